//! Fixed-point helpers for the risk model.
//!
//! Prices and collateral are 18-decimal integers; funding rates are
//! integers where 10,000 = 100%. Decisions are made on integers; the f64
//! conversions here exist for log output only.

use alloy::primitives::{I256, U256};

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Funding-rate scale (10,000 = 100%)
pub const FUNDING_SCALE: i64 = 10_000;

/// Maintenance margin in basis points of collateral (500 = 5%)
pub const MAINTENANCE_MARGIN_BPS: i64 = 500;

/// Basis points denominator (10,000 = 100%)
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Lossless U256 -> I256 conversion; `None` above `I256::MAX`.
#[inline]
pub fn to_signed(value: U256) -> Option<I256> {
    I256::try_from(value).ok()
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let mut acc = 0.0f64;
        for limb in limbs.iter().rev() {
            acc = acc * 18_446_744_073_709_551_616.0 + *limb as f64;
        }
        acc / 1e18
    }
}

/// Signed variant of [`wad_to_f64`].
#[inline]
pub fn signed_wad_to_f64(value: I256) -> f64 {
    let magnitude = wad_to_f64(value.unsigned_abs());
    if value.is_negative() {
        -magnitude
    } else {
        magnitude
    }
}

/// Funding rate as a percentage (10,000 -> 100.0).
#[inline]
pub fn funding_rate_pct(rate: I256) -> f64 {
    let raw = signed_wad_to_f64(rate) * 1e18;
    raw / FUNDING_SCALE as f64 * 100.0
}

/// Convert f64 to WAD (18 decimals).
/// Use for test fixtures and user input only.
#[inline]
pub fn f64_to_wad(value: f64) -> U256 {
    if value <= 0.0 {
        return U256::ZERO;
    }
    U256::from((value * 1e18) as u128)
}
