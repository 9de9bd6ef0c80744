//! Maintenance-margin risk model.
//!
//! ```text
//! pnl               = collateral * leverage * (price / entry - 1)     (long)
//!                   = collateral * leverage * (1 - price / entry)     (short)
//! funding_payment   = collateral * (accumulated - entry_funding) / 10_000
//!                     (negated for longs: longs pay positive funding)
//! remaining_value   = collateral + pnl + funding_payment
//! maintenance       = collateral * 5%
//! liquidatable      = remaining_value <= maintenance
//! ```
//!
//! The decision is evaluated exactly: both sides are multiplied by
//! `entry * 10_000` so no division happens before the comparison.

use alloy::primitives::{I256, U256};
use keeper_store::Position;
use thiserror::Error;

use crate::fixed_math::{
    signed_wad_to_f64, to_signed, BPS_DENOMINATOR, FUNDING_SCALE, MAINTENANCE_MARGIN_BPS,
};

/// Invalid position or market inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RiskError {
    #[error("entry price is zero")]
    ZeroEntryPrice,
    #[error("{0} exceeds the signed 256-bit range")]
    OutOfRange(&'static str),
    #[error("arithmetic overflow while evaluating risk")]
    Overflow,
}

/// Market state shared by every position in one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSnapshot {
    /// Mark price (18 decimals)
    pub price: U256,
    /// Accumulated funding rate (10,000 = 100%)
    pub accumulated_funding: I256,
}

/// Position fields the risk model depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskInputs {
    pub collateral: U256,
    pub leverage: u64,
    pub entry_price: U256,
    pub entry_funding_rate: I256,
    pub is_long: bool,
}

impl From<&Position> for RiskInputs {
    fn from(position: &Position) -> Self {
        Self {
            collateral: position.collateral,
            leverage: position.leverage,
            entry_price: position.entry_price,
            entry_funding_rate: position.entry_funding_rate,
            is_long: position.is_long,
        }
    }
}

/// Result of evaluating one position.
///
/// Values are in collateral units (18 decimals), truncated toward zero.
/// `liquidatable` comes from the exact comparison, not from these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub remaining_value: I256,
    pub maintenance_margin: I256,
    pub pnl: I256,
    pub funding_payment: I256,
    pub liquidatable: bool,
}

impl RiskAssessment {
    pub fn remaining_value_f64(&self) -> f64 {
        signed_wad_to_f64(self.remaining_value)
    }

    pub fn maintenance_margin_f64(&self) -> f64 {
        signed_wad_to_f64(self.maintenance_margin)
    }

    pub fn pnl_f64(&self) -> f64 {
        signed_wad_to_f64(self.pnl)
    }

    pub fn funding_payment_f64(&self) -> f64 {
        signed_wad_to_f64(self.funding_payment)
    }
}

#[inline]
fn mul(a: I256, b: I256) -> Result<I256, RiskError> {
    a.checked_mul(b).ok_or(RiskError::Overflow)
}

#[inline]
fn add(a: I256, b: I256) -> Result<I256, RiskError> {
    a.checked_add(b).ok_or(RiskError::Overflow)
}

#[inline]
fn sub(a: I256, b: I256) -> Result<I256, RiskError> {
    a.checked_sub(b).ok_or(RiskError::Overflow)
}

#[inline]
fn div(a: I256, b: I256) -> Result<I256, RiskError> {
    a.checked_div(b).ok_or(RiskError::Overflow)
}

fn signed(value: U256, field: &'static str) -> Result<I256, RiskError> {
    to_signed(value).ok_or(RiskError::OutOfRange(field))
}

/// Evaluate a position against a market snapshot.
///
/// Pure function of the inputs.
pub fn assess(inputs: &RiskInputs, market: &MarketSnapshot) -> Result<RiskAssessment, RiskError> {
    if inputs.entry_price.is_zero() {
        return Err(RiskError::ZeroEntryPrice);
    }

    let collateral = signed(inputs.collateral, "collateral")?;
    let entry = signed(inputs.entry_price, "entry price")?;
    let price = signed(market.price, "price")?;
    let leverage = I256::try_from(inputs.leverage).map_err(|_| RiskError::OutOfRange("leverage"))?;
    let scale = I256::try_from(FUNDING_SCALE).map_err(|_| RiskError::Overflow)?;
    let margin_bps = I256::try_from(MAINTENANCE_MARGIN_BPS).map_err(|_| RiskError::Overflow)?;
    let bps = I256::try_from(BPS_DENOMINATOR).map_err(|_| RiskError::Overflow)?;

    let price_move = if inputs.is_long {
        sub(price, entry)?
    } else {
        sub(entry, price)?
    };
    let funding_delta = sub(market.accumulated_funding, inputs.entry_funding_rate)?;

    // Everything below is scaled by entry * 10_000
    let notional_move = mul(mul(collateral, leverage)?, price_move)?;
    let scaled_pnl = mul(notional_move, scale)?;
    let raw_funding = mul(collateral, funding_delta)?;
    let scaled_funding = mul(raw_funding, entry)?;
    let scaled_funding = if inputs.is_long {
        scaled_funding.checked_neg().ok_or(RiskError::Overflow)?
    } else {
        scaled_funding
    };
    let scaled_collateral = mul(mul(collateral, entry)?, scale)?;
    let scaled_remaining = add(add(scaled_collateral, scaled_pnl)?, scaled_funding)?;
    let scaled_margin = mul(mul(collateral, entry)?, margin_bps)?;

    let pnl = div(notional_move, entry)?;
    let funding_payment = div(raw_funding, scale)?;
    let funding_payment = if inputs.is_long {
        funding_payment.checked_neg().ok_or(RiskError::Overflow)?
    } else {
        funding_payment
    };

    Ok(RiskAssessment {
        remaining_value: add(add(collateral, pnl)?, funding_payment)?,
        maintenance_margin: div(mul(collateral, margin_bps)?, bps)?,
        pnl,
        funding_payment,
        liquidatable: scaled_remaining <= scaled_margin,
    })
}
