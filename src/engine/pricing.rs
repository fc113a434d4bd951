use crate::model::{DayRange, PricingBreakdown, PricingMode, Story};

use super::EngineError;

/// Absolute disagreement tolerated between a client-submitted total and the
/// server recomputation, in currency units.
pub const PRICE_TOLERANCE: f64 = 0.01;

/// Platform fee schedule applied on top of a story's base price. The seam
/// the fee-administration surface (out of scope here) plugs into.
pub trait FeePolicy: Send + Sync {
    fn breakdown(&self, base_total: f64) -> PricingBreakdown;
}

/// Percentage-plus-flat platform fee.
#[derive(Debug, Clone, Copy)]
pub struct PlatformFees {
    pub percent: f64,
    pub flat: f64,
}

impl PlatformFees {
    pub fn new(percent: f64, flat: f64) -> Self {
        Self { percent, flat }
    }
}

impl FeePolicy for PlatformFees {
    fn breakdown(&self, base_total: f64) -> PricingBreakdown {
        let base = round_cents(base_total);
        let fee = round_cents(base * self.percent / 100.0 + self.flat);
        PricingBreakdown {
            base_total: base,
            fee_total: fee,
            grand_total: round_cents(base + fee),
        }
    }
}

/// A story's pre-fee price for a concrete request. Per-person stories
/// multiply by the party; per-day stories use the host's precomputed
/// package total (falling back to `unit × days` when no total was set) and
/// never multiply by party size.
pub fn base_total(story: &Story, range: &DayRange, party_size: u32) -> f64 {
    match story.pricing.mode {
        PricingMode::PerPerson => story.pricing.unit_amount * f64::from(party_size),
        PricingMode::PerDay => story
            .pricing
            .total_amount
            .unwrap_or(story.pricing.unit_amount * range.num_days() as f64),
    }
}

/// The server total is authoritative; the client-submitted one is only
/// checked, never persisted.
pub fn verify_client_total(server_total: f64, client_total: f64) -> Result<(), EngineError> {
    if (server_total - client_total).abs() > PRICE_TOLERANCE {
        return Err(EngineError::PricingMismatch {
            client_total,
            server_total,
        });
    }
    Ok(())
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
