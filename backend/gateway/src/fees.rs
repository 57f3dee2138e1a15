//! Donation amount, service tip and total calculation.
//!
//! The platform keeps a tip on top of every donation. The donor picks the tip
//! on a slider, but the slider can never go below the floor of the tier the
//! donation amount falls into, nor above [`MAX_TIP_PERCENT`].
//!
//! | Donation amount | Base fee % |
//! |-----------------|------------|
//! | < 2000          | 2.5        |
//! | 2000 – 5000     | 2.0        |
//! | > 5000          | 1.8        |

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, Result};

pub const MAX_TIP_PERCENT: Decimal = dec!(25);

/// Largest single donation accepted, in cedis.
pub const MAX_DONATION_AMOUNT: Decimal = dec!(10000000);

/// Slider position before the donor touches it.
pub const DEFAULT_TIP_PERCENT: Decimal = dec!(2);

const LOW_TIER_CEILING: Decimal = dec!(2000);
const MID_TIER_CEILING: Decimal = dec!(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Momo,
    Card,
}

impl PaymentMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Momo => "Mobile Money",
            Self::Card => "Credit or debit",
        }
    }
}

/// Tier floor for the tip percentage.
pub fn base_fee(amount: Decimal) -> Decimal {
    if amount < LOW_TIER_CEILING {
        dec!(2.5)
    } else if amount <= MID_TIER_CEILING {
        dec!(2.0)
    } else {
        dec!(1.8)
    }
}

/// Tip percentage actually charged for `chosen` on a donation of `amount`.
pub fn effective_tip(chosen: Decimal, amount: Decimal) -> Decimal {
    chosen.max(base_fee(amount)).min(MAX_TIP_PERCENT)
}

/// Tip slider state.
///
/// Changing the amount only ever moves the slider up (to a higher floor). A
/// tip the donor raised above the floor survives any amount change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TipSlider {
    value: Decimal,
}

impl Default for TipSlider {
    fn default() -> Self {
        Self {
            value: DEFAULT_TIP_PERCENT,
        }
    }
}

impl TipSlider {
    pub fn value(&self) -> Decimal {
        self.value
    }

    /// Donor moved the slider.
    pub fn set(&mut self, chosen: Decimal, amount: Decimal) {
        self.value = effective_tip(chosen, amount);
    }

    /// Donation amount changed; snap up to the new floor if needed.
    pub fn on_amount_changed(&mut self, amount: Decimal) {
        let floor = base_fee(amount);
        if self.value < floor {
            self.value = floor;
        }
    }
}

/// A donation as entered by the donor. Fee and total are always derived,
/// with overflow reported as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationIntent {
    pub donation_amount: Decimal,
    pub fee_percentage: Decimal,
    pub payment_method: PaymentMethod,
    pub is_anonymous: bool,
}

impl DonationIntent {
    pub fn new(
        donation_amount: Decimal,
        chosen_tip: Decimal,
        payment_method: PaymentMethod,
        is_anonymous: bool,
    ) -> Result<Self> {
        validate_amount(donation_amount)?;
        if donation_amount <= Decimal::ZERO {
            return Err(GatewayError::Validation(
                "Donation amount must be greater than zero".to_string(),
            ));
        }
        let intent = Self {
            donation_amount,
            fee_percentage: effective_tip(chosen_tip, donation_amount),
            payment_method,
            is_anonymous,
        };
        intent.total_amount()?;
        Ok(intent)
    }

    pub fn fee_amount(&self) -> Result<Decimal> {
        self.donation_amount
            .checked_mul(self.fee_percentage)
            .and_then(|v| v.checked_div(dec!(100)))
            .ok_or_else(too_large)
    }

    pub fn total_amount(&self) -> Result<Decimal> {
        self.donation_amount
            .checked_add(self.fee_amount()?)
            .ok_or_else(too_large)
    }

    pub fn quote(&self) -> Result<FeeQuote> {
        let fee_amount = self.fee_amount()?;
        let total_amount = self.total_amount()?;
        Ok(FeeQuote {
            donation_amount: self.donation_amount,
            base_fee_percent: base_fee(self.donation_amount),
            fee_percentage: self.fee_percentage,
            fee_amount,
            total_amount,
            total_display: format_cedis(total_amount),
        })
    }
}

fn too_large() -> GatewayError {
    GatewayError::Validation("Donation amount is too large".to_string())
}

/// Bounds every amount the donor can enter: never negative, never above
/// [`MAX_DONATION_AMOUNT`]. Zero is allowed while the form is being filled.
pub fn validate_amount(amount: Decimal) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(GatewayError::Validation(
            "Donation amount cannot be negative".to_string(),
        ));
    }
    if amount > MAX_DONATION_AMOUNT {
        return Err(GatewayError::Validation(format!(
            "Donation amount cannot exceed {}",
            format_cedis(MAX_DONATION_AMOUNT)
        )));
    }
    Ok(())
}

/// What the donation summary shows.
#[derive(Debug, Clone, Serialize)]
pub struct FeeQuote {
    pub donation_amount: Decimal,
    pub base_fee_percent: Decimal,
    pub fee_percentage: Decimal,
    pub fee_amount: Decimal,
    pub total_amount: Decimal,
    pub total_display: String,
}

/// Two-decimal string used in payment payloads.
pub fn format_amount(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{rounded:.2}")
}

pub fn format_cedis(amount: Decimal) -> String {
    format!("₵{}", format_amount(amount))
}
