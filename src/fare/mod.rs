//! Parking fare computation.
//!
//! `compute_fare` is pure: it takes the entry and exit instants plus the rate
//! policy in effect and returns the billable duration and amount. Callers
//! capture `hourly_rate` from the returned breakdown so later policy changes
//! never alter a stored fare.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub mod rates;

pub const DEFAULT_HOURLY_RATE: f64 = 10.0;
pub const DEFAULT_MINIMUM_CHARGE: f64 = 5.0;
pub const DEFAULT_GRACE_PERIOD_MINUTES: u32 = 15;
pub const DEFAULT_RATE_NAME: &str = "default";

const MILLIS_PER_MINUTE: i128 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub id: Uuid,
    pub name: String,
    pub hourly_rate: f64,
    pub minimum_charge: f64,
    pub grace_period_minutes: u32,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Error, PartialEq)]
pub enum FareError {
    #[error("exit time precedes entry time by {minutes} minute(s)")]
    NegativeDuration { minutes: i64 },
    #[error("invalid rate policy: {0}")]
    InvalidPolicy(String),
}

impl RatePolicy {
    /// Build a validated, active policy.
    pub fn new(
        name: impl Into<String>,
        hourly_rate: f64,
        minimum_charge: f64,
        grace_period_minutes: u32,
        created_at: OffsetDateTime,
    ) -> Result<Self, FareError> {
        if !hourly_rate.is_finite() || hourly_rate <= 0.0 {
            return Err(FareError::InvalidPolicy(format!(
                "hourly_rate must be > 0, got {hourly_rate}"
            )));
        }
        if !minimum_charge.is_finite() || minimum_charge < 0.0 {
            return Err(FareError::InvalidPolicy(format!(
                "minimum_charge must be >= 0, got {minimum_charge}"
            )));
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FareError::InvalidPolicy("name must not be blank".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            hourly_rate,
            minimum_charge,
            grace_period_minutes,
            is_active: true,
            created_at,
        })
    }

    /// Built-in policy used when no active policy is configured or the lookup fails.
    pub fn fallback() -> Self {
        Self {
            id: Uuid::nil(),
            name: DEFAULT_RATE_NAME.to_string(),
            hourly_rate: DEFAULT_HOURLY_RATE,
            minimum_charge: DEFAULT_MINIMUM_CHARGE,
            grace_period_minutes: DEFAULT_GRACE_PERIOD_MINUTES,
            is_active: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.id.is_nil()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareBreakdown {
    pub duration_minutes: i64,
    pub duration_hours: f64,
    pub fare_amount: f64,
    pub hourly_rate: f64,
    pub within_grace: bool,
}

impl FareBreakdown {
    /// Fare rounded to cents for display. The stored amount keeps full precision.
    pub fn display_amount(&self) -> String {
        format!("{:.2}", round_cents(self.fare_amount))
    }
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Compute billable duration and fare for a stay.
///
/// Duration is floored to whole minutes. A stay no longer than the grace
/// period costs nothing but still reports its real duration. Past the grace
/// period the time-based fare is floored at the policy's minimum charge.
pub fn compute_fare(
    entry_time: OffsetDateTime,
    exit_time: OffsetDateTime,
    rate: &RatePolicy,
) -> Result<FareBreakdown, FareError> {
    let elapsed_ms = (exit_time - entry_time).whole_milliseconds();
    let duration_minutes = elapsed_ms.div_euclid(MILLIS_PER_MINUTE) as i64;
    if duration_minutes < 0 {
        return Err(FareError::NegativeDuration {
            minutes: -duration_minutes,
        });
    }

    let duration_hours = duration_minutes as f64 / 60.0;
    let within_grace = duration_minutes <= i64::from(rate.grace_period_minutes);
    let fare_amount = if within_grace {
        0.0
    } else {
        (duration_hours * rate.hourly_rate).max(rate.minimum_charge)
    };

    Ok(FareBreakdown {
        duration_minutes,
        duration_hours,
        fare_amount,
        hourly_rate: rate.hourly_rate,
        within_grace,
    })
}
