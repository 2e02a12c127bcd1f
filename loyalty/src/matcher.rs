//! Payment reconciliation.
//!
//! When a member cannot supply the provider's payment id they assert what their receipt
//! shows: local date, local time, amount and optionally the card's last four digits or their
//! DNI. The matcher searches the provider around that instant and accepts only a single
//! unambiguous candidate.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    config::MatcherConfig,
    errors::{Error, Result},
    payment_providers::{PaymentProvider, PaymentSearch, ProviderPayment},
    types::mask_tail,
};

const DATE_TIME_FORMAT: &str = "%d/%m/%Y %H:%M";

/// What the member asserts about a payment
#[derive(Debug, Clone, Default)]
pub struct PaymentClaim {
    /// `dd/mm/yyyy`, local business time
    pub date: String,
    /// `HH:MM` (or `HH.MM`), local business time
    pub time: String,
    pub amount: Decimal,
    pub last4: Option<String>,
    pub dni: Option<String>,
}

impl PaymentClaim {
    fn last4(&self) -> Option<&str> {
        self.last4.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    fn dni(&self) -> Option<&str> {
        self.dni.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    /// Optional fields the member left out, in the order they would narrow the search
    fn missing_fields(&self) -> Vec<&'static str> {
        let mut hints = Vec::new();
        if self.last4().is_none() {
            hints.push("last4");
        }
        if self.dni().is_none() {
            hints.push("dni");
        }
        hints
    }
}

/// A uniquely matched payment with the metadata copied onto a proof
#[derive(Debug, Clone, Serialize)]
pub struct MatchedPayment {
    pub payment: ProviderPayment,
    pub dni: Option<String>,
    pub card_last4: Option<String>,
    pub card_type: Option<String>,
    pub payment_method_id: Option<String>,
}

impl From<ProviderPayment> for MatchedPayment {
    fn from(payment: ProviderPayment) -> Self {
        Self {
            dni: payment.dni().map(str::to_string),
            card_last4: payment.card_last4().map(str::to_string),
            card_type: payment.payment_type_id.clone(),
            payment_method_id: payment.payment_method_id.clone(),
            payment,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched(Box<MatchedPayment>),
    NoMatch,
    /// Several candidates survived; `hints` names the unsupplied fields that could disambiguate
    Ambiguous { count: usize, hints: Vec<&'static str> },
}

/// Windows and tolerances, resolved from [`MatcherConfig`]
#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub offset: FixedOffset,
    pub search_window: Duration,
    pub match_tolerance: Duration,
    pub amount_epsilon: Decimal,
}

impl MatchSettings {
    pub fn new(config: &MatcherConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .ok_or_else(|| Error::validation(format!("invalid UTC offset: {} minutes", config.utc_offset_minutes)))?;
        let to_chrono = |d: std::time::Duration| Duration::from_std(d).map_err(|e| Error::Other(anyhow::anyhow!("matcher window out of range: {e}")));

        Ok(Self {
            offset,
            search_window: to_chrono(config.search_window)?,
            match_tolerance: to_chrono(config.match_tolerance)?,
            amount_epsilon: config.amount_epsilon,
        })
    }
}

/// Parse a receipt's local date and time (`18/11/2025`, `12:11` or `12.11`) into an instant
pub fn parse_local_instant(date: &str, time: &str, offset: FixedOffset) -> Result<DateTime<Utc>> {
    let time = time.trim().replace('.', ":");
    let raw = format!("{} {}", date.trim(), time);

    let naive = NaiveDateTime::parse_from_str(&raw, DATE_TIME_FORMAT)
        .map_err(|_| Error::validation(format!("invalid date/time '{raw}', expected dd/mm/yyyy and HH:MM")))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| Error::validation(format!("invalid local date/time '{raw}'")))
}

/// Keep the payments consistent with the claim around `asserted`
pub fn select_candidates<'a>(
    payments: &'a [ProviderPayment],
    claim: &PaymentClaim,
    asserted: DateTime<Utc>,
    settings: &MatchSettings,
) -> Vec<&'a ProviderPayment> {
    payments
        .iter()
        .filter(|p| p.is_approved())
        .filter(|p| p.matches_amount(claim.amount, settings.amount_epsilon))
        .filter(|p| claim.last4().is_none_or(|last4| p.card_last4() == Some(last4)))
        .filter(|p| claim.dni().is_none_or(|dni| p.dni() == Some(dni)))
        .filter(|p| {
            p.effective_time()
                .is_some_and(|at| (at - asserted).abs() <= settings.match_tolerance)
        })
        .collect()
}

pub struct PaymentMatcher {
    provider: Arc<dyn PaymentProvider>,
    settings: MatchSettings,
}

impl PaymentMatcher {
    pub fn new(provider: Arc<dyn PaymentProvider>, settings: MatchSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    #[instrument(
        skip(self, claim),
        fields(
            date = %claim.date,
            time = %claim.time,
            amount = %claim.amount,
            dni = ?claim.dni().map(|d| mask_tail(d, 3)),
        ),
        err
    )]
    pub async fn match_payment(&self, claim: &PaymentClaim) -> Result<MatchOutcome> {
        if claim.date.trim().is_empty() || claim.time.trim().is_empty() {
            return Err(Error::validation("date and time are required"));
        }
        if claim.amount <= Decimal::ZERO {
            return Err(Error::validation("amount must be greater than zero"));
        }

        let asserted = parse_local_instant(&claim.date, &claim.time, self.settings.offset)?;
        let search = PaymentSearch {
            begin: asserted - self.settings.search_window,
            end: asserted + self.settings.search_window,
            amount: claim.amount,
            epsilon: self.settings.amount_epsilon,
        };

        let payments = self.provider.search_payments(&search).await?;
        let candidates = select_candidates(&payments, claim, asserted, &self.settings);
        debug!(searched = payments.len(), candidates = candidates.len(), "Reconciliation candidates");

        match candidates.as_slice() {
            [] => Ok(MatchOutcome::NoMatch),
            [only] => {
                info!(payment_id = only.id, "Payment matched");
                Ok(MatchOutcome::Matched(Box::new(MatchedPayment::from((*only).clone()))))
            }
            many => Ok(MatchOutcome::Ambiguous {
                count: many.len(),
                hints: claim.missing_fields(),
            }),
        }
    }
}
