//! Payment provider abstraction layer
//!
//! [`PaymentProvider`] is what the matcher and proof intake talk to. The MercadoPago
//! implementation lives in [`mercadopago`]; tests substitute in-memory providers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{db::models::proofs::PaymentFacts, errors::ProviderError};

pub mod mercadopago;

/// Result type for payment provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

pub const STATUS_APPROVED: &str = "approved";

/// Approved payments in `[begin, end]` whose amount is near `amount`
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSearch {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub amount: Decimal,
    pub epsilon: Decimal,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Search approved payments inside a time window, filtered by amount
    async fn search_payments(&self, search: &PaymentSearch) -> Result<Vec<ProviderPayment>>;

    /// Fetch one payment by its provider id. `Ok(None)` when the provider does not know it.
    async fn get_payment(&self, payment_id: &str) -> Result<Option<ProviderPayment>>;
}

/// A payment as reported by the provider. Only the fields reconciliation and proof recording
/// read are modelled; everything else in the payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub operation_type: String,
    pub date_approved: Option<DateTime<Utc>>,
    pub date_created: Option<DateTime<Utc>>,
    pub transaction_amount: Decimal,
    #[serde(default)]
    pub transaction_details: TransactionDetails,
    #[serde(default)]
    pub payer: Payer,
    #[serde(default)]
    pub card: Card,
    pub payment_method_id: Option<String>,
    pub payment_type_id: Option<String>,
    pub external_reference: Option<String>,
    #[serde(default)]
    pub point_of_interaction: PointOfInteraction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub total_paid_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub number: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payer {
    pub email: Option<String>,
    #[serde(default)]
    pub identification: Identification,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub first_six_digits: Option<String>,
    pub last_four_digits: Option<String>,
    pub cardholder: Option<Cardholder>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cardholder {
    pub name: Option<String>,
    #[serde(default)]
    pub identification: Identification,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointOfInteraction {
    #[serde(default)]
    pub transaction_data: TransactionData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionData {
    #[serde(default)]
    pub bank_info: BankInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankInfo {
    #[serde(default)]
    pub payer: BankPayer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankPayer {
    #[serde(default)]
    pub identification: Identification,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ProviderPayment {
    pub fn is_approved(&self) -> bool {
        self.status == STATUS_APPROVED
    }

    /// Approval time, falling back to creation time
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.date_approved.or(self.date_created)
    }

    pub fn total_paid_amount(&self) -> Decimal {
        self.transaction_details.total_paid_amount.unwrap_or(self.transaction_amount)
    }

    /// Whether either the total paid or the transaction amount is within `epsilon` of `amount`
    pub fn matches_amount(&self, amount: Decimal, epsilon: Decimal) -> bool {
        (self.total_paid_amount() - amount).abs() <= epsilon || (self.transaction_amount - amount).abs() <= epsilon
    }

    /// Identification number, preferring the card holder, then the payer, then the
    /// bank-transfer payer
    pub fn dni(&self) -> Option<&str> {
        self.card
            .cardholder
            .as_ref()
            .and_then(|holder| non_blank(&holder.identification.number))
            .or_else(|| non_blank(&self.payer.identification.number))
            .or_else(|| non_blank(&self.point_of_interaction.transaction_data.bank_info.payer.identification.number))
    }

    pub fn card_last4(&self) -> Option<&str> {
        non_blank(&self.card.last_four_digits)
    }

    pub fn external_order_id(&self) -> Option<&str> {
        non_blank(&self.external_reference)
    }

    /// Facts copied onto a proof row. `None` when the payment carries no usable timestamp.
    pub fn to_facts(&self, product_name: Option<String>) -> Option<PaymentFacts> {
        Some(PaymentFacts {
            approved_at: self.effective_time()?,
            operation_type: self.operation_type.clone(),
            status: self.status.clone(),
            amount: self.total_paid_amount(),
            dni: self.dni().map(str::to_string),
            card_last4: self.card_last4().map(str::to_string),
            card_type: self.payment_type_id.clone(),
            payment_method_id: self.payment_method_id.clone(),
            external_order_id: self.external_order_id().map(str::to_string),
            product_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_deserialize_provider_payload() {
        let payload = json!({
            "id": 133_754_891_234_i64,
            "status": "approved",
            "status_detail": "accredited",
            "operation_type": "regular_payment",
            "date_approved": "2025-11-18T12:12:40.000-03:00",
            "date_created": "2025-11-18T12:12:31.000-03:00",
            "transaction_amount": 2890,
            "transaction_details": { "total_paid_amount": 2890.0, "net_received_amount": 2750.5 },
            "payer": { "email": "buyer@example.com", "identification": { "number": "30111222", "type": "DNI" } },
            "card": { "last_four_digits": "4321", "first_six_digits": "450995" },
            "payment_method_id": "visa",
            "payment_type_id": "debit_card",
            "external_reference": "ORD-77",
            "fee_details": []
        });

        let payment: ProviderPayment = serde_json::from_value(payload).unwrap();

        assert_eq!(payment.id, 133_754_891_234);
        assert!(payment.is_approved());
        assert_eq!(
            payment.effective_time(),
            Some(Utc.with_ymd_and_hms(2025, 11, 18, 15, 12, 40).unwrap())
        );
        assert_eq!(payment.total_paid_amount(), Decimal::new(2890, 0));
        assert_eq!(payment.dni(), Some("30111222"));
        assert_eq!(payment.card_last4(), Some("4321"));
        assert_eq!(payment.external_order_id(), Some("ORD-77"));
    }

    #[test]
    fn test_dni_priority() {
        let mut payment = ProviderPayment::default();
        payment.point_of_interaction.transaction_data.bank_info.payer.identification.number = Some("333".into());
        assert_eq!(payment.dni(), Some("333"));

        payment.payer.identification.number = Some("222".into());
        assert_eq!(payment.dni(), Some("222"));

        payment.card.cardholder = Some(Cardholder {
            name: None,
            identification: Identification {
                number: Some("111".into()),
                kind: None,
            },
        });
        assert_eq!(payment.dni(), Some("111"));

        payment.card.cardholder = Some(Cardholder {
            name: None,
            identification: Identification {
                number: Some("  ".into()),
                kind: None,
            },
        });
        assert_eq!(payment.dni(), Some("222"), "blank values are skipped");
    }

    #[test]
    fn test_matches_amount_checks_both_amounts() {
        let payment = ProviderPayment {
            transaction_amount: Decimal::new(289000, 2),
            transaction_details: TransactionDetails {
                total_paid_amount: Some(Decimal::new(295000, 2)),
            },
            ..Default::default()
        };
        let eps = Decimal::new(1, 2);

        assert!(payment.matches_amount(Decimal::new(2890, 0), eps));
        assert!(payment.matches_amount(Decimal::new(295001, 2), eps));
        assert!(!payment.matches_amount(Decimal::new(289002, 2), eps));
    }

    #[test]
    fn test_effective_time_falls_back_to_created() {
        let created = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let payment = ProviderPayment {
            date_created: Some(created),
            ..Default::default()
        };
        assert_eq!(payment.effective_time(), Some(created));
        assert!(payment.to_facts(None).is_some());
        assert!(ProviderPayment::default().to_facts(None).is_none());
    }
}
