//! Test utilities: database fixtures and in-memory fakes for the external APIs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    config::{AuthConfig, Config},
    db::{
        handlers::{Users, Vouchers},
        models::{
            proofs::PaymentFacts,
            users::{User, UserCreateDBRequest},
            vouchers::{Voucher, VoucherCreateDBRequest},
        },
    },
    errors::ProviderError,
    payment_providers::{PaymentSearch, PaymentProvider, ProviderPayment, STATUS_APPROVED, TransactionDetails},
    vending::{OrderLookup, VoucherVerifier},
};

pub fn test_config() -> Config {
    Config {
        auth: AuthConfig {
            jwt_secret: Some("test-jwt-secret-for-testing-only".to_string()),
            reset_password_secret: Some("test-reset-secret-for-testing-only".to_string()),
            token_pepper: Some("test-pepper".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Install the rustls provider reqwest needs. Safe to call from every test.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub async fn create_test_user(pool: &PgPool, email: &str) -> User {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            email: email.to_string(),
            name: "Test Member".to_string(),
        })
        .await
        .expect("Failed to create test user")
}

/// Load `count` unassigned vouchers into stock
pub async fn stock_vouchers(pool: &PgPool, count: usize) -> Vec<Voucher> {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let mut repo = Vouchers::new(&mut conn);
    let mut stocked = Vec::with_capacity(count);
    for _ in 0..count {
        let code = Uuid::new_v4().simple().to_string();
        stocked.push(
            repo.create(&VoucherCreateDBRequest {
                storage_path: format!("vouchers/{code}.png"),
                qr_code: code,
            })
            .await
            .expect("Failed to stock voucher"),
        );
    }
    stocked
}

pub fn sample_facts() -> PaymentFacts {
    PaymentFacts {
        approved_at: Utc::now(),
        operation_type: "regular_payment".to_string(),
        status: STATUS_APPROVED.to_string(),
        amount: Decimal::new(289000, 2),
        dni: Some("30111222".to_string()),
        card_last4: Some("4321".to_string()),
        card_type: Some("debit_card".to_string()),
        payment_method_id: Some("visa".to_string()),
        external_order_id: None,
        product_name: None,
    }
}

/// An approved payment of `amount` whole currency units, approved at `approved_at`
pub fn provider_payment(id: i64, amount: i64, approved_at: DateTime<Utc>) -> ProviderPayment {
    ProviderPayment {
        id,
        status: STATUS_APPROVED.to_string(),
        operation_type: "regular_payment".to_string(),
        date_approved: Some(approved_at),
        date_created: Some(approved_at),
        transaction_amount: Decimal::from(amount),
        transaction_details: TransactionDetails {
            total_paid_amount: Some(Decimal::from(amount)),
        },
        payment_type_id: Some("debit_card".to_string()),
        payment_method_id: Some("visa".to_string()),
        ..Default::default()
    }
}

/// Serves a fixed set of payments and records every search and lookup it receives
pub struct FakePaymentProvider {
    payments: Vec<ProviderPayment>,
    searches: Mutex<Vec<PaymentSearch>>,
    lookups: Mutex<Vec<String>>,
}

impl FakePaymentProvider {
    pub fn new(payments: Vec<ProviderPayment>) -> Self {
        Self {
            payments,
            searches: Mutex::new(Vec::new()),
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn searches(&self) -> Vec<PaymentSearch> {
        self.searches.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn search_payments(&self, search: &PaymentSearch) -> Result<Vec<ProviderPayment>, ProviderError> {
        self.searches.lock().unwrap().push(search.clone());
        Ok(self.payments.clone())
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<ProviderPayment>, ProviderError> {
        self.lookups.lock().unwrap().push(payment_id.to_string());
        Ok(self.payments.iter().find(|p| p.id.to_string() == payment_id).cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum VerifierAnswer {
    Used,
    Unused,
    Fail,
    /// Never answers within any reasonable timeout
    Hang,
}

/// Answers per voucher code; unknown codes are unused
pub struct FakeVerifier {
    answers: HashMap<String, VerifierAnswer>,
    calls: Mutex<Vec<String>>,
}

impl FakeVerifier {
    pub fn new(answers: impl IntoIterator<Item = (String, VerifierAnswer)>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoucherVerifier for FakeVerifier {
    async fn is_used(&self, code: &str) -> Result<bool, ProviderError> {
        self.calls.lock().unwrap().push(code.to_string());
        match self.answers.get(code).copied().unwrap_or(VerifierAnswer::Unused) {
            VerifierAnswer::Used => Ok(true),
            VerifierAnswer::Unused => Ok(false),
            VerifierAnswer::Fail => Err(ProviderError::Status {
                service: "vending",
                status: 500,
                body: "boom".to_string(),
            }),
            VerifierAnswer::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(false)
            }
        }
    }
}

/// Order lookup backed by a map; `fail` makes every call error
#[derive(Default)]
pub struct FakeOrderLookup {
    pub products: HashMap<String, String>,
    pub fail: bool,
}

#[async_trait]
impl OrderLookup for FakeOrderLookup {
    async fn product_name(&self, order_no: &str) -> Result<Option<String>, ProviderError> {
        if self.fail {
            return Err(ProviderError::Timeout { service: "vending" });
        }
        Ok(self.products.get(order_no).cloned())
    }
}

pub fn fake_orders(products: &[(&str, &str)]) -> Arc<FakeOrderLookup> {
    Arc::new(FakeOrderLookup {
        products: products.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        fail: false,
    })
}
