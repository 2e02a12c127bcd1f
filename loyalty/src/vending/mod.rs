//! Vending machine API seams.
//!
//! Redemption of a voucher happens at the machine, so the only way to learn a voucher was
//! used is to ask the vending API. The same API resolves an order number to the product
//! that was dispensed.

use async_trait::async_trait;

use crate::errors::ProviderError;

pub mod coffeeji;

pub use coffeeji::CoffeejiClient;

/// Answers "has this voucher code been redeemed?"
#[async_trait]
pub trait VoucherVerifier: Send + Sync {
    async fn is_used(&self, code: &str) -> Result<bool, ProviderError>;
}

/// Resolves an order number to the product name
#[async_trait]
pub trait OrderLookup: Send + Sync {
    async fn product_name(&self, order_no: &str) -> Result<Option<String>, ProviderError>;
}
