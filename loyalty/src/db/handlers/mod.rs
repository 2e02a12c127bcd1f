//! Repository implementations for database access.
//!
//! Each repository wraps a borrowed `PgConnection` (a pooled connection or an open
//! transaction) and returns models from [`crate::db::models`]. Callers decide the
//! transaction scope:
//!
//! ```ignore
//! use loyalty::db::handlers::{Users, Vouchers};
//!
//! let mut tx = pool.begin().await?;
//! let stamps = Users::new(&mut tx).increment_stamps(user_id).await?;
//! let voucher = Vouchers::new(&mut tx).assign_next(user_id, now).await?;
//! tx.commit().await?;
//! ```
//!
//! - [`Users`]: members and their stamp counter
//! - [`Tokens`]: the credential store behind token rotation
//! - [`Proofs`]: payment proofs
//! - [`Vouchers`]: voucher stock, allocation and usage bookkeeping

pub mod proofs;
pub mod tokens;
pub mod users;
pub mod vouchers;

pub use proofs::{ProofFilter, Proofs};
pub use tokens::Tokens;
pub use users::Users;
pub use vouchers::Vouchers;
