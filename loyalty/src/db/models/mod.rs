//! Database record models matching table schemas.
//!
//! - [`users`]: loyalty members and their stamp counter
//! - [`tokens`]: refresh/reset credentials and their rotation chain
//! - [`proofs`]: immutable payment proofs
//! - [`vouchers`]: stocked reward vouchers and their assignment state
//!
//! Models derive `sqlx::FromRow` and are read with runtime-checked
//! `sqlx::query_as::<_, Model>` queries.

pub mod proofs;
pub mod tokens;
pub mod users;
pub mod vouchers;
