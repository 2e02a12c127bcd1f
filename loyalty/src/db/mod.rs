//! Database layer: PostgreSQL via SQLx, organised as repositories over models.
//!
//! - [`handlers`]: repositories, one per table
//! - [`models`]: record structures matching table schemas
//! - [`errors`]: categorised database errors

pub mod errors;
pub mod handlers;
pub mod models;
