//! Authentication tokens: JWT signing, storage hashing and the refresh rotation engine.

pub mod hashing;
pub mod jwt;
pub mod tokens;

pub use tokens::{Rotation, TokenPair, TokenService, ValidatedToken};
