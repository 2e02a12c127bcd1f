//! Common type definitions.
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`UserId`]: loyalty member
//! - [`TokenId`]: a persisted credential row
//! - [`FamilyId`]: the refresh-token chain descended from one login
//! - [`ProofId`]: a recorded payment proof
//! - [`VoucherId`]: a stocked reward voucher
//!
//! [`abbrev_uuid`] shortens IDs for log fields.

use uuid::Uuid;

pub type UserId = Uuid;
pub type TokenId = Uuid;
pub type FamilyId = Uuid;
pub type ProofId = Uuid;
pub type VoucherId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Mask all but the last few characters of an identifier (DNI, card digits) for logging
pub fn mask_tail(value: &str, visible: usize) -> String {
    let len = value.chars().count();
    if len <= visible {
        return "*".repeat(len);
    }
    let tail: String = value.chars().skip(len - visible).collect();
    format!("{}{}", "*".repeat(len - visible), tail)
}
