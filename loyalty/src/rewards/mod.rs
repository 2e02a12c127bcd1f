//! Loyalty rewards: the stamp ledger, voucher allocation and voucher usage tracking.

pub mod ledger;
pub mod usage_check;
pub mod vouchers;

pub use ledger::{LedgerEntry, ProofPage, RewardLedger};
pub use usage_check::{UsageCheckSummary, VoucherUsageJob, check_used_vouchers};
pub use vouchers::{VoucherAllocator, VoucherView};
