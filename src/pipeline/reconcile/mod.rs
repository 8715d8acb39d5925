//! Referral reconciliation: work list in, local referrals out.

pub mod error;
pub mod types;
pub mod store;
pub mod runner;

pub use error::ReconcileError;
pub use types::*;
pub use store::{
    CriDocument, HttpReferralStore, InMemoryReferralStore, LocalReferral, LocalReferralRef,
    MissingAttachment, NhsNumberMismatch, ReferralStore, StoreError,
};
pub use runner::{ReconcileRunner, NOT_RETRIEVED, NO_VALID_ATTACHMENT};
