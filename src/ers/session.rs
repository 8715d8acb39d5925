use super::types::{Attachment, ReferralResource, ReviewOutcome, Ubrn, WorkListResource};
use super::RegistryError;

/// An authenticated connection to the registry.
///
/// One session serves a whole batch. Implementations are not expected to be
/// shared between threads; the runner owns the session for the duration of
/// a run. Each method performs a single attempt; retry lives in
/// [`super::WorkListFetcher`].
pub trait RegistrySession {
    /// Establish (or re-establish) the session.
    fn authenticate(&mut self) -> Result<(), RegistryError>;

    /// Outstanding referrals awaiting reconciliation.
    fn fetch_work_list(&self) -> Result<WorkListResource, RegistryError>;

    /// Full referral resource including contained attachments.
    fn fetch_referral(&self, ubrn: &Ubrn) -> Result<ReferralResource, RegistryError>;

    /// Raw bytes of one attachment.
    fn fetch_attachment(&self, ubrn: &Ubrn, attachment: &Attachment)
        -> Result<Vec<u8>, RegistryError>;

    /// Record a review comment against a referral.
    fn record_outcome(&self, outcome: &ReviewOutcome) -> Result<(), RegistryError>;
}
