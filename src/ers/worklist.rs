//! Work-list and referral retrieval with retry on transient failures.

use std::time::Duration;

use super::retry::RetryPolicy;
use super::session::RegistrySession;
use super::types::{Attachment, ErsReferral, ReviewOutcome, Ubrn, WorkList};
use super::RegistryError;

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

pub struct WorkListFetcher {
    retry: RetryPolicy,
    sleep: Sleeper,
}

impl WorkListFetcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Replace the backoff sleep (tests record delays instead of waiting).
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fetch the outstanding work list, deduplicated by UBRN.
    pub fn fetch_work_list(
        &self,
        session: &dyn RegistrySession,
    ) -> Result<WorkList, RegistryError> {
        let resource = self
            .retry
            .run("fetch work list", &*self.sleep, || session.fetch_work_list())?;

        let list = WorkList::from_resource(resource);
        tracing::info!(
            entries = list.entries.len(),
            problems = list.errors.len(),
            "Work list retrieved"
        );
        Ok(list)
    }

    /// Fetch one referral. A 404 yields a `NotFound` referral, not an error.
    pub fn fetch_referral(
        &self,
        session: &dyn RegistrySession,
        ubrn: &Ubrn,
    ) -> Result<ErsReferral, RegistryError> {
        match self
            .retry
            .run("fetch referral", &*self.sleep, || session.fetch_referral(ubrn))
        {
            Ok(resource) => Ok(ErsReferral::from_resource(ubrn, resource)),
            Err(RegistryError::NotFound(_)) => {
                tracing::info!(ubrn = %ubrn, "Referral not found in registry");
                Ok(ErsReferral::not_found(ubrn))
            }
            Err(e) => Err(e),
        }
    }

    pub fn fetch_attachment(
        &self,
        session: &dyn RegistrySession,
        ubrn: &Ubrn,
        attachment: &Attachment,
    ) -> Result<Vec<u8>, RegistryError> {
        self.retry.run("fetch attachment", &*self.sleep, || {
            session.fetch_attachment(ubrn, attachment)
        })
    }

    /// Record a review comment against the referral.
    pub fn record_outcome(
        &self,
        session: &dyn RegistrySession,
        outcome: &ReviewOutcome,
    ) -> Result<(), RegistryError> {
        self.retry.run("record outcome", &*self.sleep, || {
            session.record_outcome(outcome)
        })
    }
}

impl Default for WorkListFetcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
