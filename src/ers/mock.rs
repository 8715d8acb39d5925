use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::session::RegistrySession;
use super::types::{
    Attachment, Reference, ReferralResource, ReviewOutcome, Ubrn, WorkListItem, WorkListResource,
};
use super::RegistryError;

/// In-memory registry session for tests and dry runs.
///
/// Responses are scripted up front. Scripted failures are consumed one per
/// call before the stored response is returned, which makes transient-error
/// sequences (503, 503, 200) easy to express.
#[derive(Default)]
pub struct MockRegistrySession {
    authenticated: bool,
    authenticate_error: Option<RegistryError>,
    work_list: WorkListResource,
    work_list_failures: Mutex<VecDeque<RegistryError>>,
    referrals: HashMap<Ubrn, ReferralResource>,
    referral_failures: Mutex<HashMap<Ubrn, VecDeque<RegistryError>>>,
    attachments: HashMap<String, Vec<u8>>,
    outcomes: Mutex<Vec<ReviewOutcome>>,
    work_list_calls: AtomicUsize,
    referral_calls: AtomicUsize,
}

impl MockRegistrySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Work list of plain `ReferralRequest/<ubrn>` references.
    pub fn with_work_list(mut self, ubrns: &[&str]) -> Self {
        self.work_list = WorkListResource {
            resource_type: Some("List".into()),
            entry: ubrns
                .iter()
                .map(|u| WorkListItem {
                    item: Some(Reference {
                        reference: Some(format!("ReferralRequest/{u}")),
                    }),
                    service_id: None,
                    referral_source: None,
                })
                .collect(),
        };
        self
    }

    pub fn with_work_list_resource(mut self, resource: WorkListResource) -> Self {
        self.work_list = resource;
        self
    }

    pub fn with_work_list_failures(self, failures: Vec<RegistryError>) -> Self {
        if let Ok(mut queue) = self.work_list_failures.lock() {
            queue.extend(failures);
        }
        self
    }

    pub fn with_referral(mut self, ubrn: &str, resource: ReferralResource) -> Self {
        self.referrals.insert(Ubrn::new(ubrn), resource);
        self
    }

    pub fn with_referral_failures(self, ubrn: &str, failures: Vec<RegistryError>) -> Self {
        if let Ok(mut map) = self.referral_failures.lock() {
            map.entry(Ubrn::new(ubrn)).or_default().extend(failures);
        }
        self
    }

    pub fn with_attachment(mut self, attachment_id: &str, bytes: Vec<u8>) -> Self {
        self.attachments.insert(attachment_id.to_string(), bytes);
        self
    }

    pub fn fail_authentication(mut self, error: RegistryError) -> Self {
        self.authenticate_error = Some(error);
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Invalidate the session, as if it expired mid-batch.
    pub fn expire(&mut self) {
        self.authenticated = false;
    }

    pub fn recorded_outcomes(&self) -> Vec<ReviewOutcome> {
        self.outcomes.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn work_list_calls(&self) -> usize {
        self.work_list_calls.load(Ordering::SeqCst)
    }

    pub fn referral_calls(&self) -> usize {
        self.referral_calls.load(Ordering::SeqCst)
    }

    fn require_session(&self) -> Result<(), RegistryError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(RegistryError::NoSession)
        }
    }
}

impl RegistrySession for MockRegistrySession {
    fn authenticate(&mut self) -> Result<(), RegistryError> {
        if let Some(e) = &self.authenticate_error {
            return Err(e.clone());
        }
        self.authenticated = true;
        Ok(())
    }

    fn fetch_work_list(&self) -> Result<WorkListResource, RegistryError> {
        self.require_session()?;
        self.work_list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self
            .work_list_failures
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
        {
            return Err(e);
        }
        Ok(self.work_list.clone())
    }

    fn fetch_referral(&self, ubrn: &Ubrn) -> Result<ReferralResource, RegistryError> {
        self.require_session()?;
        self.referral_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self
            .referral_failures
            .lock()
            .ok()
            .and_then(|mut m| m.get_mut(ubrn).and_then(|q| q.pop_front()))
        {
            return Err(e);
        }
        self.referrals
            .get(ubrn)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("referral {ubrn}")))
    }

    fn fetch_attachment(
        &self,
        ubrn: &Ubrn,
        attachment: &Attachment,
    ) -> Result<Vec<u8>, RegistryError> {
        self.require_session()?;
        self.attachments.get(&attachment.id).cloned().ok_or_else(|| {
            RegistryError::NotFound(format!("attachment {} of referral {ubrn}", attachment.id))
        })
    }

    fn record_outcome(&self, outcome: &ReviewOutcome) -> Result<(), RegistryError> {
        self.require_session()?;
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome.clone());
        }
        Ok(())
    }
}
