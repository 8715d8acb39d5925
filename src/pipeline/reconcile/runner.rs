//! ReconcileRunner: drives one batch from the registry work list to the
//! local referral store.
//!
//! Runs sequentially over a single registry session. Per-item failures are
//! recorded on the item and the batch moves on; only session-level problems
//! (or the optional circuit breaker) abort it.

use std::time::Instant;

use super::error::ReconcileError;
use super::store::{
    CriDocument, LocalReferralRef, MissingAttachment, NhsNumberMismatch, ReferralStore, StoreError,
};
use super::types::*;
use crate::ers::{
    Attachment, AttachmentSelector, ErsReferral, RegistryError, RegistrySession, ReviewOutcome,
    WorkListEntry, WorkListFetcher,
};
use crate::pipeline::extraction::fields::normalize_nhs_number;
use crate::pipeline::extraction::{
    map_referral, parse_document, LayoutTolerances, Preprocessor, ReferralRequest,
};

/// Skip reason for referrals the registry no longer returns.
pub const NOT_RETRIEVED: &str = "not retrieved";
/// Skip reason when no attachment survives selection.
pub const NO_VALID_ATTACHMENT: &str = "no valid attachment found";

type ProgressFn<'a> = Option<&'a dyn Fn(BatchStatusEvent)>;

/// An item stopped by a session-level failure. The batch cannot continue.
struct FatalItem {
    result: ReconciliationResult,
    reason: String,
}

type ItemOutcome = Result<ReconciliationResult, FatalItem>;

/// Orchestrates a reconciliation batch.
pub struct ReconcileRunner {
    selector: AttachmentSelector,
    fetcher: WorkListFetcher,
    tolerances: LayoutTolerances,
    preprocessor: Preprocessor,
    options: ReconcileOptions,
}

impl ReconcileRunner {
    pub fn new(
        selector: AttachmentSelector,
        fetcher: WorkListFetcher,
        tolerances: LayoutTolerances,
        preprocessor: Preprocessor,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            selector,
            fetcher,
            tolerances,
            preprocessor,
            options,
        }
    }

    /// Reconcile every outstanding referral on the work list.
    ///
    /// Returns `Err` only for fatal conditions; the partial result travels
    /// inside [`ReconcileError::Fatal`].
    pub fn run_batch(
        &self,
        session: &mut dyn RegistrySession,
        store: &dyn ReferralStore,
    ) -> Result<BatchResult, ReconcileError> {
        self.run_batch_with_progress(session, store, None)
    }

    /// As [`run_batch`](Self::run_batch), emitting a [`BatchStatusEvent`]
    /// at start, after each item and at the end.
    pub fn run_batch_with_progress(
        &self,
        session: &mut dyn RegistrySession,
        store: &dyn ReferralStore,
        progress: ProgressFn<'_>,
    ) -> Result<BatchResult, ReconcileError> {
        let start = Instant::now();
        let mut batch = BatchResult::empty();
        let emit = |event: BatchStatusEvent| {
            if let Some(f) = progress {
                f(event);
            }
        };

        tracing::info!(batch_id = %batch.batch_id, "Starting reconciliation batch");

        if let Err(e) = session.authenticate() {
            let reason = format!("Registry authentication failed: {e}");
            return Err(abort(batch, reason, &[], start, progress));
        }

        let work_list = match self.fetcher.fetch_work_list(&*session) {
            Ok(list) => list,
            Err(e) => {
                let reason = format!("Work list could not be retrieved: {e}");
                return Err(abort(batch, reason, &[], start, progress));
            }
        };
        for problem in &work_list.errors {
            tracing::warn!(batch_id = %batch.batch_id, problem = %problem, "Work list entry problem");
        }
        batch.errors.extend(work_list.errors.iter().cloned());

        let total = work_list.entries.len() as u32;
        emit(BatchStatusEvent::Started { entry_count: total });

        let mut consecutive_failures = 0u32;
        for (index, entry) in work_list.entries.iter().enumerate() {
            let result = match self.reconcile_entry(&*session, store, entry) {
                Ok(result) => result,
                Err(FatalItem { result, reason }) => {
                    log_item(&result);
                    batch.results.push(result);
                    let remaining = &work_list.entries[index + 1..];
                    return Err(abort(batch, reason, remaining, start, progress));
                }
            };

            log_item(&result);
            if result.state == ItemState::Failed {
                consecutive_failures += 1;
            } else {
                consecutive_failures = 0;
            }
            batch.results.push(result);

            emit(BatchStatusEvent::Progress {
                completed: index as u32 + 1,
                total,
                ubrn: entry.ubrn.to_string(),
            });

            if let Some(limit) = self.options.max_consecutive_failures {
                if limit > 0 && consecutive_failures >= limit {
                    let reason =
                        format!("Aborted after {consecutive_failures} consecutive item failures");
                    let remaining = &work_list.entries[index + 1..];
                    return Err(abort(batch, reason, remaining, start, progress));
                }
            }
        }

        batch.tally();
        batch.duration_ms = start.elapsed().as_millis() as u64;
        log_summary(&batch);

        emit(BatchStatusEvent::Completed {
            succeeded: batch.succeeded,
            failed: batch.failed,
            skipped: batch.skipped,
            duration_ms: batch.duration_ms,
        });

        Ok(batch)
    }

    /// Fetching → Parsing → Reconciling for one work-list entry.
    fn reconcile_entry(
        &self,
        session: &dyn RegistrySession,
        store: &dyn ReferralStore,
        entry: &WorkListEntry,
    ) -> ItemOutcome {
        let ubrn = &entry.ubrn;
        let mut result = ReconciliationResult::pending(ubrn);

        result.state = ItemState::Fetching;
        let mut referral = match self.fetcher.fetch_referral(session, ubrn) {
            Ok(referral) => referral,
            Err(e) => return registry_failure(result, "Referral could not be retrieved", e),
        };
        if !referral.is_found() {
            result.skip(NOT_RETRIEVED, Some(FailureCategory::NotFound));
            return Ok(result);
        }
        result.retrieved_from_registry = true;

        referral.apply_selector(&self.selector);
        let Some(attachment) = referral.most_recent_attachment().cloned() else {
            record_missing_attachment(store, entry, &referral, &mut result);
            result.skip(NO_VALID_ATTACHMENT, Some(FailureCategory::MissingAttachment));
            return Ok(result);
        };

        result.state = ItemState::Parsing;
        tracing::debug!(ubrn = %ubrn, attachment = %attachment.title, "Parsing attachment");
        let bytes = match self.fetcher.fetch_attachment(session, ubrn, &attachment) {
            Ok(bytes) => bytes,
            Err(e) => {
                let context = format!("Attachment '{}' could not be retrieved", attachment.title);
                return registry_failure(result, &context, e);
            }
        };
        let parsed = match parse_document(&bytes, &self.preprocessor, &self.tolerances) {
            Ok(parsed) => parsed,
            Err(e) => {
                result.fail(
                    FailureCategory::MalformedDocument,
                    format!("Attachment '{}' could not be parsed: {e}", attachment.title),
                );
                return Ok(result);
            }
        };
        tracing::debug!(
            ubrn = %ubrn,
            mode = parsed.layout.mode.as_str(),
            fields = parsed.len(),
            "Attachment parsed"
        );

        let fields = map_referral(&parsed);
        for warning in &fields.warnings {
            tracing::warn!(ubrn = %ubrn, warning = %warning, "Referral field ignored");
        }

        result.state = ItemState::Reconciling;
        let registry_nhs = referral
            .nhs_number
            .as_deref()
            .map(normalize_nhs_number)
            .filter(|n| !n.is_empty());
        if let (Some(registry_nhs), Some(document_nhs)) = (registry_nhs, fields.nhs_number.clone()) {
            if registry_nhs != document_nhs {
                let mismatch = NhsNumberMismatch {
                    ubrn: ubrn.clone(),
                    registry_nhs_number: registry_nhs,
                    document_nhs_number: document_nhs,
                    service_id: service_id(entry, &referral),
                    attachment_id: Some(attachment.id.clone()),
                };
                return self.handle_mismatch(session, store, mismatch, result);
            }
        }

        let request = ReferralRequest::new(
            ubrn.clone(),
            fields,
            referral.nhs_number.as_deref(),
            service_id(entry, &referral),
            Some(attachment.id.clone()),
            referral.version.clone(),
        );

        match store_referral(store, &request, &attachment, &bytes) {
            Ok((action, local)) => result.succeed(action, Some(local)),
            Err(e) => result.fail(
                FailureCategory::Store,
                format!("Local referral could not be saved: {e}"),
            ),
        }
        Ok(result)
    }

    /// Record the mismatch locally and in the registry, then fail the item.
    fn handle_mismatch(
        &self,
        session: &dyn RegistrySession,
        store: &dyn ReferralStore,
        mismatch: NhsNumberMismatch,
        mut result: ReconciliationResult,
    ) -> ItemOutcome {
        tracing::warn!(
            ubrn = %mismatch.ubrn,
            registry_nhs_number = %mismatch.registry_nhs_number,
            document_nhs_number = %mismatch.document_nhs_number,
            "NHS number mismatch between registry and attachment"
        );

        if let Err(e) = store.record_nhs_number_mismatch(&mismatch) {
            result
                .errors
                .push(format!("NHS number mismatch could not be recorded locally: {e}"));
        }

        let outcome = ReviewOutcome {
            ubrn: mismatch.ubrn.clone(),
            nhs_number: Some(mismatch.registry_nhs_number.clone()),
            comment: self
                .options
                .mismatch_comment(&mismatch.registry_nhs_number, &mismatch.document_nhs_number),
        };
        if let Err(e) = self.fetcher.record_outcome(session, &outcome) {
            if e.is_fatal() {
                return registry_failure(result, "Review outcome could not be recorded", e);
            }
            result
                .errors
                .push(format!("Review outcome could not be recorded: {e}"));
        }

        result.fail(
            FailureCategory::NhsNumberMismatch,
            format!(
                "NHS number in attachment ({}) does not match registry ({})",
                mismatch.document_nhs_number, mismatch.registry_nhs_number
            ),
        );
        Ok(result)
    }
}

/// Create, update or leave the local referral, then upsert its CRI document.
fn store_referral(
    store: &dyn ReferralStore,
    request: &ReferralRequest,
    attachment: &Attachment,
    bytes: &[u8],
) -> Result<(ReconcileAction, LocalReferralRef), StoreError> {
    let (action, local) = match store.find_referral(&request.ubrn)? {
        Some(existing) if existing.is_current(request) => {
            let local = LocalReferralRef {
                id: existing.id,
                ubrn: existing.ubrn,
            };
            return Ok((ReconcileAction::Unchanged, local));
        }
        Some(existing) => (
            ReconcileAction::Updated,
            store.update_referral(&existing.id, request)?,
        ),
        None => (ReconcileAction::Created, store.create_referral(request)?),
    };

    store.upsert_cri_document(&CriDocument::new(&request.ubrn, attachment, bytes))?;
    Ok((action, local))
}

fn record_missing_attachment(
    store: &dyn ReferralStore,
    entry: &WorkListEntry,
    referral: &ErsReferral,
    result: &mut ReconciliationResult,
) {
    let missing = MissingAttachment {
        ubrn: entry.ubrn.clone(),
        nhs_number: referral.nhs_number.clone(),
        service_id: service_id(entry, referral),
        excluded_files: referral.excluded_files.clone(),
        reason: NO_VALID_ATTACHMENT.to_string(),
    };
    if let Err(e) = store.record_missing_attachment(&missing) {
        result
            .errors
            .push(format!("Missing attachment could not be recorded: {e}"));
    }
}

/// The referral's own service id, else the work list's.
fn service_id(entry: &WorkListEntry, referral: &ErsReferral) -> Option<String> {
    referral
        .service_id
        .clone()
        .or_else(|| entry.service_id.clone())
}

fn registry_failure(
    mut result: ReconciliationResult,
    context: &str,
    error: RegistryError,
) -> ItemOutcome {
    let message = format!("{context}: {error}");
    if error.is_fatal() {
        result.fail(FailureCategory::Fatal, message.clone());
        return Err(FatalItem {
            result,
            reason: message,
        });
    }
    let category = if error.is_transient() {
        FailureCategory::Transient
    } else {
        FailureCategory::Registry
    };
    result.fail(category, message);
    Ok(result)
}

/// Stop the batch: mark `remaining` skipped and wrap the partial result.
fn abort(
    mut batch: BatchResult,
    reason: String,
    remaining: &[WorkListEntry],
    start: Instant,
    progress: ProgressFn<'_>,
) -> ReconcileError {
    for entry in remaining {
        let mut result = ReconciliationResult::pending(&entry.ubrn);
        result.skip(reason.clone(), Some(FailureCategory::Fatal));
        batch.results.push(result);
    }
    batch.success = false;
    batch.errors.push(reason.clone());
    batch.tally();
    batch.duration_ms = start.elapsed().as_millis() as u64;

    tracing::error!(
        batch_id = %batch.batch_id,
        reason = %reason,
        unprocessed = remaining.len(),
        "Reconciliation batch aborted"
    );
    log_summary(&batch);

    if let Some(f) = progress {
        f(BatchStatusEvent::Failed {
            error: reason.clone(),
        });
    }

    ReconcileError::Fatal {
        reason,
        partial: Box::new(batch),
    }
}

fn log_item(result: &ReconciliationResult) {
    let category = result.category.map(|c| c.as_str());
    match &result.state {
        ItemState::Succeeded => tracing::info!(
            ubrn = %result.ubrn,
            action = ?result.action,
            "Referral reconciled"
        ),
        ItemState::Skipped(reason) => tracing::info!(
            ubrn = %result.ubrn,
            reason = %reason,
            category,
            "Referral skipped"
        ),
        _ => tracing::warn!(
            ubrn = %result.ubrn,
            category,
            errors = ?result.errors,
            "Referral failed"
        ),
    }
}

fn log_summary(batch: &BatchResult) {
    tracing::info!(
        batch_id = %batch.batch_id,
        succeeded = batch.succeeded,
        failed = batch.failed,
        skipped = batch.skipped,
        success = batch.success,
        duration_ms = batch.duration_ms,
        errors = %batch.aggregate_error(),
        "Reconciliation batch finished"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::ers::{MockRegistrySession, ReferralResource, RetryPolicy, Ubrn};
    use crate::pipeline::extraction::pdf::tests::make_test_pdf;
    use crate::pipeline::reconcile::store::InMemoryReferralStore;

    const REGISTRY_NHS: &str = "9434765919";
    const OTHER_NHS: &str = "4010232137";

    fn runner_with(options: ReconcileOptions) -> ReconcileRunner {
        ReconcileRunner::new(
            AttachmentSelector::new("pdf|rtf", &["*consent*".to_string()]).unwrap(),
            WorkListFetcher::new(RetryPolicy::default()).with_sleeper(|_| {}),
            LayoutTolerances::default(),
            Preprocessor::default(),
            options,
        )
    }

    fn runner() -> ReconcileRunner {
        runner_with(ReconcileOptions::default())
    }

    /// Referral resource with one DocumentReference per `(id, title, created)`.
    fn referral(nhs: &str, version: &str, attachments: &[(&str, &str, &str)]) -> ReferralResource {
        let content: Vec<_> = attachments
            .iter()
            .map(|(id, title, created)| {
                json!({
                    "attachment": {
                        "id": id,
                        "title": title,
                        "contentType": "application/octet-stream",
                        "creation": created,
                    }
                })
            })
            .collect();
        serde_json::from_value(json!({
            "resourceType": "ReferralRequest",
            "meta": { "versionId": version },
            "subject": { "identifier": { "system": "https://fhir.nhs.uk/Id/nhs-number", "value": nhs } },
            "serviceId": "svc-1",
            "contained": [{ "resourceType": "DocumentReference", "id": "doc", "content": content }],
        }))
        .unwrap()
    }

    fn rtf_letter(nhs: &str) -> Vec<u8> {
        format!(
            "{{\\rtf1\\ansi Name:\\tab Jane Smith\\par NHS Number:\\tab {nhs}\\par Postcode:\\tab ls1 4ap\\par }}"
        )
        .into_bytes()
    }

    /// Session with referrals A and C holding a valid RTF letter each.
    fn standard_session(work_list: &[&str]) -> MockRegistrySession {
        MockRegistrySession::new()
            .with_work_list(work_list)
            .with_referral("A", referral(REGISTRY_NHS, "1", &[("att-a", "letter.rtf", "2024-03-01")]))
            .with_referral("C", referral(OTHER_NHS, "1", &[("att-c", "letter.rtf", "2024-03-02")]))
            .with_attachment("att-a", rtf_letter(REGISTRY_NHS))
            .with_attachment("att-c", rtf_letter(OTHER_NHS))
    }

    fn unavailable() -> RegistryError {
        RegistryError::Http {
            status: 503,
            body: "Service Unavailable".into(),
        }
    }

    #[test]
    fn missing_referral_skipped_and_batch_succeeds() {
        let mut session = standard_session(&["A", "B", "C"]);
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        assert_eq!((batch.succeeded, batch.failed, batch.skipped), (2, 0, 1));
        let b = batch.result("B").unwrap();
        assert_eq!(b.state, ItemState::Skipped(NOT_RETRIEVED.into()));
        assert_eq!(b.category, Some(FailureCategory::NotFound));
        assert!(!b.retrieved_from_registry);

        let a = batch.result("A").unwrap();
        assert_eq!(a.action, Some(ReconcileAction::Created));
        assert!(a.retrieved_from_registry);
        assert_eq!(store.referral_count(), 2);
    }

    #[test]
    fn created_referral_carries_document_fields() {
        let mut session = standard_session(&["A"]);
        let store = InMemoryReferralStore::new();

        runner().run_batch(&mut session, &store).unwrap();

        let (local, request) = store.referral(&Ubrn::new("A")).unwrap();
        assert_eq!(local.referral_attachment_id.as_deref(), Some("att-a"));
        assert_eq!(request.fields.given_name.as_deref(), Some("Jane"));
        assert_eq!(request.fields.family_name.as_deref(), Some("Smith"));
        assert_eq!(request.fields.nhs_number.as_deref(), Some(REGISTRY_NHS));
        assert_eq!(request.fields.postcode.as_deref(), Some("LS1 4AP"));
        assert_eq!(request.service_id.as_deref(), Some("svc-1"));

        let cri = store.cri_document(&Ubrn::new("A")).unwrap();
        assert_eq!(cri.decode_content().unwrap(), rtf_letter(REGISTRY_NHS));
    }

    #[test]
    fn rerun_leaves_current_referral_unchanged() {
        let runner = runner();
        let store = InMemoryReferralStore::new();

        let mut session = standard_session(&["A"]);
        runner.run_batch(&mut session, &store).unwrap();
        let writes = store.write_count();

        let mut session = standard_session(&["A"]);
        let batch = runner.run_batch(&mut session, &store).unwrap();

        let a = batch.result("A").unwrap();
        assert_eq!(a.state, ItemState::Succeeded);
        assert_eq!(a.action, Some(ReconcileAction::Unchanged));
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.referral_count(), 1);
    }

    #[test]
    fn rerun_classifies_every_entry_the_same() {
        let runner = runner();
        let store = InMemoryReferralStore::new();
        let classify = |batch: &BatchResult| -> Vec<(String, ItemState)> {
            batch
                .results
                .iter()
                .map(|r| (r.ubrn.to_string(), r.state.clone()))
                .collect()
        };

        let mut session = standard_session(&["A", "B", "C"]);
        let first = runner.run_batch(&mut session, &store).unwrap();
        let mut session = standard_session(&["A", "B", "C"]);
        let second = runner.run_batch(&mut session, &store).unwrap();

        assert_eq!(classify(&first), classify(&second));
        assert_ne!(first.batch_id, second.batch_id);
    }

    #[test]
    fn new_registry_version_updates_referral() {
        let runner = runner();
        let store = InMemoryReferralStore::new();

        let mut session = standard_session(&["A"]);
        runner.run_batch(&mut session, &store).unwrap();

        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral("A", referral(REGISTRY_NHS, "2", &[("att-a2", "letter v2.rtf", "2024-04-01")]))
            .with_attachment("att-a2", rtf_letter(REGISTRY_NHS));
        let batch = runner.run_batch(&mut session, &store).unwrap();

        let a = batch.result("A").unwrap();
        assert_eq!(a.action, Some(ReconcileAction::Updated));
        let (local, _) = store.referral(&Ubrn::new("A")).unwrap();
        assert_eq!(local.registry_version.as_deref(), Some("2"));
        assert_eq!(local.referral_attachment_id.as_deref(), Some("att-a2"));
        assert_eq!(store.referral_count(), 1);
    }

    #[test]
    fn most_recent_attachment_is_used() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral(
                "A",
                referral(
                    REGISTRY_NHS,
                    "1",
                    &[
                        ("old", "first letter.rtf", "2024-01-01"),
                        ("new", "second letter.rtf", "2024-02-01"),
                    ],
                ),
            )
            .with_attachment("new", rtf_letter(REGISTRY_NHS));
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert_eq!(batch.succeeded, 1);
        let (local, _) = store.referral(&Ubrn::new("A")).unwrap();
        assert_eq!(local.referral_attachment_id.as_deref(), Some("new"));
    }

    #[test]
    fn nhs_number_mismatch_recorded_in_store_and_registry() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral("A", referral(REGISTRY_NHS, "1", &[("att-a", "letter.rtf", "2024-03-01")]))
            .with_attachment("att-a", rtf_letter("401 023 2137"));
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        let a = batch.result("A").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(a.category, Some(FailureCategory::NhsNumberMismatch));
        assert_eq!(store.referral_count(), 0);

        let mismatches = store.mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].registry_nhs_number, REGISTRY_NHS);
        assert_eq!(mismatches[0].document_nhs_number, OTHER_NHS);
        assert_eq!(mismatches[0].attachment_id.as_deref(), Some("att-a"));

        let outcomes = session.recorded_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].ubrn, Ubrn::new("A"));
        assert!(outcomes[0].comment.contains(OTHER_NHS));
    }

    #[test]
    fn mismatch_found_in_one_line_letter() {
        let letter = "{\\rtf1\\ansi Name: Jane Smith\\par NHS Number: 401 023 2137\\par Postcode: LS1 4AP\\par }";
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral("A", referral(REGISTRY_NHS, "1", &[("att-a", "letter.rtf", "2024-03-01")]))
            .with_attachment("att-a", letter.as_bytes().to_vec());
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        let a = batch.result("A").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(a.category, Some(FailureCategory::NhsNumberMismatch));
        assert_eq!(store.referral_count(), 0);
        assert_eq!(store.mismatches()[0].document_nhs_number, OTHER_NHS);
    }

    #[test]
    fn invalid_document_nhs_number_falls_back_to_registry() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral("A", referral(REGISTRY_NHS, "1", &[("att-a", "letter.rtf", "2024-03-01")]))
            .with_attachment("att-a", rtf_letter("9434765918"));
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert_eq!(batch.succeeded, 1);
        assert!(store.mismatches().is_empty());
        let (_, request) = store.referral(&Ubrn::new("A")).unwrap();
        assert_eq!(request.fields.nhs_number.as_deref(), Some(REGISTRY_NHS));
    }

    #[test]
    fn missing_attachment_skipped_and_recorded() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral(
                "A",
                referral(
                    REGISTRY_NHS,
                    "1",
                    &[
                        ("d1", "letter.docx", "2024-03-01"),
                        ("c1", "Patient Consent.pdf", "2024-03-01"),
                    ],
                ),
            );
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        let a = batch.result("A").unwrap();
        assert_eq!(a.state, ItemState::Skipped(NO_VALID_ATTACHMENT.into()));
        assert_eq!(a.category, Some(FailureCategory::MissingAttachment));
        assert!(a.retrieved_from_registry);

        let missing = store.missing_attachments();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].excluded_files, vec!["Patient Consent.pdf".to_string()]);
        assert_eq!(missing[0].nhs_number.as_deref(), Some(REGISTRY_NHS));
    }

    #[test]
    fn malformed_attachment_fails_item_and_batch_continues() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A", "C"])
            .with_referral("A", referral(REGISTRY_NHS, "1", &[("att-a", "letter.pdf", "2024-03-01")]))
            .with_referral("C", referral(OTHER_NHS, "1", &[("att-c", "letter.rtf", "2024-03-02")]))
            .with_attachment("att-a", b"PK\x03\x04word/document.xml".to_vec())
            .with_attachment("att-c", rtf_letter(OTHER_NHS));
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        let a = batch.result("A").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(a.category, Some(FailureCategory::MalformedDocument));
        assert!(a.errors[0].contains("letter.pdf"));
        assert_eq!(batch.result("C").unwrap().state, ItemState::Succeeded);
        assert!(batch.aggregate_error().starts_with("UBRN A: "));
    }

    #[test]
    fn pdf_attachment_reconciled() {
        let pdf = make_test_pdf(&[
            "BT /F1 12 Tf 72 700 Td (Name:) Tj 200 0 Td (Jane Smith) Tj \
             -200 -20 Td (NHS Number:) Tj 200 0 Td (943 476 5919) Tj ET",
        ]);
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A"])
            .with_referral("A", referral(REGISTRY_NHS, "1", &[("att-a", "letter.pdf", "2024-03-01")]))
            .with_attachment("att-a", pdf);
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert_eq!(batch.succeeded, 1, "{}", batch.aggregate_error());
        let (_, request) = store.referral(&Ubrn::new("A")).unwrap();
        assert_eq!(request.fields.family_name.as_deref(), Some("Smith"));
        assert_eq!(request.fields.nhs_number.as_deref(), Some(REGISTRY_NHS));
    }

    #[test]
    fn store_failure_fails_item_only() {
        let mut session = standard_session(&["A", "C"]);
        let store = InMemoryReferralStore::failing_writes(StoreError::Http {
            status: 500,
            body: "boom".into(),
        });

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        assert_eq!(batch.failed, 2);
        assert!(batch
            .results
            .iter()
            .all(|r| r.category == Some(FailureCategory::Store)));
    }

    #[test]
    fn authentication_failure_is_fatal() {
        let mut session = standard_session(&["A"])
            .fail_authentication(RegistryError::Unauthorized("smartcard missing".into()));
        let store = InMemoryReferralStore::new();

        let err = runner().run_batch(&mut session, &store).unwrap_err();

        let partial = err.partial().unwrap();
        assert!(!partial.success);
        assert!(partial.results.is_empty());
        assert!(partial.errors[0].contains("authentication"));
    }

    #[test]
    fn unauthorized_mid_batch_aborts_remaining_entries() {
        let mut session = standard_session(&["A", "B", "C"])
            .with_referral("B", referral(REGISTRY_NHS, "1", &[]))
            .with_referral_failures("B", vec![RegistryError::Unauthorized("session expired".into())]);
        let store = InMemoryReferralStore::new();

        let err = runner().run_batch(&mut session, &store).unwrap_err();

        let ReconcileError::Fatal { reason, partial } = err else {
            panic!("expected fatal error");
        };
        assert!(reason.contains("session expired"));
        assert!(!partial.success);
        assert_eq!(partial.results.len(), 3);
        assert_eq!(partial.result("A").unwrap().state, ItemState::Succeeded);
        let b = partial.result("B").unwrap();
        assert_eq!(b.state, ItemState::Failed);
        assert_eq!(b.category, Some(FailureCategory::Fatal));
        let c = partial.result("C").unwrap();
        assert_eq!(c.state, ItemState::Skipped(reason.clone()));
        assert_eq!(c.category, Some(FailureCategory::Fatal));
        assert_eq!((partial.succeeded, partial.failed, partial.skipped), (1, 1, 1));
        assert_eq!(store.referral_count(), 1);
    }

    #[test]
    fn exhausted_transient_failures_fail_item() {
        let mut session = standard_session(&["A", "C"]).with_referral_failures(
            "A",
            vec![unavailable(), unavailable(), unavailable(), unavailable()],
        );
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        let a = batch.result("A").unwrap();
        assert_eq!(a.state, ItemState::Failed);
        assert_eq!(a.category, Some(FailureCategory::Transient));
        assert_eq!(batch.result("C").unwrap().state, ItemState::Succeeded);
        // A: 4 attempts, C: 1
        assert_eq!(session.referral_calls(), 5);
    }

    #[test]
    fn transient_failures_recovered_within_budget() {
        let mut session = standard_session(&["A"])
            .with_referral_failures("A", vec![unavailable(), unavailable(), unavailable()]);
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert_eq!(batch.succeeded, 1);
    }

    #[test]
    fn work_list_failure_is_fatal() {
        let mut session = standard_session(&["A"]).with_work_list_failures(vec![RegistryError::Http {
            status: 400,
            body: "bad request".into(),
        }]);
        let store = InMemoryReferralStore::new();

        let err = runner().run_batch(&mut session, &store).unwrap_err();

        assert!(matches!(err, ReconcileError::Fatal { .. }));
        assert!(err.to_string().contains("Work list could not be retrieved"));
        assert_eq!(session.referral_calls(), 0);
    }

    #[test]
    fn circuit_breaker_aborts_after_consecutive_failures() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A", "B", "C", "D"])
            .with_referral_failures("A", vec![RegistryError::Http { status: 400, body: String::new() }])
            .with_referral_failures("B", vec![RegistryError::Http { status: 400, body: String::new() }])
            .with_referral("C", referral(REGISTRY_NHS, "1", &[("att-c", "letter.rtf", "2024-03-01")]))
            .with_attachment("att-c", rtf_letter(REGISTRY_NHS));
        let store = InMemoryReferralStore::new();
        let runner = runner_with(ReconcileOptions {
            max_consecutive_failures: Some(2),
            ..Default::default()
        });

        let err = runner.run_batch(&mut session, &store).unwrap_err();

        let partial = err.partial().unwrap();
        assert_eq!(partial.failed, 2);
        assert_eq!(partial.skipped, 2);
        assert_eq!(
            partial.result("A").unwrap().category,
            Some(FailureCategory::Registry)
        );
        assert!(partial.errors.last().unwrap().contains("2 consecutive"));
        assert_eq!(store.referral_count(), 0);
    }

    #[test]
    fn circuit_breaker_disabled_by_default() {
        let mut session = MockRegistrySession::new()
            .with_work_list(&["A", "B", "C"])
            .with_referral_failures("A", vec![RegistryError::Http { status: 400, body: String::new() }])
            .with_referral_failures("B", vec![RegistryError::Http { status: 400, body: String::new() }])
            .with_referral_failures("C", vec![RegistryError::Http { status: 400, body: String::new() }]);
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        assert_eq!(batch.failed, 3);
    }

    #[test]
    fn duplicate_work_list_entries_noted() {
        let mut session = standard_session(&["A", "A", "C"]);
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.aggregate_error().contains("Duplicate"));
    }

    #[test]
    fn progress_events_emitted() {
        let mut session = standard_session(&["A", "B"]);
        let store = InMemoryReferralStore::new();
        let events = Mutex::new(Vec::new());
        let record = |event: BatchStatusEvent| events.lock().unwrap().push(event);

        runner()
            .run_batch_with_progress(&mut session, &store, Some(&record))
            .unwrap();

        let events = events.into_inner().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], BatchStatusEvent::Started { entry_count: 2 });
        assert_eq!(
            events[2],
            BatchStatusEvent::Progress {
                completed: 2,
                total: 2,
                ubrn: "B".into()
            }
        );
        assert!(matches!(
            events[3],
            BatchStatusEvent::Completed { succeeded: 1, skipped: 1, .. }
        ));
    }

    #[test]
    fn empty_work_list_is_successful() {
        let mut session = MockRegistrySession::new().with_work_list(&[]);
        let store = InMemoryReferralStore::new();

        let batch = runner().run_batch(&mut session, &store).unwrap();

        assert!(batch.success);
        assert!(batch.results.is_empty());
        assert_eq!(batch.aggregate_error(), "");
    }
}
