use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::LocalReferralRef;
use crate::ers::Ubrn;

// ═══════════════════════════════════════════
// Per-item state
// ═══════════════════════════════════════════

/// Lifecycle of one work-list entry within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Fetching,
    Parsing,
    Reconciling,
    Succeeded,
    Failed,
    Skipped(String),
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Reconciling => "reconciling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// Why an item did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Network failures that outlived the retry budget.
    Transient,
    NotFound,
    /// Registry rejected a request or returned something unreadable.
    Registry,
    MalformedDocument,
    /// Registry and document disagree; needs manual review.
    NhsNumberMismatch,
    MissingAttachment,
    Store,
    Fatal,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Registry => "registry",
            Self::MalformedDocument => "malformed_document",
            Self::NhsNumberMismatch => "nhs_number_mismatch",
            Self::MissingAttachment => "missing_attachment",
            Self::Store => "store",
            Self::Fatal => "fatal",
        }
    }
}

/// What reconciliation did to the local referral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Created,
    Updated,
    Unchanged,
}

// ═══════════════════════════════════════════
// Results
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub ubrn: Ubrn,
    pub state: ItemState,
    pub success: bool,
    pub errors: Vec<String>,
    pub category: Option<FailureCategory>,
    pub retrieved_from_registry: bool,
    pub local_referral: Option<LocalReferralRef>,
    pub action: Option<ReconcileAction>,
}

impl ReconciliationResult {
    pub fn pending(ubrn: &Ubrn) -> Self {
        Self {
            ubrn: ubrn.clone(),
            state: ItemState::Pending,
            success: false,
            errors: Vec::new(),
            category: None,
            retrieved_from_registry: false,
            local_referral: None,
            action: None,
        }
    }

    pub fn succeed(&mut self, action: ReconcileAction, local: Option<LocalReferralRef>) {
        self.state = ItemState::Succeeded;
        self.success = true;
        self.action = Some(action);
        self.local_referral = local;
    }

    pub fn fail(&mut self, category: FailureCategory, error: impl Into<String>) {
        self.state = ItemState::Failed;
        self.success = false;
        self.category = Some(category);
        self.errors.push(error.into());
    }

    pub fn skip(&mut self, reason: impl Into<String>, category: Option<FailureCategory>) {
        self.state = ItemState::Skipped(reason.into());
        self.success = false;
        self.category = category;
    }
}

/// Outcome of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub results: Vec<ReconciliationResult>,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    /// False only when a fatal condition stopped the batch.
    pub success: bool,
    /// Batch-level problems (work-list entry errors, fatal reason).
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self {
            batch_id: new_batch_id(),
            results: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            success: true,
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Recompute the counters from `results`.
    pub fn tally(&mut self) {
        self.succeeded = 0;
        self.failed = 0;
        self.skipped = 0;
        for r in &self.results {
            match r.state {
                ItemState::Succeeded => self.succeeded += 1,
                ItemState::Failed => self.failed += 1,
                ItemState::Skipped(_) => self.skipped += 1,
                _ => {}
            }
        }
    }

    /// Batch errors followed by every per-item error, one per line.
    pub fn aggregate_error(&self) -> String {
        self.errors
            .iter()
            .cloned()
            .chain(self.results.iter().flat_map(|r| {
                r.errors.iter().map(move |e| format!("UBRN {}: {e}", r.ubrn))
            }))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn result(&self, ubrn: &str) -> Option<&ReconciliationResult> {
        self.results.iter().find(|r| r.ubrn.as_str() == ubrn)
    }
}

pub fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}

// ═══════════════════════════════════════════
// Progress events
// ═══════════════════════════════════════════

/// Emitted by the runner while a batch progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchStatusEvent {
    Started { entry_count: u32 },
    Progress { completed: u32, total: u32, ubrn: String },
    Completed { succeeded: u32, failed: u32, skipped: u32, duration_ms: u64 },
    Failed { error: String },
}

// ═══════════════════════════════════════════
// Options
// ═══════════════════════════════════════════

/// Batch-level behaviour switches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileOptions {
    /// Abort the batch after this many consecutive item failures.
    /// `None` never aborts.
    pub max_consecutive_failures: Option<u32>,
    /// Review comment recorded in the registry on an NHS number mismatch.
    pub mismatch_comment: Option<String>,
}

impl ReconcileOptions {
    pub fn mismatch_comment(&self, registry: &str, document: &str) -> String {
        self.mismatch_comment.clone().unwrap_or_else(|| {
            format!(
                "NHS number in referral letter ({document}) does not match the registry ({registry})"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ubrn: &str) -> ReconciliationResult {
        ReconciliationResult::pending(&Ubrn::new(ubrn))
    }

    #[test]
    fn tally_counts_terminal_states() {
        let mut batch = BatchResult::empty();
        let mut a = result("A");
        a.succeed(ReconcileAction::Created, None);
        let mut b = result("B");
        b.skip("not retrieved", Some(FailureCategory::NotFound));
        let mut c = result("C");
        c.fail(FailureCategory::MalformedDocument, "bad pdf");
        batch.results = vec![a, b, c, result("D")];
        batch.tally();

        assert_eq!((batch.succeeded, batch.failed, batch.skipped), (1, 1, 1));
    }

    #[test]
    fn aggregate_error_joins_lines() {
        let mut batch = BatchResult::empty();
        batch.errors.push("Duplicate work list entry for UBRN A ignored".into());
        let mut c = result("C");
        c.fail(FailureCategory::MalformedDocument, "bad pdf");
        batch.results.push(c);

        assert_eq!(
            batch.aggregate_error(),
            "Duplicate work list entry for UBRN A ignored\nUBRN C: bad pdf"
        );
    }

    #[test]
    fn empty_batch_is_successful() {
        let batch = BatchResult::empty();
        assert!(batch.success);
        assert_eq!(batch.aggregate_error(), "");
        assert_eq!(batch.batch_id.len(), 36);
    }

    #[test]
    fn item_state_serializes_reason() {
        let json = serde_json::to_value(ItemState::Skipped("not retrieved".into())).unwrap();
        assert_eq!(json["state"], "skipped");
        assert_eq!(json["reason"], "not retrieved");
    }

    #[test]
    fn progress_event_tagged() {
        let event = BatchStatusEvent::Progress {
            completed: 1,
            total: 3,
            ubrn: "A".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Progress\""));
    }

    #[test]
    fn default_mismatch_comment_names_both_numbers() {
        let comment = ReconcileOptions::default().mismatch_comment("9434765919", "4010232137");
        assert!(comment.contains("9434765919"));
        assert!(comment.contains("4010232137"));
    }
}
