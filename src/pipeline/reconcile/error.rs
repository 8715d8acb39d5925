//! Batch-level errors. Per-item failures never surface here; they are
//! recorded on the item's [`ReconciliationResult`](super::ReconciliationResult).

use thiserror::Error;

use super::types::BatchResult;
use crate::ers::SelectorError;
use crate::pipeline::extraction::ExtractionError;
use crate::settings::ConfigError;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The batch stopped early. `partial` holds every entry, with the ones
    /// never reached marked skipped.
    #[error("Reconciliation batch aborted: {reason}")]
    Fatal {
        reason: String,
        partial: Box<BatchResult>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Attachment selector error: {0}")]
    Selector(#[from] SelectorError),

    #[error("Preprocessor error: {0}")]
    Preprocessor(#[from] ExtractionError),

    #[error("Client setup failed: {0}")]
    ClientSetup(String),
}

impl ReconcileError {
    /// The partial batch result of a fatal abort.
    pub fn partial(&self) -> Option<&BatchResult> {
        match self {
            Self::Fatal { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
