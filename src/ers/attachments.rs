//! Attachment selection: filter a referral's contained attachments down to
//! the supported, non-excluded files, most recent first.

use regex::Regex;
use thiserror::Error;

use super::types::{Attachment, ContainedResource};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("Supported file extension list must not be empty")]
    EmptyAllowList,

    #[error("Invalid file name exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Output of [`AttachmentSelector::select`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentSelection {
    /// Supported attachments, most recent first.
    pub attachments: Vec<Attachment>,
    /// Titles of attachments that matched an exclusion pattern.
    pub excluded_files: Vec<String>,
}

impl AttachmentSelection {
    pub fn most_recent(&self) -> Option<&Attachment> {
        self.attachments.first()
    }
}

/// Allow-list and blacklist, built once from configuration.
#[derive(Debug, Clone)]
pub struct AttachmentSelector {
    allowed_extensions: Vec<String>,
    exclusions: Vec<Regex>,
}

impl AttachmentSelector {
    /// `allowed_extensions` is pipe-delimited, e.g. `"pdf|rtf|docx"`.
    /// `exclusions` are case-insensitive wildcard patterns (`*`, `?`)
    /// matched against the whole attachment title.
    pub fn new(allowed_extensions: &str, exclusions: &[String]) -> Result<Self, SelectorError> {
        let allowed: Vec<String> = allowed_extensions
            .split('|')
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        if allowed.is_empty() {
            return Err(SelectorError::EmptyAllowList);
        }

        let exclusions = exclusions
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| wildcard_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed_extensions: allowed,
            exclusions,
        })
    }

    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    pub fn is_supported(&self, attachment: &Attachment) -> bool {
        attachment
            .extension()
            .is_some_and(|ext| self.allowed_extensions.iter().any(|a| *a == ext))
    }

    pub fn is_excluded(&self, title: &str) -> bool {
        let title = title.trim();
        self.exclusions.iter().any(|re| re.is_match(title))
    }

    /// Select supported attachments from the contained resources.
    ///
    /// Containers without a content collection and content items without an
    /// attachment are skipped silently.
    pub fn select(&self, contained: &[ContainedResource]) -> AttachmentSelection {
        let mut selection = AttachmentSelection::default();

        let candidates = contained
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flatten()
            .filter_map(|item| item.attachment.as_ref())
            .map(Attachment::from_resource);

        for attachment in candidates {
            if self.is_excluded(&attachment.title) {
                tracing::debug!(title = %attachment.title, "Attachment excluded by file name pattern");
                selection.excluded_files.push(attachment.title);
                continue;
            }
            if !self.is_supported(&attachment) {
                tracing::debug!(
                    title = %attachment.title,
                    allowed = ?self.allowed_extensions,
                    "Attachment has unsupported file type"
                );
                continue;
            }
            selection.attachments.push(attachment);
        }

        // Stable: equal timestamps keep input order. Missing timestamps last.
        selection
            .attachments
            .sort_by(|a, b| b.created.cmp(&a.created));

        selection
    }
}

/// Compile a wildcard pattern into an anchored, case-insensitive regex.
fn wildcard_to_regex(pattern: &str) -> Result<Regex, SelectorError> {
    let mut expr = String::from("(?i)^");
    for c in pattern.trim().chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| SelectorError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
