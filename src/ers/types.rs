//! Registry wire types and the domain types derived from them.
//!
//! Wire structs mirror the FHIR-like JSON the registry returns and are
//! deliberately permissive: every field is optional so that one malformed
//! entry never fails a whole response.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::attachments::AttachmentSelector;

// ═══════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════

/// Unique booking reference number of a referral in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ubrn(String);

impl Ubrn {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    /// Parse a UBRN, rejecting blank values.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Extract the UBRN from a FHIR reference such as `ReferralRequest/000000070000`.
    pub fn from_reference(reference: &str) -> Option<Self> {
        let id = reference.rsplit('/').next().unwrap_or(reference);
        Self::parse(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Ubrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════
// Wire types: work list
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkListResource {
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub entry: Vec<WorkListItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkListItem {
    #[serde(default)]
    pub item: Option<Reference>,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub referral_source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub reference: Option<String>,
}

// ═══════════════════════════════════════════
// Wire types: referral
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralResource {
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub meta: Option<Meta>,
    #[serde(default)]
    pub subject: Option<Subject>,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub contained: Vec<ContainedResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub identifier: Option<Identifier>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// A contained resource. Only `DocumentReference` entries carry attachments,
/// but the selector tolerates anything with a `content` collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainedResource {
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<Vec<ContentItem>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(default)]
    pub attachment: Option<AttachmentResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentResource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// FHIR dateTime: full RFC 3339 or a bare date.
    #[serde(default)]
    pub creation: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

// ═══════════════════════════════════════════
// Domain types
// ═══════════════════════════════════════════

/// One outstanding referral on the registry work list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkListEntry {
    pub ubrn: Ubrn,
    pub referral_source: Option<String>,
    pub service_id: Option<String>,
}

/// Deduplicated work list plus the entry-level problems found while reading it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkList {
    pub entries: Vec<WorkListEntry>,
    pub errors: Vec<String>,
}

impl WorkList {
    /// Build from the wire resource. Entries are deduplicated by UBRN only,
    /// first occurrence wins.
    pub fn from_resource(resource: WorkListResource) -> Self {
        let mut list = WorkList::default();

        for (index, item) in resource.entry.into_iter().enumerate() {
            let reference = item.item.and_then(|r| r.reference).unwrap_or_default();
            let Some(ubrn) = Ubrn::from_reference(&reference) else {
                list.errors
                    .push(format!("Work list entry {index} has no referral reference"));
                continue;
            };

            if list.entries.iter().any(|e| e.ubrn == ubrn) {
                list.errors
                    .push(format!("Duplicate work list entry for UBRN {ubrn} ignored"));
                continue;
            }

            list.entries.push(WorkListEntry {
                ubrn,
                referral_source: item.referral_source,
                service_id: item.service_id,
            });
        }

        list
    }
}

/// An attachment value object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub title: String,
    pub created: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub url: Option<String>,
}

impl Attachment {
    pub fn from_resource(resource: &AttachmentResource) -> Self {
        let title = resource.title.clone().unwrap_or_default();
        Self {
            id: resource.id.clone().unwrap_or_else(|| title.clone()),
            created: resource.creation.as_deref().and_then(parse_fhir_datetime),
            content_type: resource.content_type.clone(),
            size: resource.size,
            url: resource.url.clone(),
            title,
        }
    }

    /// Lowercase file extension taken from the title, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.title.trim().rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Whether the registry returned the referral. Failed retrievals never
/// produce an `ErsReferral`; they surface as [`RegistryError`](super::RegistryError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    Found,
    NotFound,
}

/// A referral as retrieved from the registry.
///
/// `attachments` and `excluded_files` are empty until
/// [`ErsReferral::apply_selector`] finalizes them from `contained`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErsReferral {
    pub ubrn: Ubrn,
    pub nhs_number: Option<String>,
    pub version: Option<String>,
    pub service_id: Option<String>,
    pub status: RetrievalStatus,
    #[serde(skip)]
    pub contained: Vec<ContainedResource>,
    pub attachments: Vec<Attachment>,
    pub excluded_files: Vec<String>,
}

impl ErsReferral {
    pub fn from_resource(ubrn: &Ubrn, resource: ReferralResource) -> Self {
        let nhs_number = resource
            .subject
            .and_then(|s| s.identifier)
            .and_then(|i| i.value)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            ubrn: ubrn.clone(),
            nhs_number,
            version: resource.meta.and_then(|m| m.version_id),
            service_id: resource.service_id,
            status: RetrievalStatus::Found,
            contained: resource.contained,
            attachments: Vec::new(),
            excluded_files: Vec::new(),
        }
    }

    pub fn not_found(ubrn: &Ubrn) -> Self {
        Self {
            ubrn: ubrn.clone(),
            nhs_number: None,
            version: None,
            service_id: None,
            status: RetrievalStatus::NotFound,
            contained: Vec::new(),
            attachments: Vec::new(),
            excluded_files: Vec::new(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == RetrievalStatus::Found
    }

    /// Finalize the attachment lists from the contained resources.
    pub fn apply_selector(&mut self, selector: &AttachmentSelector) {
        let selection = selector.select(&self.contained);
        self.attachments = selection.attachments;
        self.excluded_files = selection.excluded_files;
    }

    /// The most recent supported attachment.
    pub fn most_recent_attachment(&self) -> Option<&Attachment> {
        self.attachments.first()
    }
}

/// Review comment recorded against a referral in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub ubrn: Ubrn,
    pub nhs_number: Option<String>,
    pub comment: String,
}

/// Parse a FHIR dateTime (`2024-03-01T10:00:00Z` or `2024-03-01`).
pub fn parse_fhir_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
