//! Local referral persistence.
//!
//! The reconciliation runner only sees [`ReferralStore`]. Production uses
//! the referral service's HTTP API; tests and dry runs use
//! [`InMemoryReferralStore`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ers::{Attachment, Ubrn};
use crate::pipeline::extraction::ReferralRequest;
use crate::settings::LocalApiSettings;

/// Header carrying the local API key.
pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Referral API is not reachable at {0}")]
    Connection(String),

    #[error("Referral API request timed out after {0}s")]
    Timeout(u64),

    #[error("Referral API returned error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Referral API rejected the API key")]
    Unauthorized,

    #[error("Local referral not found: {0}")]
    NotFound(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

// ═══════════════════════════════════════════
// Records
// ═══════════════════════════════════════════

/// A referral as the local service holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalReferral {
    pub id: String,
    pub ubrn: Ubrn,
    pub referral_attachment_id: Option<String>,
    pub registry_version: Option<String>,
}

impl LocalReferral {
    /// Same attachment and registry version: nothing to update.
    pub fn is_current(&self, request: &ReferralRequest) -> bool {
        self.referral_attachment_id == request.referral_attachment_id
            && self.registry_version == request.registry_version
    }
}

/// Identity returned by create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalReferralRef {
    pub id: String,
    pub ubrn: Ubrn,
}

/// The clinical record information document: the attachment the referral
/// was read from, stored alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriDocument {
    pub ubrn: Ubrn,
    pub attachment_id: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// Base64 of the raw attachment bytes.
    pub content: String,
}

impl CriDocument {
    pub fn new(ubrn: &Ubrn, attachment: &Attachment, bytes: &[u8]) -> Self {
        Self {
            ubrn: ubrn.clone(),
            attachment_id: attachment.id.clone(),
            file_name: attachment.title.clone(),
            content_type: attachment.content_type.clone(),
            created: attachment.created,
            content: STANDARD.encode(bytes),
        }
    }

    pub fn decode_content(&self) -> Result<Vec<u8>, StoreError> {
        STANDARD
            .decode(&self.content)
            .map_err(|e| StoreError::ResponseParsing(format!("CRI content: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NhsNumberMismatch {
    pub ubrn: Ubrn,
    pub registry_nhs_number: String,
    pub document_nhs_number: String,
    pub service_id: Option<String>,
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingAttachment {
    pub ubrn: Ubrn,
    pub nhs_number: Option<String>,
    pub service_id: Option<String>,
    pub excluded_files: Vec<String>,
    pub reason: String,
}

// ═══════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════

pub trait ReferralStore {
    fn find_referral(&self, ubrn: &Ubrn) -> Result<Option<LocalReferral>, StoreError>;

    fn create_referral(&self, request: &ReferralRequest) -> Result<LocalReferralRef, StoreError>;

    fn update_referral(
        &self,
        id: &str,
        request: &ReferralRequest,
    ) -> Result<LocalReferralRef, StoreError>;

    fn upsert_cri_document(&self, document: &CriDocument) -> Result<(), StoreError>;

    fn record_nhs_number_mismatch(&self, mismatch: &NhsNumberMismatch) -> Result<(), StoreError>;

    fn record_missing_attachment(&self, missing: &MissingAttachment) -> Result<(), StoreError>;
}

// ═══════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════

/// Blocking client for the local referral API.
pub struct HttpReferralStore {
    base_url: String,
    api_key: String,
    client: Client,
    timeout_secs: u64,
}

impl HttpReferralStore {
    pub fn new(settings: &LocalApiSettings) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| StoreError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            client,
            timeout_secs: settings.timeout_secs,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StoreError::HttpClient(format!("invalid base URL: {e}")))?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                StoreError::HttpClient(format!("base URL cannot be a base: {}", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> StoreError {
        if e.is_connect() {
            StoreError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            StoreError::Timeout(self.timeout_secs)
        } else {
            StoreError::HttpClient(e.to_string())
        }
    }

    fn send_json<T: Serialize>(
        &self,
        method: reqwest::Method,
        segments: &[&str],
        body: &T,
    ) -> Result<Response, StoreError> {
        let response = self
            .client
            .request(method, self.endpoint(segments)?)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        check_status(response, &segments.join("/"))
    }
}

fn check_status(response: Response, resource: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized,
        StatusCode::NOT_FOUND => StoreError::NotFound(resource.to_string()),
        _ => StoreError::Http {
            status: status.as_u16(),
            body,
        },
    })
}

impl ReferralStore for HttpReferralStore {
    fn find_referral(&self, ubrn: &Ubrn) -> Result<Option<LocalReferral>, StoreError> {
        let response = self
            .client
            .get(self.endpoint(&["referral", "ubrn", ubrn.as_str()])?)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response, "referral/ubrn")?
            .json()
            .map(Some)
            .map_err(|e| StoreError::ResponseParsing(e.to_string()))
    }

    fn create_referral(&self, request: &ReferralRequest) -> Result<LocalReferralRef, StoreError> {
        self.send_json(reqwest::Method::POST, &["referral"], request)?
            .json()
            .map_err(|e| StoreError::ResponseParsing(e.to_string()))
    }

    fn update_referral(
        &self,
        id: &str,
        request: &ReferralRequest,
    ) -> Result<LocalReferralRef, StoreError> {
        self.send_json(reqwest::Method::PUT, &["referral", id], request)?
            .json()
            .map_err(|e| StoreError::ResponseParsing(e.to_string()))
    }

    fn upsert_cri_document(&self, document: &CriDocument) -> Result<(), StoreError> {
        self.send_json(
            reqwest::Method::PUT,
            &["referral", document.ubrn.as_str(), "cri"],
            document,
        )?;
        Ok(())
    }

    fn record_nhs_number_mismatch(&self, mismatch: &NhsNumberMismatch) -> Result<(), StoreError> {
        self.send_json(
            reqwest::Method::POST,
            &["referral", "nhsnumbermismatch"],
            mismatch,
        )?;
        Ok(())
    }

    fn record_missing_attachment(&self, missing: &MissingAttachment) -> Result<(), StoreError> {
        self.send_json(
            reqwest::Method::POST,
            &["referral", "missingattachment"],
            missing,
        )?;
        Ok(())
    }
}

// ═══════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════

#[derive(Default)]
struct InMemoryState {
    referrals: HashMap<Ubrn, (LocalReferral, ReferralRequest)>,
    cri_documents: HashMap<Ubrn, CriDocument>,
    mismatches: Vec<NhsNumberMismatch>,
    missing_attachments: Vec<MissingAttachment>,
    next_id: u64,
    writes: usize,
}

/// Store backed by a mutex-guarded map. Ids are sequential (`ref-1`, ...).
#[derive(Default)]
pub struct InMemoryReferralStore {
    state: Mutex<InMemoryState>,
    fail_writes: Option<StoreError>,
}

impl InMemoryReferralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with `error` (reads still succeed).
    pub fn failing_writes(error: StoreError) -> Self {
        Self {
            fail_writes: Some(error),
            ..Self::default()
        }
    }

    pub fn referral(&self, ubrn: &Ubrn) -> Option<(LocalReferral, ReferralRequest)> {
        self.state.lock().ok()?.referrals.get(ubrn).cloned()
    }

    pub fn referral_count(&self) -> usize {
        self.state.lock().map(|s| s.referrals.len()).unwrap_or(0)
    }

    pub fn cri_document(&self, ubrn: &Ubrn) -> Option<CriDocument> {
        self.state.lock().ok()?.cri_documents.get(ubrn).cloned()
    }

    pub fn mismatches(&self) -> Vec<NhsNumberMismatch> {
        self.state
            .lock()
            .map(|s| s.mismatches.clone())
            .unwrap_or_default()
    }

    pub fn missing_attachments(&self) -> Vec<MissingAttachment> {
        self.state
            .lock()
            .map(|s| s.missing_attachments.clone())
            .unwrap_or_default()
    }

    /// Create, update and CRI writes performed so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or(0)
    }

    fn with_state<T>(
        &self,
        write: bool,
        f: impl FnOnce(&mut InMemoryState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if write {
            if let Some(e) = &self.fail_writes {
                return Err(e.clone());
            }
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::HttpClient("in-memory store lock poisoned".into()))?;
        f(&mut *state)
    }
}

impl ReferralStore for InMemoryReferralStore {
    fn find_referral(&self, ubrn: &Ubrn) -> Result<Option<LocalReferral>, StoreError> {
        self.with_state(false, |s| Ok(s.referrals.get(ubrn).map(|(r, _)| r.clone())))
    }

    fn create_referral(&self, request: &ReferralRequest) -> Result<LocalReferralRef, StoreError> {
        self.with_state(true, |s| {
            s.next_id += 1;
            s.writes += 1;
            let local = LocalReferral {
                id: format!("ref-{}", s.next_id),
                ubrn: request.ubrn.clone(),
                referral_attachment_id: request.referral_attachment_id.clone(),
                registry_version: request.registry_version.clone(),
            };
            let reference = LocalReferralRef {
                id: local.id.clone(),
                ubrn: local.ubrn.clone(),
            };
            s.referrals
                .insert(request.ubrn.clone(), (local, request.clone()));
            Ok(reference)
        })
    }

    fn update_referral(
        &self,
        id: &str,
        request: &ReferralRequest,
    ) -> Result<LocalReferralRef, StoreError> {
        self.with_state(true, |s| {
            let entry = s
                .referrals
                .get_mut(&request.ubrn)
                .filter(|(local, _)| local.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("referral {id}")))?;
            entry.0.referral_attachment_id = request.referral_attachment_id.clone();
            entry.0.registry_version = request.registry_version.clone();
            entry.1 = request.clone();
            s.writes += 1;
            Ok(LocalReferralRef {
                id: id.to_string(),
                ubrn: request.ubrn.clone(),
            })
        })
    }

    fn upsert_cri_document(&self, document: &CriDocument) -> Result<(), StoreError> {
        self.with_state(true, |s| {
            s.cri_documents
                .insert(document.ubrn.clone(), document.clone());
            s.writes += 1;
            Ok(())
        })
    }

    fn record_nhs_number_mismatch(&self, mismatch: &NhsNumberMismatch) -> Result<(), StoreError> {
        self.with_state(true, |s| {
            s.mismatches.push(mismatch.clone());
            Ok(())
        })
    }

    fn record_missing_attachment(&self, missing: &MissingAttachment) -> Result<(), StoreError> {
        self.with_state(true, |s| {
            s.missing_attachments.push(missing.clone());
            Ok(())
        })
    }
}
