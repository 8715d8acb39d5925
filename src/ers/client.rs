use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::session::RegistrySession;
use super::types::{Attachment, ReferralResource, ReviewOutcome, Ubrn, WorkListResource};
use super::RegistryError;
use crate::settings::RegistrySettings;

/// Header carrying the session key on every call after authentication.
pub const SESSION_HEADER: &str = "X-Session-Key";

/// Blocking HTTP session against the registry API.
pub struct HttpRegistrySession {
    base_url: String,
    api_key: String,
    user_id: String,
    client: Client,
    timeout_secs: u64,
    session_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    api_key: &'a str,
    user_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
}

impl HttpRegistrySession {
    pub fn new(settings: &RegistrySettings) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| RegistryError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            user_id: settings.user_id.clone(),
            client,
            timeout_secs: settings.timeout_secs,
            session_key: None,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_key.is_some()
    }

    fn session_key(&self) -> Result<&str, RegistryError> {
        self.session_key.as_deref().ok_or(RegistryError::NoSession)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| RegistryError::HttpClient(format!("invalid base URL: {e}")))?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                RegistryError::HttpClient(format!("base URL cannot be a base: {}", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> RegistryError {
        if e.is_connect() {
            RegistryError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            RegistryError::Timeout(self.timeout_secs)
        } else {
            RegistryError::HttpClient(e.to_string())
        }
    }

    fn get(&self, segments: &[&str], resource: &str) -> Result<Response, RegistryError> {
        let key = self.session_key()?;
        let response = self
            .client
            .get(self.endpoint(segments)?)
            .header(SESSION_HEADER, key)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        check_status(response, resource)
    }
}

fn check_status(response: Response, resource: &str) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(RegistryError::from_status(status.as_u16(), body, resource))
}

impl RegistrySession for HttpRegistrySession {
    fn authenticate(&mut self) -> Result<(), RegistryError> {
        let body = SessionRequest {
            api_key: &self.api_key,
            user_id: &self.user_id,
        };

        let response = self
            .client
            .post(self.endpoint(&["session"])?)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        let response = check_status(response, "session")?;

        let parsed: SessionResponse = response
            .json()
            .map_err(|e| RegistryError::ResponseParsing(e.to_string()))?;

        tracing::info!(user_id = %self.user_id, "Registry session established");
        self.session_key = Some(parsed.session_id);
        Ok(())
    }

    fn fetch_work_list(&self) -> Result<WorkListResource, RegistryError> {
        self.get(&["worklist"], "worklist")?
            .json()
            .map_err(|e| RegistryError::ResponseParsing(e.to_string()))
    }

    fn fetch_referral(&self, ubrn: &Ubrn) -> Result<ReferralResource, RegistryError> {
        self.get(&["referrals", ubrn.as_str()], &format!("referral {ubrn}"))?
            .json()
            .map_err(|e| RegistryError::ResponseParsing(e.to_string()))
    }

    fn fetch_attachment(
        &self,
        ubrn: &Ubrn,
        attachment: &Attachment,
    ) -> Result<Vec<u8>, RegistryError> {
        let resource = format!("attachment {} of referral {ubrn}", attachment.id);
        let bytes = self
            .get(
                &["referrals", ubrn.as_str(), "attachments", &attachment.id],
                &resource,
            )?
            .bytes()
            .map_err(|e| RegistryError::ResponseParsing(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn record_outcome(&self, outcome: &ReviewOutcome) -> Result<(), RegistryError> {
        let key = self.session_key()?;
        let response = self
            .client
            .post(self.endpoint(&["referrals", outcome.ubrn.as_str(), "outcome"])?)
            .header(SESSION_HEADER, key)
            .json(outcome)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        check_status(response, &format!("outcome for referral {}", outcome.ubrn))?;
        Ok(())
    }
}
