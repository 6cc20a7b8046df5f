use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{CapacityProbe, CapacityReading};
use crate::error::{PipelineError, Result};

/// Reads quota figures for one Nextcloud user through the OCS API.
#[derive(Clone)]
pub struct NextcloudCapacityProbe {
    http: reqwest::Client,
    endpoint: Url,
    user: String,
    password: String,
}

impl fmt::Debug for NextcloudCapacityProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextcloudCapacityProbe")
            .field("endpoint", &self.endpoint.as_str())
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct OcsEnvelope {
    ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
struct OcsBody {
    meta: OcsMeta,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OcsMeta {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OcsUser {
    quota: OcsQuota,
}

#[derive(Debug, Deserialize)]
struct OcsQuota {
    #[serde(default)]
    free: Option<f64>,
    used: f64,
    #[serde(default)]
    total: Option<f64>,
}

impl NextcloudCapacityProbe {
    pub fn new(
        base_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let user = user.into();
        let endpoint = Self::endpoint_for(base_url, &user)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                PipelineError::Probe(format!("failed to create HTTP client: {e}"))
            })?;
        Ok(Self {
            http,
            endpoint,
            user,
            password: password.into(),
        })
    }

    fn endpoint_for(base_url: &str, user: &str) -> Result<Url> {
        let mut base = Url::parse(base_url).map_err(|e| {
            PipelineError::Configuration(format!(
                "invalid Nextcloud URL '{base_url}': {e}"
            ))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut endpoint = base.join("ocs/v1.php/cloud/users/").map_err(|e| {
            PipelineError::Configuration(format!("invalid OCS endpoint: {e}"))
        })?;
        endpoint
            .path_segments_mut()
            .map_err(|_| {
                PipelineError::Configuration(format!(
                    "Nextcloud URL '{base_url}' cannot carry a path"
                ))
            })?
            .pop_if_empty()
            .push(user);
        endpoint.query_pairs_mut().append_pair("format", "json");
        Ok(endpoint)
    }

    fn parse_quota(body: &[u8]) -> Result<CapacityReading> {
        let envelope: OcsEnvelope = serde_json::from_slice(body)?;
        if envelope.ocs.meta.status != "ok" {
            return Err(PipelineError::Probe(format!(
                "OCS request failed: {}",
                envelope.ocs.meta.message.unwrap_or_default()
            )));
        }
        let quota = serde_json::from_value::<OcsUser>(envelope.ocs.data)
            .map_err(|e| {
                PipelineError::Probe(format!("unexpected OCS user payload: {e}"))
            })?
            .quota;

        let used = quota.used.max(0.0) as u64;
        // Unlimited quotas report a negative total; fall back to used + free.
        let total = match (quota.total, quota.free) {
            (Some(total), _) if total > 0.0 => total as u64,
            (_, Some(free)) if free >= 0.0 => used.saturating_add(free as u64),
            _ => {
                return Err(PipelineError::Probe(
                    "quota reports neither total nor free space".into(),
                ));
            }
        };
        Ok(CapacityReading {
            used_bytes: used,
            total_bytes: total,
        })
    }
}

#[async_trait]
impl CapacityProbe for NextcloudCapacityProbe {
    async fn read_capacity(&self) -> Result<CapacityReading> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .basic_auth(&self.user, Some(&self.password))
            .header("OCS-APIRequest", "true")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                PipelineError::Probe(format!("Nextcloud request failed: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(PipelineError::Probe(format!(
                "Nextcloud capacity query failed: HTTP {}",
                response.status()
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            PipelineError::Probe(format!("failed to read Nextcloud response: {e}"))
        })?;
        let reading = Self::parse_quota(&body)?;

        debug!(
            target: "storage::nextcloud",
            used_bytes = reading.used_bytes,
            total_bytes = reading.total_bytes,
            "capacity read"
        );
        Ok(reading)
    }
}
