//! HTTPS client for the remote scoring services.
//!
//! Uses reqwest with rustls. When a pinned certificate is configured, the
//! built-in roots are disabled so only that root is trusted. Both endpoints
//! answer with a [`RemoteRiskStatus`] JSON document.

use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{ExposureScoringApi, RemoteRiskStatus, VenueCheckin, WarningScoringApi};
use crate::config::EndpointConfig;
use crate::error::{ConfigError, SourceError};

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WarningStatusRequest<'a> {
    visit_tokens: &'a [VenueCheckin],
}

pub struct HttpScoringClient {
    client: reqwest::Client,
    proximity_url: Option<String>,
    warning_url: Option<String>,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpScoringClient {
    pub fn new(endpoints: &EndpointConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .https_only(true);

        if let Some(path) = &endpoints.pinned_certificate_path {
            let pem = fs::read(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ConfigError::Invalid {
                field: "endpoints.pinnedCertificatePath",
                reason: e.to_string(),
            })?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert);
        }

        let client = builder.build().map_err(|e| ConfigError::Invalid {
            field: "endpoints",
            reason: format!("Failed to build HTTP client: {}", e),
        })?;

        Ok(Self {
            client,
            proximity_url: endpoints.proximity_status_url.clone(),
            warning_url: endpoints.warning_status_url.clone(),
            api_token: endpoints.api_token.clone(),
            timeout,
        })
    }

    async fn post_status<B: Serialize + Sync>(
        &self,
        url: Option<&str>,
        body: &B,
    ) -> Result<RemoteRiskStatus, SourceError> {
        let url = url.ok_or_else(|| SourceError::Network("endpoint not configured".to_string()))?;

        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::Unauthorized);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SourceError::Server {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        let text = resp.text().await.map_err(|e| self.transport_error(e))?;
        decode_status(&text)
    }

    fn transport_error(&self, err: reqwest::Error) -> SourceError {
        if err.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl ExposureScoringApi for HttpScoringClient {
    async fn fetch_proximity_status(&self) -> Result<RemoteRiskStatus, SourceError> {
        self.post_status(self.proximity_url.as_deref(), &serde_json::json!({}))
            .await
    }
}

#[async_trait]
impl WarningScoringApi for HttpScoringClient {
    async fn fetch_warning_status(
        &self,
        checkins: &[VenueCheckin],
    ) -> Result<RemoteRiskStatus, SourceError> {
        let body = WarningStatusRequest {
            visit_tokens: checkins,
        };
        self.post_status(self.warning_url.as_deref(), &body).await
    }
}

/// Decode a scoring response body.
pub fn decode_status(body: &str) -> Result<RemoteRiskStatus, SourceError> {
    let status: RemoteRiskStatus =
        serde_json::from_str(body).map_err(|e| SourceError::Decoding(e.to_string()))?;
    if !status.risk_level.is_finite() || status.risk_level < 0.0 {
        return Err(SourceError::Decoding(format!(
            "invalid risk level {}",
            status.risk_level
        )));
    }
    Ok(status)
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_ERROR_BODY_CHARS {
        let head: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_decode_status() {
        let status = decode_status(r#"{ "riskLevel": 3, "lastRiskScoringDate": "2024-03-01T00:00:00Z" }"#)
            .expect("valid body");
        assert_eq!(status.risk_level, 3.0);
        assert_eq!(
            status.last_risk_scoring_date,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_rejects_garbage_and_negative_levels() {
        assert!(matches!(decode_status("<html>"), Err(SourceError::Decoding(_))));
        assert!(matches!(
            decode_status(r#"{ "riskLevel": -1 }"#),
            Err(SourceError::Decoding(_))
        ));
    }

    #[test]
    fn test_warning_request_shape() {
        let checkins = vec![VenueCheckin {
            payload: "abc".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }];
        let body = serde_json::to_value(WarningStatusRequest {
            visit_tokens: &checkins,
        })
        .unwrap();
        assert_eq!(body["visitTokens"][0]["payload"], "abc");
        assert_eq!(body["visitTokens"][0]["timestamp"], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn test_truncate_long_error_bodies() {
        let long = "x".repeat(500);
        let short = truncate(&long);
        assert_eq!(short.len(), MAX_ERROR_BODY_CHARS + 3);
        assert_eq!(truncate("oops"), "oops");
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_network_error() {
        let client = HttpScoringClient::new(&EndpointConfig::default(), Duration::from_secs(5))
            .expect("client builds");
        let result = client.fetch_proximity_status().await;
        assert!(matches!(result, Err(SourceError::Network(_))));
    }

    #[test]
    fn test_missing_pinned_certificate_fails_construction() {
        let endpoints = EndpointConfig {
            pinned_certificate_path: Some("/nonexistent/pin.pem".into()),
            ..EndpointConfig::default()
        };
        assert!(matches!(
            HttpScoringClient::new(&endpoints, Duration::from_secs(5)),
            Err(ConfigError::Read { .. })
        ));
    }
}
