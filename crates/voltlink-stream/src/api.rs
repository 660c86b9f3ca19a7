//! Rate-limited helper for the owner REST API.
//!
//! Every call made through [`ApiClient`] waits on the shared
//! [`RateLimiter`] before it reaches the transport.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use voltlink_core::RateLimiter;

use crate::error::{ApiError, ApiResult, TransportError};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// The owner API wraps every payload in `{"response": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: T,
}

/// A vehicle as listed on the account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VehicleSummary {
    /// Owner-API id, used in REST paths.
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    /// Streaming identity, used in the stream URL.
    #[serde(deserialize_with = "id_string")]
    pub vehicle_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl VehicleSummary {
    /// The first listed token authorizes streaming.
    pub fn streaming_token(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }
}

/// Outcome body of a command or wake-up call.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub result: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Ids arrive as JSON numbers larger than 2^53 on some accounts, or as
/// strings on others; keep them as text either way.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Owner REST API client.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    base_url: String,
    access_token: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            limiter,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call(&self, request: HttpRequest) -> ApiResult<HttpResponse> {
        self.limiter.before_call(&request.url).await;
        let url = request.url.clone();
        let request = request.authorization(format!("Bearer {}", self.access_token));
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(TransportError::Status {
                status: response.status,
                url,
            }
            .into());
        }
        Ok(response)
    }

    fn decode<T: DeserializeOwned>(url: &str, response: &HttpResponse) -> ApiResult<T> {
        let envelope: Envelope<T> =
            serde_json::from_str(&response.body).map_err(|e| ApiError::Parse {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(envelope.response)
    }

    /// GET `path` and unwrap the `response` field.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let url = self.url(path);
        let response = self.call(HttpRequest::get(&url)).await?;
        Self::decode(&url, &response)
    }

    /// POST `body` to `path` and unwrap the `response` field.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> ApiResult<T> {
        let url = self.url(path);
        let response = self.call(HttpRequest::post(&url).json(body)).await?;
        Self::decode(&url, &response)
    }

    pub async fn vehicles(&self) -> ApiResult<Vec<VehicleSummary>> {
        self.get_json("/api/1/vehicles").await
    }

    /// Ask the vehicle to wake up. Success only means the request was
    /// accepted; the vehicle may take a while to come online.
    pub async fn wake_up(&self, vehicle_id: &str) -> ApiResult<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/api/1/vehicles/{vehicle_id}/wake_up"),
                serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    /// Run a named vehicle command.
    ///
    /// # Errors
    /// Returns [`ApiError::Rejected`] when the service reports
    /// `result: false`.
    pub async fn command(
        &self,
        vehicle_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> ApiResult<CommandResult> {
        let outcome: CommandResult = self
            .post_json(
                &format!("/api/1/vehicles/{vehicle_id}/command/{command}"),
                params,
            )
            .await?;
        if !outcome.result {
            return Err(ApiError::Rejected {
                command: command.to_string(),
                reason: outcome.reason.clone().unwrap_or_default(),
            });
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("transport", &self.transport)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_summary_accepts_numeric_ids() {
        let body = r#"{"response":[{"id":12345678901234567,"vehicle_id":490215852,
            "display_name":"Blue","tokens":["abc","def"]}]}"#;
        let envelope: Envelope<Vec<VehicleSummary>> = serde_json::from_str(body).unwrap();
        let vehicle = &envelope.response[0];
        assert_eq!(vehicle.id, "12345678901234567");
        assert_eq!(vehicle.vehicle_id, "490215852");
        assert_eq!(vehicle.streaming_token(), Some("abc"));
    }

    #[test]
    fn test_vehicle_summary_without_tokens() {
        let body = r#"{"id":"1","vehicle_id":"2"}"#;
        let vehicle: VehicleSummary = serde_json::from_str(body).unwrap();
        assert!(vehicle.streaming_token().is_none());
    }

    #[test]
    fn test_command_result_defaults() {
        let outcome: CommandResult = serde_json::from_str("{}").unwrap();
        assert!(!outcome.result);
        assert!(outcome.reason.is_none());
    }
}
