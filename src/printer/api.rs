//! Moonraker REST calls
//!
//! The connection task never awaits these; they run inside spawned jobs.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::MoonrakerConfig;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("moonraker returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Slicer metadata of a gcode file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub estimated_time: Option<f64>,
    #[serde(default)]
    pub print_start_time: Option<f64>,
    #[serde(default)]
    pub filament_total: Option<f64>,
    #[serde(default)]
    pub filament_weight_total: Option<f64>,
}

/// Calls the monitor makes against the printer host
#[async_trait]
pub trait MoonrakerApi: Send + Sync {
    async fn file_metadata(&self, filename: &str) -> Result<FileMetadata, ApiError>;

    /// Switch a power device; returns the state the device reports afterwards
    async fn set_device_power(&self, device: &str, on: bool) -> Result<bool, ApiError>;

    async fn run_gcode(&self, script: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    source: &'static str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResult {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// reqwest-backed Moonraker client with API key or JWT authentication
pub struct MoonrakerClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    credentials: Option<(String, String)>,
    tokens: RwLock<Tokens>,
}

impl MoonrakerClient {
    pub fn new(config: &MoonrakerConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(config.ssl && !config.ssl_verify)
            .build()?;

        let credentials = match (&config.user, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            client,
            base_url: config.http_url(),
            api_key: config.api_token.clone(),
            credentials,
            tokens: RwLock::new(Tokens::default()),
        })
    }

    fn with_auth(&self, builder: RequestBuilder, access: Option<&str>) -> RequestBuilder {
        let builder = match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        };
        match access {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Log in with user and password, if configured
    pub async fn login(&self) -> Result<(), ApiError> {
        let Some((user, password)) = &self.credentials else {
            return Ok(());
        };

        let response = self
            .client
            .post(format!("{}/access/login", self.base_url))
            .json(&LoginRequest {
                username: user,
                password,
                source: "moonraker",
            })
            .send()
            .await?;
        let result: LoginResult = parse_result(response).await?;

        let mut tokens = self.tokens.write().await;
        tokens.access = Some(result.token);
        tokens.refresh = result.refresh_token;
        info!("Logged in to moonraker as {}", user);
        Ok(())
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        let refresh = self.tokens.read().await.refresh.clone();
        let Some(refresh) = refresh else {
            return self.login().await;
        };

        let response = self
            .client
            .post(format!("{}/access/refresh_jwt", self.base_url))
            .json(&RefreshRequest {
                refresh_token: &refresh,
            })
            .send()
            .await?;

        match parse_result::<LoginResult>(response).await {
            Ok(result) => {
                self.tokens.write().await.access = Some(result.token);
                debug!("Refreshed moonraker access token");
                Ok(())
            }
            Err(e) => {
                warn!("Token refresh failed ({}), logging in again", e);
                self.login().await
            }
        }
    }

    /// Send a request, refreshing the access token once on 401
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retried = false;

        loop {
            let access = self.tokens.read().await.access.clone();
            let builder = self.client.request(method.clone(), &url).query(query);
            let response = self.with_auth(builder, access.as_deref()).send().await?;

            if response.status() == StatusCode::UNAUTHORIZED
                && self.credentials.is_some()
                && !retried
            {
                retried = true;
                self.refresh().await?;
                continue;
            }

            return parse_result(response).await;
        }
    }

    /// One-shot token for the websocket URL, when authentication is in use
    pub async fn oneshot_token(&self) -> Result<Option<String>, ApiError> {
        if self.api_key.is_none() && self.credentials.is_none() {
            return Ok(None);
        }
        let value = self
            .request(Method::GET, "/access/oneshot_token", &[])
            .await?;
        match value {
            Value::String(token) => Ok(Some(token)),
            other => Err(ApiError::Malformed(format!(
                "oneshot token is not a string: {}",
                other
            ))),
        }
    }
}

async fn parse_result<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }

    let mut body: Value = response.json().await?;
    let result = body
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| ApiError::Malformed("missing result field".to_string()))?;
    serde_json::from_value(result).map_err(|e| ApiError::Malformed(e.to_string()))
}

#[async_trait]
impl MoonrakerApi for MoonrakerClient {
    async fn file_metadata(&self, filename: &str) -> Result<FileMetadata, ApiError> {
        let value = self
            .request(
                Method::GET,
                "/server/files/metadata",
                &[("filename", filename)],
            )
            .await?;
        serde_json::from_value(value).map_err(|e| ApiError::Malformed(e.to_string()))
    }

    async fn set_device_power(&self, device: &str, on: bool) -> Result<bool, ApiError> {
        let action = if on { "on" } else { "off" };
        let value = self
            .request(
                Method::POST,
                "/machine/device_power/device",
                &[("device", device), ("action", action)],
            )
            .await?;
        device_state_from(&value, device)
    }

    async fn run_gcode(&self, script: &str) -> Result<(), ApiError> {
        self.request(Method::POST, "/printer/gcode/script", &[("script", script)])
            .await?;
        Ok(())
    }
}

fn device_state_from(value: &Value, device: &str) -> Result<bool, ApiError> {
    match value.get(device).and_then(Value::as_str) {
        Some(state) => Ok(state == "on"),
        None => Err(ApiError::Malformed(format!(
            "no state for device {} in {}",
            device, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let meta: FileMetadata =
            serde_json::from_value(json!({"estimated_time": 3600.0, "size": 12})).unwrap();
        assert_eq!(meta.estimated_time, Some(3600.0));
        assert_eq!(meta.filament_total, None);
    }

    #[test]
    fn test_device_state_parsing() {
        let value = json!({"chamber_light": "on"});
        assert!(device_state_from(&value, "chamber_light").unwrap());
        assert!(device_state_from(&json!({"chamber_light": "off"}), "chamber_light").is_ok_and(|on| !on));
        assert!(device_state_from(&value, "psu").is_err());
    }

    #[test]
    fn test_client_builds_from_config() {
        let config = MoonrakerConfig {
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let client = MoonrakerClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:7125");
        assert!(client.credentials.is_some());
    }
}
