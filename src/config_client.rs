//! REST calls against the Milestone Management Server: camera listing and
//! recorder resolution (§4.2).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::auth::AuthBroker;
use crate::config::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("camera not found: {0}")]
    CameraNotFound(String),

    #[error("no reachable recording server for camera {0}")]
    RecorderUnreachable(String),

    #[error("network error talking to the Milestone REST API: {0}")]
    Network(#[from] reqwest::Error),
}

/// Camera descriptor (§3), produced by `ConfigClient` and consumed
/// read-only by `Exporter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(skip)]
    pub recording_server_host: String,
    #[serde(skip)]
    pub recording_server_port: u16,
}

#[derive(Deserialize)]
struct CamerasResponse {
    array: Vec<RawCamera>,
}

#[derive(Deserialize)]
struct RawCamera {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize)]
struct RecordingServersResponse {
    array: Vec<RawRecordingServer>,
}

#[derive(Deserialize)]
struct RawRecordingServer {
    #[serde(rename = "hostName")]
    host_name: String,
    #[serde(rename = "portNumber", default = "default_port")]
    port_number: u16,
    #[serde(default)]
    cameras: Vec<String>,
}

fn default_port() -> u16 {
    7563
}

pub struct ConfigClient {
    http: reqwest::Client,
    server_url: String,
    auth: Arc<AuthBroker>,
}

impl ConfigClient {
    pub fn new(config: &Config, auth: Arc<AuthBroker>) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.tls_verify)
            .build()?;
        Ok(Self {
            http,
            server_url: config.server_url.clone(),
            auth,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_cameras(&self) -> Result<Vec<Camera>, ConfigError> {
        let url = format!("{}/api/rest/v1/cameras", self.server_url);
        let response = self.get_with_oauth_retry(&url).await?;
        let body: CamerasResponse = response.json().await?;

        Ok(body
            .array
            .into_iter()
            .map(|c| Camera {
                id: c.id,
                display_name: c.display_name,
                enabled: c.enabled,
                recording_server_host: String::new(),
                recording_server_port: 0,
            })
            .collect())
    }

    /// Resolves the host/port of the Recording Server owning `camera_id`.
    ///
    /// Uses the simpler sufficient strategy named in §4.2: list all
    /// recording servers and pick the one whose child set contains the
    /// camera, rather than walking `relations.parent` → hardware →
    /// recordingServer (left as an Open Question, see DESIGN.md).
    #[instrument(skip(self))]
    pub async fn resolve_recorder(&self, camera_id: &str) -> Result<(String, u16), ConfigError> {
        let url = format!("{}/api/rest/v1/recordingServers", self.server_url);
        let response = self.get_with_oauth_retry(&url).await?;
        let body: RecordingServersResponse = response.json().await?;

        body.array
            .into_iter()
            .find(|server| server.cameras.iter().any(|c| c == camera_id))
            .map(|server| (server.host_name, server.port_number))
            .ok_or_else(|| ConfigError::CameraNotFound(camera_id.to_string()))
    }

    /// GETs `url` bearing the cached OAuth token; on a 401, forces one
    /// refresh and retries exactly once (§7's one-refresh-on-401 rule)
    /// before surfacing the error.
    async fn get_with_oauth_retry(&self, url: &str) -> Result<reqwest::Response, ConfigError> {
        let oauth = self.auth.oauth_token().await.map_err(|_| {
            ConfigError::RecorderUnreachable("could not obtain OAuth token".to_string())
        })?;

        let response = self.http.get(url).bearer_auth(&oauth).send().await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response.error_for_status()?);
        }

        let oauth = self.auth.force_refresh_oauth().await.map_err(|_| {
            ConfigError::RecorderUnreachable("OAuth refresh after 401 failed".to_string())
        })?;
        let response = self.http.get(url).bearer_auth(&oauth).send().await?;
        Ok(response.error_for_status()?)
    }
}
