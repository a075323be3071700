//! Two-token authentication against a Milestone XProtect installation: an
//! OAuth bearer for REST/SOAP calls, and an opaque ImageServer session token
//! required by the TCP `connect` method (§4.1).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::xml::extract_tag;

/// Refresh a token once its remaining TTL drops below this.
const REFRESH_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid OAuth credentials")]
    InvalidCredentials,

    #[error("SOAP login failed: {0}")]
    SoapLoginFailed(String),

    #[error("token expired and no refresh was attempted")]
    Expired,

    #[error("network error talking to the identity/management server: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Clone)]
struct OAuthToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Clone)]
struct ImageServerToken {
    token: String,
    acquired_at: Instant,
    ttl: Duration,
}

/// Process-wide authentication state. Mutations are serialized behind the
/// `AuthBroker`'s single `Mutex`; see §5 "single-writer discipline".
struct AuthState {
    oauth: Option<OAuthToken>,
    imageserver: Option<ImageServerToken>,
    instance_id: String,
}

pub struct AuthBroker {
    http: reqwest::Client,
    server_url: String,
    username: String,
    password: String,
    state: Mutex<AuthState>,
}

#[derive(Deserialize)]
struct OAuthResponse {
    access_token: String,
    expires_in: u64,
}

impl AuthBroker {
    pub fn new(config: &Config) -> Result<Arc<Self>, AuthError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.tls_verify)
            .build()?;

        Ok(Arc::new(Self {
            http,
            server_url: config.server_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            state: Mutex::new(AuthState {
                oauth: None,
                imageserver: None,
                instance_id: Uuid::new_v4().to_string(),
            }),
        }))
    }

    /// Returns a valid OAuth bearer token, acquiring or refreshing it first
    /// if necessary.
    #[instrument(skip(self))]
    pub async fn oauth_token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        if let Some(tok) = &state.oauth {
            if tok.expires_at > Instant::now() + REFRESH_SKEW {
                return Ok(tok.access_token.clone());
            }
        }
        let tok = self.acquire_oauth().await?;
        let access_token = tok.access_token.clone();
        state.oauth = Some(tok);
        Ok(access_token)
    }

    /// Forces a fresh OAuth token regardless of the cached one's remaining
    /// TTL. Used by the one-refresh-on-401 retry (§7) after a dependent
    /// REST/SOAP call rejects the cached token outright.
    #[instrument(skip(self))]
    pub async fn force_refresh_oauth(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        let tok = self.acquire_oauth().await?;
        let access_token = tok.access_token.clone();
        state.oauth = Some(tok);
        Ok(access_token)
    }

    /// Returns a valid ImageServer session token, acquiring or refreshing it
    /// first if necessary. Invariant: an ImageServer token is never issued
    /// before an unexpired OAuth token exists (§3).
    #[instrument(skip(self))]
    pub async fn imageserver_token(&self) -> Result<String, AuthError> {
        // Held for the whole operation (including the SOAP round trip and
        // its possible retry) rather than re-acquired via `oauth_token()`/
        // `force_refresh_oauth()`, since `tokio::sync::Mutex` is not
        // reentrant and those lock the same `AuthState`.
        let mut state = self.state.lock().await;

        if let Some(tok) = &state.imageserver {
            let remaining = tok.ttl.saturating_sub(tok.acquired_at.elapsed());
            if remaining > REFRESH_SKEW {
                return Ok(tok.token.clone());
            }
        }

        let mut oauth = match &state.oauth {
            Some(tok) if tok.expires_at > Instant::now() + REFRESH_SKEW => tok.access_token.clone(),
            _ => {
                let tok = self.acquire_oauth().await?;
                let access_token = tok.access_token.clone();
                state.oauth = Some(tok);
                access_token
            }
        };
        let instance_id = state.instance_id.clone();

        let tok = match self.soap_login_attempt(&oauth, &instance_id).await? {
            SoapAttempt::Ok(tok) => tok,
            SoapAttempt::Unauthorized => {
                let fresh = self.acquire_oauth().await?;
                oauth = fresh.access_token.clone();
                state.oauth = Some(fresh);
                match self.soap_login_attempt(&oauth, &instance_id).await? {
                    SoapAttempt::Ok(tok) => tok,
                    SoapAttempt::Unauthorized => {
                        return Err(AuthError::SoapLoginFailed(
                            "HTTP 401 persisted after an OAuth refresh".into(),
                        ))
                    }
                }
            }
        };

        let token = tok.token.clone();
        state.imageserver = Some(tok);
        Ok(token)
    }

    /// Half the last-observed SOAP token TTL, used by `Pipeliner` to decide
    /// when to inject a `connectupdate` (§4.5 step 5). `None` if no
    /// ImageServer token has been acquired yet.
    pub async fn soap_refresh_interval(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state.imageserver.as_ref().map(|t| t.ttl / 2)
    }

    async fn acquire_oauth(&self) -> Result<OAuthToken, AuthError> {
        let url = format!("{}/API/IDP/connect/token", self.server_url);
        let form = [
            ("grant_type", "password"),
            ("username", &self.username),
            ("password", &self.password),
            ("client_id", "GrantValidatorClient"),
        ];

        let response = self.http.post(&url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::InvalidCredentials);
        }
        let body: OAuthResponse = response.json().await?;

        debug!(expires_in = body.expires_in, "acquired OAuth token");
        Ok(OAuthToken {
            access_token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }

    /// Attempts one SOAP `Login` call. Returns `SoapAttempt::Unauthorized`
    /// rather than an error on a 401 so the caller can retry once with a
    /// freshly forced OAuth token (§7's one-refresh-on-401 rule) instead of
    /// failing the whole export on a merely stale bearer token.
    async fn soap_login_attempt(
        &self,
        oauth: &str,
        instance_id: &str,
    ) -> Result<SoapAttempt, AuthError> {
        let url = format!("{}/ManagementServer/ServerCommandServiceOAuth.svc", self.server_url);
        let body = soap_login_envelope(instance_id);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header(
                "SOAPAction",
                "http://videoos.net/2/XProtectCSServerCommand/IServerCommandService/Login",
            )
            .bearer_auth(oauth)
            .body(body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(SoapAttempt::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(AuthError::SoapLoginFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let text = response.text().await?;

        let token = extract_tag(&text, "Token")
            .ok_or_else(|| AuthError::SoapLoginFailed("missing <Token> in response".into()))?;
        let micros = extract_tag(&text, "MicroSeconds")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                AuthError::SoapLoginFailed("missing <TimeToLive><MicroSeconds> in response".into())
            })?;

        warn_if_dummy_ttl(micros);

        Ok(SoapAttempt::Ok(ImageServerToken {
            token,
            acquired_at: Instant::now(),
            ttl: Duration::from_micros(micros),
        }))
    }
}

enum SoapAttempt {
    Ok(ImageServerToken),
    Unauthorized,
}

fn warn_if_dummy_ttl(micros: u64) {
    if micros == 0 {
        warn!("SOAP login returned a zero TTL; treating every call as requiring refresh");
    }
}

/// Builds the SOAP Login envelope (§4.1). `currentToken` is always empty —
/// this crate never attempts to refresh an existing SOAP session, it logs
/// in fresh with a new `instanceId` each time the cached token nears expiry.
fn soap_login_envelope(instance_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <Login xmlns="http://videoos.net/2/XProtectCSServerCommand">
      <instanceId>{instance_id}</instanceId>
      <currentToken></currentToken>
    </Login>
  </soap:Body>
</soap:Envelope>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_tag() {
        let xml = "<Token>TOKEN#abc#host//ServerConnector#1</Token>";
        assert_eq!(
            extract_tag(xml, "Token").as_deref(),
            Some("TOKEN#abc#host//ServerConnector#1")
        );
    }

    #[test]
    fn extracts_namespaced_tag() {
        let xml = "<a:Token>xyz</a:Token>";
        assert_eq!(extract_tag(xml, "Token").as_deref(), Some("xyz"));
    }

    #[test]
    fn extracts_nested_ttl() {
        let xml = "<TimeToLive><MicroSeconds>2000000</MicroSeconds></TimeToLive>";
        assert_eq!(extract_tag(xml, "MicroSeconds").as_deref(), Some("2000000"));
    }

    #[test]
    fn missing_tag_is_none() {
        assert_eq!(extract_tag("<Status>success</Status>", "Token"), None);
    }
}
