//! Process configuration, read once at startup from the environment.

use std::time::Duration;

/// Process-wide configuration, following the same `from_env` idiom the rest
/// of this crate's ancestry uses: required settings `expect()` at startup
/// rather than threading an `Option` through every constructor.
pub struct Config {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub tls_verify: bool,
    pub pipeline_depth: usize,
    pub export_dir: String,
    pub bind_addr: String,
    pub static_dir: String,
    pub encoder_bin: String,
    pub connect_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let server_url = std::env::var("MILESTONE_SERVER_URL")
            .expect("MILESTONE_SERVER_URL must be set")
            .trim_end_matches('/')
            .to_string();
        let username =
            std::env::var("MILESTONE_USERNAME").expect("MILESTONE_USERNAME must be set");
        let password =
            std::env::var("MILESTONE_PASSWORD").expect("MILESTONE_PASSWORD must be set");

        let tls_verify = std::env::var("TLS_VERIFY")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let pipeline_depth: usize = std::env::var("PIPELINE_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8)
            .clamp(1, 32);

        let export_dir = std::env::var("EXPORT_DIR").unwrap_or_else(|_| "./exports".to_string());
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let static_dir = std::env::var("STATIC_DIR").unwrap_or_else(|_| "./webapp".to_string());
        let encoder_bin = std::env::var("ENCODER_BIN").unwrap_or_else(|_| "ffmpeg".to_string());

        let connect_timeout_ms: u64 = std::env::var("CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);

        Self {
            server_url,
            username,
            password,
            tls_verify,
            pipeline_depth,
            export_dir,
            bind_addr,
            static_dir,
            encoder_bin,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        }
    }
}
