//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own narrow error enum (`AuthError`,
//! `ConfigError`, `ProtoError`, `EncoderError`); this module folds them into
//! the single `ExportError` that `Exporter` records on a terminal
//! `ExportJob` and that the HTTP layer maps to a status code.

use thiserror::Error;

use crate::auth::AuthError;
use crate::config_client::ConfigError;
use crate::encoder::EncoderError;
use crate::protocol::ProtoError;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("unsupported codec id {0:#06x}")]
    UnsupportedCodec(u16),

    #[error("requested range exceeds the maximum export duration")]
    RangeTooLarge,

    #[error("no recorded frames in the requested range")]
    NoRecordingInRange,

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("export cancelled")]
    Cancelled,
}

impl ExportError {
    /// A stable machine-readable tag, independent of the `Display` text,
    /// for the HTTP error body and for log filtering.
    pub fn tag(&self) -> &'static str {
        match self {
            ExportError::Auth(AuthError::InvalidCredentials) => "auth.invalid_credentials",
            ExportError::Auth(AuthError::SoapLoginFailed(_)) => "auth.soap_login_failed",
            ExportError::Auth(AuthError::Expired) => "auth.expired",
            ExportError::Auth(AuthError::Network(_)) => "auth.network",
            ExportError::Config(ConfigError::CameraNotFound(_)) => "config.camera_not_found",
            ExportError::Config(ConfigError::RecorderUnreachable(_)) => {
                "config.recorder_unreachable"
            }
            ExportError::Config(ConfigError::Network(_)) => "config.network",
            ExportError::Proto(ProtoError::BadHeader(_)) => "proto.bad_header",
            ExportError::Proto(ProtoError::ShortRead) => "proto.short_read",
            ExportError::Proto(ProtoError::ContentLengthMismatch) => {
                "proto.content_length_mismatch"
            }
            ExportError::Proto(ProtoError::MissingTrailer) => "proto.missing_trailer",
            ExportError::Proto(ProtoError::UnexpectedStatus(_)) => "proto.unexpected_status",
            ExportError::Proto(ProtoError::ConnectionBroken) => "proto.connection_broken",
            ExportError::Proto(ProtoError::Io(_)) => "proto.io",
            ExportError::UnsupportedCodec(_) => "codec.unsupported",
            ExportError::RangeTooLarge => "policy.range_too_large",
            ExportError::NoRecordingInRange => "policy.no_recording_in_range",
            ExportError::Encoder(EncoderError::SpawnFailed { .. }) => "encoder.spawn_failed",
            ExportError::Encoder(EncoderError::NonZeroExit { .. }) => "encoder.non_zero_exit",
            ExportError::Encoder(EncoderError::Io(_)) => "encoder.io",
            ExportError::Cancelled => "cancelled",
        }
    }

    /// HTTP status mapping (§7): policy violations are 400, auth failures
    /// 401, an unresolvable camera 404, cancellation a 409 conflict with
    /// the now-terminal job state, everything else a 500.
    pub fn http_status(&self) -> u16 {
        match self {
            ExportError::RangeTooLarge | ExportError::NoRecordingInRange => 400,
            ExportError::Auth(_) => 401,
            ExportError::Config(ConfigError::CameraNotFound(_)) => 404,
            ExportError::Cancelled => 409,
            _ => 500,
        }
    }
}
