//! Orchestrates one export end to end (§4.6): resolve recorder, authenticate,
//! connect, stream frames through the codec-appropriate encoder, publish the
//! finished file. One `tokio::spawn`ed worker per job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::AuthBroker;
use crate::config::Config;
use crate::config_client::ConfigClient;
use crate::encoder::{EncodeMode, EncoderPipe};
use crate::error::ExportError;
use crate::protocol::{Codec, Connection, FirstFrame, MethodCall, Pipeliner, ProtoError};
use crate::registry::{ExportJob, ExportRegistry};

/// §4.6: "larger ranges fail immediately with `Policy::RangeTooLarge`".
const MAX_RANGE_MS: i64 = 10 * 60 * 1000;

pub struct Exporter {
    auth: Arc<AuthBroker>,
    config_client: Arc<ConfigClient>,
    registry: Arc<ExportRegistry>,
    export_dir: PathBuf,
    encoder_bin: String,
    connect_timeout: Duration,
    pipeline_depth: usize,
}

impl Exporter {
    pub fn new(
        config: &Config,
        auth: Arc<AuthBroker>,
        config_client: Arc<ConfigClient>,
        registry: Arc<ExportRegistry>,
    ) -> Self {
        Self {
            auth,
            config_client,
            registry,
            export_dir: PathBuf::from(&config.export_dir),
            encoder_bin: config.encoder_bin.clone(),
            connect_timeout: config.connect_timeout,
            pipeline_depth: config.pipeline_depth,
        }
    }

    /// Validates the range, creates the job record, and spawns its worker.
    /// Returns immediately with the new `export_id`.
    #[instrument(skip(self))]
    pub fn start(&self, camera_id: String, t0_ms: i64, t1_ms: i64) -> Result<String, ExportError> {
        if t1_ms <= t0_ms || t1_ms - t0_ms > MAX_RANGE_MS {
            return Err(ExportError::RangeTooLarge);
        }

        let export_id = Uuid::new_v4().to_string();
        let cancel = self
            .registry
            .create(export_id.clone(), camera_id.clone(), t0_ms, t1_ms);

        let worker = ExportWorker {
            auth: Arc::clone(&self.auth),
            config_client: Arc::clone(&self.config_client),
            registry: Arc::clone(&self.registry),
            export_dir: self.export_dir.clone(),
            encoder_bin: self.encoder_bin.clone(),
            connect_timeout: self.connect_timeout,
            pipeline_depth: self.pipeline_depth,
            export_id: export_id.clone(),
            camera_id,
            t0_ms,
            t1_ms,
            cancel,
        };

        tokio::spawn(worker.run());
        Ok(export_id)
    }

    pub fn status(&self, export_id: &str) -> Option<ExportJob> {
        self.registry.get(export_id)
    }

    /// Path of a succeeded job's output file, if it exists.
    pub fn output_path(&self, export_id: &str) -> Option<PathBuf> {
        let job = self.registry.get(export_id)?;
        job.output_path.map(PathBuf::from)
    }

    /// Signals cancellation. Returns `true` if the job existed and was not
    /// already terminal.
    pub fn cancel(&self, export_id: &str) -> Option<bool> {
        let job = self.registry.get(export_id)?;
        if job.state.is_terminal() {
            return Some(false);
        }
        if let Some(token) = self.registry.cancellation_token(export_id) {
            token.cancel();
        }
        Some(true)
    }
}

struct ExportWorker {
    auth: Arc<AuthBroker>,
    config_client: Arc<ConfigClient>,
    registry: Arc<ExportRegistry>,
    export_dir: PathBuf,
    encoder_bin: String,
    connect_timeout: Duration,
    pipeline_depth: usize,
    export_id: String,
    camera_id: String,
    t0_ms: i64,
    t1_ms: i64,
    cancel: CancellationToken,
}

impl ExportWorker {
    #[instrument(skip(self), fields(export_id = %self.export_id, camera_id = %self.camera_id))]
    async fn run(self) {
        self.registry.set_running(&self.export_id);
        info!("export started");

        match self.run_inner().await {
            Ok(output_path) => {
                self.registry
                    .set_succeeded(&self.export_id, output_path.to_string_lossy().into_owned());
                info!("export succeeded");
            }
            Err(e) => {
                warn!(error = %e, tag = e.tag(), "export failed");
                self.registry
                    .set_failed(&self.export_id, e.to_string(), e.tag());
            }
        }
    }

    async fn run_inner(&self) -> Result<PathBuf, ExportError> {
        // 1. Resolve recorder host/port.
        let (host, port) = self
            .config_client
            .resolve_recorder(&self.camera_id)
            .await?;

        // 2-3. Authenticate, connect, issue connect+goto. Reconnected once if
        // the connection breaks before any frame has been emitted; never
        // retried again past this point (§7).
        let (mut conn, pipeliner, first) = match self.connect_and_goto_first(&host, port).await
        {
            Ok(v) => v,
            Err(ExportError::Proto(ProtoError::ConnectionBroken | ProtoError::Io(_))) => {
                warn!("connection broken before first frame; reconnecting once");
                self.connect_and_goto_first(&host, port).await?
            }
            Err(e) => return Err(e),
        };

        let frame_stream = pipeliner.stream_continuing(
            &mut conn,
            Arc::clone(&self.auth),
            first,
            self.t1_ms,
            self.cancel.clone(),
        );
        tokio::pin!(frame_stream);

        // 4. Consume the first emitted frame; classify codec.
        let first_frame = match frame_stream.next().await {
            Some(frame) => frame?,
            None => return Err(ExportError::NoRecordingInRange),
        };
        let codec = first_frame.classify();
        let encode_mode = match codec {
            Codec::RawH264 => EncodeMode::H264Passthrough,
            Codec::Jpeg => EncodeMode::JpegSequence,
            Codec::Unsupported(id) => return Err(ExportError::UnsupportedCodec(id)),
        };

        // 5. Spawn EncoderPipe in the appropriate mode.
        fs::create_dir_all(self.export_dir.join("tmp")).await.ok();
        let tmp_path = self
            .export_dir
            .join("tmp")
            .join(format!("{}.mp4", self.export_id));
        let mut encoder = EncoderPipe::spawn(&self.encoder_bin, encode_mode, &tmp_path)?;

        let write_result = self.write_frame(&mut encoder, &first_frame, codec).await;
        if let Err(e) = write_result {
            encoder.abort().await;
            return Err(e);
        }

        // 6. For each subsequent frame, strip header if applicable, feed encoder.
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    encoder.abort().await;
                    return Err(ExportError::Cancelled);
                }
                next = frame_stream.next() => {
                    let Some(frame) = next else { break };
                    let frame = match frame {
                        Ok(f) => f,
                        Err(e) => {
                            encoder.abort().await;
                            return Err(e.into());
                        }
                    };
                    if let Err(e) = self.write_frame(&mut encoder, &frame, codec).await {
                        encoder.abort().await;
                        return Err(e);
                    }
                    // 7. Update progress monotonically.
                    let progress = ((frame.current_ts_ms - self.t0_ms) as f32
                        / (self.t1_ms - self.t0_ms) as f32)
                        .clamp(0.0, 1.0);
                    self.registry.set_progress(&self.export_id, progress);
                }
            }
        }

        // 8. Close encoder input and await its exit.
        encoder.finish().await?;

        // 9. Move the output file into stable storage.
        let final_path = self.export_dir.join(format!("{}.mp4", self.export_id));
        fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            error!(error = %e, "failed to move encoder output into place; left at {}", tmp_path.display());
            crate::protocol::ProtoError::Io(e)
        })?;

        Ok(final_path)
    }

    /// Authenticates, opens the TCP connection, issues `connect` then
    /// `goto(t0)`. Split out of `run_inner` so it can be retried wholesale:
    /// the retry policy (§7) allows one reconnect before the first frame is
    /// obtained, never after.
    async fn connect_and_goto_first(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(Connection, Pipeliner, FirstFrame), ExportError> {
        let imageserver_token = self.auth.imageserver_token().await?;

        let mut conn = Connection::connect(host, port, self.connect_timeout).await?;
        conn.send_call(
            &MethodCall::Connect {
                camera_id: self.camera_id.clone(),
                connection_token: imageserver_token,
                always_std_jpeg: false,
            },
            0,
        )
        .await?;
        match conn.recv().await? {
            crate::protocol::WireMessage::Method(resp) => resp.ensure_success()?,
            crate::protocol::WireMessage::Image(_) => {
                return Err(ExportError::Proto(ProtoError::BadHeader(
                    "connect response was an image frame".into(),
                )))
            }
        }

        let mut pipeliner = Pipeliner::new(self.pipeline_depth);
        let first = pipeliner
            .goto_first(&mut conn, self.t0_ms, self.t1_ms)
            .await?;
        Ok((conn, pipeliner, first))
    }

    async fn write_frame(
        &self,
        encoder: &mut EncoderPipe,
        frame: &crate::protocol::Frame,
        codec: Codec,
    ) -> Result<(), ExportError> {
        let payload: bytes::Bytes = match codec {
            Codec::RawH264 => frame.strip_proprietary_header()?,
            Codec::Jpeg => frame.payload.clone(),
            Codec::Unsupported(id) => return Err(ExportError::UnsupportedCodec(id)),
        };
        encoder.write(&payload).await?;
        self.registry.increment_frame_count(&self.export_id);
        Ok(())
    }
}
