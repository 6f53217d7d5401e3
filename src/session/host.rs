//! Host side of a streaming session
//!
//! The capture loop runs on its own thread; this task forwards its events
//! to the viewer and relays viewer requests back as loop commands.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::gpu::DuplicationApi;
use crate::capture::{FrameStreamer, StreamerCommand, StreamerEvent};
use crate::capture::streamer::StreamerStats;
use crate::error::{Result, TransportResult};
use crate::protocol::{
    ChangeDisplaysDto, CursorChangedDto, DisplayDataDto, DisplayDto, KeyFrameRequestDto,
    ScreenRegionDto,
};
use crate::session::StreamingSession;
use crate::transport::{FrameListener, FrameTransport, MessageHandlers, TransportOptions};

/// Counters for one host session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostSessionStats {
    /// Region batches forwarded
    pub batches_sent: u64,
    /// Region payloads sent
    pub regions_sent: u64,
    /// Encoded image bytes sent
    pub image_bytes_sent: u64,
    /// Display sets sent
    pub display_updates: u64,
    /// Viewer commands relayed to the capture loop
    pub commands_relayed: u64,
    /// Capture loop counters at shutdown
    pub capture: StreamerStats,
}

/// Registers the viewer-request handlers for a host connection
fn host_handlers() -> (Arc<MessageHandlers>, mpsc::UnboundedReceiver<StreamerCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handlers = Arc::new(MessageHandlers::new());

    let key_frames = tx.clone();
    handlers.register_typed::<KeyFrameRequestDto, _>(move |_| {
        let _ = key_frames.send(StreamerCommand::RequestKeyFrame);
    });
    handlers.register_typed::<ChangeDisplaysDto, _>(move |request| {
        debug!("Viewer selected {}", request.device_name);
        let _ = tx.send(StreamerCommand::ChangeDisplay(request.device_name));
    });

    (handlers, rx)
}

/// A viewer connection being served from the local screen
pub struct HostSession {
    session: StreamingSession,
    commands: mpsc::UnboundedReceiver<StreamerCommand>,
}

impl HostSession {
    /// Accepts the next viewer from `listener`
    ///
    /// # Errors
    ///
    /// Returns error if accepting the connection fails
    pub async fn accept(listener: &FrameListener, options: TransportOptions) -> TransportResult<Self> {
        let (handlers, commands) = host_handlers();
        let transport = listener.accept(options.with_handlers(handlers)).await?;
        Ok(Self::with_commands(transport, commands))
    }

    /// Serves an already established duplex stream
    pub fn from_stream<S>(stream: S, peer: &str, options: TransportOptions) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (handlers, commands) = host_handlers();
        let transport = FrameTransport::from_stream(stream, peer, options.with_handlers(handlers));
        Self::with_commands(transport, commands)
    }

    fn with_commands(
        transport: FrameTransport,
        commands: mpsc::UnboundedReceiver<StreamerCommand>,
    ) -> Self {
        let session = StreamingSession::new(Uuid::new_v4(), transport);
        info!(
            "Session {} started for connection {} ({})",
            session.session_id(),
            session.viewer_connection_id(),
            session.transport().peer()
        );
        Self { session, commands }
    }

    /// The session being served
    pub fn session(&self) -> &StreamingSession {
        &self.session
    }

    /// Streams until the viewer disconnects or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread cannot be started
    pub async fn run<A>(
        mut self,
        streamer: FrameStreamer<A>,
        cancel: CancellationToken,
    ) -> Result<HostSessionStats>
    where
        A: DuplicationApi + Send + 'static,
    {
        let capture_cancel = cancel.child_token();
        let mut handle = streamer.spawn(capture_cancel.clone())?;
        let mut stats = HostSessionStats::default();
        let transport = self.session.transport().clone();

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "host shutting down",
                _ = transport.wait_for_close() => break "viewer disconnected",
                Some(command) = self.commands.recv() => {
                    stats.commands_relayed += 1;
                    if handle.commands.send(command).is_err() {
                        break "capture loop stopped";
                    }
                }
                event = handle.events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.forward(event, &mut stats).await {
                            warn!("Session {}: send failed: {}", self.session.session_id(), e);
                            break "send failed";
                        }
                    }
                    None => break "capture loop stopped",
                },
            }
        };

        info!("Session {} ending: {}", self.session.session_id(), reason);
        capture_cancel.cancel();
        stats.capture = tokio::task::spawn_blocking(move || handle.join())
            .await
            .unwrap_or_default();
        self.session.close(reason).await;

        Ok(stats)
    }

    async fn forward(&self, event: StreamerEvent, stats: &mut HostSessionStats) -> TransportResult<()> {
        let session_id = self.session.session_id();
        let transport = self.session.transport();

        match event {
            StreamerEvent::Displays(displays) => {
                let data = DisplayDataDto {
                    session_id,
                    displays: displays.iter().map(DisplayDto::from).collect(),
                };
                transport.send(&data, false).await?;
                stats.display_updates += 1;
            }
            StreamerEvent::Regions(batch) => {
                for region in batch.regions {
                    stats.image_bytes_sent += region.encoded_image.len() as u64;
                    let dto = ScreenRegionDto {
                        session_id,
                        x: region.area.x,
                        y: region.area.y,
                        width: region.area.width,
                        height: region.area.height,
                        encoded_image: region.encoded_image,
                    };
                    transport.send(&dto, false).await?;
                    stats.regions_sent += 1;
                }
                stats.batches_sent += 1;
            }
            StreamerEvent::CursorChanged(cursor) => {
                transport
                    .send(&CursorChangedDto { session_id, cursor }, false)
                    .await?;
            }
        }
        Ok(())
    }
}
