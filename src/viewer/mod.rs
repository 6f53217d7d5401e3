//! Viewer side of a session
//!
//! `ViewerSession` connects to a host, paints every inbound region through a
//! shared [`RegionRenderer`], and sends display and keyframe requests back.

pub mod renderer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransportResult;
use crate::protocol::{
    ChangeDisplaysDto, CursorChangedDto, DisplayDataDto, KeyFrameRequestDto, ScreenRegionDto,
};
use crate::transport::{FrameTransport, MessageHandlers, TransportOptions};

pub use renderer::RegionRenderer;

/// Renderer shared between the read loop and its owner
pub type SharedRenderer = Arc<Mutex<RegionRenderer>>;

fn lock(renderer: &SharedRenderer) -> MutexGuard<'_, RegionRenderer> {
    renderer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds the handler table that paints into `renderer`
pub fn viewer_handlers(renderer: &SharedRenderer) -> Arc<MessageHandlers> {
    let handlers = Arc::new(MessageHandlers::new());

    let target = Arc::clone(renderer);
    handlers.register_typed::<DisplayDataDto, _>(move |data| {
        if let Err(e) = lock(&target).apply_display_data(&data) {
            warn!("Keeping the current surface: {}", e);
        }
    });

    let target = Arc::clone(renderer);
    handlers.register_typed::<ScreenRegionDto, _>(move |region| {
        if let Err(e) = lock(&target).apply_region(&region) {
            warn!("Dropping region {}: {}", region.area(), e);
        }
    });

    let target = Arc::clone(renderer);
    handlers.register_typed::<CursorChangedDto, _>(move |change| {
        debug!("Cursor changed to {:?}", change.cursor);
        lock(&target).apply_cursor(&change);
    });

    handlers
}

/// A connection to a host plus the surface it paints
pub struct ViewerSession {
    transport: FrameTransport,
    renderer: SharedRenderer,
}

impl ViewerSession {
    /// Connects to `uri` and asks for a keyframe
    ///
    /// The request doubles as the first write QUIC needs before the host
    /// sees the stream.
    ///
    /// # Errors
    ///
    /// Returns error if the connection or the first send fails
    pub async fn connect(uri: &str, options: TransportOptions) -> TransportResult<Self> {
        let renderer = SharedRenderer::default();
        let options = options.with_handlers(viewer_handlers(&renderer));
        let transport = FrameTransport::connect(uri, options).await?;
        Self::start(transport, renderer).await
    }

    /// Serves an already established duplex stream
    ///
    /// # Errors
    ///
    /// Returns error if the first send fails
    pub async fn from_stream<S>(stream: S, peer: &str, options: TransportOptions) -> TransportResult<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let renderer = SharedRenderer::default();
        let options = options.with_handlers(viewer_handlers(&renderer));
        let transport = FrameTransport::from_stream(stream, peer, options);
        Self::start(transport, renderer).await
    }

    async fn start(transport: FrameTransport, renderer: SharedRenderer) -> TransportResult<Self> {
        let session = Self { transport, renderer };
        session.request_key_frame().await?;
        Ok(session)
    }

    fn session_id(&self) -> Uuid {
        lock(&self.renderer).session_id().unwrap_or_else(Uuid::nil)
    }

    /// The host connection
    pub fn transport(&self) -> &FrameTransport {
        &self.transport
    }

    /// The shared surface
    pub fn renderer(&self) -> &SharedRenderer {
        &self.renderer
    }

    /// Asks the host for a full frame
    ///
    /// # Errors
    ///
    /// Returns error if the send fails
    pub async fn request_key_frame(&self) -> TransportResult<()> {
        let request = KeyFrameRequestDto {
            session_id: self.session_id(),
        };
        self.transport.send(&request, false).await
    }

    /// Asks the host to stream another display
    ///
    /// # Errors
    ///
    /// Returns error if the send fails
    pub async fn change_display(&self, device_name: &str) -> TransportResult<()> {
        if !lock(&self.renderer).select_display(device_name) {
            debug!("Requesting unknown display {}", device_name);
        }
        let request = ChangeDisplaysDto {
            session_id: self.session_id(),
            device_name: device_name.to_string(),
        };
        self.transport.send(&request, false).await
    }

    /// Closes the connection
    pub async fn close(&self, reason: &str) {
        self.transport.close(reason).await;
    }

    /// Resolves once the host connection has closed
    pub async fn wait_for_close(&self) {
        self.transport.wait_for_close().await;
    }
}
