//! Framed duplex transport
//!
//! A `FrameTransport` owns one duplex byte stream. Sends go through a single
//! writer lock so a header and its payload are never split by another
//! sender. A background task owns the read half and dispatches decoded
//! envelopes to the handler registered for their kind.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::TransportSettings;
use crate::error::{ProtocolError, TransportError, TransportResult};
use crate::protocol::{CloseDto, Envelope, MessageHeader, Payload, PayloadKind, HEADER_SIZE};
use crate::transport::signature::{PayloadSigner, RejectSigned, SignatureVerifier};
use crate::transport::state::{TransportState, TransportStateMachine};

/// Read half of a connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Keeps connection-level resources alive until the transport closes
pub type ConnectionGuard = Box<dyn std::any::Any + Send>;

/// Callback invoked for every dispatched envelope of one kind
pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Per-kind handler table
///
/// Register handlers before the transport starts reading; an envelope with
/// no handler is discarded.
#[derive(Default)]
pub struct MessageHandlers {
    handlers: RwLock<HashMap<PayloadKind, Handler>>,
}

impl fmt::Debug for MessageHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MessageHandlers")
            .field("kinds", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MessageHandlers {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw envelope handler, replacing any previous one
    pub fn register<F>(&self, kind: PayloadKind, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(handler));
    }

    /// Registers a handler that receives the decoded body
    pub fn register_typed<P, F>(&self, handler: F)
    where
        P: Payload,
        F: Fn(P) + Send + Sync + 'static,
    {
        self.register(P::KIND, move |envelope| match envelope.decode_body::<P>() {
            Ok(body) => handler(body),
            Err(e) => warn!("Discarding undecodable {:?} body: {}", P::KIND, e),
        });
    }

    /// Returns true if a handler exists for `kind`
    pub fn contains(&self, kind: PayloadKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Runs the handler for the envelope's kind; returns false if none
    pub fn dispatch(&self, envelope: Envelope) -> bool {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.kind())
            .cloned();

        match handler {
            Some(handler) => {
                handler(envelope);
                true
            }
            None => false,
        }
    }
}

/// Everything a transport needs besides the stream itself
#[derive(Clone)]
pub struct TransportOptions {
    /// Limits and timeouts
    pub settings: TransportSettings,
    /// Inbound dispatch table
    pub handlers: Arc<MessageHandlers>,
    /// Key used for `send(.., true)`
    pub signer: Option<Arc<dyn PayloadSigner>>,
    /// Check applied to inbound signed envelopes
    pub verifier: Arc<dyn SignatureVerifier>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("settings", &self.settings)
            .field("handlers", &self.handlers)
            .field("has_signer", &self.signer.is_some())
            .finish()
    }
}

impl TransportOptions {
    /// Options with no handlers, no signer, and signed payloads rejected
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            handlers: Arc::new(MessageHandlers::new()),
            signer: None,
            verifier: Arc::new(RejectSigned),
        }
    }

    /// Uses the given handler table
    pub fn with_handlers(mut self, handlers: Arc<MessageHandlers>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Enables signed sends
    pub fn with_signer(mut self, signer: Arc<dyn PayloadSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replaces the inbound signature check
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }
}

/// Traffic counters
#[derive(Debug, Default)]
struct TransportCounters {
    messages_in: AtomicU64,
    bytes_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_out: AtomicU64,
    dropped_signed: AtomicU64,
    protocol_violations: AtomicU64,
}

/// Point-in-time copy of the traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages read, including dropped ones
    pub messages_in: u64,
    /// Bytes read, headers included
    pub bytes_in: u64,
    /// Messages written
    pub messages_out: u64,
    /// Bytes written, headers included
    pub bytes_out: u64,
    /// Signed messages that failed verification
    pub dropped_signed: u64,
    /// Framing or envelope violations that closed the connection
    pub protocol_violations: u64,
}

impl TransportCounters {
    fn record_in(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped_signed: self.dropped_signed.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

/// Why the read loop stopped
#[derive(Debug)]
enum ReadEnd {
    Eof,
    CloseFrame(String),
    Violation(ProtocolError),
    Io(io::Error),
    Cancelled,
}

struct Inner {
    id: Uuid,
    peer: String,
    settings: TransportSettings,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    state: Mutex<TransportStateMachine>,
    state_tx: watch::Sender<TransportState>,
    cancel: CancellationToken,
    handlers: Arc<MessageHandlers>,
    signer: Option<Arc<dyn PayloadSigner>>,
    verifier: Arc<dyn SignatureVerifier>,
    counters: TransportCounters,
    read_task: Mutex<Option<JoinHandle<()>>>,
    guard: Mutex<Option<ConnectionGuard>>,
    closing: AtomicBool,
}

/// One framed connection; cheap to clone
#[derive(Clone)]
pub struct FrameTransport {
    inner: Arc<Inner>,
}

impl fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTransport")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl FrameTransport {
    /// Adopts an established duplex stream and starts the read loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, options: TransportOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), None, peer, options)
    }

    /// Adopts separate read and write halves
    ///
    /// `guard` is dropped once the transport has closed.
    pub fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        guard: Option<ConnectionGuard>,
        peer: impl Into<String>,
        options: TransportOptions,
    ) -> Self {
        let mut machine = TransportStateMachine::new();
        for step in [TransportState::Connecting, TransportState::Open] {
            if let Err(e) = machine.transition(step) {
                warn!("Unexpected transport state: {}", e);
            }
        }
        let (state_tx, _) = watch::channel(machine.current());

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            peer: peer.into(),
            settings: options.settings,
            writer: tokio::sync::Mutex::new(Some(writer)),
            state: Mutex::new(machine),
            state_tx,
            cancel: CancellationToken::new(),
            handlers: options.handlers,
            signer: options.signer,
            verifier: options.verifier,
            counters: TransportCounters::default(),
            read_task: Mutex::new(None),
            guard: Mutex::new(guard),
            closing: AtomicBool::new(false),
        });

        info!("Transport {} open to {}", inner.id, inner.peer);

        let task = tokio::spawn(read_loop(Arc::clone(&inner), reader));
        *inner.read_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Self { inner }
    }

    /// Connection id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Remote peer description
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// Inbound handler table
    pub fn handlers(&self) -> &Arc<MessageHandlers> {
        &self.inner.handlers
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.inner.counters.snapshot()
    }

    /// Serializes and sends one payload
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` unless the transport is open, `SigningFailed` for a
    /// signed send without a signer, and `WriteFailed` on I/O errors.
    pub async fn send<P: Payload>(&self, payload: &P, signed: bool) -> TransportResult<()> {
        let envelope = if signed {
            let signer = self.inner.signer.as_ref().ok_or_else(|| {
                TransportError::SigningFailed("no signing key configured".to_string())
            })?;
            let body = bincode::serialize(payload).map_err(ProtocolError::from)?;
            Envelope::Signed(signer.sign(P::KIND, body)?)
        } else {
            Envelope::Unsigned(payload.to_unsigned()?)
        };
        self.send_envelope(&envelope).await
    }

    /// Sends a prebuilt envelope
    ///
    /// # Errors
    ///
    /// Same as [`FrameTransport::send`]
    pub async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(TransportError::NotOpen(state.to_string()));
        }
        self.inner.write_envelope(envelope).await
    }

    /// Closes the connection; later calls wait for the first to finish
    ///
    /// Sends a `Close` payload, shuts the writer down, and stops the read
    /// loop. Each graceful step is bounded by the close timeout.
    pub async fn close(&self, reason: &str) {
        let inner = &self.inner;
        if !inner.begin_close() {
            self.wait_for_close().await;
            return;
        }

        debug!("Closing transport {}: {}", inner.id, reason);
        let close_timeout = inner.settings.close_timeout();

        let graceful = async {
            let close = CloseDto {
                reason: reason.to_string(),
            };
            if let Ok(unsigned) = close.to_unsigned() {
                if let Err(e) = inner.write_envelope(&Envelope::Unsigned(unsigned)).await {
                    debug!("Close payload not delivered: {}", e);
                }
            }
            inner.set_state(TransportState::Closing);
            inner.shutdown_writer().await;
        };
        if tokio::time::timeout(close_timeout, graceful).await.is_err() {
            warn!("Graceful close of {} timed out after {:?}", inner.id, close_timeout);
        }

        inner.cancel.cancel();
        let task = inner
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(close_timeout, &mut task).await.is_err() {
                task.abort();
            }
        }

        inner.release();
    }

    /// Resolves once the transport is `Closed`
    pub async fn wait_for_close(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        // The sender lives in `inner`, which `self` keeps alive
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }
}

impl Inner {
    fn state(&self) -> TransportState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
    }

    fn set_state(&self, to: TransportState) {
        let mut machine = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if machine.current() == to {
            return;
        }
        match machine.transition(to) {
            Ok(()) => {
                self.state_tx.send_replace(to);
            }
            Err(e) => debug!("Transport {}: {}", self.id, e),
        }
    }

    /// Returns true for the first caller only
    fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    async fn write_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        let bytes = envelope.encode()?;
        let max = self.settings.max_payload_size;
        let size = i32::try_from(bytes.len())
            .ok()
            .filter(|_| bytes.len() <= max)
            .ok_or(ProtocolError::PayloadTooLarge {
                size: bytes.len() as i64,
                max,
            })?;
        let header = MessageHeader::new(envelope.is_signed(), size).encode();

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.state().to_string()))?;
        write_frame(stream, &header, &bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        drop(writer);

        self.counters.record_out(HEADER_SIZE + bytes.len());
        trace!("Sent {:?} ({} bytes)", envelope.kind(), bytes.len());
        Ok(())
    }

    async fn shutdown_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Writer shutdown for {}: {}", self.id, e);
            }
        }
    }

    fn release(&self) {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.set_state(TransportState::Closed);
        info!("Transport {} closed", self.id);
    }
}

async fn write_frame(
    writer: &mut BoxedWriter,
    header: &[u8; HEADER_SIZE],
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads a header; `Ok(false)` means the peer closed at a message boundary
async fn read_header(reader: &mut BoxedReader, buf: &mut [u8; HEADER_SIZE]) -> io::Result<bool> {
    let first = reader.read(&mut buf[..]).await?;
    if first == 0 {
        return Ok(false);
    }
    reader.read_exact(&mut buf[first..]).await?;
    Ok(true)
}

async fn read_messages(inner: &Inner, reader: &mut BoxedReader) -> ReadEnd {
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut payload = BytesMut::new();

    loop {
        match read_header(reader, &mut header_buf).await {
            Ok(true) => {}
            Ok(false) => return ReadEnd::Eof,
            Err(e) => return ReadEnd::Io(e),
        }

        let header = match MessageHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(e) => return ReadEnd::Violation(e),
        };
        let len = match header.payload_len(inner.settings.max_payload_size) {
            Ok(len) => len,
            Err(e) => return ReadEnd::Violation(e),
        };

        payload.clear();
        payload.resize(len, 0);
        if let Err(e) = reader.read_exact(&mut payload[..]).await {
            return ReadEnd::Io(e);
        }
        inner.counters.record_in(HEADER_SIZE + len);

        let envelope = match Envelope::decode(header.is_signed, &payload) {
            Ok(envelope) => envelope,
            Err(e) => return ReadEnd::Violation(e),
        };

        if let Envelope::Signed(signed) = &envelope {
            if !inner.verifier.verify(signed) {
                debug!("Dropping {:?} payload with a bad signature", signed.kind);
                inner.counters.dropped_signed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        if envelope.kind() == PayloadKind::Close {
            let reason = envelope
                .decode_body::<CloseDto>()
                .map(|close| close.reason)
                .unwrap_or_default();
            return ReadEnd::CloseFrame(reason);
        }

        let kind = envelope.kind();
        if !inner.handlers.dispatch(envelope) {
            trace!("No handler for {:?}", kind);
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: BoxedReader) {
    let end = tokio::select! {
        _ = inner.cancel.cancelled() => ReadEnd::Cancelled,
        end = read_messages(&inner, &mut reader) => end,
    };
    drop(reader);

    match &end {
        ReadEnd::Eof => info!("Peer {} closed the connection", inner.peer),
        ReadEnd::CloseFrame(reason) => info!("Peer {} sent close: {}", inner.peer, reason),
        ReadEnd::Violation(e) => {
            inner
                .counters
                .protocol_violations
                .fetch_add(1, Ordering::Relaxed);
            warn!("Protocol violation from {}: {}", inner.peer, e);
        }
        ReadEnd::Io(e) => warn!("Read from {} failed: {}", inner.peer, e),
        ReadEnd::Cancelled => debug!("Read loop for {} cancelled", inner.id),
    }

    // `close()` owns the teardown once it has started
    if matches!(end, ReadEnd::Cancelled) || !inner.begin_close() {
        return;
    }

    inner.set_state(TransportState::Closing);
    let close_timeout = inner.settings.close_timeout();
    if tokio::time::timeout(close_timeout, inner.shutdown_writer())
        .await
        .is_err()
    {
        warn!("Writer shutdown for {} timed out", inner.id);
    }
    inner.cancel.cancel();
    inner.release();
}
