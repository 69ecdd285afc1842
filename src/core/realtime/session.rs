//! Realtime synthesis session.
//!
//! A session owns one connection for the duration of a streaming request and
//! runs two loops on it:
//!
//! - the **writer** turns each incoming text fragment into a `text` frame
//!   followed by a `flush` frame, and keeps the socket alive with pings;
//! - the **reader** decodes inbound frames, forwards audio to
//!   [`RealtimeSession::audio`], optionally demuxes Ogg Opus pages into
//!   [`RealtimeSession::packets`], and exits on `finish` or on error.
//!
//! Failures that leave the socket unusable (abnormal closure) destroy the
//! connection immediately. Any other failure is reported once on
//! [`RealtimeSession::errors`] and poisons the session, so a later
//! [`release`](RealtimeSession::release) destroys the connection instead of
//! returning it to the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::base::{RealtimeError, RealtimeResult, SessionOptions};
use super::events::{ClientEvent, ServerEvent};
use super::pool::PoolLease;
use super::transport::{Transport, TransportError};
use crate::core::audio::ogg::OggDemuxer;
use crate::core::tts::TtsRequest;

/// How long a best-effort `stop` may take during force-close.
const STOP_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Connection control
// =============================================================================

/// What a session may do with the connection it runs on.
#[async_trait]
pub trait ConnectionControl: Send + Sync + 'static {
    /// Records that a text frame was written.
    fn touch_text(&self);

    /// Hands the connection back for reuse.
    async fn release(&self);

    /// Destroys the connection.
    async fn force_close(&self);

    /// Whether the reader should close the socket itself when it exits.
    fn closes_on_exit(&self) -> bool {
        false
    }
}

#[async_trait]
impl<C: Transport> ConnectionControl for PoolLease<C> {
    fn touch_text(&self) {
        PoolLease::touch_text(self);
    }

    async fn release(&self) {
        PoolLease::release(self).await;
    }

    async fn force_close(&self) {
        PoolLease::force_close(self).await;
    }
}

/// Control for a connection dialed outside the pool. Release does nothing;
/// force-close closes the socket.
pub struct DirectConnection {
    transport: Arc<dyn Transport>,
}

impl DirectConnection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ConnectionControl for DirectConnection {
    fn touch_text(&self) {}

    async fn release(&self) {}

    async fn force_close(&self) {
        self.transport.close().await;
    }

    fn closes_on_exit(&self) -> bool {
        true
    }
}

// =============================================================================
// Closed signal
// =============================================================================

/// Fires once when the session is over. Cheap to clone; any number of
/// observers may wait on it.
#[derive(Debug, Clone)]
pub struct ClosedSignal {
    token: CancellationToken,
}

impl ClosedSignal {
    /// Resolves when the session has closed.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct SessionShared {
    id: Uuid,
    transport: Arc<dyn Transport>,
    control: Box<dyn ConnectionControl>,
    /// Tells both loops to stop.
    shutdown: CancellationToken,
    /// Session is over.
    closed: CancellationToken,
    /// Serializes frame groups so `text`+`flush` pairs never interleave.
    write_lock: tokio::sync::Mutex<()>,
    poisoned: AtomicBool,
    settled: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionShared {
    async fn send_event(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => return Err(TransportError::Protocol(e.to_string())),
        };
        debug!(session_id = %self.id, event = event.name(), bytes = frame.len(), "Sending event");
        self.transport.send(frame).await
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;
        self.send_event(&ClientEvent::Text { text }).await?;
        self.send_event(&ClientEvent::Flush).await?;
        self.control.touch_text();
        Ok(())
    }

    async fn send_stop(&self) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;
        self.send_event(&ClientEvent::Stop).await
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn report(&self, errors: &mpsc::Sender<RealtimeError>, err: RealtimeError) {
        error!(session_id = %self.id, error = %err, "Realtime session error");
        if errors.try_send(err).is_err() {
            debug!(session_id = %self.id, "Error channel full, dropping error");
        }
    }

    /// Classifies a transport failure from either loop.
    async fn on_transport_error(&self, err: TransportError, errors: &mpsc::Sender<RealtimeError>) {
        if err.is_abnormal_closure() {
            warn!(session_id = %self.id, error = %err, "Abnormal closure, destroying connection");
            self.force_close().await;
        } else if self.is_winding_down() {
            debug!(session_id = %self.id, error = %err, "Transport closed during shutdown");
        } else {
            self.poison();
            self.report(errors, RealtimeError::Transport(err));
        }
    }

    /// The session itself is closing the socket. A `LocallyClosed` seen
    /// outside this window means someone else closed the connection.
    fn is_winding_down(&self) -> bool {
        self.shutdown.is_cancelled()
            || self.closed.is_cancelled()
            || self.settled.load(Ordering::Acquire)
    }

    async fn release(&self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        if self.poisoned.load(Ordering::Acquire) {
            info!(session_id = %self.id, "Session poisoned, destroying connection on release");
            self.control.force_close().await;
        } else {
            debug!(session_id = %self.id, "Releasing session connection");
            self.control.release().await;
        }
        self.closed.cancel();
    }

    async fn force_close(&self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = %self.id, "Force-closing session");
        self.shutdown.cancel();
        if let Ok(frame) = ClientEvent::Stop.encode() {
            let _ = tokio::time::timeout(STOP_GRACE, self.transport.send(frame)).await;
        }
        self.control.force_close().await;
        self.closed.cancel();
    }
}

// =============================================================================
// Session
// =============================================================================

/// Handle to a running realtime session.
///
/// The public channels are receive-only views of the session's output:
///
/// - `opened` is already fulfilled when the session is returned,
/// - `audio` yields audio chunks in arrival order,
/// - `packets` is present for Opus output and yields demuxed packets; it
///   closes when the service finishes the stream,
/// - `errors` holds at most the first unread error,
/// - `closed` fires once the session is over.
pub struct RealtimeSession {
    pub opened: oneshot::Receiver<()>,
    pub audio: mpsc::Receiver<Bytes>,
    pub packets: Option<mpsc::Receiver<Bytes>>,
    pub errors: mpsc::Receiver<RealtimeError>,
    pub closed: ClosedSignal,
    controller: SessionController,
}

impl RealtimeSession {
    /// Starts a session on an established connection.
    ///
    /// Sends `start` with `request`, then spawns the writer and reader loops.
    /// If `start` cannot be written the connection is destroyed and the error
    /// returned.
    pub async fn open<S>(
        transport: Arc<dyn Transport>,
        control: Box<dyn ConnectionControl>,
        request: TtsRequest,
        texts: S,
        options: SessionOptions,
    ) -> RealtimeResult<Self>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let demux = request.requires_demux();
        let shared = Arc::new(SessionShared {
            id,
            transport,
            control,
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            write_lock: tokio::sync::Mutex::new(()),
            poisoned: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let (opened_tx, opened) = oneshot::channel();
        let _ = opened_tx.send(());

        let start = ClientEvent::Start { request };
        let sent = {
            let _guard = shared.write_lock.lock().await;
            shared.send_event(&start).await
        };
        if let Err(e) = sent {
            error!(session_id = %id, error = %e, "Failed to send start event");
            shared.settled.store(true, Ordering::Release);
            shared.control.force_close().await;
            return Err(RealtimeError::Transport(e));
        }
        info!(session_id = %id, demux, "Realtime session started");

        let (audio_tx, audio) = mpsc::channel(options.audio_buffer.max(1));
        let (errors_tx, errors) = mpsc::channel(1);
        let (packets_tx, packets) = if demux {
            let (tx, rx) = mpsc::channel(options.packet_buffer.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let demuxer = demux.then(|| OggDemuxer::with_max_buffer(options.demux_max_buffer));

        let writer = tokio::spawn(write_loop(
            shared.clone(),
            texts.boxed(),
            errors_tx.clone(),
            options.ping_interval,
            options.auto_stop,
        ));
        let reader = tokio::spawn(read_loop(
            shared.clone(),
            audio_tx,
            packets_tx,
            demuxer,
            errors_tx,
        ));
        shared.tasks.lock().extend([writer, reader]);

        let closed = ClosedSignal {
            token: shared.closed.clone(),
        };
        Ok(Self {
            opened,
            audio,
            packets,
            errors,
            closed,
            controller: SessionController { shared },
        })
    }

    pub fn id(&self) -> Uuid {
        self.controller.id()
    }

    /// A clonable handle to the lifecycle operations.
    pub fn controller(&self) -> SessionController {
        self.controller.clone()
    }

    pub async fn stop(&self) -> RealtimeResult<()> {
        self.controller.stop().await
    }

    pub async fn release(&self) {
        self.controller.release().await;
    }

    pub async fn force_close(&self) {
        self.controller.force_close().await;
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        let shared = &self.controller.shared;
        if shared.settled.load(Ordering::Acquire) {
            return;
        }
        debug!(session_id = %shared.id, "Session dropped without release, force-closing");
        let shared = shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { shared.force_close().await });
        } else {
            shared.shutdown.cancel();
        }
    }
}

/// Clonable lifecycle handle for a [`RealtimeSession`].
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<SessionShared>,
}

impl SessionController {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Asks the service to finish the stream. The connection stays open and
    /// the service answers with `finish`.
    pub async fn stop(&self) -> RealtimeResult<()> {
        self.shared.send_stop().await.map_err(RealtimeError::from)
    }

    /// Stops both loops, waits for them, and returns the connection to the
    /// pool. A poisoned session destroys the connection instead.
    pub async fn release(&self) {
        self.shared.release().await;
    }

    /// Sends a best-effort `stop` and destroys the connection.
    pub async fn force_close(&self) {
        self.shared.force_close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> ClosedSignal {
        ClosedSignal {
            token: self.shared.closed.clone(),
        }
    }
}

// =============================================================================
// Loops
// =============================================================================

async fn next_ping(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop(
    shared: Arc<SessionShared>,
    mut texts: BoxStream<'static, String>,
    errors: mpsc::Sender<RealtimeError>,
    ping_interval: Option<Duration>,
    auto_stop: bool,
) {
    let mut ticker = ping_interval.filter(|p| !p.is_zero()).map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut fragments = 0usize;

    loop {
        let result = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = shared.closed.cancelled() => break,
            next = texts.next() => match next {
                Some(text) => {
                    fragments += 1;
                    shared.send_text(text).await
                }
                None => {
                    debug!(session_id = %shared.id, fragments, "Text source exhausted");
                    if auto_stop
                        && let Err(e) = shared.send_stop().await
                    {
                        shared.on_transport_error(e, &errors).await;
                    }
                    break;
                }
            },
            _ = next_ping(&mut ticker) => shared.transport.ping().await,
        };

        if let Err(e) = result {
            shared.on_transport_error(e, &errors).await;
            break;
        }
    }
    debug!(session_id = %shared.id, "Writer loop exited");
}

/// Sends `item` unless the session is shutting down first. Returns false on
/// shutdown.
async fn forward(shutdown: &CancellationToken, tx: &mpsc::Sender<Bytes>, item: Bytes) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = tx.send(item) => {
            if sent.is_err() {
                debug!("Receiver dropped, discarding chunk");
            }
            true
        }
    }
}

async fn read_loop(
    shared: Arc<SessionShared>,
    audio: mpsc::Sender<Bytes>,
    mut packets: Option<mpsc::Sender<Bytes>>,
    mut demuxer: Option<OggDemuxer>,
    errors: mpsc::Sender<RealtimeError>,
) {
    'read: loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            frame = shared.transport.recv() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                shared.on_transport_error(e, &errors).await;
                break;
            }
        };

        match ServerEvent::decode(&frame) {
            Ok(ServerEvent::Audio(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                let demuxed = match demuxer.as_mut() {
                    Some(demuxer) => demuxer.push(&chunk),
                    None => Vec::new(),
                };
                if !forward(&shared.shutdown, &audio, chunk).await {
                    break;
                }
                if let Some(tx) = packets.as_ref() {
                    for packet in demuxed {
                        if !forward(&shared.shutdown, tx, packet).await {
                            break 'read;
                        }
                    }
                }
            }
            Ok(ServerEvent::Finish { reason, message }) => {
                if reason.is_error() {
                    shared.report(
                        &errors,
                        RealtimeError::Remote(message.unwrap_or_else(|| "unknown error".to_string())),
                    );
                } else {
                    debug!(session_id = %shared.id, ?reason, "Service finished stream");
                }
                packets.take();
                break;
            }
            Err(e) => {
                shared.poison();
                shared.report(&errors, RealtimeError::Event(e));
                break;
            }
        }
    }

    drop(packets);
    if shared.control.closes_on_exit() {
        shared.shutdown.cancel();
        shared.transport.close().await;
    }
    shared.closed.cancel();
    debug!(session_id = %shared.id, "Reader loop exited");
}
