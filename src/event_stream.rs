//! Server-pushed event stream for the dashboard metrics feed.
//!
//! The stream is a long-lived, unidirectional UTF-8 text body. Frames are
//! separated by a blank line and carry an `event: <type>` line and one or more
//! `data: <json>` lines:
//!
//! ```text
//! event: system_update
//! data: {"cpu": 41.5}
//!
//! ```
//!
//! [`FrameParser`] does the incremental splitting, [`StreamEvent`] classifies
//! frames, and [`EventStreamReader`] owns the connection and hands every
//! update to the [`UpdateBatcher`]. Category updates wait for the batching
//! window; a full replacement is written at once and discards whatever was
//! still pending, so the store sees frames in stream order. When the stream ends it retries once per termination
//! after a fixed delay; it never opens without a credential.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batcher::UpdateBatcher;
use crate::error::MonitorError;
use crate::protocol::{DashboardMetrics, MetricCategory};
use crate::sync::{join_or_abort, lock};

/// Default delay before reopening a terminated stream.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default timeout for stopping the reader task.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Body chunks of an open event stream.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, MonitorError>>;

/// Opens the event stream endpoint.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open the stream using `credential` as the bearer token.
    ///
    /// # Errors
    ///
    /// Any error is treated as a stream termination and retried after the
    /// configured delay.
    async fn open(&self, credential: &str) -> Result<ChunkStream, MonitorError>;
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for an [`EventStreamReader`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Fixed delay before reopening after the stream ends or fails to open.
    ///
    /// Defaults to **5 seconds**. There is no exponential growth.
    pub retry_delay: Duration,
    /// How long [`EventStreamReader::stop`] waits for the reader task.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl StreamConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the fixed reconnect delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the stop timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Framing ─────────────────────────────────────────────────────────

/// One complete frame: its event type and its (joined) data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

/// Incremental splitter for the double-newline framed text protocol.
///
/// Bytes are buffered until a full frame is available, so a chunk boundary
/// may fall anywhere, including inside a multi-byte UTF-8 sequence. The
/// trailing partial frame stays in the buffer until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
}

impl FrameParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completed, in order.
    ///
    /// Complete frames that cannot be parsed are logged and skipped; they
    /// never affect the frames around them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        // CRLF line endings are folded into LF.
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..end).collect();
            self.buffer.drain(..2);

            match std::str::from_utf8(&raw) {
                Ok(text) => {
                    if let Some(frame) = parse_frame(text) {
                        frames.push(frame);
                    }
                }
                Err(e) => warn!("dropping event stream frame with invalid UTF-8: {e}"),
            }
        }
        frames
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Parse the lines of one frame. Returns `None` for frames without data
/// (comments, keep-alive blanks).
fn parse_frame(text: &str) -> Option<StreamFrame> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => debug!(field, "ignoring unknown event stream field"),
        }
    }

    let data = data?;
    Some(StreamFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data,
    })
}

// ── Classification ──────────────────────────────────────────────────

/// A recognized event stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The server acknowledged the subscription.
    Connected,
    /// Keep-alive.
    Heartbeat,
    /// Whole-dashboard replacement.
    Metrics(DashboardMetrics),
    /// Replacement of one category.
    CategoryUpdate {
        category: MetricCategory,
        value: serde_json::Value,
    },
}

impl StreamEvent {
    /// Classify a frame.
    ///
    /// Returns `Ok(None)` for event types this client does not handle.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Serialization`] if the data of a `metrics` or
    /// `*_update` frame is not valid JSON.
    pub fn from_frame(frame: &StreamFrame) -> Result<Option<Self>, MonitorError> {
        let category = match frame.event.as_str() {
            "connected" => return Ok(Some(Self::Connected)),
            "heartbeat" => return Ok(Some(Self::Heartbeat)),
            "metrics" => return Ok(Some(Self::Metrics(serde_json::from_str(&frame.data)?))),
            "system_update" => MetricCategory::System,
            "business_update" => MetricCategory::Business,
            "connection_update" => MetricCategory::Connection,
            "performance_update" => MetricCategory::Performance,
            _ => return Ok(None),
        };
        Ok(Some(Self::CategoryUpdate {
            category,
            value: serde_json::from_str(&frame.data)?,
        }))
    }
}

// ── Reader ──────────────────────────────────────────────────────────

struct Running {
    task: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

fn dispatch(batcher: &UpdateBatcher, frame: &StreamFrame) {
    match StreamEvent::from_frame(frame) {
        Ok(Some(StreamEvent::Metrics(metrics))) => batcher.replace(metrics),
        Ok(Some(StreamEvent::CategoryUpdate { category, value })) => {
            batcher.record(category, value);
        }
        Ok(Some(StreamEvent::Connected)) => debug!("event stream acknowledged"),
        Ok(Some(StreamEvent::Heartbeat)) => debug!("event stream heartbeat"),
        Ok(None) => debug!(event = %frame.event, "ignoring unrecognized event stream frame"),
        Err(e) => warn!(event = %frame.event, "dropping malformed event stream frame: {e}"),
    }
}

/// Owns the event stream connection. See the [module documentation](self).
pub struct EventStreamReader {
    source: Arc<dyn EventSource>,
    batcher: UpdateBatcher,
    config: StreamConfig,
    credential: Arc<StdMutex<Option<String>>>,
    running: StdMutex<Option<Running>>,
}

impl EventStreamReader {
    /// Create a stopped reader that writes through `batcher`.
    pub fn new(source: Arc<dyn EventSource>, batcher: UpdateBatcher, config: StreamConfig) -> Self {
        Self {
            source,
            batcher,
            config,
            credential: Arc::new(StdMutex::new(None)),
            running: StdMutex::new(None),
        }
    }

    /// Set or clear the bearer credential used by the next open.
    pub fn set_credential(&self, credential: Option<String>) {
        *lock(&self.credential) = credential;
    }

    /// Start reading if not already running.
    ///
    /// Without a credential nothing is opened and nothing is scheduled; call
    /// `start` again once one is set.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("event stream reader already running");
            return;
        }
        if lock(&self.credential).is_none() {
            warn!("no credential available, event stream not opened");
            *running = None;
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(read_loop(
            Arc::clone(&self.source),
            self.batcher.clone(),
            Arc::clone(&self.credential),
            self.config.retry_delay,
            shutdown_rx,
        ));
        *running = Some(Running { task, shutdown_tx });
    }

    /// Returns `true` while the reader task is alive.
    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Stop reading, cancel any pending retry and force the batcher's final flush.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(Running { task, shutdown_tx }) = running {
            let _ = shutdown_tx.send(());
            join_or_abort(task, self.config.shutdown_timeout, "event stream task").await;
        }
        self.batcher.shutdown();
    }
}

impl std::fmt::Debug for EventStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamReader")
            .field("running", &self.is_running())
            .field("has_credential", &lock(&self.credential).is_some())
            .finish()
    }
}

impl Drop for EventStreamReader {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.task.abort();
        }
    }
}

/// Why one connection's read loop ended.
enum StreamExit {
    Shutdown,
    Terminated,
}

/// Open, read until termination, wait the fixed delay, repeat.
async fn read_loop(
    source: Arc<dyn EventSource>,
    batcher: UpdateBatcher,
    credential: Arc<StdMutex<Option<String>>>,
    retry_delay: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("event stream reader started");

    loop {
        let Some(token) = lock(&credential).clone() else {
            warn!("credential missing at open time, event stream reader stopping");
            break;
        };

        let opened = tokio::select! {
            opened = source.open(&token) => opened,
            _ = &mut shutdown_rx => break,
        };

        match opened {
            Ok(stream) => {
                info!("event stream connected");
                if let StreamExit::Shutdown = consume(stream, &batcher, &mut shutdown_rx).await {
                    break;
                }
                info!("event stream terminated");
            }
            Err(e) => error!("failed to open event stream: {e}"),
        }

        debug!(delay = ?retry_delay, "reopening event stream after delay");
        tokio::select! {
            _ = tokio::time::sleep(retry_delay) => {}
            _ = &mut shutdown_rx => break,
        }
    }

    debug!("event stream reader exited");
}

async fn consume(
    mut stream: ChunkStream,
    batcher: &UpdateBatcher,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> StreamExit {
    let mut parser = FrameParser::new();
    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for frame in parser.push(&bytes) {
                        dispatch(batcher, &frame);
                    }
                }
                Some(Err(e)) => {
                    error!("event stream read error: {e}");
                    return StreamExit::Terminated;
                }
                None => {
                    if parser.buffered() > 0 {
                        debug!(bytes = parser.buffered(), "event stream ended inside a frame");
                    }
                    return StreamExit::Terminated;
                }
            },
            _ = &mut *shutdown_rx => return StreamExit::Shutdown,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::batcher::BatchConfig;
    use crate::store::{SessionStateStore, StoreConfig};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Parser ──────────────────────────────────────────────────────

    #[test]
    fn splits_frames_on_blank_line() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"event: heartbeat\ndata: {}\n\nevent: metrics\ndata: {\"system\":1}\n\n");
        assert_eq!(
            frames,
            vec![
                StreamFrame {
                    event: "heartbeat".into(),
                    data: "{}".into()
                },
                StreamFrame {
                    event: "metrics".into(),
                    data: "{\"system\":1}".into()
                },
            ]
        );
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn partial_frame_is_retained_until_completed() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"event: system_up").is_empty());
        assert!(parser.push(b"date\ndata: {\"cpu\"").is_empty());
        assert!(parser.buffered() > 0);
        let frames = parser.push(b": 3}\n\nevent: heart");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "system_update");
        assert_eq!(frames[0].data, "{\"cpu\": 3}");
        assert_eq!(parser.buffered(), "event: heart".len());
    }

    #[test]
    fn utf8_sequence_split_across_chunks() {
        let text = "event: business_update\ndata: {\"name\":\"Zoë\"}\n\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut parser = FrameParser::new();
        assert!(parser.push(&text[..split]).is_empty());
        let frames = parser.push(&text[split..]);
        assert_eq!(frames[0].data, "{\"name\":\"Zoë\"}");
    }

    #[test]
    fn crlf_and_multiline_data_are_handled() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b": comment\r\nevent: metrics\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn invalid_utf8_frame_is_isolated() {
        let mut parser = FrameParser::new();
        let mut bytes = b"event: heartbeat\ndata: \xff\n\n".to_vec();
        bytes.extend_from_slice(b"event: connected\ndata: {}\n\n");
        let frames = parser.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "connected");
    }

    #[test]
    fn classification_routes_by_event_type() {
        let frame = |event: &str, data: &str| StreamFrame {
            event: event.into(),
            data: data.into(),
        };
        assert_eq!(
            StreamEvent::from_frame(&frame("connection_update", "{\"n\":2}")).unwrap(),
            Some(StreamEvent::CategoryUpdate {
                category: MetricCategory::Connection,
                value: json!({ "n": 2 }),
            })
        );
        assert_eq!(
            StreamEvent::from_frame(&frame("heartbeat", "")).unwrap(),
            Some(StreamEvent::Heartbeat)
        );
        assert!(StreamEvent::from_frame(&frame("unknown", "{}")).unwrap().is_none());
        assert!(StreamEvent::from_frame(&frame("system_update", "{oops")).is_err());
    }

    // ── Reader ──────────────────────────────────────────────────────

    /// Replays scripted streams; every `open` pops the next script.
    struct ScriptedSource {
        scripts: StdMutex<VecDeque<Vec<Result<Vec<u8>, MonitorError>>>>,
        opens: AtomicUsize,
        credentials: StdMutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Vec<Result<Vec<u8>, MonitorError>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                opens: AtomicUsize::new(0),
                credentials: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn open(&self, credential: &str) -> Result<ChunkStream, MonitorError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.credentials.lock().unwrap().push(credential.to_string());
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(chunks) => Ok(futures_util::stream::iter(chunks).boxed()),
                // Out of scripts: stay open and silent.
                None => Ok(futures_util::stream::pending().boxed()),
            }
        }
    }

    fn reader(source: Arc<ScriptedSource>) -> (Arc<SessionStateStore>, EventStreamReader) {
        let (store, _refetch) = SessionStateStore::new(StoreConfig::new());
        let batcher = UpdateBatcher::new(Arc::clone(&store), BatchConfig::new());
        let reader = EventStreamReader::new(
            source,
            batcher,
            StreamConfig::new().with_retry_delay(Duration::from_secs(5)),
        );
        (store, reader)
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_aborts_without_retry() {
        let source = ScriptedSource::new(vec![]);
        let (_store, reader) = reader(Arc::clone(&source));

        reader.start();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!reader.is_running());
        assert_eq!(source.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_frame_replaces_dashboard_immediately() {
        let source = ScriptedSource::new(vec![vec![Ok(
            b"event: metrics\ndata: {\"system\":{\"cpu\":5},\"business\":{\"exams\":2}}\n\n".to_vec(),
        )]]);
        let (store, reader) = reader(Arc::clone(&source));
        reader.set_credential(Some("tok".into()));
        reader.start();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let metrics = store.dashboard().unwrap();
        assert_eq!(metrics.system, Some(json!({ "cpu": 5 })));
        assert_eq!(metrics.business, Some(json!({ "exams": 2 })));
        assert_eq!(source.credentials.lock().unwrap()[0], "tok");
        reader.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_frame_wins_over_earlier_category_update() {
        let source = ScriptedSource::new(vec![vec![
            Ok(b"event: system_update\ndata: {\"cpu\":1}\n\n".to_vec()),
            Ok(b"event: metrics\ndata: {\"system\":{\"cpu\":99}}\n\n".to_vec()),
        ]]);
        let (store, reader) = reader(Arc::clone(&source));
        reader.set_credential(Some("tok".into()));
        reader.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.dashboard().unwrap().system, Some(json!({ "cpu": 99 })));

        // Past the batching window.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.dashboard().unwrap().system, Some(json!({ "cpu": 99 })));
        reader.stop().await;
        assert_eq!(store.dashboard().unwrap().system, Some(json!({ "cpu": 99 })));
    }

    #[tokio::test(start_paused = true)]
    async fn termination_schedules_one_retry_after_fixed_delay() {
        let source = ScriptedSource::new(vec![
            vec![Err(MonitorError::TransportReceive("reset".into()))],
            vec![],
        ]);
        let (_store, reader) = reader(Arc::clone(&source));
        reader.set_credential(Some("tok".into()));
        reader.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        // Second script ends cleanly, third open stays pending forever.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 3);

        reader.stop().await;
        assert!(!reader.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn credential_cleared_before_retry_stops_reader() {
        let source = ScriptedSource::new(vec![vec![]]);
        let (_store, reader) = reader(Arc::clone(&source));
        reader.set_credential(Some("tok".into()));
        reader.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.set_credential(None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
        assert!(!reader.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_pending_category_updates() {
        let source = ScriptedSource::new(vec![vec![Ok(
            b"event: performance_update\ndata: {\"p50\":7}\n\n".to_vec(),
        )]]);
        let (store, reader) = reader(Arc::clone(&source));
        reader.set_credential(Some("tok".into()));
        reader.start();

        // Let the frame arrive but stay inside the batching window.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        reader.stop().await;

        assert_eq!(
            store.dashboard().unwrap().performance,
            Some(json!({ "p50": 7 }))
        );
    }
}
