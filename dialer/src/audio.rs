//! Per-call audio streams from the voice AI provider.
//!
//! A monitor holds one websocket per answered call. Binary frames are audio:
//! they're relayed to live listeners and buffered for the recording sink,
//! which gets the buffer whenever it fills up and when the stream ends.
//! Text frames are JSON control messages; errors are broadcast and status
//! messages go back into the reconciler through the feedback channel.
//! Connection loss is retried with exponential backoff; running out of
//! retries is reported but never ends the call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use outdial_timer::Backoff;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{parse_voiceai, EventKind, NormalizedEvent};
use crate::call::CallStatus;
use crate::config::AudioConfig;
use crate::event::{DialerEvent, EventBus};
use crate::registry::CallRegistry;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(Value),
    Audio(Vec<u8>),
    Closed { normal: bool },
}

pub type FrameStream = BoxStream<'static, Result<Frame>>;

#[async_trait]
pub trait AudioConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream>;
}

pub struct WsConnector;

#[async_trait]
impl AudioConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Binary(data)) => Some(Ok(Frame::Audio(data))),
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(value) => Some(Ok(Frame::Control(value))),
                    Err(e) => {
                        debug!("ignoring non json text frame: {e}");
                        None
                    }
                },
                Ok(Message::Close(frame)) => Some(Ok(Frame::Closed {
                    normal: frame.map(|f| f.code == CloseCode::Normal).unwrap_or(true),
                })),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });
        Ok(frames.boxed())
    }
}

/// Where a call's audio goes. A stream arrives as consecutive chunks, in
/// order.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn write(&self, call_id: &str, audio: Vec<u8>) -> Result<()>;
}

pub struct DiscardSink;

#[async_trait]
impl AudioSink for DiscardSink {
    async fn write(&self, call_id: &str, audio: Vec<u8>) -> Result<()> {
        debug!(call_id, bytes = audio.len(), "discarding call audio");
        Ok(())
    }
}

/// Appends raw audio to `{dir}/{call_id}.raw`. Reconnects of the same call
/// land in the same file.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AudioSink for FileSink {
    async fn write(&self, call_id: &str, audio: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{call_id}.raw"));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&audio).await?;
        debug!(call_id, bytes = audio.len(), path = %path.display(), "call audio written");
        Ok(())
    }
}

enum Session {
    Cancelled,
    Closed,
    Lost { opened: bool, reason: String },
}

pub struct AudioMonitor {
    registry: Arc<CallRegistry>,
    events: EventBus,
    connector: Arc<dyn AudioConnector>,
    sink: Arc<dyn AudioSink>,
    config: AudioConfig,
    feedback: mpsc::UnboundedSender<NormalizedEvent>,
    relays: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl AudioMonitor {
    pub fn new(
        registry: Arc<CallRegistry>,
        events: EventBus,
        connector: Arc<dyn AudioConnector>,
        sink: Arc<dyn AudioSink>,
        config: AudioConfig,
        feedback: mpsc::UnboundedSender<NormalizedEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            connector,
            sink,
            config,
            feedback,
            relays: Mutex::new(HashMap::new()),
        })
    }

    /// Open the stream for an answered call. False if the call isn't live
    /// and answered, or already has a monitor.
    pub fn start(self: &Arc<Self>, call_id: &str, url: &str) -> bool {
        let answered = self
            .registry
            .status(call_id)
            .map(|s| s.rank() >= CallStatus::InProgress.rank() && !s.is_terminal())
            .unwrap_or(false);
        if !answered {
            debug!(call_id, "not starting audio for unanswered call");
            return false;
        }
        let token = CancellationToken::new();
        if !self.registry.set_audio(call_id, token.clone()) {
            debug!(call_id, "audio already running");
            return false;
        }
        let (relay, _) = broadcast::channel(64);
        self.relays.lock().insert(call_id.to_string(), relay);

        let this = self.clone();
        let call_id = call_id.to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            this.run(&call_id, &url, &token).await;
            if !token.is_cancelled() {
                this.registry.take_audio(&call_id);
                this.relays.lock().remove(&call_id);
            }
        });
        true
    }

    pub fn stop(&self, call_id: &str) -> bool {
        self.relays.lock().remove(call_id);
        match self.registry.take_audio(call_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Live audio for a listener, while the stream is being monitored.
    pub fn subscribe(&self, call_id: &str) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.relays.lock().get(call_id).map(|relay| relay.subscribe())
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.config.retry_base_ms),
            Duration::from_millis(self.config.retry_max_ms),
            self.config.max_retries,
        )
    }

    async fn run(&self, call_id: &str, url: &str, token: &CancellationToken) {
        let backoff = self.backoff();
        let mut attempt = 0u32;
        loop {
            let (opened, reason) = match self.session(call_id, url, token).await {
                Session::Cancelled => return,
                Session::Closed => {
                    info!(call_id, "audio stream closed");
                    return;
                }
                Session::Lost { opened, reason } => (opened, reason),
            };
            if opened {
                attempt = 0;
            }
            attempt += 1;

            let live = self
                .registry
                .status(call_id)
                .map(|s| !s.is_terminal())
                .unwrap_or(false);
            if !live {
                debug!(call_id, "call over, not reconnecting audio: {reason}");
                return;
            }

            let Some(delay) = backoff.delay(attempt) else {
                let attempts = attempt - 1;
                error!(call_id, attempts, "audio stream failed permanently: {reason}");
                self.events.publish(DialerEvent::AudioFailed {
                    call_id: call_id.to_string(),
                    attempts,
                });
                return;
            };
            warn!(
                call_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "audio stream lost: {reason}"
            );
            self.registry.set_audio_retries(call_id, attempt);
            self.events.publish(DialerEvent::AudioRetry {
                call_id: call_id.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&self, call_id: &str, url: &str, token: &CancellationToken) -> Session {
        let connect =
            tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(url));
        let mut frames = tokio::select! {
            _ = token.cancelled() => return Session::Cancelled,
            result = connect => match result {
                Ok(Ok(frames)) => frames,
                Ok(Err(e)) => {
                    return Session::Lost {
                        opened: false,
                        reason: format!("{e:#}"),
                    }
                }
                Err(_) => {
                    return Session::Lost {
                        opened: false,
                        reason: "connect timeout".to_string(),
                    }
                }
            },
        };

        info!(call_id, "audio stream connected");
        self.registry.set_audio_retries(call_id, 0);
        self.events.publish(DialerEvent::AudioConnected {
            call_id: call_id.to_string(),
        });

        let mut buffer = Vec::new();
        let outcome = loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break Session::Cancelled,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(Frame::Audio(data))) => {
                    self.relay(call_id, &data);
                    buffer.extend_from_slice(&data);
                    if buffer.len() >= self.config.flush_bytes {
                        self.flush(call_id, std::mem::take(&mut buffer)).await;
                    }
                }
                Some(Ok(Frame::Control(value))) => self.control_frame(call_id, &value),
                Some(Ok(Frame::Closed { normal: true })) => break Session::Closed,
                Some(Ok(Frame::Closed { normal: false })) => {
                    break Session::Lost {
                        opened: true,
                        reason: "abnormal close".to_string(),
                    }
                }
                Some(Err(e)) => {
                    break Session::Lost {
                        opened: true,
                        reason: format!("{e:#}"),
                    }
                }
                None => {
                    break Session::Lost {
                        opened: true,
                        reason: "stream ended without close".to_string(),
                    }
                }
            }
        };

        if !buffer.is_empty() {
            self.flush(call_id, buffer).await;
        }
        outcome
    }

    async fn flush(&self, call_id: &str, audio: Vec<u8>) {
        if let Err(e) = self.sink.write(call_id, audio).await {
            warn!(call_id, "audio sink failed: {e:#}");
        }
    }

    fn relay(&self, call_id: &str, data: &[u8]) {
        if let Some(relay) = self.relays.lock().get(call_id) {
            if relay.receiver_count() > 0 {
                let _ = relay.send(data.to_vec());
            }
        }
    }

    fn control_frame(&self, call_id: &str, value: &Value) {
        if value.get("type").and_then(|t| t.as_str()) == Some("error") {
            let message = value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            warn!(call_id, "audio stream error frame: {message}");
            self.events.publish(DialerEvent::AudioError {
                call_id: call_id.to_string(),
                message,
            });
            return;
        }
        match parse_voiceai(value, Some(call_id)) {
            Ok(NormalizedEvent {
                kind: EventKind::Unrecognized { status: None, .. },
                ..
            }) => debug!(call_id, "ignoring audio control frame"),
            Ok(event) => {
                if self.feedback.send(event).is_err() {
                    debug!(call_id, "audio feedback closed");
                }
            }
            Err(e) => debug!(call_id, "bad audio control frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, Evidence};
    use crate::event::drain;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    enum Script {
        Fail,
        Hang,
        Frames(Vec<Frame>),
        /// Frames, then the stream stays open.
        Open(Vec<Frame>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        connects: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                connects: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AudioConnector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<FrameStream> {
            self.connects.lock().push(Instant::now());
            let script = self.scripts.lock().pop_front().unwrap_or(Script::Fail);
            match script {
                Script::Fail => Err(anyhow!("connection refused")),
                Script::Hang => futures::future::pending().await,
                Script::Frames(frames) => {
                    Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
                }
                Script::Open(frames) => Ok(futures::stream::iter(frames.into_iter().map(Ok))
                    .chain(futures::stream::pending())
                    .boxed()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        finished: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn write(&self, call_id: &str, audio: Vec<u8>) -> Result<()> {
            self.finished.lock().push((call_id.to_string(), audio));
            Ok(())
        }
    }

    struct Harness {
        monitor: Arc<AudioMonitor>,
        registry: Arc<CallRegistry>,
        connector: Arc<ScriptedConnector>,
        sink: Arc<RecordingSink>,
        events: EventBus,
        feedback: mpsc::UnboundedReceiver<NormalizedEvent>,
    }

    fn harness(scripts: Vec<Script>, max_retries: u32) -> Harness {
        harness_with(
            scripts,
            AudioConfig {
                max_retries,
                ..Default::default()
            },
        )
    }

    fn harness_with(scripts: Vec<Script>, config: AudioConfig) -> Harness {
        let registry = Arc::new(CallRegistry::new());
        registry.register(Call::new("c1"));
        registry.transition("c1", CallStatus::InProgress, Evidence::None);
        let connector = Arc::new(ScriptedConnector::new(scripts));
        let sink = Arc::new(RecordingSink::default());
        let events = EventBus::default();
        let (tx, feedback) = mpsc::unbounded_channel();
        let monitor = AudioMonitor::new(
            registry.clone(),
            events.clone(),
            connector.clone(),
            sink.clone(),
            config,
            tx,
        );
        Harness {
            monitor,
            registry,
            connector,
            sink,
            events,
            feedback,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_max_without_ending_call() {
        let h = harness(Vec::new(), 3);
        let mut rx = h.events.subscribe();
        assert!(h.monitor.start("c1", "wss://listen/c1"));

        tokio::time::sleep(Duration::from_secs(60)).await;

        let events = drain(&mut rx);
        let delays: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                DialerEvent::AudioRetry { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(matches!(
            events.last(),
            Some(DialerEvent::AudioFailed { attempts: 3, .. })
        ));
        assert_eq!(h.connector.connects.lock().len(), 4);
        assert_eq!(h.registry.status("c1"), Some(CallStatus::InProgress));
        assert!(h.registry.get("c1").unwrap().audio.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_retried() {
        let h = harness(
            vec![
                Script::Hang,
                Script::Frames(vec![Frame::Closed { normal: true }]),
            ],
            5,
        );
        let mut rx = h.events.subscribe();
        let started = Instant::now();
        h.monitor.start("c1", "wss://listen/c1");

        tokio::time::sleep(Duration::from_secs(30)).await;

        let connects = h.connector.connects.lock().clone();
        assert_eq!(connects.len(), 2);
        // 5s connect timeout, then the first backoff delay
        assert!(connects[1] - started >= Duration::from_millis(6000));
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            DialerEvent::AudioRetry { attempt: 1, delay_ms: 1000, .. }
        ));
        assert!(matches!(events[1], DialerEvent::AudioConnected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn audio_goes_to_sink_and_status_frames_feed_back() {
        let ended = serde_json::json!({
            "type": "status-update",
            "status": "ended",
            "endedReason": "customer-ended-call",
        });
        let mut h = harness(
            vec![
                Script::Frames(vec![
                    Frame::Audio(vec![1, 2]),
                    Frame::Closed { normal: false },
                ]),
                Script::Fail,
                Script::Frames(vec![
                    Frame::Audio(vec![3]),
                    Frame::Control(serde_json::json!({"type": "error", "message": "codec"})),
                    Frame::Control(ended),
                    Frame::Closed { normal: false },
                ]),
                Script::Frames(vec![Frame::Closed { normal: true }]),
            ],
            5,
        );
        let mut rx = h.events.subscribe();
        h.monitor.start("c1", "wss://listen/c1");

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            *h.sink.finished.lock(),
            vec![
                ("c1".to_string(), vec![1, 2]),
                ("c1".to_string(), vec![3]),
            ]
        );
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            DialerEvent::AudioError { message, .. } if message == "codec"
        )));
        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                DialerEvent::AudioRetry { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        // the third connect opened, so the next loss starts over at 1
        assert_eq!(retries, vec![1, 2, 1]);

        let event = h.feedback.try_recv().unwrap();
        assert_eq!(event.call_id, "c1");
        assert!(matches!(
            event.kind,
            EventKind::Ended {
                status: CallStatus::Ended,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn long_stream_is_written_in_chunks() {
        let h = harness_with(
            vec![Script::Open(vec![
                Frame::Audio(vec![1]),
                Frame::Audio(vec![2]),
                Frame::Audio(vec![3]),
            ])],
            AudioConfig {
                flush_bytes: 2,
                ..Default::default()
            },
        );
        h.monitor.start("c1", "wss://listen/c1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        // written while the stream is still open
        assert_eq!(
            *h.sink.finished.lock(),
            vec![("c1".to_string(), vec![1, 2])]
        );

        assert!(h.monitor.stop("c1"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            *h.sink.finished.lock(),
            vec![
                ("c1".to_string(), vec![1, 2]),
                ("c1".to_string(), vec![3]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn not_started_before_answer() {
        let h = harness(Vec::new(), 3);
        h.registry.register(Call::new("c2"));
        assert!(!h.monitor.start("c2", "wss://listen/c2"));
        assert!(!h.monitor.start("missing", "wss://listen/missing"));

        // one monitor per call
        h.connector.scripts.lock().push_back(Script::Hang);
        assert!(h.monitor.start("c1", "wss://listen/c1"));
        assert!(!h.monitor.start("c1", "wss://listen/c1"));
        assert!(h.monitor.subscribe("c1").is_some());
        assert!(h.monitor.stop("c1"));
        assert!(h.monitor.subscribe("c1").is_none());
    }
}
