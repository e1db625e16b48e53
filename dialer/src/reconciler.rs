//! Applies normalized provider events to the registry.
//!
//! Providers deliver out of order, more than once, and sometimes wrong: a
//! call that is clearly talking can still be reported as `no-answer`. The
//! reconciler lets activity evidence win, makes every handler idempotent,
//! and turns terminal calls into delayed cleanups that never drop a call
//! somebody is still listening to.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outdial_timer::TimerSet;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{EventKind, NormalizedEvent, ToolCall};
use crate::audio::AudioMonitor;
use crate::call::{Call, CallStatus, Evidence, Speaker, TranscriptEntry, TranscriptOutcome};
use crate::campaign::CampaignExecutor;
use crate::conference::{ConferenceOrchestrator, Qualification};
use crate::config::Config;
use crate::error::DialerError;
use crate::event::{DialerEvent, EventBus};
use crate::registry::{CallMeta, CallRegistry, TransitionOutcome};

/// Delayed archive-then-evict of terminal calls. Evicted ids are remembered
/// for a while so late provider events don't bring the call back.
#[derive(Clone)]
pub struct Cleanup {
    registry: Arc<CallRegistry>,
    events: EventBus,
    timers: TimerSet<String>,
    evicted: TimerSet<String>,
    delay: Duration,
    retry: Duration,
    remember: Duration,
}

impl Cleanup {
    pub fn new(
        registry: Arc<CallRegistry>,
        events: EventBus,
        delay: Duration,
        retry: Duration,
        remember: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            timers: TimerSet::new(),
            evicted: TimerSet::new(),
            delay,
            retry,
            remember,
        }
    }

    fn remember_evicted(&self, call_id: &str) {
        self.evicted
            .schedule(call_id.to_string(), self.remember, async {});
    }

    pub fn was_evicted(&self, call_id: &str) -> bool {
        self.evicted.contains(&call_id.to_string())
    }

    pub fn schedule(&self, call_id: &str) {
        self.schedule_in(call_id, self.delay);
    }

    fn schedule_in(&self, call_id: &str, delay: Duration) {
        let this = self.clone();
        let id = call_id.to_string();
        self.timers.schedule(call_id.to_string(), delay, async move {
            this.run(&id);
        });
    }

    pub fn pending(&self, call_id: &str) -> bool {
        self.timers.contains(&call_id.to_string())
    }

    pub fn cancel(&self, call_id: &str) -> bool {
        self.timers.cancel(&call_id.to_string())
    }

    /// Archive and evict a terminal call now. A call with listeners is
    /// rescheduled instead. Returns whether the call was evicted.
    pub fn run(&self, call_id: &str) -> bool {
        let Some(call) = self.registry.get(call_id) else {
            return false;
        };
        if !call.status.is_terminal() {
            return false;
        }
        if call.listeners > 0 {
            debug!(call_id, listeners = call.listeners, "cleanup blocked by listeners");
            self.schedule_in(call_id, self.retry);
            return false;
        }

        if let Some(transcript) = self.registry.archive_transcript(call_id) {
            if !transcript.is_empty() {
                info!(call_id, lines = transcript.len(), "transcript archived");
                self.events.publish(DialerEvent::CallArchived {
                    call_id: call_id.to_string(),
                    transcript,
                });
            }
        }
        match self.registry.evict(call_id, false) {
            Ok(_) => {
                self.cancel(call_id);
                self.remember_evicted(call_id);
                true
            }
            Err(e) => {
                debug!(call_id, "cleanup rescheduled: {e}");
                self.schedule_in(call_id, self.retry);
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub rescheduled: usize,
    pub failed_stale: usize,
}

pub struct Reconciler {
    registry: Arc<CallRegistry>,
    events: EventBus,
    campaigns: Arc<CampaignExecutor>,
    audio: Arc<AudioMonitor>,
    conferences: Arc<ConferenceOrchestrator>,
    cleanup: Cleanup,
    stale_after: chrono::Duration,
    qualification_tool: String,
}

impl Reconciler {
    pub fn new(
        registry: Arc<CallRegistry>,
        events: EventBus,
        campaigns: Arc<CampaignExecutor>,
        audio: Arc<AudioMonitor>,
        conferences: Arc<ConferenceOrchestrator>,
        config: &Config,
    ) -> Self {
        let cleanup = Cleanup::new(
            registry.clone(),
            events.clone(),
            config.registry.cleanup_delay(),
            config.registry.cleanup_retry(),
            config.registry.evicted_ttl(),
        );
        Self {
            registry,
            events,
            campaigns,
            audio,
            conferences,
            cleanup,
            stale_after: chrono::Duration::seconds(config.registry.stale_call_secs as i64),
            qualification_tool: config.voiceai.qualification_tool.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    /// Apply one event. Tool calls get a response body for the provider.
    pub async fn handle(&self, event: NormalizedEvent) -> Option<Value> {
        let NormalizedEvent {
            call_id,
            kind,
            meta,
        } = event;
        if self.cleanup.was_evicted(&call_id) {
            debug!(call_id = call_id.as_str(), "event for evicted call ignored");
            return None;
        }
        match kind {
            EventKind::Started => {
                self.apply_status(&call_id, CallStatus::Queued, None, &meta)
                    .await
            }
            EventKind::Ringing => {
                self.apply_status(&call_id, CallStatus::Ringing, None, &meta)
                    .await
            }
            EventKind::Answered => {
                self.apply_status(&call_id, CallStatus::InProgress, None, &meta)
                    .await
            }
            EventKind::StatusUpdate(status) => {
                self.apply_status(&call_id, status, None, &meta).await
            }
            EventKind::Ended { status, reason } => {
                self.apply_status(&call_id, status, reason.as_deref(), &meta)
                    .await
            }
            EventKind::Transcript {
                speaker,
                text,
                is_final,
            } => {
                self.activity(&call_id, Evidence::Transcript, &meta);
                self.transcript(&call_id, speaker, text, is_final);
            }
            EventKind::Speech { .. } => self.activity(&call_id, Evidence::Speech, &meta),
            EventKind::ToolCalls(calls) => {
                self.registry.attach_meta(&call_id, &meta);
                return Some(self.tool_calls(&call_id, calls).await);
            }
            EventKind::Unrecognized { kind, status } => match status {
                Some(status) => {
                    info!(
                        call_id = call_id.as_str(),
                        kind = kind.as_str(),
                        status = %status,
                        "unrecognized event carried a status"
                    );
                    self.apply_status(&call_id, status, None, &meta).await
                }
                None => debug!(
                    call_id = call_id.as_str(),
                    kind = kind.as_str(),
                    "unrecognized event ignored"
                ),
            },
        }
        None
    }

    fn announce_created(&self, call_id: &str, outcome: &TransitionOutcome, meta: &CallMeta) {
        if outcome.created {
            self.events.publish(DialerEvent::CallStarted {
                call_id: call_id.to_string(),
                phone: meta.phone.clone(),
                campaign_id: meta.campaign_id.clone(),
            });
        }
    }

    async fn apply_status(
        &self,
        call_id: &str,
        reported: CallStatus,
        reason: Option<&str>,
        meta: &CallMeta,
    ) {
        let outcome = self.registry.transition(call_id, reported, Evidence::None);
        self.registry.attach_meta(call_id, meta);
        self.announce_created(call_id, &outcome, meta);
        if let Some(reason) = reason.filter(|_| outcome.current.is_terminal()) {
            self.registry.set_end_reason(call_id, reason);
        }
        if !outcome.changed() {
            return;
        }
        if outcome.mismatch() {
            self.events.publish(DialerEvent::StatusMismatch {
                call_id: call_id.to_string(),
                reported: outcome.reported,
                applied: outcome.current,
            });
        }

        match outcome.current {
            CallStatus::Ringing => self.events.publish(DialerEvent::CallRinging {
                call_id: call_id.to_string(),
            }),
            _ if outcome.answered() => self.answered(call_id, false),
            status if status.is_terminal() => self.finish(call_id).await,
            status => self.events.publish(DialerEvent::CallStatus {
                call_id: call_id.to_string(),
                status,
            }),
        }
    }

    /// Transcript or speech on a call: it was answered, whatever the
    /// provider said so far.
    fn activity(&self, call_id: &str, evidence: Evidence, meta: &CallMeta) {
        let reported = self.registry.status(call_id).unwrap_or(CallStatus::Queued);
        let outcome = self.registry.transition(call_id, reported, evidence);
        self.registry.attach_meta(call_id, meta);
        self.announce_created(call_id, &outcome, meta);
        if outcome.answered() {
            info!(call_id, previous = %outcome.previous, "call answered by activity");
            self.answered(call_id, true);
        }
    }

    fn answered(&self, call_id: &str, forced: bool) {
        self.events.publish(DialerEvent::CallAnswered {
            call_id: call_id.to_string(),
            forced,
        });
        match self.registry.get(call_id).and_then(|c| c.listen_url) {
            Some(url) => {
                self.audio.start(call_id, &url);
            }
            None => debug!(call_id, "no listen url, audio not monitored"),
        }
    }

    fn transcript(&self, call_id: &str, speaker: Speaker, text: String, is_final: bool) {
        if text.trim().is_empty() {
            return;
        }
        let entry = TranscriptEntry {
            speaker,
            text,
            is_final,
            timestamp: Utc::now(),
        };
        match self.registry.apply_transcript(call_id, entry.clone()) {
            TranscriptOutcome::Duplicate => {
                debug!(call_id, "duplicate transcript line dropped")
            }
            TranscriptOutcome::Appended | TranscriptOutcome::Replaced => {
                self.events.publish(DialerEvent::TranscriptUpdate {
                    call_id: call_id.to_string(),
                    entry,
                })
            }
        }
    }

    /// The call just became terminal.
    async fn finish(&self, call_id: &str) {
        let Some(call) = self.registry.get(call_id) else {
            return;
        };
        info!(
            call_id,
            status = %call.status,
            reason = call.end_reason.as_deref().unwrap_or(""),
            duration_secs = call.duration_secs.unwrap_or(0),
            "call finished"
        );
        self.events.publish(DialerEvent::CallEnded {
            call_id: call_id.to_string(),
            status: call.status,
            reason: call.end_reason.clone(),
            duration_secs: call.duration_secs,
        });
        self.audio.stop(call_id);
        if let Some(campaign) = call.campaign_id.as_deref() {
            self.campaigns
                .record_result(campaign, call_id, call.status)
                .await;
        }
        self.cleanup.schedule(call_id);
    }

    async fn tool_calls(&self, call_id: &str, calls: Vec<ToolCall>) -> Value {
        let mut results = Vec::new();
        for call in calls {
            let result = if call.name == self.qualification_tool {
                self.qualify(call_id, &call.arguments).await
            } else {
                debug!(call_id, tool = call.name.as_str(), "unhandled tool call");
                json!({"ok": false, "code": "unsupported_tool", "message": call.name})
            };
            results.push(json!({
                "toolCallId": call.id,
                "result": result.to_string(),
            }));
        }
        json!({ "results": results })
    }

    async fn qualify(&self, call_id: &str, arguments: &Value) -> Value {
        let call = self.registry.get(call_id);
        let argument = |name: &str| {
            arguments
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };
        let lead_id = argument("leadId")
            .or_else(|| call.as_ref().and_then(|c| c.lead_id.clone()))
            .unwrap_or_else(|| call_id.to_string());
        let phone = argument("phone").or_else(|| call.as_ref().and_then(|c| c.phone.clone()));
        let qualification = Qualification {
            lead_id,
            phone,
            call_id: Some(call_id.to_string()),
            payload: arguments.clone(),
        };
        match self.conferences.qualify(qualification).await {
            Ok(result) => {
                let mut body = json!({ "ok": true });
                if let (Value::Object(body), Ok(Value::Object(result))) =
                    (&mut body, serde_json::to_value(&result))
                {
                    body.extend(result);
                }
                body
            }
            Err(e) => {
                warn!(call_id, "qualification failed: {e}");
                json!({"ok": false, "code": e.code(), "message": e.to_string()})
            }
        }
    }

    /// A listener left. When it was the last one on a finished call, the
    /// cleanup runs now instead of waiting for its timer.
    pub fn release_listener(&self, call_id: &str) -> Option<u32> {
        let remaining = self.registry.release_listener(call_id)?;
        let terminal = self
            .registry
            .status(call_id)
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        if remaining == 0 && terminal {
            self.cleanup.cancel(call_id);
            self.cleanup.run(call_id);
        }
        Some(remaining)
    }

    /// Manual eviction.
    pub fn evict(&self, call_id: &str, force: bool) -> Result<Call, DialerError> {
        let call = self
            .registry
            .evict(call_id, force)?
            .ok_or_else(|| DialerError::CallNotFound(call_id.to_string()))?;
        self.cleanup.cancel(call_id);
        self.cleanup.remember_evicted(call_id);
        self.audio.stop(call_id);
        Ok(call)
    }

    /// Reschedule cleanups whose timers are gone and fail calls that have
    /// been live for too long.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for call_id in self.registry.terminal_ids() {
            if !self.cleanup.pending(&call_id) {
                self.cleanup.schedule(&call_id);
                report.rescheduled += 1;
            }
        }

        let before = Utc::now() - self.stale_after;
        for call_id in self.registry.stale_ids(before) {
            warn!(call_id = call_id.as_str(), "failing stale call");
            self.registry.set_end_reason(&call_id, "stale");
            let outcome =
                self.registry
                    .transition(&call_id, CallStatus::Failed, Evidence::None);
            if outcome.terminated() {
                report.failed_stale += 1;
                self.finish(&call_id).await;
            }
        }

        if report != SweepReport::default() {
            info!(
                rescheduled = report.rescheduled,
                failed_stale = report.failed_stale,
                "registry sweep"
            );
        }
        report
    }

    /// Feed events coming from audio control frames back through `handle`.
    pub fn spawn_feedback(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<NormalizedEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle(event).await;
            }
        })
    }
}
