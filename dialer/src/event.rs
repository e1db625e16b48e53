use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::call::{CallStatus, TranscriptEntry};
use crate::campaign::CampaignRecord;
use crate::conference::Conference;

/// Everything subscribers (the dashboard) get told about.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DialerEvent {
    CallStarted {
        call_id: String,
        phone: Option<String>,
        campaign_id: Option<String>,
    },
    CallRinging {
        call_id: String,
    },
    CallAnswered {
        call_id: String,
        /// Answered because of activity rather than a status report.
        forced: bool,
    },
    CallStatus {
        call_id: String,
        status: CallStatus,
    },
    CallEnded {
        call_id: String,
        status: CallStatus,
        reason: Option<String>,
        duration_secs: Option<i64>,
    },
    TranscriptUpdate {
        call_id: String,
        entry: TranscriptEntry,
    },
    StatusMismatch {
        call_id: String,
        reported: CallStatus,
        applied: CallStatus,
    },
    CallArchived {
        call_id: String,
        transcript: Vec<TranscriptEntry>,
    },
    AudioConnected {
        call_id: String,
    },
    AudioRetry {
        call_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    AudioFailed {
        call_id: String,
        attempts: u32,
    },
    AudioError {
        call_id: String,
        message: String,
    },
    CampaignUpdate {
        campaign: CampaignRecord,
    },
    ConferenceCreated {
        conference: Conference,
    },
    ConferenceUpdate {
        conference: Conference,
    },
    ConferenceAgentConnected {
        conference_id: String,
    },
    ConferenceEnded {
        conference_id: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DialerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DialerEvent) {
        if self.sender.send(event).is_err() {
            debug!("event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DialerEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<DialerEvent>) -> Vec<DialerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serialization() {
        let event = DialerEvent::CallAnswered {
            call_id: "c1".to_string(),
            forced: true,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "type": "call_answered",
                "payload": {"call_id": "c1", "forced": true},
            })
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(DialerEvent::CallRinging {
            call_id: "c1".to_string(),
        });
        let mut rx = bus.subscribe();
        bus.publish(DialerEvent::CallRinging {
            call_id: "c2".to_string(),
        });
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
