use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::EnumString;
use tokio_util::sync::CancellationToken;

#[derive(
    strum_macros::Display,
    EnumString,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Debug,
)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    #[strum(serialize = "queued")]
    Queued,
    #[strum(serialize = "ringing")]
    Ringing,
    #[strum(serialize = "in-progress")]
    InProgress,
    #[strum(serialize = "transferring")]
    Transferring,
    #[strum(serialize = "ending")]
    Ending,
    #[strum(serialize = "ended")]
    Ended,
    #[strum(serialize = "failed")]
    Failed,
    #[strum(serialize = "no-answer")]
    NoAnswer,
}

impl CallStatus {
    pub fn rank(self) -> u8 {
        match self {
            CallStatus::Queued => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            CallStatus::Transferring => 3,
            CallStatus::Ending => 4,
            CallStatus::Ended | CallStatus::Failed | CallStatus::NoAnswer => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 5
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Assistant,
    User,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptOutcome {
    Appended,
    Replaced,
    Duplicate,
}

/// What a status report came with. Transcript lines and speech signals
/// only happen on an answered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    None,
    Transcript,
    Speech,
}

impl Evidence {
    pub fn is_activity(self) -> bool {
        !matches!(self, Evidence::None)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub from: Option<CallStatus>,
    pub to: CallStatus,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<CallStatus>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: String,
    pub status: CallStatus,
    pub phone: Option<String>,
    pub campaign_id: Option<String>,
    pub lead_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ringing_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub end_reason: Option<String>,
    pub control_url: Option<String>,
    pub listen_url: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub listeners: u32,
    /// Set once a transcript line or speech signal was seen.
    pub activity: bool,
    pub audio_retries: u32,
    #[serde(skip)]
    pub audio: Option<CancellationToken>,
    pub history: Vec<StatusChange>,
}

impl Call {
    pub fn new(id: impl Into<String>) -> Call {
        Call {
            id: id.into(),
            status: CallStatus::Queued,
            phone: None,
            campaign_id: None,
            lead_id: None,
            created_at: Utc::now(),
            ringing_at: None,
            answered_at: None,
            ended_at: None,
            duration_secs: None,
            end_reason: None,
            control_url: None,
            listen_url: None,
            transcript: Vec::new(),
            listeners: 0,
            activity: false,
            audio_retries: 0,
            audio: None,
            history: Vec::new(),
        }
    }

    pub fn audio_connected(&self) -> bool {
        self.audio.is_some()
    }

    /// Move to `to`, stamping the matching timestamp and appending history.
    /// Rank checks are the caller's job.
    pub(crate) fn set_status(&mut self, to: CallStatus, reported: Option<CallStatus>) {
        let now = Utc::now();
        let from = self.status;
        self.status = to;
        match to {
            CallStatus::Ringing => {
                self.ringing_at.get_or_insert(now);
            }
            CallStatus::InProgress => {
                self.answered_at.get_or_insert(now);
            }
            s if s.is_terminal() => {
                if self.activity {
                    self.answered_at.get_or_insert(now);
                }
                self.ended_at = Some(now);
                let start = self.answered_at.unwrap_or(self.created_at);
                self.duration_secs = Some((now - start).num_seconds().max(0));
            }
            _ => {}
        }
        self.history.push(StatusChange {
            from: Some(from),
            to,
            at: now,
            reported: reported.filter(|r| *r != to),
        });
    }

    /// Finals always append and retire the speaker's pending partial; a
    /// partial replaces that pending partial. Anything repeating the
    /// speaker's latest final line is a redelivery and gets dropped.
    pub fn apply_transcript(&mut self, entry: TranscriptEntry) -> TranscriptOutcome {
        let repeats_final = self
            .transcript
            .iter()
            .rev()
            .find(|e| e.speaker == entry.speaker && e.is_final)
            .is_some_and(|e| e.text == entry.text);
        if repeats_final {
            return TranscriptOutcome::Duplicate;
        }

        let pending = self
            .transcript
            .iter()
            .rposition(|e| e.speaker == entry.speaker && !e.is_final);
        if entry.is_final {
            if let Some(index) = pending {
                self.transcript.remove(index);
            }
            self.transcript.push(entry);
            return TranscriptOutcome::Appended;
        }
        match pending {
            Some(index) if self.transcript[index].text == entry.text => {
                TranscriptOutcome::Duplicate
            }
            Some(index) => {
                self.transcript[index] = entry;
                TranscriptOutcome::Replaced
            }
            None => {
                self.transcript.push(entry);
                TranscriptOutcome::Appended
            }
        }
    }
}
