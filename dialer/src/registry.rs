use std::collections::HashMap;
use std::mem;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::{
    Call, CallStatus, Evidence, TranscriptEntry, TranscriptOutcome,
};
use crate::error::DialerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// The reported status was applied as is.
    Applied,
    /// Applied, but not as reported: activity evidence promoted the call to
    /// in-progress, or a no-answer on a call with activity became ended.
    Overridden,
    /// Same status delivered again.
    Unchanged,
    /// Lower rank than the current status, or the call is already terminal.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous: CallStatus,
    pub current: CallStatus,
    pub reported: CallStatus,
    pub kind: TransitionKind,
    pub created: bool,
}

impl TransitionOutcome {
    pub fn changed(&self) -> bool {
        matches!(self.kind, TransitionKind::Applied | TransitionKind::Overridden)
    }

    /// The call just became answered.
    pub fn answered(&self) -> bool {
        self.changed()
            && self.previous.rank() < CallStatus::InProgress.rank()
            && self.current == CallStatus::InProgress
    }

    pub fn terminated(&self) -> bool {
        self.changed() && self.current.is_terminal()
    }

    pub fn mismatch(&self) -> bool {
        self.kind == TransitionKind::Overridden && self.reported != self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Upgraded,
    /// An entry with a later or equal status exists; only missing metadata
    /// was attached.
    StatusIgnored,
}

/// Fields a webhook can tell us about a call besides its status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMeta {
    pub phone: Option<String>,
    pub campaign_id: Option<String>,
    pub lead_id: Option<String>,
    pub control_url: Option<String>,
    pub listen_url: Option<String>,
}

impl CallMeta {
    fn fill(&self, call: &mut Call) {
        fn fill_one(slot: &mut Option<String>, value: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        fill_one(&mut call.phone, &self.phone);
        fill_one(&mut call.campaign_id, &self.campaign_id);
        fill_one(&mut call.lead_id, &self.lead_id);
        fill_one(&mut call.control_url, &self.control_url);
        fill_one(&mut call.listen_url, &self.listen_url);
    }
}

#[derive(Default)]
struct Inner {
    calls: HashMap<String, Call>,
    /// normalized phone -> the call (or pending dispatch token) holding it
    phones: HashMap<String, String>,
}

impl Inner {
    fn release_phone_of(&mut self, call_id: &str, phone: Option<&str>) {
        if let Some(phone) = phone {
            if self.phones.get(phone).map(|id| id == call_id).unwrap_or(false) {
                self.phones.remove(phone);
            }
        }
    }
}

/// The live view of every monitored call. All mutation happens under one
/// lock, so every call has a single writer per event.
#[derive(Default)]
pub struct CallRegistry {
    inner: Mutex<Inner>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call: Call) -> RegisterOutcome {
        let meta = CallMeta {
            phone: call.phone.clone(),
            campaign_id: call.campaign_id.clone(),
            lead_id: call.lead_id.clone(),
            control_url: call.control_url.clone(),
            listen_url: call.listen_url.clone(),
        };
        let mut inner = self.inner.lock();
        match inner.calls.get_mut(&call.id) {
            None => {
                info!(call_id = call.id.as_str(), status = %call.status, "call registered");
                inner.calls.insert(call.id.clone(), call);
                RegisterOutcome::Inserted
            }
            Some(existing) => {
                meta.fill(existing);
                if existing.status.rank() >= call.status.rank() {
                    debug!(
                        call_id = call.id.as_str(),
                        current = %existing.status,
                        registered = %call.status,
                        "register ignored, call already further along"
                    );
                    return RegisterOutcome::StatusIgnored;
                }
                existing.set_status(call.status, None);
                RegisterOutcome::Upgraded
            }
        }
    }

    /// Apply a reported status. Activity evidence wins over the report: a
    /// call with activity is at least in-progress, and its no-answer report
    /// is read as ended. Terminal statuses are final.
    pub fn transition(
        &self,
        call_id: &str,
        reported: CallStatus,
        evidence: Evidence,
    ) -> TransitionOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut created = false;
        let call = inner.calls.entry(call_id.to_string()).or_insert_with(|| {
            created = true;
            debug!(call_id, "unknown call, creating entry");
            Call::new(call_id)
        });
        if evidence.is_activity() {
            call.activity = true;
        }
        let previous = call.status;
        let outcome = |current, kind| TransitionOutcome {
            previous,
            current,
            reported,
            kind,
            created,
        };

        if previous.is_terminal() {
            let kind = if previous == reported {
                TransitionKind::Unchanged
            } else {
                TransitionKind::Ignored
            };
            return outcome(previous, kind);
        }

        let mut target = reported;
        if reported == CallStatus::NoAnswer && call.activity {
            target = CallStatus::Ended;
        } else if evidence.is_activity()
            && reported.rank() < CallStatus::InProgress.rank()
        {
            target = CallStatus::InProgress;
        }

        if target == previous {
            return outcome(previous, TransitionKind::Unchanged);
        }
        if target.rank() < previous.rank() {
            debug!(
                call_id,
                current = %previous,
                reported = %reported,
                "stale status ignored"
            );
            return outcome(previous, TransitionKind::Ignored);
        }

        call.set_status(target, Some(reported));
        let kind = if target == reported {
            TransitionKind::Applied
        } else {
            warn!(
                call_id,
                reported = %reported,
                applied = %target,
                "status overridden by call activity"
            );
            TransitionKind::Overridden
        };
        if target.is_terminal() {
            let phone = call.phone.clone();
            inner.release_phone_of(call_id, phone.as_deref());
        }
        outcome(target, kind)
    }

    pub fn set_end_reason(&self, call_id: &str, reason: &str) {
        if let Some(call) = self.inner.lock().calls.get_mut(call_id) {
            call.end_reason.get_or_insert_with(|| reason.to_string());
        }
    }

    /// Attach whatever metadata a webhook carried to an existing call.
    pub fn attach_meta(&self, call_id: &str, meta: &CallMeta) {
        if let Some(call) = self.inner.lock().calls.get_mut(call_id) {
            meta.fill(call);
        }
    }

    pub fn apply_transcript(
        &self,
        call_id: &str,
        entry: TranscriptEntry,
    ) -> TranscriptOutcome {
        let mut inner = self.inner.lock();
        let call = inner
            .calls
            .entry(call_id.to_string())
            .or_insert_with(|| Call::new(call_id));
        call.activity = true;
        call.apply_transcript(entry)
    }

    /// Remove a call. Without `force` a call that still has listeners or
    /// transcript lines is kept.
    pub fn evict(&self, call_id: &str, force: bool) -> Result<Option<Call>, DialerError> {
        let mut inner = self.inner.lock();
        let Some(call) = inner.calls.get(call_id) else {
            return Ok(None);
        };
        if !force && (call.listeners > 0 || !call.transcript.is_empty()) {
            return Err(DialerError::EvictionBlocked {
                call_id: call_id.to_string(),
                listeners: call.listeners,
                transcript: call.transcript.len(),
            });
        }
        let call = inner.calls.remove(call_id);
        if let Some(call) = call.as_ref() {
            inner.release_phone_of(call_id, call.phone.as_deref());
            if let Some(audio) = call.audio.as_ref() {
                audio.cancel();
            }
            info!(call_id, status = %call.status, force, "call evicted");
        }
        Ok(call)
    }

    /// Reserve `phone` for `holder`. Fails with the current holder while
    /// that call is still live.
    pub fn claim_phone(&self, phone: &str, holder: &str) -> Result<(), String> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.phones.get(phone) {
            let live = inner
                .calls
                .get(existing)
                .map(|c| !c.status.is_terminal())
                .unwrap_or(true);
            if live && existing != holder {
                return Err(existing.clone());
            }
        }
        inner.phones.insert(phone.to_string(), holder.to_string());
        Ok(())
    }

    /// Move a claim from a pending dispatch token to the created call. A call
    /// that already finished doesn't keep the claim.
    pub fn bind_phone(&self, phone: &str, token: &str, call_id: &str) {
        let mut inner = self.inner.lock();
        if inner.phones.get(phone).map(|h| h != token).unwrap_or(true) {
            return;
        }
        let terminal = inner
            .calls
            .get(call_id)
            .map(|c| c.status.is_terminal())
            .unwrap_or(false);
        if terminal {
            inner.phones.remove(phone);
        } else {
            inner.phones.insert(phone.to_string(), call_id.to_string());
        }
    }

    /// Drop the claim if `holder` still has it.
    pub fn release_phone(&self, phone: &str, holder: &str) {
        self.inner.lock().release_phone_of(holder, Some(phone));
    }

    /// Manual override, returns the call that held the number.
    pub fn clear_phone(&self, phone: &str) -> Option<String> {
        self.inner.lock().phones.remove(phone)
    }

    pub fn phone_holder(&self, phone: &str) -> Option<String> {
        self.inner.lock().phones.get(phone).cloned()
    }

    pub fn add_listener(&self, call_id: &str) -> Option<u32> {
        let mut inner = self.inner.lock();
        let call = inner.calls.get_mut(call_id)?;
        call.listeners += 1;
        Some(call.listeners)
    }

    pub fn release_listener(&self, call_id: &str) -> Option<u32> {
        let mut inner = self.inner.lock();
        let call = inner.calls.get_mut(call_id)?;
        call.listeners = call.listeners.saturating_sub(1);
        Some(call.listeners)
    }

    /// Hand off a finished call's transcript, leaving it empty. `None` while
    /// the call is still live.
    pub fn archive_transcript(&self, call_id: &str) -> Option<Vec<TranscriptEntry>> {
        let mut inner = self.inner.lock();
        let call = inner.calls.get_mut(call_id)?;
        if !call.status.is_terminal() {
            return None;
        }
        Some(mem::take(&mut call.transcript))
    }

    /// Store the audio monitor's cancel token. Fails when one is running.
    pub fn set_audio(&self, call_id: &str, token: CancellationToken) -> bool {
        let mut inner = self.inner.lock();
        match inner.calls.get_mut(call_id) {
            Some(call) if call.audio.is_none() => {
                call.audio = Some(token);
                true
            }
            _ => false,
        }
    }

    pub fn take_audio(&self, call_id: &str) -> Option<CancellationToken> {
        self.inner.lock().calls.get_mut(call_id)?.audio.take()
    }

    pub fn set_audio_retries(&self, call_id: &str, retries: u32) {
        if let Some(call) = self.inner.lock().calls.get_mut(call_id) {
            call.audio_retries = retries;
        }
    }

    pub fn get(&self, call_id: &str) -> Option<Call> {
        self.inner.lock().calls.get(call_id).cloned()
    }

    pub fn status(&self, call_id: &str) -> Option<CallStatus> {
        self.inner.lock().calls.get(call_id).map(|c| c.status)
    }

    pub fn list(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self.inner.lock().calls.values().cloned().collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        calls
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn terminal_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .values()
            .filter(|c| c.status.is_terminal())
            .map(|c| c.id.clone())
            .collect()
    }

    /// Live calls created before `before`.
    pub fn stale_ids(&self, before: DateTime<Utc>) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .values()
            .filter(|c| !c.status.is_terminal() && c.created_at < before)
            .map(|c| c.id.clone())
            .collect()
    }
}
