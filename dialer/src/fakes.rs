//! In-process stand-ins for the provider clients.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use outdial_redis::{MemoryStore, SharedStore};
use parking_lot::Mutex;
use telephony::{ActiveCall, AddParticipant, ConferenceInfo, ConferenceRoom, Participant, TelephonyApi};
use tokio::time::Instant;
use voiceai::{ControlAction, CreateCallRequest, CreatedCall, VoiceAiApi};

#[derive(Default)]
pub struct FakeVoiceAi {
    next: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<(Instant, String)>>,
    created: Mutex<Vec<CreateCallRequest>>,
    controls: Mutex<Vec<(String, ControlAction)>>,
}

impl FakeVoiceAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_number(&self, number: &str) {
        self.failing.lock().insert(number.to_string());
    }

    /// Every create call, failed or not, with the (paused) time it was made.
    pub fn attempts(&self) -> Vec<(Instant, String)> {
        self.attempts.lock().clone()
    }

    pub fn created(&self) -> Vec<CreateCallRequest> {
        self.created.lock().clone()
    }

    /// Control actions by call id.
    pub fn controls(&self) -> Vec<(String, ControlAction)> {
        self.controls.lock().clone()
    }
}

#[async_trait]
impl VoiceAiApi for FakeVoiceAi {
    async fn create_call(&self, req: &CreateCallRequest) -> Result<CreatedCall> {
        self.attempts
            .lock()
            .push((Instant::now(), req.customer.number.clone()));
        if self.failing.lock().contains(&req.customer.number) {
            return Err(anyhow!("provider rejected {}", req.customer.number));
        }
        self.created.lock().push(req.clone());
        let id = format!("call-{}", self.next.fetch_add(1, Ordering::SeqCst));
        Ok(CreatedCall {
            listen_url: Some(format!("wss://listen/{id}")),
            control_url: Some(format!("https://control/{id}")),
            status: Some("queued".to_string()),
            id,
        })
    }

    async fn control(&self, control_url: &str, action: &ControlAction) -> Result<()> {
        let call_id = control_url.trim_start_matches("https://control/").to_string();
        self.controls.lock().push((call_id, action.clone()));
        Ok(())
    }

    async fn configure_assistant_webhook(
        &self,
        _assistant_id: &str,
        _server_url: &str,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTelephony {
    pub active_call: Mutex<Option<ActiveCall>>,
    pub fail_update: Mutex<bool>,
    pub fail_queue: Mutex<bool>,
    pub rooms: Mutex<Vec<String>>,
    pub participants: Mutex<Vec<(String, AddParticipant)>>,
    pub updates: Mutex<Vec<(String, String)>>,
    pub searches: Mutex<Vec<(String, String, Duration)>>,
}

impl FakeTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active_call(sid: &str, to: &str) -> Self {
        let fake = Self::default();
        *fake.active_call.lock() = Some(ActiveCall {
            sid: sid.to_string(),
            to: to.to_string(),
            from: String::new(),
            status: "in-progress".to_string(),
            start_time: None,
        });
        fake
    }
}

#[async_trait]
impl TelephonyApi for FakeTelephony {
    async fn create_conference(&self, friendly_name: &str) -> Result<ConferenceRoom> {
        self.rooms.lock().push(friendly_name.to_string());
        Ok(ConferenceRoom {
            sid: format!("CF-{friendly_name}"),
            friendly_name: friendly_name.to_string(),
        })
    }

    async fn add_participant(
        &self,
        friendly_name: &str,
        participant: &AddParticipant,
    ) -> Result<String> {
        if *self.fail_queue.lock() {
            return Err(anyhow!("queue unreachable"));
        }
        let mut participants = self.participants.lock();
        participants.push((friendly_name.to_string(), participant.clone()));
        Ok(format!("CA-queue-{}", participants.len()))
    }

    async fn find_active_call(
        &self,
        to: &str,
        from: &str,
        within: Duration,
    ) -> Result<Option<ActiveCall>> {
        self.searches
            .lock()
            .push((to.to_string(), from.to_string(), within));
        Ok(self.active_call.lock().clone().filter(|c| c.to == to))
    }

    async fn update_call(&self, call_sid: &str, twiml: &str) -> Result<()> {
        if *self.fail_update.lock() {
            return Err(anyhow!("call {call_sid} already completed"));
        }
        self.updates
            .lock()
            .push((call_sid.to_string(), twiml.to_string()));
        Ok(())
    }

    async fn hangup_call(&self, _call_sid: &str) -> Result<()> {
        Ok(())
    }

    async fn conference_status(
        &self,
        friendly_name: &str,
    ) -> Result<Option<ConferenceInfo>> {
        Ok(Some(ConferenceInfo {
            sid: format!("CF-{friendly_name}"),
            friendly_name: friendly_name.to_string(),
            status: "in-progress".to_string(),
        }))
    }

    async fn participants(&self, _conference_sid: &str) -> Result<Vec<Participant>> {
        Ok(Vec::new())
    }
}

/// A [`MemoryStore`] that yields to the scheduler before every command, so
/// concurrent tasks interleave between store calls the way they do against
/// a remote Redis.
#[derive(Default)]
pub struct YieldingStore {
    inner: MemoryStore,
}

impl YieldingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SharedStore for YieldingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, expire: u64) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.set_ex(key, value, expire).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, expire: u64) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.set_nx_ex(key, value, expire).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.del(key).await
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.del_if_value(key, value).await
    }

    async fn expire(&self, key: &str, expire: u64) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.expire(key, expire).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.exists(key).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        tokio::task::yield_now().await;
        self.inner.rpush(key, values).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.lpop(key).await
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        tokio::task::yield_now().await;
        self.inner.llen(key).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.hset(key, field, value).await
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.hsetnx(key, field, value).await
    }

    async fn hswap(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.hswap(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        tokio::task::yield_now().await;
        self.inner.hgetall(key).await
    }
}
