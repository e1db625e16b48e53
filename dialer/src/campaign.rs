use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use outdial_redis::{KeyedMutex, Lease, SharedStore};
use outdial_timer::TimerSet;
use outdial_utils::{normalize_phone, uuid};
use serde::{Deserialize, Serialize};
use strum_macros::EnumString;
use tracing::{error, info, warn};

use crate::call::CallStatus;
use crate::config::CampaignConfig;
use crate::dispatch::CallDispatcher;
use crate::error::DialerError;
use crate::event::{DialerEvent, EventBus};

pub const ACTIVE_CAMPAIGN_KEY: &str = "campaign_active";

pub fn campaign_key(id: &str) -> String {
    format!("campaign:{id}")
}

pub fn queue_key(id: &str) -> String {
    format!("campaign_queue:{id}")
}

pub fn calls_key(id: &str) -> String {
    format!("campaign_calls:{id}")
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub phone_e164: String,
    #[serde(default)]
    pub case_type: String,
    #[serde(default)]
    pub lead_id: String,
    #[serde(default)]
    pub org_id: String,
}

impl Contact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(
    strum_macros::Display,
    EnumString,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    #[strum(serialize = "scheduled")]
    Scheduled,
    #[strum(serialize = "active")]
    Active,
    #[strum(serialize = "stopped")]
    Stopped,
    #[strum(serialize = "completed")]
    Completed,
}

impl CampaignStatus {
    fn rank(self) -> u8 {
        match self {
            CampaignStatus::Scheduled => 0,
            CampaignStatus::Active => 1,
            CampaignStatus::Stopped | CampaignStatus::Completed => 2,
        }
    }

    pub fn is_finished(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub total: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRecord {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub concurrency_limit: usize,
    pub batch_delay_secs: u64,
    pub stats: CampaignStats,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl CampaignRecord {
    /// Fold a modified copy back into the stored record. Status only moves
    /// forward and the first finish wins.
    pub fn merge(&self, next: CampaignRecord) -> CampaignRecord {
        let mut merged = next;
        if self.status.is_finished() || merged.status.rank() < self.status.rank() {
            merged.status = self.status;
            merged.finished_at = self.finished_at;
            merged.stop_reason = self.stop_reason.clone();
        }
        if merged.started_at.is_none() {
            merged.started_at = self.started_at;
        }
        merged
    }
}

/// The kind of terminal result a campaign call counts as.
fn counts_as_completed(status: CallStatus) -> bool {
    status == CallStatus::Ended
}

/// Campaign records, queues and call result hashes in the shared store.
/// Record updates are read-merge-write under a per-campaign lock.
#[derive(Clone)]
pub struct CampaignLedger {
    store: Arc<dyn SharedStore>,
    locks: KeyedMutex,
    ttl: u64,
}

impl CampaignLedger {
    pub fn new(store: Arc<dyn SharedStore>, ttl: u64) -> Self {
        Self {
            store,
            locks: KeyedMutex::new(),
            ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub async fn create(
        &self,
        record: &CampaignRecord,
        contacts: &[Contact],
    ) -> Result<()> {
        let values = contacts
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;
        self.store.rpush(&queue_key(&record.id), &values).await?;
        self.store.expire(&queue_key(&record.id), self.ttl).await?;
        self.put(record).await
    }

    async fn put(&self, record: &CampaignRecord) -> Result<()> {
        self.store
            .set_ex(
                &campaign_key(&record.id),
                &serde_json::to_string(record)?,
                self.ttl,
            )
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<CampaignRecord>> {
        match self.store.get(&campaign_key(id)).await? {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<CampaignRecord>>
    where
        F: FnOnce(&mut CampaignRecord),
    {
        let _guard = self.locks.lock(&campaign_key(id)).await;
        let Some(stored) = self.get(id).await? else {
            return Ok(None);
        };
        let mut next = stored.clone();
        f(&mut next);
        let merged = stored.merge(next);
        self.put(&merged).await?;
        Ok(Some(merged))
    }

    /// Next contact off the queue. Entries that don't parse are dropped.
    pub async fn pop(&self, id: &str) -> Result<Option<Contact>> {
        loop {
            let Some(raw) = self.store.lpop(&queue_key(id)).await? else {
                return Ok(None);
            };
            match serde_json::from_str(&raw) {
                Ok(contact) => return Ok(Some(contact)),
                Err(e) => warn!(campaign = id, "dropping bad queue entry: {e}"),
            }
        }
    }

    pub async fn queue_len(&self, id: &str) -> Result<usize> {
        self.store.llen(&queue_key(id)).await
    }

    /// Mark a dispatched call in progress. False when the call already has a
    /// result (a terminal webhook beat us here).
    pub async fn record_dispatch(&self, id: &str, call_id: &str) -> Result<bool> {
        let set = self
            .store
            .hsetnx(&calls_key(id), call_id, &CallStatus::InProgress.to_string())
            .await?;
        self.store.expire(&calls_key(id), self.ttl).await?;
        Ok(set)
    }

    /// Record a call's terminal result and adjust the stats, exactly once per
    /// call however often the result is delivered.
    pub async fn record_result(
        &self,
        id: &str,
        call_id: &str,
        status: CallStatus,
    ) -> Result<Option<CampaignRecord>> {
        let previous = self
            .store
            .hswap(&calls_key(id), call_id, &status.to_string())
            .await?;
        let previous = previous.and_then(|p| p.parse::<CallStatus>().ok());
        if let Some(previous) = previous {
            if previous.is_terminal() {
                if previous != status {
                    // keep the first result
                    self.store
                        .hset(&calls_key(id), call_id, &previous.to_string())
                        .await?;
                }
                return Ok(None);
            }
        }
        self.update(id, |record| {
            if previous.is_some() {
                record.stats.in_progress = record.stats.in_progress.saturating_sub(1);
            }
            if counts_as_completed(status) {
                record.stats.completed += 1;
            } else {
                record.stats.failed += 1;
            }
        })
        .await
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StartCampaign {
    #[serde(default)]
    pub name: String,
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default)]
    pub batch_delay_secs: Option<u64>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Drains campaign queues in batches. At most one campaign runs at a time,
/// enforced through a lease on [`ACTIVE_CAMPAIGN_KEY`] that the running
/// campaign refreshes every batch.
pub struct CampaignExecutor {
    ledger: CampaignLedger,
    dispatcher: Arc<CallDispatcher>,
    events: EventBus,
    config: CampaignConfig,
    schedules: TimerSet<String>,
}

impl CampaignExecutor {
    pub fn new(
        ledger: CampaignLedger,
        dispatcher: Arc<CallDispatcher>,
        events: EventBus,
        config: CampaignConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            dispatcher,
            events,
            config,
            schedules: TimerSet::new(),
        })
    }

    pub fn ledger(&self) -> &CampaignLedger {
        &self.ledger
    }

    fn lease(id: &str) -> Lease {
        Lease::new(ACTIVE_CAMPAIGN_KEY, id)
    }

    /// Take the active campaign lease for `id`. A holder whose campaign has
    /// finished is a leftover and gets replaced.
    async fn acquire(&self, id: &str) -> Result<(), DialerError> {
        let store = self.ledger.store();
        let lease = Self::lease(id);
        for _ in 0..2 {
            if lease
                .acquire(store, self.config.lock_ttl_secs)
                .await
                .map_err(DialerError::Store)?
            {
                return Ok(());
            }
            let Some(holder) = lease.holder(store).await.map_err(DialerError::Store)?
            else {
                continue;
            };
            if holder == id {
                return Ok(());
            }
            // a holder without a record may still be writing it, only a
            // finished holder is a leftover; anything else expires with the lease
            let holder_finished = self
                .ledger
                .get(&holder)
                .await
                .map_err(DialerError::Store)?
                .map(|r| r.status.is_finished())
                .unwrap_or(false);
            if !holder_finished {
                return Err(DialerError::CampaignAlreadyActive { active: holder });
            }
            warn!(campaign = holder.as_str(), "recovering stale active campaign lock");
            Lease::new(ACTIVE_CAMPAIGN_KEY, holder)
                .release(store)
                .await
                .map_err(DialerError::Store)?;
        }
        let active = lease
            .holder(store)
            .await
            .map_err(DialerError::Store)?
            .unwrap_or_default();
        Err(DialerError::CampaignAlreadyActive { active })
    }

    pub async fn start(
        self: &Arc<Self>,
        req: StartCampaign,
    ) -> Result<CampaignRecord, DialerError> {
        let contacts: Vec<Contact> = req
            .contacts
            .into_iter()
            .filter_map(|mut contact| match normalize_phone(&contact.phone_e164) {
                Some(phone) => {
                    contact.phone_e164 = phone;
                    Some(contact)
                }
                None => {
                    warn!(phone = contact.phone_e164.as_str(), "skipping invalid contact");
                    None
                }
            })
            .collect();
        if contacts.is_empty() {
            return Err(DialerError::EmptyCampaign);
        }

        let id = uuid();
        let now = Utc::now();
        let scheduled = req.scheduled_at.filter(|at| *at > now);
        let mut record = CampaignRecord {
            id: id.clone(),
            name: if req.name.is_empty() { id.clone() } else { req.name },
            status: CampaignStatus::Scheduled,
            concurrency_limit: req
                .concurrency_limit
                .filter(|n| *n > 0)
                .unwrap_or(self.config.default_concurrency),
            batch_delay_secs: req
                .batch_delay_secs
                .unwrap_or(self.config.default_batch_delay_secs),
            stats: CampaignStats {
                total: contacts.len() as u64,
                queued: contacts.len() as u64,
                ..Default::default()
            },
            scheduled_at: scheduled,
            created_at: now,
            started_at: None,
            finished_at: None,
            stop_reason: None,
        };

        if let Some(at) = scheduled {
            self.ledger
                .create(&record, &contacts)
                .await
                .map_err(DialerError::Store)?;
            let delay = (at - now).to_std().unwrap_or_default();
            let executor = self.clone();
            let campaign_id = id.clone();
            self.schedules.schedule(id.clone(), delay, async move {
                executor.activate(&campaign_id).await;
            });
            info!(campaign = id.as_str(), at = %at, "campaign scheduled");
            self.events.publish(DialerEvent::CampaignUpdate {
                campaign: record.clone(),
            });
            return Ok(record);
        }

        self.acquire(&id).await?;
        record.status = CampaignStatus::Active;
        record.started_at = Some(now);
        if let Err(e) = self.ledger.create(&record, &contacts).await {
            let _ = Self::lease(&id).release(self.ledger.store()).await;
            return Err(DialerError::Store(e));
        }
        info!(
            campaign = id.as_str(),
            contacts = contacts.len(),
            concurrency = record.concurrency_limit,
            "campaign started"
        );
        self.events.publish(DialerEvent::CampaignUpdate {
            campaign: record.clone(),
        });
        self.spawn(id);
        Ok(record)
    }

    /// Fire a scheduled campaign. Another campaign being active at that
    /// point stops this one.
    async fn activate(self: &Arc<Self>, id: &str) {
        let result = match self.acquire(id).await {
            Ok(()) => {
                self.ledger
                    .update(id, |record| {
                        record.status = CampaignStatus::Active;
                        record.started_at = Some(Utc::now());
                    })
                    .await
            }
            Err(e) => {
                warn!(campaign = id, "scheduled campaign can't start: {e}");
                let reason = e.to_string();
                self.ledger
                    .update(id, |record| {
                        record.status = CampaignStatus::Stopped;
                        record.finished_at = Some(Utc::now());
                        record.stop_reason = Some(reason);
                    })
                    .await
            }
        };
        match result {
            Ok(Some(record)) => {
                let active = record.status == CampaignStatus::Active;
                self.events.publish(DialerEvent::CampaignUpdate { campaign: record });
                if active {
                    self.spawn(id.to_string());
                }
            }
            Ok(None) => {
                warn!(campaign = id, "scheduled campaign record expired");
                let _ = Self::lease(id).release(self.ledger.store()).await;
            }
            Err(e) => error!(campaign = id, "activate campaign failed: {e:#}"),
        }
    }

    fn spawn(self: &Arc<Self>, id: String) {
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.run(&id).await {
                error!(campaign = id.as_str(), "campaign loop failed: {e:#}");
            }
        });
    }

    /// The batch loop. Cancellation is checked once per batch, in-flight
    /// dispatches always finish.
    pub(crate) async fn run(&self, id: &str) -> Result<()> {
        let lease = Self::lease(id);
        loop {
            let Some(record) = self.ledger.get(id).await? else {
                warn!(campaign = id, "campaign record gone, halting");
                break;
            };
            if record.status != CampaignStatus::Active {
                info!(campaign = id, status = %record.status, "campaign halted");
                break;
            }
            if !lease
                .refresh(self.ledger.store(), self.config.lock_ttl_secs)
                .await?
            {
                // the lease expired between batches, take it back if nobody else did
                if !lease
                    .acquire(self.ledger.store(), self.config.lock_ttl_secs)
                    .await?
                {
                    self.lease_lost(id).await?;
                    break;
                }
            }

            let mut batch = Vec::with_capacity(record.concurrency_limit);
            while batch.len() < record.concurrency_limit {
                match self.ledger.pop(id).await? {
                    Some(contact) => batch.push(contact),
                    None => break,
                }
            }
            if batch.is_empty() {
                self.complete(id).await?;
                break;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|contact| self.dispatcher.dispatch_contact(id, contact)),
            )
            .await;

            let mut in_progress = 0;
            let mut failed = 0;
            for (contact, result) in batch.iter().zip(results) {
                match result {
                    Ok(call) => {
                        if self.ledger.record_dispatch(id, &call.id).await? {
                            in_progress += 1;
                        }
                    }
                    Err(e) => {
                        warn!(
                            campaign = id,
                            phone = contact.phone_e164.as_str(),
                            "campaign dispatch failed: {e}"
                        );
                        failed += 1;
                    }
                }
            }
            let dispatched = batch.len() as u64;
            info!(campaign = id, dispatched, failed, "campaign batch done");
            if let Some(record) = self
                .ledger
                .update(id, |record| {
                    record.stats.queued = record.stats.queued.saturating_sub(dispatched);
                    record.stats.in_progress += in_progress;
                    record.stats.failed += failed;
                })
                .await?
            {
                self.events.publish(DialerEvent::CampaignUpdate { campaign: record });
            }

            if self.ledger.queue_len(id).await? == 0 {
                self.complete(id).await?;
                break;
            }
            let delay = Duration::from_secs(record.batch_delay_secs);
            if !self.hold_lease(&lease, delay).await? {
                self.lease_lost(id).await?;
                break;
            }
        }
        Ok(())
    }

    /// Sleep out the batch delay, refreshing the lease at a third of its ttl.
    /// False once somebody else holds it.
    async fn hold_lease(&self, lease: &Lease, delay: Duration) -> Result<bool> {
        let ttl = self.config.lock_ttl_secs;
        let every = Duration::from_secs((ttl / 3).max(1));
        let deadline = tokio::time::Instant::now() + delay;
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(true),
                _ = refresh.tick() => {
                    if !lease.refresh(self.ledger.store(), ttl).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn lease_lost(&self, id: &str) -> Result<()> {
        // a stop releases the lease itself
        if self.ledger.get(id).await?.map_or(true, |r| r.status.is_finished()) {
            return Ok(());
        }
        warn!(campaign = id, "lost the active campaign lock, stopping");
        let record = self
            .ledger
            .update(id, |record| {
                record.status = CampaignStatus::Stopped;
                record.finished_at = Some(Utc::now());
                record.stop_reason = Some("lost the active campaign lock".to_string());
            })
            .await?;
        if let Some(record) = record {
            self.events.publish(DialerEvent::CampaignUpdate { campaign: record });
        }
        Ok(())
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let record = self
            .ledger
            .update(id, |record| {
                record.status = CampaignStatus::Completed;
                record.finished_at = Some(Utc::now());
            })
            .await?;
        Self::lease(id).release(self.ledger.store()).await?;
        if let Some(record) = record {
            info!(campaign = id, status = %record.status, "campaign finished");
            self.events.publish(DialerEvent::CampaignUpdate { campaign: record });
        }
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<CampaignRecord, DialerError> {
        self.schedules.cancel(&id.to_string());
        let record = self
            .ledger
            .update(id, |record| {
                record.status = CampaignStatus::Stopped;
                record.finished_at = Some(Utc::now());
                record.stop_reason = Some("stopped".to_string());
            })
            .await
            .map_err(DialerError::Store)?
            .ok_or_else(|| DialerError::CampaignNotFound(id.to_string()))?;
        Self::lease(id)
            .release(self.ledger.store())
            .await
            .map_err(DialerError::Store)?;
        info!(campaign = id, status = %record.status, "campaign stop requested");
        self.events.publish(DialerEvent::CampaignUpdate {
            campaign: record.clone(),
        });
        Ok(record)
    }

    pub async fn status(&self, id: &str) -> Result<CampaignRecord, DialerError> {
        self.ledger
            .get(id)
            .await
            .map_err(DialerError::Store)?
            .ok_or_else(|| DialerError::CampaignNotFound(id.to_string()))
    }

    /// Count a campaign call's terminal result.
    pub async fn record_result(&self, id: &str, call_id: &str, status: CallStatus) {
        match self.ledger.record_result(id, call_id, status).await {
            Ok(Some(record)) => {
                self.events.publish(DialerEvent::CampaignUpdate { campaign: record })
            }
            Ok(None) => {}
            Err(e) => error!(campaign = id, call_id, "record call result failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceAiConfig;
    use crate::fakes::{FakeVoiceAi, YieldingStore};
    use crate::registry::CallRegistry;
    use itertools::Itertools;
    use outdial_redis::MemoryStore;

    struct Harness {
        executor: Arc<CampaignExecutor>,
        voiceai: Arc<FakeVoiceAi>,
        store: Arc<dyn SharedStore>,
    }

    fn harness() -> Harness {
        harness_on(Arc::new(MemoryStore::new()))
    }

    fn harness_on(store: Arc<dyn SharedStore>) -> Harness {
        let voiceai = Arc::new(FakeVoiceAi::new());
        let events = EventBus::default();
        let dispatcher = Arc::new(CallDispatcher::new(
            Arc::new(CallRegistry::new()),
            voiceai.clone(),
            events.clone(),
            VoiceAiConfig::default(),
        ));
        let executor = CampaignExecutor::new(
            CampaignLedger::new(store.clone(), 3600),
            dispatcher,
            events,
            CampaignConfig::default(),
        );
        Harness {
            executor,
            voiceai,
            store,
        }
    }

    fn contacts(n: usize) -> Vec<Contact> {
        (0..n)
            .map(|i| Contact {
                first_name: format!("first{i}"),
                last_name: "last".to_string(),
                phone_e164: format!("+1555000{:04}", i),
                case_type: "auto".to_string(),
                lead_id: format!("lead{i}"),
                org_id: "org".to_string(),
            })
            .collect()
    }

    fn start_request(n: usize) -> StartCampaign {
        StartCampaign {
            name: "test".to_string(),
            contacts: contacts(n),
            concurrency_limit: Some(3),
            batch_delay_secs: Some(5),
            scheduled_at: None,
        }
    }

    fn record(id: &str, status: CampaignStatus) -> CampaignRecord {
        CampaignRecord {
            id: id.to_string(),
            name: id.to_string(),
            status,
            concurrency_limit: 3,
            batch_delay_secs: 5,
            stats: CampaignStats::default(),
            scheduled_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stop_reason: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batches_of_three_with_failures() {
        let h = harness();
        h.voiceai.fail_number("+15550000001");
        h.voiceai.fail_number("+15550000007");

        let record = h.executor.start(start_request(10)).await.unwrap();
        assert_eq!(record.status, CampaignStatus::Active);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let attempts = h.voiceai.attempts();
        assert_eq!(attempts.len(), 10);
        let batches: Vec<usize> = attempts
            .iter()
            .group_by(|(at, _)| *at)
            .into_iter()
            .map(|(_, group)| group.count())
            .collect();
        assert_eq!(batches, vec![3, 3, 3, 1]);
        let first = attempts[0].0;
        let last = attempts[9].0;
        assert_eq!(last - first, Duration::from_secs(15));

        let record = h.executor.status(&record.id).await.unwrap();
        assert_eq!(record.status, CampaignStatus::Completed);
        assert_eq!(record.stats.queued, 0);
        assert_eq!(record.stats.failed, 2);
        assert_eq!(record.stats.in_progress, 8);
        assert_eq!(h.store.get(ACTIVE_CAMPAIGN_KEY).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_changes() {
        let h = harness();
        let first = h.executor.start(start_request(10)).await.unwrap();

        match h.executor.start(start_request(4)).await {
            Err(DialerError::CampaignAlreadyActive { active }) => {
                assert_eq!(active, first.id)
            }
            other => panic!("expected already active, got {other:?}"),
        }
        // only the first campaign's record and queue exist
        assert_eq!(
            h.store.get(ACTIVE_CAMPAIGN_KEY).await.unwrap().as_deref(),
            Some(first.id.as_str())
        );
        h.executor.stop(&first.id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_at_next_batch() {
        let h = harness();
        let record = h.executor.start(start_request(10)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.voiceai.attempts().len(), 3);

        let stopped = h.executor.stop(&record.id).await.unwrap();
        assert_eq!(stopped.status, CampaignStatus::Stopped);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.voiceai.attempts().len(), 3);
        assert_eq!(
            h.executor.status(&record.id).await.unwrap().status,
            CampaignStatus::Stopped
        );
        // a new campaign may start now
        assert!(h.executor.start(start_request(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_holder_lock_is_recovered() {
        let h = harness();
        h.executor
            .ledger()
            .create(&record("gone", CampaignStatus::Completed), &[])
            .await
            .unwrap();
        h.store
            .set_ex(ACTIVE_CAMPAIGN_KEY, "gone", 300)
            .await
            .unwrap();
        assert!(h.executor.start(start_request(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn holder_without_record_is_not_replaced() {
        let h = harness();
        h.store
            .set_ex(ACTIVE_CAMPAIGN_KEY, "writing", 300)
            .await
            .unwrap();
        match h.executor.start(start_request(1)).await {
            Err(DialerError::CampaignAlreadyActive { active }) => {
                assert_eq!(active, "writing")
            }
            other => panic!("expected already active, got {other:?}"),
        }
        assert!(h.voiceai.attempts().is_empty());
        assert_eq!(
            h.store.get(ACTIVE_CAMPAIGN_KEY).await.unwrap().as_deref(),
            Some("writing")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_admit_one() {
        let h = harness_on(YieldingStore::new());
        let (a, b) = tokio::join!(
            h.executor.start(start_request(10)),
            h.executor.start(start_request(10))
        );
        let (winner, loser) = match (a, b) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            other => panic!("expected exactly one start, got {other:?}"),
        };
        match loser {
            DialerError::CampaignAlreadyActive { active } => assert_eq!(active, winner.id),
            other => panic!("expected already active, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.voiceai.attempts().len(), 3);
        h.executor.stop(&winner.id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lease_outlives_long_batch_delay() {
        let h = harness();
        let mut req = start_request(6);
        req.batch_delay_secs = Some(600);
        let first = h.executor.start(req).await.unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.voiceai.attempts().len(), 3);
        match h.executor.start(start_request(1)).await {
            Err(DialerError::CampaignAlreadyActive { active }) => assert_eq!(active, first.id),
            other => panic!("expected already active, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.voiceai.attempts().len(), 6);
        let record = h.executor.status(&first.id).await.unwrap();
        assert_eq!(record.status, CampaignStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_stops_campaign() {
        let h = harness();
        let mut req = start_request(6);
        req.batch_delay_secs = Some(600);
        let first = h.executor.start(req).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        h.store
            .set_ex(ACTIVE_CAMPAIGN_KEY, "other", 300)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let record = h.executor.status(&first.id).await.unwrap();
        assert_eq!(record.status, CampaignStatus::Stopped);
        assert_eq!(
            record.stop_reason.as_deref(),
            Some("lost the active campaign lock")
        );
        assert_eq!(
            h.store.get(ACTIVE_CAMPAIGN_KEY).await.unwrap().as_deref(),
            Some("other")
        );
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.voiceai.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_start_conflict_stops() {
        let h = harness();
        let mut req = start_request(2);
        req.scheduled_at = Some(Utc::now() + chrono::Duration::seconds(30));
        let scheduled = h.executor.start(req).await.unwrap();
        assert_eq!(scheduled.status, CampaignStatus::Scheduled);

        let mut busy = start_request(10);
        busy.batch_delay_secs = Some(60);
        let active = h.executor.start(busy).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        let scheduled = h.executor.status(&scheduled.id).await.unwrap();
        assert_eq!(scheduled.status, CampaignStatus::Stopped);
        assert!(scheduled.stop_reason.unwrap().contains(&active.id));
    }

    #[tokio::test]
    async fn results_are_counted_once() {
        let h = harness();
        let ledger = h.executor.ledger();
        let record = CampaignRecord {
            id: "camp".to_string(),
            name: "camp".to_string(),
            status: CampaignStatus::Active,
            concurrency_limit: 3,
            batch_delay_secs: 5,
            stats: CampaignStats::default(),
            scheduled_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stop_reason: None,
        };
        ledger.create(&record, &[]).await.unwrap();
        assert!(ledger.record_dispatch("camp", "c1").await.unwrap());
        ledger
            .update("camp", |r| r.stats.in_progress += 1)
            .await
            .unwrap();

        for _ in 0..3 {
            ledger
                .record_result("camp", "c1", CallStatus::Ended)
                .await
                .unwrap();
        }
        ledger
            .record_result("camp", "c1", CallStatus::Failed)
            .await
            .unwrap();
        // result before dispatch bookkeeping
        ledger
            .record_result("camp", "c2", CallStatus::NoAnswer)
            .await
            .unwrap();
        assert!(!ledger.record_dispatch("camp", "c2").await.unwrap());

        let stats = ledger.get("camp").await.unwrap().unwrap().stats;
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            h.store.hget(&calls_key("camp"), "c1").await.unwrap().as_deref(),
            Some("ended")
        );
    }

    #[test]
    fn merge_keeps_finished_status() {
        let stored = CampaignRecord {
            id: "camp".to_string(),
            name: "camp".to_string(),
            status: CampaignStatus::Stopped,
            concurrency_limit: 3,
            batch_delay_secs: 5,
            stats: CampaignStats::default(),
            scheduled_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: Some(Utc::now()),
            stop_reason: Some("stopped".to_string()),
        };
        let mut next = stored.clone();
        next.status = CampaignStatus::Completed;
        next.stats.completed = 4;
        let merged = stored.merge(next);
        assert_eq!(merged.status, CampaignStatus::Stopped);
        assert_eq!(merged.stats.completed, 4);
    }
}
