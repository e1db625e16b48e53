//! Warm transfer of a qualified lead to a human agent.
//!
//! A conference room gets three legs: an AI hold agent that keeps the
//! customer company, a dial into the human agent queue, and the customer.
//! The customer joins either by modifying their live call in place or, when
//! that call can't be found or modified, through a SIP transfer the voice AI
//! performs. When the queue leg joins, the hold agent says goodbye and is
//! hung up after a short window.
//!
//! The agent side and the customer side run concurrently, so each has its
//! own [`LegStatus`] next to the overall status.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outdial_redis::{KeyedMutex, SharedStore};
use outdial_timer::TimerSet;
use outdial_utils::{conference_id, normalize_phone};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use telephony::{conference_twiml, AddParticipant, Participant, TelephonyApi};
use tracing::{debug, info, warn};
use voiceai::{ControlAction, VoiceAiApi};

use crate::adapter::{ConferenceEventKind, ConferenceWebhook};
use crate::config::Config;
use crate::dispatch::CallDispatcher;
use crate::error::DialerError;
use crate::event::{DialerEvent, EventBus};
use crate::registry::CallRegistry;

pub const QUEUE_LABEL: &str = "queue";
pub const CUSTOMER_LABEL: &str = "customer";

pub fn conference_key(id: &str) -> String {
    format!("conference:{id}")
}

#[derive(
    Display, EnumString, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConferenceStatus {
    Initializing,
    HoldAgentJoining,
    WaitingForAgent,
    CustomerJoining,
    AgentConnected,
    Ended,
}

impl ConferenceStatus {
    pub fn rank(self) -> u8 {
        match self {
            ConferenceStatus::Initializing => 0,
            ConferenceStatus::HoldAgentJoining => 1,
            ConferenceStatus::WaitingForAgent => 2,
            ConferenceStatus::CustomerJoining => 3,
            ConferenceStatus::AgentConnected => 4,
            ConferenceStatus::Ended => 5,
        }
    }
}

/// Progress of one side of the bridge.
#[derive(
    Display, EnumString, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LegStatus {
    #[default]
    Pending,
    Dialing,
    /// Dialed, or handed to the voice AI for a SIP transfer, not joined yet.
    Waiting,
    Failed,
    Connected,
}

impl LegStatus {
    pub fn rank(self) -> u8 {
        match self {
            LegStatus::Pending => 0,
            LegStatus::Dialing => 1,
            LegStatus::Waiting => 2,
            LegStatus::Failed => 3,
            LegStatus::Connected => 4,
        }
    }

    fn max(self, other: LegStatus) -> LegStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    HoldAgent,
    QueueDial,
    Customer,
    HumanAgent,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    CallModification,
    SipTransferFallback,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conference {
    pub id: String,
    pub lead_id: String,
    pub customer_phone: String,
    pub status: ConferenceStatus,
    /// Hold agent plus the human agent queue.
    #[serde(default)]
    pub agent_leg: LegStatus,
    #[serde(default)]
    pub customer_leg: LegStatus,
    #[serde(default)]
    pub participants: Vec<ParticipantRole>,
    #[serde(default)]
    pub transfer_method: Option<TransferMethod>,
    #[serde(default)]
    pub room_sid: Option<String>,
    #[serde(default)]
    pub hold_call_id: Option<String>,
    #[serde(default)]
    pub queue_call_sid: Option<String>,
    #[serde(default)]
    pub customer_call_sid: Option<String>,
    #[serde(default)]
    pub sip_uri: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Conference {
    pub fn new(id: &str, lead_id: &str, customer_phone: &str) -> Conference {
        Conference {
            id: id.to_string(),
            lead_id: lead_id.to_string(),
            customer_phone: customer_phone.to_string(),
            status: ConferenceStatus::Initializing,
            agent_leg: LegStatus::Pending,
            customer_leg: LegStatus::Pending,
            participants: Vec::new(),
            transfer_method: None,
            room_sid: None,
            hold_call_id: None,
            queue_call_sid: None,
            customer_call_sid: None,
            sip_uri: None,
            errors: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn has(&self, role: ParticipantRole) -> bool {
        self.participants.contains(&role)
    }

    pub fn add(&mut self, role: ParticipantRole) {
        if !self.has(role) {
            self.participants.push(role);
        }
    }

    /// Status and legs only move forward and `ended` is final. Participants
    /// and legs are frozen at the end. The first transfer method and call
    /// ids stick.
    pub fn merge(&self, next: Conference) -> Conference {
        let mut merged = next;
        if self.status.rank() > merged.status.rank() {
            merged.status = self.status;
        }
        if self.status == ConferenceStatus::Ended {
            merged.agent_leg = self.agent_leg;
            merged.customer_leg = self.customer_leg;
        } else {
            merged.agent_leg = self.agent_leg.max(merged.agent_leg);
            merged.customer_leg = self.customer_leg.max(merged.customer_leg);
        }

        let mut participants = self.participants.clone();
        if self.status != ConferenceStatus::Ended {
            for role in merged.participants.iter() {
                if !participants.contains(role) {
                    participants.push(*role);
                }
            }
        }
        merged.participants = participants;

        merged.transfer_method = self.transfer_method.or(merged.transfer_method);
        merged.room_sid = self.room_sid.clone().or(merged.room_sid);
        merged.hold_call_id = self.hold_call_id.clone().or(merged.hold_call_id);
        merged.queue_call_sid = self.queue_call_sid.clone().or(merged.queue_call_sid);
        merged.customer_call_sid =
            self.customer_call_sid.clone().or(merged.customer_call_sid);
        merged.sip_uri = self.sip_uri.clone().or(merged.sip_uri);
        merged.ended_at = self.ended_at.or(merged.ended_at);

        let mut errors = self.errors.clone();
        for e in merged.errors.iter() {
            if !errors.contains(e) {
                errors.push(e.clone());
            }
        }
        merged.errors = errors;
        merged
    }
}

#[derive(Clone)]
pub struct ConferenceStore {
    store: Arc<dyn SharedStore>,
    locks: KeyedMutex,
    ttl: u64,
}

impl ConferenceStore {
    pub fn new(store: Arc<dyn SharedStore>, ttl: u64) -> Self {
        Self {
            store,
            locks: KeyedMutex::new(),
            ttl,
        }
    }

    async fn put(&self, conference: &Conference) -> Result<()> {
        self.store
            .set_ex(
                &conference_key(&conference.id),
                &serde_json::to_string(conference)?,
                self.ttl,
            )
            .await
    }

    pub async fn create(&self, conference: &Conference) -> Result<()> {
        self.put(conference).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conference>> {
        match self.store.get(&conference_key(id)).await? {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Read-merge-write under the conference's lock. Returns the record
    /// before and after.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<(Conference, Conference)>>
    where
        F: FnOnce(&mut Conference),
    {
        let _guard = self.locks.lock(&conference_key(id)).await;
        let Some(stored) = self.get(id).await? else {
            return Ok(None);
        };
        let mut next = stored.clone();
        f(&mut next);
        let merged = stored.merge(next);
        self.put(&merged).await?;
        Ok(Some((stored, merged)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Lead {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

/// Read-only CRM access.
#[async_trait]
pub trait LeadLookup: Send + Sync {
    async fn lookup(&self, lead_id: &str) -> Result<Option<Lead>>;
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Qualification {
    pub lead_id: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// The voice AI call that qualified the lead.
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SipFallback {
    pub destination: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QualificationResult {
    pub conference_id: String,
    pub transfer_method: TransferMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<SipFallback>,
    pub errors: Vec<String>,
    pub conference: Conference,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveConference {
    pub conference: Conference,
    pub provider_status: Option<String>,
    pub participants: Vec<Participant>,
}

pub struct ConferenceOrchestrator {
    records: ConferenceStore,
    registry: Arc<CallRegistry>,
    dispatcher: Arc<CallDispatcher>,
    voiceai: Arc<dyn VoiceAiApi>,
    telephony: Arc<dyn TelephonyApi>,
    events: EventBus,
    config: Config,
    goodbyes: TimerSet<String>,
    leads: Option<Arc<dyn LeadLookup>>,
}

impl ConferenceOrchestrator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: Arc<CallRegistry>,
        dispatcher: Arc<CallDispatcher>,
        voiceai: Arc<dyn VoiceAiApi>,
        telephony: Arc<dyn TelephonyApi>,
        events: EventBus,
        config: Config,
    ) -> Self {
        Self {
            records: ConferenceStore::new(store, config.conference.record_ttl_secs),
            registry,
            dispatcher,
            voiceai,
            telephony,
            events,
            config,
            goodbyes: TimerSet::new(),
            leads: None,
        }
    }

    pub fn with_leads(mut self, leads: Arc<dyn LeadLookup>) -> Self {
        self.leads = Some(leads);
        self
    }

    pub async fn get(&self, id: &str) -> Result<Conference, DialerError> {
        self.records
            .get(id)
            .await
            .map_err(DialerError::Store)?
            .ok_or_else(|| DialerError::ConferenceNotFound(id.to_string()))
    }

    /// The stored record plus what the telephony provider says about the room.
    pub async fn live(&self, id: &str) -> Result<LiveConference, DialerError> {
        let conference = self.get(id).await?;
        let info = match self.telephony.conference_status(id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(conference = id, "conference status lookup failed: {e:#}");
                None
            }
        };
        let participants = match info.as_ref() {
            Some(info) => self
                .telephony
                .participants(&info.sid)
                .await
                .unwrap_or_else(|e| {
                    warn!(conference = id, "participant lookup failed: {e:#}");
                    Vec::new()
                }),
            None => Vec::new(),
        };
        Ok(LiveConference {
            conference,
            provider_status: info.map(|i| i.status),
            participants,
        })
    }

    async fn update<F>(&self, id: &str, f: F) -> Option<(Conference, Conference)>
    where
        F: FnOnce(&mut Conference),
    {
        match self.records.update(id, f).await {
            Ok(Some((before, after))) => {
                if before != after {
                    self.events.publish(DialerEvent::ConferenceUpdate {
                        conference: after.clone(),
                    });
                }
                Some((before, after))
            }
            Ok(None) => {
                warn!(conference = id, "conference record missing");
                None
            }
            Err(e) => {
                warn!(conference = id, "conference update failed: {e:#}");
                None
            }
        }
    }

    async fn note_error(&self, id: &str, error: String) {
        warn!(conference = id, "{error}");
        self.update(id, |c| c.errors.push(error)).await;
    }

    /// Bridge a qualified lead to a human agent. Only creating the room is
    /// fatal; every later step is logged and reported in the result.
    pub async fn qualify(
        &self,
        qualification: Qualification,
    ) -> Result<QualificationResult, DialerError> {
        let lead = match self.leads.as_ref() {
            Some(leads) => match leads.lookup(&qualification.lead_id).await {
                Ok(lead) => lead,
                Err(e) => {
                    warn!(lead = qualification.lead_id.as_str(), "lead lookup failed: {e:#}");
                    None
                }
            },
            None => None,
        };
        let phone = qualification
            .phone
            .clone()
            .or_else(|| lead.as_ref().and_then(|l| l.phone.clone()))
            .and_then(|p| normalize_phone(&p))
            .ok_or_else(|| {
                DialerError::InvalidRequest(format!(
                    "no customer phone for lead {}",
                    qualification.lead_id
                ))
            })?;

        let id = conference_id(&qualification.lead_id);
        let room = self
            .telephony
            .create_conference(&id)
            .await
            .map_err(DialerError::Provider)?;
        let mut conference = Conference::new(&id, &qualification.lead_id, &phone);
        conference.room_sid = Some(room.sid);
        self.records
            .create(&conference)
            .await
            .map_err(DialerError::Store)?;
        info!(
            conference = id.as_str(),
            lead = qualification.lead_id.as_str(),
            call_id = ?qualification.call_id,
            "conference created"
        );
        self.events
            .publish(DialerEvent::ConferenceCreated { conference });

        let (_, transfer_method) = tokio::join!(
            self.bridge_agents(&id, &qualification.lead_id, lead.as_ref()),
            self.join_customer(&id, &phone),
        );

        let conference = self.get(&id).await?;
        let fallback = match transfer_method {
            TransferMethod::SipTransferFallback => {
                conference.sip_uri.clone().map(|destination| SipFallback { destination })
            }
            TransferMethod::CallModification => None,
        };
        Ok(QualificationResult {
            conference_id: id,
            transfer_method,
            fallback,
            errors: conference.errors.clone(),
            conference,
        })
    }

    async fn bridge_agents(&self, id: &str, lead_id: &str, lead: Option<&Lead>) {
        self.update(id, |c| {
            c.status = ConferenceStatus::HoldAgentJoining;
            c.agent_leg = LegStatus::Dialing;
        })
        .await;

        let voiceai = &self.config.voiceai;
        let assistant = voiceai
            .hold_assistant_id
            .as_deref()
            .unwrap_or(&voiceai.assistant_id);
        let mut variables = BTreeMap::new();
        variables.insert("conferenceName".to_string(), id.to_string());
        variables.insert("leadId".to_string(), lead_id.to_string());
        if let Some(first_name) = lead.and_then(|l| l.first_name.clone()) {
            variables.insert("firstName".to_string(), first_name);
        }
        match self
            .dispatcher
            .place_call(
                assistant,
                &self.config.telephony.conference_number,
                Some(lead_id.to_string()),
                variables,
            )
            .await
        {
            Ok(call) => {
                info!(conference = id, call_id = call.id.as_str(), "hold agent dialed");
                self.update(id, |c| {
                    c.hold_call_id = Some(call.id);
                    c.add(ParticipantRole::HoldAgent);
                })
                .await;
            }
            Err(e) => self.note_error(id, format!("hold agent: {e}")).await,
        }

        let participant = AddParticipant {
            from: self.config.telephony.from_number.clone(),
            to: self.config.telephony.queue_number.clone(),
            label: QUEUE_LABEL.to_string(),
            status_callback: self.config.webhook_url("/webhooks/telephony"),
            conference_callback: self.config.webhook_url("/webhooks/telephony/conference"),
        };
        match self.telephony.add_participant(id, &participant).await {
            Ok(sid) => {
                info!(conference = id, call_sid = sid.as_str(), "agent queue dialed");
                self.update(id, |c| {
                    c.queue_call_sid = Some(sid);
                    c.add(ParticipantRole::QueueDial);
                    c.status = ConferenceStatus::WaitingForAgent;
                    c.agent_leg = LegStatus::Waiting;
                })
                .await;
            }
            Err(e) => {
                let error = format!("agent queue: {e:#}");
                warn!(conference = id, "{error}");
                self.update(id, |c| {
                    c.errors.push(error);
                    c.agent_leg = LegStatus::Failed;
                })
                .await;
            }
        }
    }

    async fn join_customer(&self, id: &str, phone: &str) -> TransferMethod {
        self.update(id, |c| {
            c.status = ConferenceStatus::CustomerJoining;
            c.customer_leg = LegStatus::Dialing;
        })
        .await;

        let found = self
            .telephony
            .find_active_call(
                phone,
                &self.config.telephony.from_number,
                self.config.conference.recency_window(),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(conference = id, "active call search failed: {e:#}");
                None
            });

        if let Some(call) = found {
            match self.telephony.update_call(&call.sid, &conference_twiml(id)).await {
                Ok(()) => {
                    info!(conference = id, call_sid = call.sid.as_str(), "customer call moved into conference");
                    self.update(id, |c| {
                        c.transfer_method = Some(TransferMethod::CallModification);
                        c.customer_call_sid = Some(call.sid);
                        c.add(ParticipantRole::Customer);
                        c.customer_leg = LegStatus::Connected;
                    })
                    .await;
                    return TransferMethod::CallModification;
                }
                Err(e) => {
                    self.note_error(id, format!("call modification: {e:#}"))
                        .await
                }
            }
        }

        let sip_uri = format!("sip:{}@{}", id, self.config.telephony.sip_domain);
        info!(conference = id, sip_uri = sip_uri.as_str(), "falling back to sip transfer");
        self.update(id, |c| {
            c.transfer_method = Some(TransferMethod::SipTransferFallback);
            c.sip_uri = Some(sip_uri);
            c.customer_leg = LegStatus::Waiting;
        })
        .await;
        TransferMethod::SipTransferFallback
    }

    /// Telephony conference callback.
    pub async fn handle_event(&self, event: ConferenceWebhook) -> Result<(), DialerError> {
        let id = event.conference_id.as_str();
        match event.kind {
            ConferenceEventKind::ParticipantJoin => {
                let conference = self.get(id).await?;
                let is_call = |sid: &Option<String>| {
                    event.call_sid.is_some() && event.call_sid == *sid
                };
                let label = event.label.as_deref();
                if is_call(&conference.queue_call_sid) || label == Some(QUEUE_LABEL) {
                    self.agent_joined(id).await;
                } else if is_call(&conference.customer_call_sid)
                    || label == Some(CUSTOMER_LABEL)
                {
                    self.update(id, |c| {
                        c.add(ParticipantRole::Customer);
                        c.customer_leg = LegStatus::Connected;
                    })
                    .await;
                } else {
                    debug!(conference = id, call_sid = ?event.call_sid, "participant joined");
                }
            }
            ConferenceEventKind::End => self.end(id).await?,
            ConferenceEventKind::ParticipantLeave => {
                debug!(conference = id, call_sid = ?event.call_sid, "participant left")
            }
            ConferenceEventKind::Start => debug!(conference = id, "conference started"),
            ConferenceEventKind::Other(kind) => {
                debug!(conference = id, kind = kind.as_str(), "ignoring conference event")
            }
        }
        Ok(())
    }

    /// The human agent is on. The hold agent announces the handoff and is
    /// hung up once the goodbye window passes.
    async fn agent_joined(&self, id: &str) {
        let Some((before, after)) = self
            .update(id, |c| {
                c.add(ParticipantRole::HumanAgent);
                c.status = ConferenceStatus::AgentConnected;
                c.agent_leg = LegStatus::Connected;
            })
            .await
        else {
            return;
        };
        if before.status.rank() >= ConferenceStatus::AgentConnected.rank() {
            debug!(conference = id, "agent join already handled");
            return;
        }
        info!(conference = id, "human agent connected");
        self.events.publish(DialerEvent::ConferenceAgentConnected {
            conference_id: id.to_string(),
        });

        let control_url = after
            .hold_call_id
            .as_deref()
            .and_then(|call_id| self.registry.get(call_id))
            .and_then(|call| call.control_url);
        let Some(control_url) = control_url else {
            warn!(conference = id, "no hold agent to hand off from");
            return;
        };
        let say = ControlAction::Say {
            content: self.config.conference.handoff_message.clone(),
            end_call_after: false,
        };
        if let Err(e) = self.voiceai.control(&control_url, &say).await {
            warn!(conference = id, "hold agent handoff message failed: {e:#}");
        }

        let voiceai = self.voiceai.clone();
        let conference = id.to_string();
        self.goodbyes.schedule(
            id.to_string(),
            self.config.conference.goodbye_window(),
            async move {
                match voiceai.control(&control_url, &ControlAction::End).await {
                    Ok(()) => info!(conference = conference.as_str(), "hold agent ended"),
                    Err(e) => warn!(conference = conference.as_str(), "ending hold agent failed: {e:#}"),
                }
            },
        );
    }

    /// Close the record. Only the first close publishes `conference_ended`.
    pub async fn end(&self, id: &str) -> Result<(), DialerError> {
        let (before, _) = self
            .records
            .update(id, |c| {
                c.status = ConferenceStatus::Ended;
                c.ended_at.get_or_insert_with(Utc::now);
            })
            .await
            .map_err(DialerError::Store)?
            .ok_or_else(|| DialerError::ConferenceNotFound(id.to_string()))?;
        if before.status == ConferenceStatus::Ended {
            return Ok(());
        }
        info!(conference = id, "conference ended");
        self.events.publish(DialerEvent::ConferenceEnded {
            conference_id: id.to_string(),
        });
        Ok(())
    }

    /// Tear a conference down from our side: hang up the telephony legs,
    /// end the hold agent, close the record.
    pub async fn hangup(&self, id: &str) -> Result<(), DialerError> {
        let conference = self.get(id).await?;
        self.goodbyes.cancel(&id.to_string());
        for sid in [&conference.queue_call_sid, &conference.customer_call_sid]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.telephony.hangup_call(sid).await {
                warn!(conference = id, call_sid = sid.as_str(), "hangup failed: {e:#}");
            }
        }
        let hold_control = conference
            .hold_call_id
            .as_deref()
            .and_then(|call_id| self.registry.get(call_id))
            .and_then(|call| call.control_url);
        if let Some(control_url) = hold_control {
            if let Err(e) = self.voiceai.control(&control_url, &ControlAction::End).await {
                warn!(conference = id, "ending hold agent failed: {e:#}");
            }
        }
        self.end(id).await
    }
}
