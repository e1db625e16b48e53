use std::collections::BTreeMap;
use std::sync::Arc;

use outdial_utils::{normalize_phone, uuid};
use serde::Deserialize;
use tracing::{info, warn};
use voiceai::{ControlAction, CreateCallRequest, Customer, VoiceAiApi};

use crate::call::{Call, CallStatus, Evidence};
use crate::campaign::Contact;
use crate::config::VoiceAiConfig;
use crate::error::DialerError;
use crate::event::{DialerEvent, EventBus};
use crate::registry::CallRegistry;

#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub phone: String,
    pub name: Option<String>,
    pub campaign_id: Option<String>,
    pub lead_id: Option<String>,
    pub variables: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlRequest {
    Mute,
    Unmute,
    Say {
        message: String,
        #[serde(default, rename = "endCallAfter")]
        end_call_after: bool,
    },
    Transfer {
        destination: String,
    },
    End,
}

impl From<ControlRequest> for ControlAction {
    fn from(request: ControlRequest) -> Self {
        match request {
            ControlRequest::Mute => ControlAction::Mute,
            ControlRequest::Unmute => ControlAction::Unmute,
            ControlRequest::Say {
                message,
                end_call_after,
            } => ControlAction::Say {
                content: message,
                end_call_after,
            },
            ControlRequest::Transfer { destination } => {
                ControlAction::Transfer { destination }
            }
            ControlRequest::End => ControlAction::End,
        }
    }
}

/// Places outbound voice AI calls. One live call per phone number.
pub struct CallDispatcher {
    registry: Arc<CallRegistry>,
    voiceai: Arc<dyn VoiceAiApi>,
    events: EventBus,
    config: VoiceAiConfig,
}

impl CallDispatcher {
    pub fn new(
        registry: Arc<CallRegistry>,
        voiceai: Arc<dyn VoiceAiApi>,
        events: EventBus,
        config: VoiceAiConfig,
    ) -> Self {
        Self {
            registry,
            voiceai,
            events,
            config,
        }
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<Call, DialerError> {
        let phone = normalize_phone(&req.phone).ok_or_else(|| {
            DialerError::InvalidRequest(format!("invalid phone number {}", req.phone))
        })?;

        let token = format!("pending:{}", uuid());
        self.registry
            .claim_phone(&phone, &token)
            .map_err(|call_id| {
                warn!(phone = phone.as_str(), call_id = call_id.as_str(), "duplicate dispatch rejected");
                DialerError::DuplicateCall {
                    phone: phone.clone(),
                    call_id,
                }
            })?;

        let mut variables = req.variables;
        if let Some(campaign_id) = req.campaign_id.as_ref() {
            variables.insert("campaignId".to_string(), campaign_id.clone());
        }
        if let Some(lead_id) = req.lead_id.as_ref() {
            variables.insert("leadId".to_string(), lead_id.clone());
        }
        let request = CreateCallRequest {
            assistant_id: self.config.assistant_id.clone(),
            phone_number_id: self.config.phone_number_id.clone(),
            customer: Customer {
                number: phone.clone(),
                name: req.name,
            },
            variable_values: variables,
        };

        let created = match self.voiceai.create_call(&request).await {
            Ok(created) => created,
            Err(e) => {
                self.registry.release_phone(&phone, &token);
                warn!(phone = phone.as_str(), "dispatch failed: {e:#}");
                return Err(DialerError::Provider(e));
            }
        };

        let mut call = Call::new(created.id.clone());
        call.phone = Some(phone.clone());
        call.campaign_id = req.campaign_id;
        call.lead_id = req.lead_id;
        call.control_url = created.control_url;
        call.listen_url = created.listen_url;
        self.registry.register(call);
        self.registry.bind_phone(&phone, &token, &created.id);

        info!(
            call_id = created.id.as_str(),
            phone = phone.as_str(),
            "call dispatched"
        );
        let call = self
            .registry
            .get(&created.id)
            .ok_or_else(|| DialerError::CallNotFound(created.id.clone()))?;
        self.events.publish(DialerEvent::CallStarted {
            call_id: call.id.clone(),
            phone: call.phone.clone(),
            campaign_id: call.campaign_id.clone(),
        });
        Ok(call)
    }

    pub async fn dispatch_contact(
        &self,
        campaign_id: &str,
        contact: &Contact,
    ) -> Result<Call, DialerError> {
        let mut variables = BTreeMap::new();
        variables.insert("firstName".to_string(), contact.first_name.clone());
        variables.insert("lastName".to_string(), contact.last_name.clone());
        variables.insert("caseType".to_string(), contact.case_type.clone());
        variables.insert("orgId".to_string(), contact.org_id.clone());
        self.dispatch(DispatchRequest {
            phone: contact.phone_e164.clone(),
            name: Some(contact.full_name()),
            campaign_id: Some(campaign_id.to_string()),
            lead_id: Some(contact.lead_id.clone()),
            variables,
        })
        .await
    }

    /// A call that doesn't hold a phone claim, used for the conference hold
    /// agent which dials one of our own numbers.
    pub async fn place_call(
        &self,
        assistant_id: &str,
        number: &str,
        lead_id: Option<String>,
        variables: BTreeMap<String, String>,
    ) -> Result<Call, DialerError> {
        let request = CreateCallRequest {
            assistant_id: assistant_id.to_string(),
            phone_number_id: self.config.phone_number_id.clone(),
            customer: Customer {
                number: number.to_string(),
                name: None,
            },
            variable_values: variables,
        };
        let created = self
            .voiceai
            .create_call(&request)
            .await
            .map_err(DialerError::Provider)?;
        let mut call = Call::new(created.id.clone());
        call.lead_id = lead_id;
        call.control_url = created.control_url;
        call.listen_url = created.listen_url;
        self.registry.register(call);
        self.events.publish(DialerEvent::CallStarted {
            call_id: created.id.clone(),
            phone: None,
            campaign_id: None,
        });
        self.registry
            .get(&created.id)
            .ok_or(DialerError::CallNotFound(created.id))
    }

    pub async fn control(
        &self,
        call_id: &str,
        request: ControlRequest,
    ) -> Result<(), DialerError> {
        let call = self
            .registry
            .get(call_id)
            .ok_or_else(|| DialerError::CallNotFound(call_id.to_string()))?;
        let control_url = call
            .control_url
            .ok_or_else(|| DialerError::NoControlUrl(call_id.to_string()))?;

        let marker = match request {
            ControlRequest::End => Some(CallStatus::Ending),
            ControlRequest::Transfer { .. } => Some(CallStatus::Transferring),
            _ => None,
        };
        if let Some(marker) = marker {
            let outcome = self.registry.transition(call_id, marker, Evidence::None);
            if outcome.changed() {
                self.events.publish(DialerEvent::CallStatus {
                    call_id: call_id.to_string(),
                    status: outcome.current,
                });
            }
        }

        let action = ControlAction::from(request);
        info!(call_id, action = action.name(), "call control");
        self.voiceai
            .control(&control_url, &action)
            .await
            .map_err(DialerError::Provider)
    }
}
