use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Customer {
    pub number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateCallRequest {
    pub assistant_id: String,
    pub phone_number_id: String,
    pub customer: Customer,
    pub variable_values: BTreeMap<String, String>,
}

impl CreateCallRequest {
    fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "assistantId": self.assistant_id,
            "phoneNumberId": self.phone_number_id,
            "customer": self.customer,
            "assistantOverrides": {
                "variableValues": self.variable_values,
            },
        })
    }
}

/// What the provider hands back for a created call. The monitor urls are
/// only present when monitoring is enabled on the assistant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreatedCall {
    pub id: String,
    pub status: Option<String>,
    pub listen_url: Option<String>,
    pub control_url: Option<String>,
}

impl CreatedCall {
    pub fn from_json(value: &serde_json::Value) -> Result<CreatedCall> {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("created call has no id"))?;
        let monitor = value.get("monitor");
        let url = |name: &str| {
            monitor
                .and_then(|m| m.get(name))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        };
        Ok(CreatedCall {
            id: id.to_string(),
            status: value
                .get("status")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            listen_url: url("listenUrl"),
            control_url: url("controlUrl"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlAction {
    Mute,
    Unmute,
    Say { content: String, end_call_after: bool },
    Transfer { destination: String },
    End,
}

impl ControlAction {
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::Mute => "mute",
            ControlAction::Unmute => "unmute",
            ControlAction::Say { .. } => "say",
            ControlAction::Transfer { .. } => "transfer",
            ControlAction::End => "end",
        }
    }

    pub fn body(&self) -> serde_json::Value {
        match self {
            ControlAction::Mute => serde_json::json!({
                "type": "control",
                "control": "mute-assistant",
            }),
            ControlAction::Unmute => serde_json::json!({
                "type": "control",
                "control": "unmute-assistant",
            }),
            ControlAction::Say {
                content,
                end_call_after,
            } => serde_json::json!({
                "type": "say",
                "content": content,
                "endCallAfterSpoken": end_call_after,
            }),
            ControlAction::Transfer { destination } => serde_json::json!({
                "type": "transfer",
                "destination": {
                    "type": "number",
                    "number": destination,
                },
            }),
            ControlAction::End => serde_json::json!({
                "type": "end-call",
            }),
        }
    }
}

#[async_trait]
pub trait VoiceAiApi: Send + Sync {
    async fn create_call(&self, req: &CreateCallRequest) -> Result<CreatedCall>;

    /// Send a live control action to the call's control url.
    async fn control(&self, control_url: &str, action: &ControlAction) -> Result<()>;

    /// Point the assistant's server webhook at `server_url`.
    async fn configure_assistant_webhook(
        &self,
        assistant_id: &str,
        server_url: &str,
    ) -> Result<()>;
}

pub struct VoiceAiClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl VoiceAiClient {
    pub fn new(base_url: &str, api_key: &str) -> VoiceAiClient {
        VoiceAiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VoiceAiApi for VoiceAiClient {
    async fn create_call(&self, req: &CreateCallRequest) -> Result<CreatedCall> {
        let res = self
            .http
            .post(&format!("{}/call", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&req.body())
            .send()
            .await?;
        let code = res.status();
        let body: serde_json::Value = res.json().await?;
        if !code.is_success() {
            return Err(anyhow!("create call failed {}: {}", code.as_u16(), body));
        }
        let call = CreatedCall::from_json(&body)?;
        info!(
            call_id = call.id.as_str(),
            customer = req.customer.number.as_str(),
            "voice ai call created"
        );
        Ok(call)
    }

    async fn control(&self, control_url: &str, action: &ControlAction) -> Result<()> {
        let res = self
            .http
            .post(control_url)
            .header("Content-Type", "application/json")
            .json(&action.body())
            .send()
            .await?;
        let code = res.status();
        if !code.is_success() {
            return Err(anyhow!(
                "control {} failed {}",
                action.name(),
                code.as_u16()
            ));
        }
        Ok(())
    }

    async fn configure_assistant_webhook(
        &self,
        assistant_id: &str,
        server_url: &str,
    ) -> Result<()> {
        let res = self
            .http
            .patch(&format!("{}/assistant/{}", self.base_url, assistant_id))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "server": { "url": server_url },
                "serverMessages": [
                    "status-update",
                    "transcript",
                    "speech-update",
                    "end-of-call-report",
                    "tool-calls",
                ],
            }))
            .send()
            .await?;
        let code = res.status();
        if !code.is_success() {
            return Err(anyhow!("configure assistant failed {}", code.as_u16()));
        }
        info!(assistant_id, server_url, "assistant webhook configured");
        Ok(())
    }
}
