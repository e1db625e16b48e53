//! Provider payloads in, one tagged event out. Nothing past this module
//! looks at provider field names.

use std::collections::HashMap;
use std::str::FromStr;

use outdial_utils::normalize_phone;
use serde_json::Value;

use crate::call::{CallStatus, Speaker};
use crate::error::DialerError;
use crate::registry::CallMeta;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Started,
    Ringing,
    Answered,
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    Speech {
        speaker: Speaker,
    },
    StatusUpdate(CallStatus),
    /// `status` is one of the terminal statuses.
    Ended {
        status: CallStatus,
        reason: Option<String>,
    },
    ToolCalls(Vec<ToolCall>),
    Unrecognized {
        kind: String,
        status: Option<CallStatus>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub call_id: String,
    pub kind: EventKind,
    pub meta: CallMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConferenceEventKind {
    Start,
    End,
    ParticipantJoin,
    ParticipantLeave,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceWebhook {
    pub kind: ConferenceEventKind,
    /// Our conference id, the room's friendly name.
    pub conference_id: String,
    pub conference_sid: Option<String>,
    pub call_sid: Option<String>,
    pub label: Option<String>,
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty())
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(|s| s.to_string())
}

fn speaker(role: Option<&str>) -> Speaker {
    match role {
        Some("assistant") | Some("bot") | Some("agent") => Speaker::Assistant,
        _ => Speaker::User,
    }
}

/// Terminal status for a voice AI end reason.
pub fn terminal_from_reason(reason: Option<&str>) -> CallStatus {
    let Some(reason) = reason else {
        return CallStatus::Ended;
    };
    if reason.contains("did-not-answer")
        || reason.contains("no-answer")
        || reason.contains("customer-busy")
        || reason == "voicemail"
    {
        CallStatus::NoAnswer
    } else if reason.starts_with("error")
        || reason.contains("failed")
        || reason.contains("-error")
    {
        CallStatus::Failed
    } else {
        CallStatus::Ended
    }
}

fn voiceai_status(status: &str, reason: Option<&str>) -> Option<EventKind> {
    let kind = match status {
        "queued" | "scheduled" => EventKind::Started,
        "ringing" => EventKind::Ringing,
        "in-progress" => EventKind::Answered,
        "forwarding" => EventKind::StatusUpdate(CallStatus::Transferring),
        "ended" => EventKind::Ended {
            status: terminal_from_reason(reason),
            reason: owned(reason),
        },
        other => EventKind::StatusUpdate(CallStatus::from_str(other).ok()?),
    };
    Some(kind)
}

fn tool_calls(message: &Value) -> Vec<ToolCall> {
    let list = message
        .get("toolCallList")
        .or_else(|| message.get("toolCalls"))
        .and_then(|v| v.as_array());
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|call| {
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or(Value::String(s.clone()))
                }
                Some(v) => v.clone(),
                None => Value::Null,
            };
            Some(ToolCall {
                id: owned(str_at(call, &["id"])),
                name,
                arguments,
            })
        })
        .collect()
}

fn voiceai_meta(call: Option<&Value>) -> CallMeta {
    let Some(call) = call else {
        return CallMeta::default();
    };
    let variable = |name: &str| {
        owned(str_at(call, &["assistantOverrides", "variableValues", name]))
            .or_else(|| owned(str_at(call, &["metadata", name])))
    };
    CallMeta {
        phone: str_at(call, &["customer", "number"]).and_then(normalize_phone),
        campaign_id: variable("campaignId"),
        lead_id: variable("leadId"),
        control_url: owned(str_at(call, &["monitor", "controlUrl"])),
        listen_url: owned(str_at(call, &["monitor", "listenUrl"])),
    }
}

/// Voice AI server message. Accepts both the `{"message": {...}}` envelope
/// and a bare message; `call_id` is used when the message doesn't name one.
pub fn parse_voiceai(
    body: &Value,
    call_id: Option<&str>,
) -> Result<NormalizedEvent, DialerError> {
    let message = body.get("message").unwrap_or(body);
    let call = message.get("call").or_else(|| body.get("call"));
    let call_id = call
        .and_then(|c| str_at(c, &["id"]))
        .or_else(|| str_at(message, &["callId"]))
        .or(call_id)
        .ok_or_else(|| DialerError::InvalidRequest("event has no call id".into()))?;

    let kind_name = str_at(message, &["type"]).unwrap_or("");
    let reason = str_at(message, &["endedReason"])
        .or_else(|| call.and_then(|c| str_at(c, &["endedReason"])));
    let embedded_status = || {
        str_at(message, &["status"])
            .or_else(|| call.and_then(|c| str_at(c, &["status"])))
    };

    let kind = match kind_name {
        "status-update" => embedded_status()
            .and_then(|s| voiceai_status(s, reason))
            .unwrap_or(EventKind::Unrecognized {
                kind: kind_name.to_string(),
                status: None,
            }),
        // the provider also sends `transcript[transcriptType="final"]`
        t if t.starts_with("transcript") => {
            let text = str_at(message, &["transcript"]).unwrap_or("").to_string();
            let is_final = str_at(message, &["transcriptType"]) == Some("final")
                || t.contains("final");
            EventKind::Transcript {
                speaker: speaker(str_at(message, &["role"])),
                text,
                is_final,
            }
        }
        "speech-update" => EventKind::Speech {
            speaker: speaker(str_at(message, &["role"])),
        },
        "end-of-call-report" => EventKind::Ended {
            status: terminal_from_reason(reason),
            reason: owned(reason),
        },
        "tool-calls" => EventKind::ToolCalls(tool_calls(message)),
        other => {
            let status = embedded_status().and_then(|s| {
                match voiceai_status(s, reason) {
                    Some(EventKind::Started) => Some(CallStatus::Queued),
                    Some(EventKind::Ringing) => Some(CallStatus::Ringing),
                    Some(EventKind::Answered) => Some(CallStatus::InProgress),
                    Some(EventKind::StatusUpdate(s)) => Some(s),
                    Some(EventKind::Ended { status, .. }) => Some(status),
                    _ => None,
                }
            });
            EventKind::Unrecognized {
                kind: other.to_string(),
                status,
            }
        }
    };

    Ok(NormalizedEvent {
        call_id: call_id.to_string(),
        kind,
        meta: voiceai_meta(call),
    })
}

/// Telephony call status callback (form encoded).
pub fn parse_telephony(
    form: &HashMap<String, String>,
) -> Result<NormalizedEvent, DialerError> {
    let get = |key: &str| form.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty());
    let call_id = get("CallSid")
        .ok_or_else(|| DialerError::InvalidRequest("missing CallSid".into()))?;
    let status = get("CallStatus").unwrap_or("");
    let kind = match status {
        "queued" | "initiated" => EventKind::Started,
        "ringing" => EventKind::Ringing,
        "in-progress" | "answered" => EventKind::Answered,
        "completed" => EventKind::Ended {
            status: CallStatus::Ended,
            reason: Some("completed".to_string()),
        },
        "busy" | "no-answer" => EventKind::Ended {
            status: CallStatus::NoAnswer,
            reason: Some(status.to_string()),
        },
        "failed" | "canceled" => EventKind::Ended {
            status: CallStatus::Failed,
            reason: Some(status.to_string()),
        },
        other => EventKind::Unrecognized {
            kind: other.to_string(),
            status: None,
        },
    };
    Ok(NormalizedEvent {
        call_id: call_id.to_string(),
        kind,
        meta: CallMeta {
            phone: get("To").and_then(normalize_phone),
            ..Default::default()
        },
    })
}

/// Telephony conference status callback (form encoded).
pub fn parse_conference(
    form: &HashMap<String, String>,
) -> Result<ConferenceWebhook, DialerError> {
    let get = |key: &str| {
        form.get(key)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    let conference_id = get("FriendlyName")
        .ok_or_else(|| DialerError::InvalidRequest("missing FriendlyName".into()))?;
    let event = get("StatusCallbackEvent").unwrap_or_default();
    let kind = match event.as_str() {
        "conference-start" => ConferenceEventKind::Start,
        "conference-end" => ConferenceEventKind::End,
        "participant-join" => ConferenceEventKind::ParticipantJoin,
        "participant-leave" => ConferenceEventKind::ParticipantLeave,
        _ => ConferenceEventKind::Other(event),
    };
    Ok(ConferenceWebhook {
        kind,
        conference_id,
        conference_sid: get("ConferenceSid"),
        call_sid: get("CallSid"),
        label: get("ParticipantLabel"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn status_update_with_metadata() {
        let event = parse_voiceai(
            &json!({"message": {
                "type": "status-update",
                "status": "in-progress",
                "call": {
                    "id": "c1",
                    "customer": {"number": "(555) 123-4567"},
                    "monitor": {"listenUrl": "wss://l", "controlUrl": "https://c"},
                    "assistantOverrides": {"variableValues": {"campaignId": "camp"}},
                },
            }}),
            None,
        )
        .unwrap();
        assert_eq!(event.call_id, "c1");
        assert_eq!(event.kind, EventKind::Answered);
        assert_eq!(event.meta.phone.as_deref(), Some("+15551234567"));
        assert_eq!(event.meta.campaign_id.as_deref(), Some("camp"));
        assert_eq!(event.meta.listen_url.as_deref(), Some("wss://l"));
    }

    #[test]
    fn end_reasons() {
        assert_eq!(
            terminal_from_reason(Some("customer-did-not-answer")),
            CallStatus::NoAnswer
        );
        assert_eq!(
            terminal_from_reason(Some("pipeline-error-openai-llm-failed")),
            CallStatus::Failed
        );
        assert_eq!(
            terminal_from_reason(Some("customer-ended-call")),
            CallStatus::Ended
        );
        let event = parse_voiceai(
            &json!({"message": {
                "type": "end-of-call-report",
                "endedReason": "customer-did-not-answer",
                "call": {"id": "c1"},
            }}),
            None,
        )
        .unwrap();
        assert_eq!(
            event.kind,
            EventKind::Ended {
                status: CallStatus::NoAnswer,
                reason: Some("customer-did-not-answer".to_string()),
            }
        );
    }

    #[test]
    fn transcripts_and_speech() {
        let event = parse_voiceai(
            &json!({"message": {
                "type": "transcript",
                "role": "user",
                "transcriptType": "final",
                "transcript": "yes please",
                "call": {"id": "c1"},
            }}),
            None,
        )
        .unwrap();
        assert_eq!(
            event.kind,
            EventKind::Transcript {
                speaker: Speaker::User,
                text: "yes please".to_string(),
                is_final: true,
            }
        );

        let event = parse_voiceai(
            &json!({"type": "speech-update", "role": "assistant", "status": "started"}),
            Some("c2"),
        )
        .unwrap();
        assert_eq!(event.call_id, "c2");
        assert_eq!(
            event.kind,
            EventKind::Speech {
                speaker: Speaker::Assistant
            }
        );
    }

    #[test]
    fn tool_call_arguments_are_parsed() {
        let event = parse_voiceai(
            &json!({"message": {
                "type": "tool-calls",
                "call": {"id": "c1"},
                "toolCallList": [{
                    "id": "t1",
                    "function": {"name": "qualify_lead", "arguments": "{\"leadId\":\"L1\"}"},
                }],
            }}),
            None,
        )
        .unwrap();
        let EventKind::ToolCalls(calls) = event.kind else {
            panic!("expected tool calls");
        };
        assert_eq!(calls[0].id.as_deref(), Some("t1"));
        assert_eq!(calls[0].name, "qualify_lead");
        assert_eq!(calls[0].arguments["leadId"], "L1");
    }

    #[test]
    fn unrecognized_keeps_embedded_status() {
        let event = parse_voiceai(
            &json!({"message": {"type": "hang", "call": {"id": "c1", "status": "ringing"}}}),
            None,
        )
        .unwrap();
        assert_eq!(
            event.kind,
            EventKind::Unrecognized {
                kind: "hang".to_string(),
                status: Some(CallStatus::Ringing),
            }
        );
        assert!(parse_voiceai(&json!({"message": {"type": "hang"}}), None).is_err());
    }

    #[test]
    fn telephony_status_callback() {
        let event = parse_telephony(&form(&[
            ("CallSid", "CA1"),
            ("CallStatus", "busy"),
            ("To", "+15551234567"),
        ]))
        .unwrap();
        assert_eq!(event.call_id, "CA1");
        assert!(matches!(
            event.kind,
            EventKind::Ended {
                status: CallStatus::NoAnswer,
                ..
            }
        ));
        assert!(parse_telephony(&form(&[("CallStatus", "ringing")])).is_err());
    }

    #[test]
    fn conference_callback() {
        let event = parse_conference(&form(&[
            ("FriendlyName", "conf_1_L1"),
            ("StatusCallbackEvent", "participant-join"),
            ("CallSid", "CA2"),
            ("ParticipantLabel", "queue"),
        ]))
        .unwrap();
        assert_eq!(event.kind, ConferenceEventKind::ParticipantJoin);
        assert_eq!(event.conference_id, "conf_1_L1");
        assert_eq!(event.label.as_deref(), Some("queue"));
    }
}
