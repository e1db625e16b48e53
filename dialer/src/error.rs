use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialerError {
    #[error("campaign {active} is already active")]
    CampaignAlreadyActive { active: String },

    #[error("{phone} already has an active call {call_id}")]
    DuplicateCall { phone: String, call_id: String },

    #[error("campaign {0} not found")]
    CampaignNotFound(String),

    #[error("call {0} not found")]
    CallNotFound(String),

    #[error("conference {0} not found")]
    ConferenceNotFound(String),

    #[error("no valid contacts")]
    EmptyCampaign,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("call {0} has no control url")]
    NoControlUrl(String),

    #[error("call {call_id} still has {listeners} listeners and {transcript} transcript entries")]
    EvictionBlocked {
        call_id: String,
        listeners: u32,
        transcript: usize,
    },

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    #[error("provider error: {0:#}")]
    Provider(anyhow::Error),
}

impl DialerError {
    pub fn code(&self) -> &'static str {
        match self {
            DialerError::CampaignAlreadyActive { .. } => "campaign_already_active",
            DialerError::DuplicateCall { .. } => "duplicate_call",
            DialerError::CampaignNotFound(_) => "campaign_not_found",
            DialerError::CallNotFound(_) => "call_not_found",
            DialerError::ConferenceNotFound(_) => "conference_not_found",
            DialerError::EmptyCampaign => "empty_campaign",
            DialerError::InvalidRequest(_) => "invalid_request",
            DialerError::NoControlUrl(_) => "no_control_url",
            DialerError::EvictionBlocked { .. } => "eviction_blocked",
            DialerError::Store(_) => "store_error",
            DialerError::Provider(_) => "provider_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DialerError::CampaignAlreadyActive { .. }
            | DialerError::DuplicateCall { .. }
            | DialerError::EvictionBlocked { .. } => StatusCode::CONFLICT,
            DialerError::CampaignNotFound(_)
            | DialerError::CallNotFound(_)
            | DialerError::ConferenceNotFound(_) => StatusCode::NOT_FOUND,
            DialerError::EmptyCampaign
            | DialerError::InvalidRequest(_)
            | DialerError::NoControlUrl(_) => StatusCode::BAD_REQUEST,
            DialerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DialerError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for DialerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "ok": false,
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let err = DialerError::CampaignAlreadyActive {
            active: "c1".to_string(),
        };
        assert_eq!(err.code(), "campaign_already_active");
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "campaign c1 is already active");

        let err = DialerError::Provider(anyhow::anyhow!("timed out"));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "provider error: timed out");
    }
}
