use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConferenceRoom {
    pub sid: String,
    pub friendly_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddParticipant {
    pub from: String,
    pub to: String,
    pub label: String,
    /// Participant status callbacks go here when set.
    pub status_callback: Option<String>,
    /// Conference start/end/join/leave callbacks go here when set.
    pub conference_callback: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ActiveCall {
    pub sid: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start_time: Option<String>,
}

impl ActiveCall {
    fn started_at(&self) -> Option<DateTime<Utc>> {
        let start = self.start_time.as_deref()?;
        DateTime::parse_from_rfc2822(start)
            .or_else(|_| DateTime::parse_from_rfc3339(start))
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ConferenceInfo {
    pub sid: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub call_sid: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub hold: bool,
    #[serde(default)]
    pub muted: bool,
}

#[async_trait]
pub trait TelephonyApi: Send + Sync {
    async fn create_conference(&self, friendly_name: &str) -> Result<ConferenceRoom>;

    /// Dial `to` into the conference. Returns the new call sid.
    async fn add_participant(
        &self,
        friendly_name: &str,
        participant: &AddParticipant,
    ) -> Result<String>;

    /// The most recent in-progress call from `from` to `to` that started
    /// within `within`.
    async fn find_active_call(
        &self,
        to: &str,
        from: &str,
        within: Duration,
    ) -> Result<Option<ActiveCall>>;

    /// Replace the running call's instructions.
    async fn update_call(&self, call_sid: &str, twiml: &str) -> Result<()>;

    async fn hangup_call(&self, call_sid: &str) -> Result<()>;

    async fn conference_status(&self, friendly_name: &str)
        -> Result<Option<ConferenceInfo>>;

    async fn participants(&self, conference_sid: &str) -> Result<Vec<Participant>>;
}

/// Instructions that move a live call into the named conference.
pub fn conference_twiml(friendly_name: &str) -> String {
    format!(
        "<Response><Dial><Conference startConferenceOnEnter=\"true\" \
         endConferenceOnExit=\"false\">{}</Conference></Dial></Response>",
        xml_escape(friendly_name)
    )
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Pick the newest in-progress call to `to` that started no earlier than
/// `within` before `now`. Calls without a parsable start time are skipped.
pub fn select_active_call(
    calls: Vec<ActiveCall>,
    to: &str,
    within: Duration,
    now: DateTime<Utc>,
) -> Option<ActiveCall> {
    let window = chrono::Duration::from_std(within).ok()?;
    calls
        .into_iter()
        .filter(|c| c.to == to && c.status == "in-progress")
        .filter_map(|c| {
            let started = c.started_at()?;
            if now - started <= window {
                Some((started, c))
            } else {
                None
            }
        })
        .max_by_key(|(started, _)| *started)
        .map(|(_, c)| c)
}

#[derive(Deserialize)]
struct CallList {
    #[serde(default)]
    calls: Vec<ActiveCall>,
}

#[derive(Deserialize)]
struct ConferenceList {
    #[serde(default)]
    conferences: Vec<ConferenceInfo>,
}

#[derive(Deserialize)]
struct ParticipantList {
    #[serde(default)]
    participants: Vec<Participant>,
}

pub struct TelephonyClient {
    base_url: String,
    account_sid: String,
    auth_token: String,
    http: reqwest::Client,
}

impl TelephonyClient {
    pub fn new(base_url: &str, account_sid: &str, auth_token: &str) -> Self {
        Self {
            base_url: format!(
                "{}/Accounts/{}",
                base_url.trim_end_matches('/'),
                account_sid
            ),
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<serde_json::Value> {
        let res = self
            .http
            .post(&format!("{}{}", self.base_url, path))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await?;
        let code = res.status();
        let body: serde_json::Value = res.json().await?;
        if !code.is_success() {
            return Err(anyhow!("{} failed {}: {}", path, code.as_u16(), body));
        }
        Ok(body)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let res = self
            .http
            .get(&format!("{}{}", self.base_url, path))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .query(query)
            .send()
            .await?;
        let code = res.status();
        if !code.is_success() {
            return Err(anyhow!("{} failed {}", path, code.as_u16()));
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl TelephonyApi for TelephonyClient {
    async fn create_conference(&self, friendly_name: &str) -> Result<ConferenceRoom> {
        let body = self
            .post_form("/Conferences.json", &[("FriendlyName", friendly_name)])
            .await?;
        let sid = body
            .get("sid")
            .and_then(|v| v.as_str())
            .unwrap_or(friendly_name)
            .to_string();
        info!(conference = friendly_name, sid = sid.as_str(), "conference created");
        Ok(ConferenceRoom {
            sid,
            friendly_name: friendly_name.to_string(),
        })
    }

    async fn add_participant(
        &self,
        friendly_name: &str,
        participant: &AddParticipant,
    ) -> Result<String> {
        let mut form = vec![
            ("From", participant.from.as_str()),
            ("To", participant.to.as_str()),
            ("Label", participant.label.as_str()),
            ("EarlyMedia", "true"),
            ("Beep", "false"),
        ];
        if let Some(url) = participant.status_callback.as_deref() {
            form.push(("StatusCallback", url));
            form.push(("StatusCallbackEvent", "initiated ringing answered completed"));
        }
        if let Some(url) = participant.conference_callback.as_deref() {
            form.push(("ConferenceStatusCallback", url));
            form.push(("ConferenceStatusCallbackEvent", "start end join leave"));
        }
        let body = self
            .post_form(
                &format!("/Conferences/{}/Participants.json", friendly_name),
                &form,
            )
            .await?;
        let call_sid = body
            .get("call_sid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("participant response has no call_sid"))?;
        Ok(call_sid.to_string())
    }

    async fn find_active_call(
        &self,
        to: &str,
        from: &str,
        within: Duration,
    ) -> Result<Option<ActiveCall>> {
        let list: CallList = self
            .get_json(
                "/Calls.json",
                &[("From", from), ("To", to), ("Status", "in-progress")],
            )
            .await?;
        Ok(select_active_call(list.calls, to, within, Utc::now()))
    }

    async fn update_call(&self, call_sid: &str, twiml: &str) -> Result<()> {
        self.post_form(&format!("/Calls/{}.json", call_sid), &[("Twiml", twiml)])
            .await?;
        Ok(())
    }

    async fn hangup_call(&self, call_sid: &str) -> Result<()> {
        if let Err(e) = self
            .post_form(&format!("/Calls/{}.json", call_sid), &[("Status", "completed")])
            .await
        {
            warn!(call_sid, "hangup failed: {e}");
            return Err(e);
        }
        Ok(())
    }

    async fn conference_status(
        &self,
        friendly_name: &str,
    ) -> Result<Option<ConferenceInfo>> {
        let list: ConferenceList = self
            .get_json("/Conferences.json", &[("FriendlyName", friendly_name)])
            .await?;
        Ok(list.conferences.into_iter().next())
    }

    async fn participants(&self, conference_sid: &str) -> Result<Vec<Participant>> {
        let list: ParticipantList = self
            .get_json(
                &format!("/Conferences/{}/Participants.json", conference_sid),
                &[],
            )
            .await?;
        Ok(list.participants)
    }
}
