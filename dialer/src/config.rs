use std::fs;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/outdial/outdial.conf";

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// `redis://` address of the shared store. The dialer falls back to an
    /// in-process store when this is missing, which is only good for a single
    /// instance.
    #[serde(default)]
    pub redis: Option<String>,
    /// Public base url the providers can reach us on. Without it webhooks
    /// aren't configured and no status callbacks are requested.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub voiceai: VoiceAiConfig,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub conference: ConferenceConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VoiceAiConfig {
    #[serde(default = "default_voiceai_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Assistant that keeps the customer company inside a conference until a
    /// human agent joins. Defaults to `assistant_id`.
    #[serde(default)]
    pub hold_assistant_id: Option<String>,
    /// Tool call name that signals a qualified lead.
    #[serde(default = "default_qualification_tool")]
    pub qualification_tool: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelephonyConfig {
    #[serde(default = "default_telephony_url")]
    pub base_url: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// The number our voice AI calls go out from.
    #[serde(default)]
    pub from_number: String,
    /// Human agent queue.
    #[serde(default)]
    pub queue_number: String,
    /// Number that drops the caller into the conference named by the call's
    /// `conferenceName` variable.
    #[serde(default)]
    pub conference_number: String,
    #[serde(default)]
    pub sip_domain: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RegistryConfig {
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_secs: u64,
    #[serde(default = "default_cleanup_retry")]
    pub cleanup_retry_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stale_call")]
    pub stale_call_secs: u64,
    /// How long events for an evicted call id keep being ignored.
    #[serde(default = "default_evicted_ttl")]
    pub evicted_ttl_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct AudioConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Where finished recordings go, discarded when unset.
    #[serde(default)]
    pub recording_dir: Option<String>,
    /// Buffered audio bytes that trigger a write to the sink.
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CampaignConfig {
    #[serde(default = "default_campaign_ttl")]
    pub record_ttl_secs: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    #[serde(default = "default_batch_delay")]
    pub default_batch_delay_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ConferenceConfig {
    #[serde(default = "default_conference_ttl")]
    pub record_ttl_secs: u64,
    #[serde(default = "default_goodbye_window")]
    pub goodbye_window_secs: u64,
    #[serde(default = "default_recency_window")]
    pub recency_window_secs: u64,
    #[serde(default = "default_handoff_message")]
    pub handoff_message: String,
}

fn default_listen() -> String {
    "0.0.0.0:8130".to_string()
}

fn default_voiceai_url() -> String {
    "https://api.vapi.ai".to_string()
}

fn default_qualification_tool() -> String {
    "qualify_lead".to_string()
}

fn default_telephony_url() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

fn default_cleanup_delay() -> u64 {
    30
}

fn default_cleanup_retry() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_stale_call() -> u64 {
    3 * 3600
}

fn default_evicted_ttl() -> u64 {
    3 * 3600
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_retry_base() -> u64 {
    1000
}

fn default_retry_max() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_flush_bytes() -> usize {
    256 * 1024
}

fn default_campaign_ttl() -> u64 {
    7 * 86400
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_concurrency() -> usize {
    3
}

fn default_batch_delay() -> u64 {
    5
}

fn default_conference_ttl() -> u64 {
    86400
}

fn default_goodbye_window() -> u64 {
    8
}

fn default_recency_window() -> u64 {
    30 * 60
}

fn default_handoff_message() -> String {
    "I'm connecting you with a specialist now. Thanks for waiting.".to_string()
}

impl Default for VoiceAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_voiceai_url(),
            api_key: String::new(),
            assistant_id: String::new(),
            phone_number_id: String::new(),
            hold_assistant_id: None,
            qualification_tool: default_qualification_tool(),
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            base_url: default_telephony_url(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            queue_number: String::new(),
            conference_number: String::new(),
            sip_domain: String::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_secs: default_cleanup_delay(),
            cleanup_retry_secs: default_cleanup_retry(),
            sweep_interval_secs: default_sweep_interval(),
            stale_call_secs: default_stale_call(),
            evicted_ttl_secs: default_evicted_ttl(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
            max_retries: default_max_retries(),
            recording_dir: None,
            flush_bytes: default_flush_bytes(),
        }
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: default_campaign_ttl(),
            lock_ttl_secs: default_lock_ttl(),
            default_concurrency: default_concurrency(),
            default_batch_delay_secs: default_batch_delay(),
        }
    }
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: default_conference_ttl(),
            goodbye_window_secs: default_goodbye_window(),
            recency_window_secs: default_recency_window(),
            handoff_message: default_handoff_message(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            redis: None,
            public_url: None,
            voiceai: VoiceAiConfig::default(),
            telephony: TelephonyConfig::default(),
            registry: RegistryConfig::default(),
            audio: AudioConfig::default(),
            campaign: CampaignConfig::default(),
            conference: ConferenceConfig::default(),
        }
    }
}

impl Config {
    /// Read the config from `OUTDIAL_CONF` or the default path.
    pub fn load() -> Result<Config> {
        let path = std::env::var("OUTDIAL_CONF")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let contents = fs::read_to_string(&path)?;
        Config::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config> {
        let config: Config = toml::from_str(contents)?;
        if config.public_url.is_none() {
            warn!("no public_url configured, webhooks and status callbacks are disabled");
        }
        Ok(config)
    }

    /// Absolute url for one of our webhook routes, if we have a public url.
    pub fn webhook_url(&self, path: &str) -> Option<String> {
        let base = url::Url::parse(self.public_url.as_deref()?).ok()?;
        base.join(path).ok().map(|u| u.to_string())
    }
}

impl RegistryConfig {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }

    pub fn cleanup_retry(&self) -> Duration {
        Duration::from_secs(self.cleanup_retry_secs)
    }

    pub fn evicted_ttl(&self) -> Duration {
        Duration::from_secs(self.evicted_ttl_secs)
    }
}

impl AudioConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ConferenceConfig {
    pub fn goodbye_window(&self) -> Duration {
        Duration::from_secs(self.goodbye_window_secs)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }
}
