use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Form, Path, Query};
use axum::response::Response;
use axum::Json;
use itertools::Itertools;
use outdial_redis::{MemoryStore, RedisPool, SharedStore};
use outdial_utils::normalize_phone;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use telephony::{TelephonyApi, TelephonyClient};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use voiceai::{VoiceAiApi, VoiceAiClient};

use crate::adapter::{parse_conference, parse_telephony, parse_voiceai, NormalizedEvent};
use crate::audio::{AudioConnector, AudioMonitor, AudioSink, DiscardSink, FileSink, WsConnector};
use crate::campaign::{CampaignExecutor, CampaignLedger, StartCampaign};
use crate::conference::{ConferenceOrchestrator, Qualification};
use crate::config::Config;
use crate::dispatch::{CallDispatcher, ControlRequest, DispatchRequest};
use crate::error::DialerError;
use crate::event::{DialerEvent, EventBus};
use crate::reconciler::Reconciler;
use crate::registry::CallRegistry;

/// Everything the dialer runs on, wired together once at startup.
pub struct DialerService {
    pub config: Config,
    pub registry: Arc<CallRegistry>,
    pub events: EventBus,
    pub dispatcher: Arc<CallDispatcher>,
    pub campaigns: Arc<CampaignExecutor>,
    pub conferences: Arc<ConferenceOrchestrator>,
    pub audio: Arc<AudioMonitor>,
    pub reconciler: Arc<Reconciler>,
    voiceai: Arc<dyn VoiceAiApi>,
    feedback: Mutex<Option<mpsc::UnboundedReceiver<NormalizedEvent>>>,
}

impl DialerService {
    pub fn new(config: Config) -> Result<Arc<DialerService>> {
        let store: Arc<dyn SharedStore> = match config.redis.as_deref() {
            Some(addr) => Arc::new(RedisPool::open(addr)?),
            None => {
                warn!("no redis configured, using the in-process store");
                Arc::new(MemoryStore::new())
            }
        };
        let voiceai = Arc::new(VoiceAiClient::new(
            &config.voiceai.base_url,
            &config.voiceai.api_key,
        ));
        let telephony = Arc::new(TelephonyClient::new(
            &config.telephony.base_url,
            &config.telephony.account_sid,
            &config.telephony.auth_token,
        ));
        let sink: Arc<dyn AudioSink> = match config.audio.recording_dir.as_deref() {
            Some(dir) => Arc::new(FileSink::new(dir)),
            None => Arc::new(DiscardSink),
        };
        Ok(Self::with_providers(
            config,
            store,
            voiceai,
            telephony,
            Arc::new(WsConnector),
            sink,
        ))
    }

    pub fn with_providers(
        config: Config,
        store: Arc<dyn SharedStore>,
        voiceai: Arc<dyn VoiceAiApi>,
        telephony: Arc<dyn TelephonyApi>,
        connector: Arc<dyn AudioConnector>,
        sink: Arc<dyn AudioSink>,
    ) -> Arc<DialerService> {
        let registry = Arc::new(CallRegistry::new());
        let events = EventBus::default();
        let dispatcher = Arc::new(CallDispatcher::new(
            registry.clone(),
            voiceai.clone(),
            events.clone(),
            config.voiceai.clone(),
        ));
        let campaigns = CampaignExecutor::new(
            CampaignLedger::new(store.clone(), config.campaign.record_ttl_secs),
            dispatcher.clone(),
            events.clone(),
            config.campaign.clone(),
        );
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let audio = AudioMonitor::new(
            registry.clone(),
            events.clone(),
            connector,
            sink,
            config.audio.clone(),
            feedback_tx,
        );
        let conferences = Arc::new(ConferenceOrchestrator::new(
            store,
            registry.clone(),
            dispatcher.clone(),
            voiceai.clone(),
            telephony,
            events.clone(),
            config.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            events.clone(),
            campaigns.clone(),
            audio.clone(),
            conferences.clone(),
            &config,
        ));
        Arc::new(DialerService {
            config,
            registry,
            events,
            dispatcher,
            campaigns,
            conferences,
            audio,
            reconciler,
            voiceai,
            feedback: Mutex::new(Some(feedback_rx)),
        })
    }

    /// Point the voice AI assistants at our webhook. Skipped without a
    /// public url; calls still go out but nothing reports back.
    pub async fn configure_webhooks(&self) {
        let Some(url) = self.config.webhook_url("/webhooks/voiceai") else {
            warn!("no public_url, voice ai webhooks not configured");
            return;
        };
        let assistants = [
            Some(self.config.voiceai.assistant_id.as_str()),
            self.config.voiceai.hold_assistant_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|id| !id.is_empty())
        .unique()
        .collect_vec();
        for assistant in assistants {
            match self.voiceai.configure_assistant_webhook(assistant, &url).await {
                Ok(()) => info!(assistant, url = url.as_str(), "assistant webhook configured"),
                Err(e) => warn!(assistant, "assistant webhook configuration failed: {e:#}"),
            }
        }
    }
}

pub struct Server {
    service: Arc<DialerService>,
}

impl Server {
    pub fn new(service: Arc<DialerService>) -> Arc<Server> {
        Arc::new(Server { service })
    }

    pub async fn run(server: Arc<Server>) -> Result<()> {
        let service = server.service.clone();

        if let Some(rx) = service.feedback.lock().take() {
            service.reconciler.spawn_feedback(rx);
        }

        {
            let reconciler = service.reconciler.clone();
            let every = Duration::from_secs(service.config.registry.sweep_interval_secs.max(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    reconciler.sweep().await;
                }
            });
        }

        service.configure_webhooks().await;

        let addr = SocketAddr::from_str(&service.config.listen)?;
        info!(%addr, "dialer listening");
        axum::Server::bind(&addr)
            .serve(router(service).into_make_service())
            .await?;
        Ok(())
    }
}

pub fn router(service: Arc<DialerService>) -> axum::Router {
    axum::Router::new()
        .route("/health", axum::routing::get(health))
        .route("/webhooks/voiceai", axum::routing::post(voiceai_webhook))
        .route("/webhooks/telephony", axum::routing::post(telephony_webhook))
        .route(
            "/webhooks/telephony/conference",
            axum::routing::post(conference_webhook),
        )
        .route(
            "/calls",
            axum::routing::get(list_calls).post(create_call),
        )
        .route(
            "/calls/:id",
            axum::routing::get(get_call).delete(evict_call),
        )
        .route("/calls/:id/control", axum::routing::post(control_call))
        .route("/calls/:id/listen", axum::routing::get(listen_call))
        .route("/phones/:phone", axum::routing::delete(clear_phone))
        .route("/campaigns", axum::routing::post(start_campaign))
        .route("/campaigns/:id", axum::routing::get(get_campaign))
        .route("/campaigns/:id/stop", axum::routing::post(stop_campaign))
        .route("/conferences", axum::routing::post(create_conference))
        .route("/conferences/:id", axum::routing::get(get_conference))
        .route(
            "/conferences/:id/hangup",
            axum::routing::post(hangup_conference),
        )
        .route("/events", axum::routing::get(events))
        .layer(Extension(service))
}

type ApiResult = Result<Json<Value>, DialerError>;

fn ok(mut body: Value) -> Json<Value> {
    if let Value::Object(map) = &mut body {
        map.insert("ok".to_string(), Value::Bool(true));
    }
    Json(body)
}

async fn health(Extension(service): Extension<Arc<DialerService>>) -> Json<Value> {
    ok(json!({ "calls": service.registry.len() }))
}

async fn voiceai_webhook(
    Extension(service): Extension<Arc<DialerService>>,
    Json(body): Json<Value>,
) -> ApiResult {
    let event = parse_voiceai(&body, None)?;
    match service.reconciler.handle(event).await {
        Some(response) => Ok(Json(response)),
        None => Ok(ok(json!({}))),
    }
}

async fn telephony_webhook(
    Extension(service): Extension<Arc<DialerService>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    let event = parse_telephony(&form)?;
    service.reconciler.handle(event).await;
    Ok(ok(json!({})))
}

async fn conference_webhook(
    Extension(service): Extension<Arc<DialerService>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    let event = parse_conference(&form)?;
    service.conferences.handle_event(event).await?;
    Ok(ok(json!({})))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateCall {
    phone: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    campaign_id: Option<String>,
    #[serde(default)]
    lead_id: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

async fn create_call(
    Extension(service): Extension<Arc<DialerService>>,
    Json(req): Json<CreateCall>,
) -> ApiResult {
    let call = service
        .dispatcher
        .dispatch(DispatchRequest {
            phone: req.phone,
            name: req.name,
            campaign_id: req.campaign_id,
            lead_id: req.lead_id,
            variables: req.variables,
        })
        .await?;
    Ok(ok(json!({ "call": call })))
}

async fn list_calls(Extension(service): Extension<Arc<DialerService>>) -> ApiResult {
    Ok(ok(json!({ "calls": service.registry.list() })))
}

async fn get_call(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let call = service
        .registry
        .get(&id)
        .ok_or(DialerError::CallNotFound(id))?;
    Ok(ok(json!({ "call": call })))
}

async fn control_call(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
    Json(req): Json<ControlRequest>,
) -> ApiResult {
    service.dispatcher.control(&id, req).await?;
    Ok(ok(json!({ "callId": id })))
}

#[derive(Deserialize, Debug, Default)]
struct EvictQuery {
    #[serde(default)]
    force: bool,
}

async fn evict_call(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
    Query(query): Query<EvictQuery>,
) -> ApiResult {
    let call = service.reconciler.evict(&id, query.force)?;
    Ok(ok(json!({ "call": call })))
}

async fn clear_phone(
    Extension(service): Extension<Arc<DialerService>>,
    Path(phone): Path<String>,
) -> ApiResult {
    let phone = normalize_phone(&phone)
        .ok_or_else(|| DialerError::InvalidRequest(format!("invalid phone number {phone}")))?;
    let call_id = service.registry.clear_phone(&phone);
    info!(phone = phone.as_str(), call_id = ?call_id, "phone claim cleared");
    Ok(ok(json!({ "phone": phone, "callId": call_id })))
}

async fn start_campaign(
    Extension(service): Extension<Arc<DialerService>>,
    Json(req): Json<StartCampaign>,
) -> ApiResult {
    let campaign = service.campaigns.start(req).await?;
    Ok(ok(json!({ "campaign": campaign })))
}

async fn get_campaign(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let campaign = service.campaigns.status(&id).await?;
    Ok(ok(json!({ "campaign": campaign })))
}

async fn stop_campaign(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let campaign = service.campaigns.stop(&id).await?;
    Ok(ok(json!({ "campaign": campaign })))
}

async fn create_conference(
    Extension(service): Extension<Arc<DialerService>>,
    Json(req): Json<Qualification>,
) -> ApiResult {
    let result = service.conferences.qualify(req).await?;
    Ok(ok(serde_json::to_value(&result).map_err(|e| DialerError::Store(e.into()))?))
}

async fn get_conference(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let live = service.conferences.live(&id).await?;
    Ok(ok(serde_json::to_value(&live).map_err(|e| DialerError::Store(e.into()))?))
}

async fn hangup_conference(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
) -> ApiResult {
    service.conferences.hangup(&id).await?;
    Ok(ok(json!({ "conferenceId": id })))
}

async fn events(
    Extension(service): Extension<Arc<DialerService>>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = service.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<DialerEvent>) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("event serialization failed: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event subscriber lagging"),
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("event subscriber gone");
}

/// One listener's hold on a call. Dropping it releases the hold, which may
/// trigger the call's cleanup.
struct ListenerGuard {
    service: Arc<DialerService>,
    call_id: String,
}

impl ListenerGuard {
    fn join(service: Arc<DialerService>, call_id: String) -> Option<Self> {
        let listeners = service.registry.add_listener(&call_id)?;
        info!(call_id = call_id.as_str(), listeners, "listener joined");
        Some(Self { service, call_id })
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let remaining = self.service.reconciler.release_listener(&self.call_id);
        info!(call_id = self.call_id.as_str(), remaining = ?remaining, "listener left");
    }
}

/// A live listener on one call. The call is held only once the socket is
/// up, a handshake that never completes holds nothing.
async fn listen_call(
    Extension(service): Extension<Arc<DialerService>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, DialerError> {
    if service.registry.status(&id).is_none() {
        return Err(DialerError::CallNotFound(id));
    }
    Ok(ws.on_upgrade(move |socket| async move {
        let Some(_guard) = ListenerGuard::join(service.clone(), id.clone()) else {
            debug!(call_id = id.as_str(), "call gone before listener joined");
            return;
        };
        let audio = service.audio.subscribe(&id);
        relay_audio(socket, audio).await;
    }))
}

async fn relay_audio(mut socket: WebSocket, mut audio: Option<broadcast::Receiver<Vec<u8>>>) {
    loop {
        let next_audio = async {
            match audio.as_mut() {
                Some(rx) => rx.recv().await,
                None => futures::future::pending().await,
            }
        };
        tokio::select! {
            chunk = next_audio => match chunk {
                Ok(chunk) => {
                    if socket.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "listener dropped audio"),
                // stream over, keep the listener until it hangs up
                Err(RecvError::Closed) => audio = None,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FrameStream;
    use crate::call::CallStatus;
    use crate::fakes::{FakeTelephony, FakeVoiceAi};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    struct IdleConnector;

    #[async_trait]
    impl AudioConnector for IdleConnector {
        async fn connect(&self, _url: &str) -> Result<FrameStream> {
            futures::future::pending().await
        }
    }

    fn service() -> Arc<DialerService> {
        DialerService::with_providers(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeVoiceAi::new()),
            Arc::new(FakeTelephony::new()),
            Arc::new(IdleConnector),
            Arc::new(DiscardSink),
        )
    }

    fn create(phone: &str) -> Json<CreateCall> {
        Json(CreateCall {
            phone: phone.to_string(),
            name: None,
            campaign_id: None,
            lead_id: None,
            variables: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn call_lifecycle_over_webhooks() {
        let service = service();
        let Json(body) = create_call(Extension(service.clone()), create("5551234567"))
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
        let id = body["call"]["id"].as_str().unwrap().to_string();

        for message in [
            json!({"type": "status-update", "status": "in-progress", "call": {"id": id}}),
            json!({"type": "end-of-call-report", "endedReason": "customer-ended-call", "call": {"id": id}}),
        ] {
            voiceai_webhook(Extension(service.clone()), Json(json!({ "message": message })))
                .await
                .unwrap();
        }

        let Json(body) = get_call(Extension(service.clone()), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(body["call"]["status"], "ended");
        assert_eq!(service.registry.status(&id), Some(CallStatus::Ended));
    }

    #[tokio::test]
    async fn listener_hold_ends_with_guard() {
        let service = service();
        assert!(ListenerGuard::join(service.clone(), "nope".to_string()).is_none());

        let Json(body) = create_call(Extension(service.clone()), create("5551234567"))
            .await
            .unwrap();
        let id = body["call"]["id"].as_str().unwrap().to_string();
        let first = ListenerGuard::join(service.clone(), id.clone()).unwrap();
        let second = ListenerGuard::join(service.clone(), id.clone()).unwrap();
        assert_eq!(service.registry.get(&id).unwrap().listeners, 2);
        drop(first);
        assert_eq!(service.registry.get(&id).unwrap().listeners, 1);

        let message = json!({"type": "end-of-call-report", "endedReason": "customer-ended-call", "call": {"id": id}});
        voiceai_webhook(Extension(service.clone()), Json(json!({ "message": message })))
            .await
            .unwrap();
        assert_eq!(service.registry.status(&id), Some(CallStatus::Ended));

        // the last listener leaving a finished call cleans it up
        drop(second);
        assert!(service.registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn errors_carry_codes() {
        let service = service();
        create_call(Extension(service.clone()), create("5551234567"))
            .await
            .unwrap();
        let err = create_call(Extension(service.clone()), create("+15551234567"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_call");
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = get_call(Extension(service.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn telephony_callbacks_and_phone_clear() {
        let service = service();
        let form: HashMap<String, String> = [
            ("CallSid", "CA1"),
            ("CallStatus", "ringing"),
            ("To", "+15557654321"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        telephony_webhook(Extension(service.clone()), Form(form))
            .await
            .unwrap();
        assert_eq!(service.registry.status("CA1"), Some(CallStatus::Ringing));

        service.registry.claim_phone("+15557654321", "CA1").unwrap();
        let Json(body) = clear_phone(Extension(service.clone()), Path("5557654321".to_string()))
            .await
            .unwrap();
        assert_eq!(body["callId"], "CA1");
        assert_eq!(service.registry.phone_holder("+15557654321"), None);
    }
}
