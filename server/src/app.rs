use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    bot::{BotChain, BotResponder, ChatCompletionBot, KeywordBot},
    config::Config,
    envelope::EnvelopeBuilder,
    error::Error,
    pipeline::{Outbound, Pipeline},
    prompting::{render_bot_prompt, BotPromptContext, DEFAULT_TOPICS},
    router,
    translate::{LibreTranslate, LlmTranslate, Passthrough, Translator, TranslatorChain},
    typing::TypingNotifier,
    types::*,
};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(state: &Arc<AppState>, client_id: usize, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn emit_to_clients<T: Serialize + Clone>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn conversation_viewers(state: &Arc<AppState>, cid: &str) -> Vec<(usize, Viewer)> {
    let rt = state.realtime.lock().await;
    rt.conversation_viewers
        .get(cid)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| rt.viewers.get(id).map(|(_, viewer)| (*id, *viewer)))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

/// Directives one connected client should receive for `envelope`, or `None`
/// when the client gets nothing. The sending connection always receives its
/// own message back (as an acknowledgement) even when its panel is suppressed.
pub fn directives_for_client(
    envelope: &MessageEnvelope,
    viewer: Viewer,
    client_id: usize,
    origin: Option<usize>,
) -> Option<Vec<RenderDirective>> {
    if envelope.is_suggestion() && !viewer.sees_agent_panel() {
        return None;
    }
    let is_origin = origin == Some(client_id);
    let is_local_echo = is_origin && envelope.local_echo_id.is_some();
    let directives = router::route(envelope, viewer, is_local_echo);
    if directives.is_empty() && !is_origin {
        return None;
    }
    Some(directives)
}

/// Delivers pipeline output to the viewers of its cid. Message callers hold
/// the conversation turn so deliveries keep arrival order.
async fn deliver(state: &Arc<AppState>, outbound: Vec<Outbound>, origin: Option<usize>) {
    for event in outbound {
        match event {
            Outbound::Message(envelope) => {
                let message = OutboundMessage::from(&envelope);
                for (client_id, viewer) in conversation_viewers(state, &envelope.cid).await {
                    let Some(directives) =
                        directives_for_client(&envelope, viewer, client_id, origin)
                    else {
                        continue;
                    };
                    emit_to_client(
                        state,
                        client_id,
                        "message:new",
                        json!({ "message": message, "directives": directives }),
                    )
                    .await;
                }
            }
            Outbound::Status(event) => {
                let recipients = conversation_viewers(state, &event.cid)
                    .await
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect::<Vec<_>>();
                emit_to_clients(state, &recipients, "agent:status", event).await;
            }
            Outbound::Typing(signal) => {
                let recipients = conversation_viewers(state, &signal.cid)
                    .await
                    .into_iter()
                    .map(|(id, _)| id)
                    .filter(|id| Some(*id) != origin)
                    .collect::<Vec<_>>();
                emit_to_clients(state, &recipients, "typing", signal).await;
            }
            Outbound::Attention(event) => {
                let agents = conversation_viewers(state, &event.cid)
                    .await
                    .into_iter()
                    .filter(|(_, viewer)| viewer.sees_agent_panel())
                    .map(|(id, _)| id)
                    .collect::<Vec<_>>();
                emit_to_clients(state, &agents, "attention", event).await;
            }
        }
    }
}

async fn join_conversation(state: &Arc<AppState>, client_id: usize, cid: &str, viewer: Viewer) {
    {
        let mut rt = state.realtime.lock().await;
        if let Some((previous, _)) = rt.viewers.insert(client_id, (cid.to_string(), viewer)) {
            if previous != cid {
                if let Some(set) = rt.conversation_viewers.get_mut(&previous) {
                    set.remove(&client_id);
                }
            }
        }
        rt.conversation_viewers
            .entry(cid.to_string())
            .or_default()
            .insert(client_id);
    }

    info!(client_id, cid = %cid, viewer = ?viewer, "viewer joined");
    emit_to_client(state, client_id, "agent:status", state.pipeline.status(cid)).await;
}

async fn joined_conversation(state: &Arc<AppState>, client_id: usize) -> Option<(String, Viewer)> {
    let rt = state.realtime.lock().await;
    rt.viewers.get(&client_id).cloned()
}

async fn ingest_message(
    state: &Arc<AppState>,
    raw: RawInput,
    role: Role,
    origin: Option<usize>,
) -> Result<Vec<OutboundMessage>, Error> {
    let turn = state.pipeline.begin(&raw.cid).await?;
    let outbound = state.pipeline.ingest(&turn, raw, role).await?;
    let accepted = outbound
        .iter()
        .filter_map(|event| match event {
            Outbound::Message(envelope) => Some(OutboundMessage::from(envelope)),
            _ => None,
        })
        .collect::<Vec<_>>();
    deliver(state, outbound, origin).await;
    drop(turn);
    Ok(accepted)
}

/// Last write wins; never waits for a message still in flight.
async fn set_presence(
    state: &Arc<AppState>,
    cid: &str,
    online: bool,
    origin: Option<usize>,
) -> Result<(), Error> {
    let outbound = state.pipeline.set_agent_online(cid, online)?;
    deliver(state, vec![outbound], origin).await;
    Ok(())
}

fn or_joined<'a>(cid: &'a str, joined: Option<&'a str>) -> &'a str {
    if cid.trim().is_empty() {
        joined.unwrap_or("")
    } else {
        cid
    }
}

fn parse_raw_input(data: Value, fallback_cid: Option<&str>) -> Result<RawInput, Error> {
    let mut raw = serde_json::from_value::<RawInput>(data)?;
    if raw.cid.trim().is_empty() {
        if let Some(cid) = fallback_cid {
            raw.cid = cid.to_string();
        }
    }
    Ok(raw)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "success",
        "config": state.config.public(),
        "timestamp": now_iso()
    }))
}

async fn get_status(
    Path(cid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(json!({ "status": state.pipeline.status(&cid) }))
}

async fn patch_handover(
    Path(cid): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<HandoverBody>,
) -> impl IntoResponse {
    if let Err(err) = set_presence(&state, &cid, body.online, None).await {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response();
    }

    (StatusCode::OK, Json(json!({ "status": state.pipeline.status(&cid) }))).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageBody {
    role: Role,
    #[serde(flatten)]
    input: RawInput,
}

async fn post_message(
    Path(cid): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PostMessageBody>,
) -> impl IntoResponse {
    let mut raw = body.input;
    raw.cid = cid;

    match ingest_message(&state, raw, body.role, None).await {
        Ok(messages) => (StatusCode::CREATED, Json(json!({ "messages": messages }))).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }
    debug!(client_id, "socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        let joined = joined_conversation(&state, client_id).await;
        let joined_cid = joined.as_ref().map(|(cid, _)| cid.as_str());

        match envelope.event.as_str() {
            "join" => {
                let Ok(body) = serde_json::from_value::<JoinBody>(envelope.data) else {
                    emit_to_client(&state, client_id, "error", json!({ "message": "cid is required" }))
                        .await;
                    continue;
                };
                let cid = body.cid.trim();
                if cid.is_empty() {
                    emit_to_client(&state, client_id, "error", json!({ "message": "cid is required" }))
                        .await;
                    continue;
                }
                state.pipeline.registry().get_or_create(cid);
                join_conversation(&state, client_id, cid, body.role).await;
            }
            "customer:message" | "agent:message" => {
                let role = if envelope.event == "agent:message" {
                    Role::Agent
                } else {
                    Role::Customer
                };
                let result = match parse_raw_input(envelope.data, joined_cid) {
                    Ok(raw) => ingest_message(&state, raw, role, Some(client_id)).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    warn!(client_id, error = %err, "message rejected");
                    emit_to_client(&state, client_id, "error", json!({ "message": err.to_string() }))
                        .await;
                }
            }
            "agent:set-status" => {
                let body = serde_json::from_value::<StatusBody>(envelope.data)
                    .unwrap_or(StatusBody {
                        cid: String::new(),
                        online: true,
                    });
                let cid = or_joined(&body.cid, joined_cid);
                if let Err(err) = set_presence(&state, cid, body.online, Some(client_id)).await {
                    emit_to_client(&state, client_id, "error", json!({ "message": err.to_string() }))
                        .await;
                }
            }
            "typing" => {
                let body = serde_json::from_value::<CidBody>(envelope.data)
                    .unwrap_or(CidBody { cid: String::new() });
                let cid = or_joined(&body.cid, joined_cid);
                let role = match joined.as_ref().map(|(_, viewer)| *viewer) {
                    Some(Viewer::Agent | Viewer::Dual) => Role::Agent,
                    _ => Role::Customer,
                };
                if let Some(outbound) = state.pipeline.typing(cid, role) {
                    deliver(&state, vec![outbound], Some(client_id)).await;
                }
            }
            other => debug!(client_id, event = other, "ignoring unknown event"),
        }
    }

    let abandoned = {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        let mut abandoned = None;
        if let Some((cid, _)) = rt.viewers.remove(&client_id) {
            if let Some(set) = rt.conversation_viewers.get_mut(&cid) {
                set.remove(&client_id);
                if set.is_empty() {
                    rt.conversation_viewers.remove(&cid);
                    abandoned = Some(cid);
                }
            }
        }
        abandoned
    };
    if let Some(cid) = abandoned {
        state.pipeline.release(&cid);
    }
    debug!(client_id, "socket disconnected");

    send_task.abort();
}

fn build_translator(config: &Config, client: &reqwest::Client) -> Arc<dyn Translator> {
    if !config.translation_enabled {
        return Arc::new(Passthrough);
    }

    let mut tiers: Vec<Arc<dyn Translator>> = vec![Arc::new(LibreTranslate::new(
        client.clone(),
        config.libre_endpoints.clone(),
        config.translation_timeout,
    ))];
    if let Some(llm) = config.llm.clone() {
        info!(model = %llm.model, "model translation fallback enabled");
        tiers.push(Arc::new(LlmTranslate::new(client.clone(), llm)));
    }
    Arc::new(TranslatorChain::new(tiers))
}

fn build_bot(config: &Config, client: &reqwest::Client) -> Arc<dyn BotResponder> {
    let mut tiers: Vec<Arc<dyn BotResponder>> = Vec::new();
    match KeywordBot::with_default_rules() {
        Ok(keywords) => tiers.push(Arc::new(keywords)),
        Err(err) => warn!(error = %err, "keyword bot disabled"),
    }

    if let Some(llm) = config.llm.clone() {
        info!(base_url = %llm.base_url, model = %llm.model, "chat completion bot enabled");
        let prompt = render_bot_prompt(&BotPromptContext {
            bot_name: &config.bot_name,
            workspace_name: "",
            reply_lang: &config.agent_lang,
            topics: &DEFAULT_TOPICS,
        });
        tiers.push(Arc::new(ChatCompletionBot::new(client.clone(), llm, prompt)));
    }

    Arc::new(BotChain::new(tiers))
}

pub fn build_state(config: Config) -> Arc<AppState> {
    let client = reqwest::Client::new();
    let pipeline = Pipeline::new(
        EnvelopeBuilder::new(config.languages(), config.max_message_length),
        build_translator(&config, &client),
        build_bot(&config, &client),
        TypingNotifier::new(config.typing_window),
    )
    .with_bot_timeout(config.bot_timeout);

    Arc::new(AppState {
        config,
        pipeline,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
    })
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/config", get(get_config))
        .route("/api/conversation/{cid}/status", get(get_status))
        .route("/api/conversation/{cid}/handover", patch(patch_handover))
        .route("/api/conversation/{cid}/message", post(post_message))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> std::io::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let port = config.port;
    info!(
        customer_lang = %config.customer_lang,
        agent_lang = %config.agent_lang,
        translation = config.translation_enabled,
        typing_window_ms = config.typing_window.as_millis() as u64,
        "starting support bridge"
    );

    let state = build_state(config);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("support bridge listening on http://localhost:{port}");
    axum::serve(listener, app(state)).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{envelope, types::LanguagePair};

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(
            LanguagePair {
                customer: "fr".to_string(),
                agent: "zh".to_string(),
            },
            500,
        )
    }

    fn agent_message(local_echo: bool) -> MessageEnvelope {
        builder()
            .normalize(
                RawInput {
                    cid: "cid_1".to_string(),
                    text: Some("您好".to_string()),
                    local_echo_id: local_echo.then(|| "local-1".to_string()),
                    ..RawInput::default()
                },
                Role::Agent,
            )
            .unwrap()
            .with_translation(Some("Bonjour".to_string()))
    }

    #[test]
    fn sender_with_local_echo_gets_ack_without_directives() {
        let envelope = agent_message(true);
        let own = directives_for_client(&envelope, Viewer::Agent, 7, Some(7)).unwrap();
        assert!(own.is_empty());

        let other_agent = directives_for_client(&envelope, Viewer::Agent, 8, Some(7)).unwrap();
        assert_eq!(other_agent.len(), 1);

        let customer = directives_for_client(&envelope, Viewer::Customer, 9, Some(7)).unwrap();
        assert_eq!(customer[0].content, "Bonjour");
    }

    #[test]
    fn sender_without_local_echo_is_painted_by_broadcast() {
        let envelope = agent_message(false);
        let own = directives_for_client(&envelope, Viewer::Agent, 7, Some(7)).unwrap();
        assert_eq!(own.len(), 1);
    }

    #[test]
    fn suggestions_never_reach_customer_connections() {
        let trigger = builder()
            .normalize(
                RawInput {
                    cid: "cid_1".to_string(),
                    text: Some("bonjour".to_string()),
                    ..RawInput::default()
                },
                Role::Customer,
            )
            .unwrap();
        let draft = envelope::suggestion(&trigger, "您好", 2);
        assert!(directives_for_client(&draft, Viewer::Customer, 1, None).is_none());
        assert_eq!(
            directives_for_client(&draft, Viewer::Dual, 2, None).map(|d| d.len()),
            Some(1)
        );
    }

    #[test]
    fn raw_input_falls_back_to_joined_cid() {
        let raw = parse_raw_input(json!({ "message": "bonjour" }), Some("cid_1")).unwrap();
        assert_eq!(raw.cid, "cid_1");
        assert_eq!(raw.text.as_deref(), Some("bonjour"));

        let raw = parse_raw_input(json!({ "cid": "cid_2", "image": "data:x" }), Some("cid_1")).unwrap();
        assert_eq!(raw.cid, "cid_2");

        assert!(parse_raw_input(json!({ "cid": 5 }), None).is_err());
    }

    fn offline_state() -> Arc<AppState> {
        let mut config = Config::from_env();
        config.translation_enabled = false;
        config.llm = None;
        build_state(config)
    }

    #[tokio::test]
    async fn presence_toggle_does_not_wait_for_busy_conversation() {
        let state = offline_state();
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel::<String>();
        state.realtime.lock().await.clients.insert(1, agent_tx);
        join_conversation(&state, 1, "cid_1", Viewer::Agent).await;
        agent_rx.recv().await.unwrap();

        let busy = state.pipeline.begin("cid_1").await.unwrap();
        let toggled = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            set_presence(&state, "cid_1", false, None),
        )
        .await;
        assert!(matches!(toggled, Ok(Ok(()))));
        drop(busy);

        let frame: Value = serde_json::from_str(&agent_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "agent:status");
        assert_eq!(frame["data"]["online"], false);
        assert!(!state.pipeline.status("cid_1").online);
    }

    #[tokio::test]
    async fn blank_cid_is_rejected_before_any_turn() {
        let state = offline_state();
        let raw = RawInput {
            cid: "  ".to_string(),
            text: Some("bonjour".to_string()),
            ..RawInput::default()
        };
        assert!(matches!(
            ingest_message(&state, raw, Role::Customer, None).await,
            Err(Error::Validation(_))
        ));
        assert!(set_presence(&state, " ", true, None).await.is_err());
    }

    #[tokio::test]
    async fn joined_viewers_receive_routed_messages() {
        let state = offline_state();

        let (customer_tx, mut customer_rx) = mpsc::unbounded_channel::<String>();
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel::<String>();
        {
            let mut rt = state.realtime.lock().await;
            rt.clients.insert(1, customer_tx);
            rt.clients.insert(2, agent_tx);
        }
        join_conversation(&state, 1, "cid_1", Viewer::Customer).await;
        join_conversation(&state, 2, "cid_1", Viewer::Agent).await;

        // both receive the current status on join
        assert!(customer_rx.recv().await.unwrap().contains("agent:status"));
        assert!(agent_rx.recv().await.unwrap().contains("agent:status"));

        let raw = RawInput {
            cid: "cid_1".to_string(),
            text: Some("天气".to_string()),
            ..RawInput::default()
        };
        let accepted = ingest_message(&state, raw, Role::Customer, Some(1)).await.unwrap();
        assert_eq!(accepted.len(), 1);

        let frame: Value = serde_json::from_str(&customer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "message:new");
        assert_eq!(frame["data"]["directives"][0]["alignment"], "right");

        let frame: Value = serde_json::from_str(&agent_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["data"]["directives"][0]["alignment"], "left");
        assert_eq!(frame["data"]["message"]["fromRole"], "customer");

        let viewers = conversation_viewers(&state, "cid_1")
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect::<HashSet<_>>();
        assert_eq!(viewers, HashSet::from([1, 2]));
    }
}
