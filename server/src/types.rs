use std::{
    collections::{HashMap, HashSet},
    sync::atomic::AtomicUsize,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::{config::Config, pipeline::Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Agent,
    Bot,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Agent => "agent",
            Role::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Panel {
    Customer,
    Agent,
}

impl Panel {
    pub fn owner(self) -> Role {
        match self {
            Panel::Customer => Role::Customer,
            Panel::Agent => Role::Agent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentVariant {
    Original,
    Translated,
    Bot,
    Suggestion,
    Image,
}

/// Which panels a connected surface owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Viewer {
    Customer,
    Agent,
    /// Debug surface showing both panels side by side.
    Dual,
}

impl Viewer {
    pub fn panels(self) -> &'static [Panel] {
        match self {
            Viewer::Customer => &[Panel::Customer],
            Viewer::Agent => &[Panel::Agent],
            Viewer::Dual => &[Panel::Customer, Panel::Agent],
        }
    }

    pub fn sees_agent_panel(self) -> bool {
        matches!(self, Viewer::Agent | Viewer::Dual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePair {
    pub customer: String,
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub cid: String,
    pub agent_online: bool,
    pub last_typing_at: Option<DateTime<Utc>>,
    pub next_seq: u64,
}

/// Inbound message event as it arrives from a client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInput {
    #[serde(default)]
    pub cid: String,
    #[serde(default, alias = "message")]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub local_echo_id: Option<String>,
    #[serde(default)]
    pub target_lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    pub cid: String,
    pub seq: u64,
    pub from_role: Role,
    pub original_text: Option<String>,
    pub original_lang: String,
    pub translated_text: Option<String>,
    pub translated_lang: String,
    pub bot_reply_text: Option<String>,
    pub suggestion_text: Option<String>,
    pub image_payload: Option<String>,
    pub timestamp: String,
    pub local_echo_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageEnvelope {
    pub fn is_image(&self) -> bool {
        self.image_payload.is_some()
    }

    pub fn is_suggestion(&self) -> bool {
        self.suggestion_text.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderDirective {
    pub target_panel: Panel,
    pub alignment: Alignment,
    pub content_variant: ContentVariant,
    pub suppress: bool,
    pub envelope_id: String,
    pub author: Role,
    pub content: String,
    pub timestamp: String,
}

/// Reply produced by the bot tier, in both languages of the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct BotReply {
    pub agent_text: String,
    pub customer_text: String,
}

/// Wire form of a message broadcast to every viewer of a cid.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub cid: String,
    pub seq: u64,
    pub from_role: Role,
    pub original: Option<String>,
    pub translated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_echo_id: Option<String>,
}

impl From<&MessageEnvelope> for OutboundMessage {
    fn from(envelope: &MessageEnvelope) -> Self {
        Self {
            id: envelope.id.clone(),
            cid: envelope.cid.clone(),
            seq: envelope.seq,
            from_role: envelope.from_role,
            original: envelope.original_text.clone(),
            translated: envelope.translated_text.clone(),
            bot_reply: envelope.bot_reply_text.clone(),
            suggestion: envelope.suggestion_text.clone(),
            image: envelope.image_payload.clone(),
            timestamp: envelope.timestamp.clone(),
            reply_to: envelope.reply_to.clone(),
            local_echo_id: envelope.local_echo_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffEvent {
    pub cid: String,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub cid: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionEvent {
    pub cid: String,
    pub reason: String,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub viewers: HashMap<usize, (String, Viewer)>,
    pub conversation_viewers: HashMap<String, HashSet<usize>>,
}

pub struct AppState {
    pub config: Config,
    pub pipeline: Pipeline,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBody {
    pub cid: String,
    #[serde(default = "default_viewer")]
    pub role: Viewer,
}

fn default_viewer() -> Viewer {
    Viewer::Customer
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoverBody {
    pub online: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CidBody {
    #[serde(default)]
    pub cid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    #[serde(default)]
    pub cid: String,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
