use chrono::Local;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    types::{BotReply, LanguagePair, MessageEnvelope, RawInput, Role},
};

/// Minute-resolution display format used on the wire.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn now_stamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Turns raw client input into canonical envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    languages: LanguagePair,
    max_message_length: usize,
}

impl EnvelopeBuilder {
    pub fn new(languages: LanguagePair, max_message_length: usize) -> Self {
        Self {
            languages,
            max_message_length,
        }
    }

    pub fn languages(&self) -> &LanguagePair {
        &self.languages
    }

    pub fn normalize(&self, raw: RawInput, role: Role) -> Result<MessageEnvelope> {
        let cid = raw.cid.trim().to_string();
        if cid.is_empty() {
            return Err(Error::validation("cid is required"));
        }

        let image = non_empty(raw.image);
        // An image travels alone; any accompanying text is dropped.
        let text = if image.is_some() {
            None
        } else {
            non_empty(raw.text)
        };

        if image.is_none() && text.is_none() {
            return Err(Error::validation("message has neither text nor image"));
        }

        if let Some(text) = text.as_deref() {
            let length = text.chars().count();
            if length > self.max_message_length {
                return Err(Error::validation(format!(
                    "message is {length} characters, limit is {}",
                    self.max_message_length
                )));
            }
        }

        let (original_lang, translated_lang) = match role {
            Role::Customer => (self.languages.customer.clone(), self.languages.agent.clone()),
            Role::Agent => (
                self.languages.agent.clone(),
                non_empty(raw.target_lang).unwrap_or_else(|| self.languages.customer.clone()),
            ),
            Role::Bot => (self.languages.agent.clone(), self.languages.customer.clone()),
        };

        let (original_text, bot_reply_text, translated_text) = match (role, text) {
            // Until a translation is attached the customer sees the agent-language text.
            (Role::Bot, Some(text)) => (None, Some(text.clone()), Some(text)),
            (_, text) => (text, None, None),
        };

        Ok(MessageEnvelope {
            id: Uuid::new_v4().to_string(),
            cid,
            seq: 0,
            from_role: role,
            original_text,
            original_lang,
            translated_text,
            translated_lang,
            bot_reply_text,
            suggestion_text: None,
            image_payload: image,
            timestamp: non_empty(raw.timestamp).unwrap_or_else(now_stamp),
            local_echo_id: non_empty(raw.local_echo_id),
            reply_to: None,
        })
    }
}

impl MessageEnvelope {
    /// Attaches the opposing-language rendering. `None` means the translation
    /// service failed, and the original text stands in for it.
    pub fn with_translation(mut self, translated: Option<String>) -> Self {
        if self.is_image() {
            return self;
        }
        let fallback = match self.from_role {
            Role::Bot => self.bot_reply_text.clone(),
            _ => self.original_text.clone(),
        };
        self.translated_text = non_empty(translated).or(fallback);
        self
    }

    pub fn at_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Text this envelope was authored in, if it is a text envelope.
    pub fn source_text(&self) -> Option<&str> {
        self.original_text
            .as_deref()
            .or(self.bot_reply_text.as_deref())
            .or(self.suggestion_text.as_deref())
    }
}

/// Bot reply chained after `trigger`, carrying both renderings.
pub fn bot_reply(trigger: &MessageEnvelope, reply: &BotReply, seq: u64) -> MessageEnvelope {
    let customer_text = if reply.customer_text.trim().is_empty() {
        reply.agent_text.clone()
    } else {
        reply.customer_text.clone()
    };

    MessageEnvelope {
        id: Uuid::new_v4().to_string(),
        cid: trigger.cid.clone(),
        seq,
        from_role: Role::Bot,
        original_text: None,
        original_lang: trigger.translated_lang.clone(),
        translated_text: Some(customer_text),
        translated_lang: trigger.original_lang.clone(),
        bot_reply_text: Some(reply.agent_text.clone()),
        suggestion_text: None,
        image_payload: None,
        timestamp: now_stamp(),
        local_echo_id: None,
        reply_to: Some(trigger.id.clone()),
    }
}

/// Agent-only draft chained after `trigger`; never delivered to the customer.
pub fn suggestion(trigger: &MessageEnvelope, draft: &str, seq: u64) -> MessageEnvelope {
    MessageEnvelope {
        id: Uuid::new_v4().to_string(),
        cid: trigger.cid.clone(),
        seq,
        from_role: Role::Bot,
        original_text: None,
        original_lang: trigger.translated_lang.clone(),
        translated_text: None,
        translated_lang: trigger.original_lang.clone(),
        bot_reply_text: None,
        suggestion_text: Some(draft.trim().to_string()),
        image_payload: None,
        timestamp: now_stamp(),
        local_echo_id: None,
        reply_to: Some(trigger.id.clone()),
    }
}
