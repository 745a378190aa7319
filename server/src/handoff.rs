//! Reply responsibility between the human agent and the bot.
//!
//! `Online` means a human is staffing the conversation: the bot may only
//! draft suggestions for the agent panel. `Offline` means the bot answers the
//! customer directly, and the agent panel mirrors that answer.

use crate::{
    envelope,
    registry::SessionRegistry,
    types::{BotReply, HandoffEvent, MessageEnvelope, Role},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Online,
    Offline,
}

impl HandoffState {
    pub fn from_agent_online(online: bool) -> Self {
        if online {
            HandoffState::Online
        } else {
            HandoffState::Offline
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, HandoffState::Online)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandoffOutcome {
    /// Bot answer delivered to both panels.
    AutoReply(MessageEnvelope),
    /// Agent-only draft.
    Suggestion(MessageEnvelope),
    /// The bot had nothing to say; the turn needs a human.
    Silent,
    /// The envelope does not engage the bot at all.
    Skip,
}

impl HandoffOutcome {
    pub fn envelope(&self) -> Option<&MessageEnvelope> {
        match self {
            HandoffOutcome::AutoReply(envelope) | HandoffOutcome::Suggestion(envelope) => {
                Some(envelope)
            }
            HandoffOutcome::Silent | HandoffOutcome::Skip => None,
        }
    }
}

/// Only customer text asks for a bot turn; images, agent and bot messages never do.
pub fn engages_bot(envelope: &MessageEnvelope) -> bool {
    envelope.from_role == Role::Customer && !envelope.is_image() && envelope.original_text.is_some()
}

/// Applies the handoff policy to one envelope. `reply` is the bot result
/// already fetched for it (`None` when the bot was unavailable), and `seq` is
/// the append position reserved for a synthesized envelope.
pub fn decide(
    state: HandoffState,
    trigger: &MessageEnvelope,
    reply: Option<&BotReply>,
    seq: u64,
) -> HandoffOutcome {
    if !engages_bot(trigger) {
        return HandoffOutcome::Skip;
    }

    let Some(reply) = reply.filter(|reply| !reply.agent_text.trim().is_empty()) else {
        return HandoffOutcome::Silent;
    };

    match state {
        HandoffState::Offline => HandoffOutcome::AutoReply(envelope::bot_reply(trigger, reply, seq)),
        HandoffState::Online => {
            HandoffOutcome::Suggestion(envelope::suggestion(trigger, &reply.agent_text, seq))
        }
    }
}

/// Explicit agent toggle. Returns the event every viewer of `cid` must see,
/// and whether the state actually changed.
pub fn toggle(registry: &SessionRegistry, cid: &str, online: bool) -> (HandoffEvent, bool) {
    let previous = registry.set_agent_online(cid, online);
    (
        HandoffEvent {
            cid: cid.to_string(),
            online,
        },
        previous != online,
    )
}

pub fn current(registry: &SessionRegistry, cid: &str) -> HandoffState {
    HandoffState::from_agent_online(registry.is_agent_online(cid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{envelope::EnvelopeBuilder, types::{LanguagePair, RawInput}};

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(
            LanguagePair {
                customer: "fr".to_string(),
                agent: "zh".to_string(),
            },
            500,
        )
    }

    fn envelope(role: Role, text: Option<&str>, image: Option<&str>) -> MessageEnvelope {
        builder()
            .normalize(
                RawInput {
                    cid: "cid_1".to_string(),
                    text: text.map(str::to_string),
                    image: image.map(str::to_string),
                    ..RawInput::default()
                },
                role,
            )
            .unwrap()
            .with_translation(Some("你好".to_string()))
            .at_seq(1)
    }

    fn reply() -> BotReply {
        BotReply {
            agent_text: "您好，有什么可以帮您？".to_string(),
            customer_text: "Bonjour, comment puis-je vous aider ?".to_string(),
        }
    }

    #[test]
    fn offline_synthesizes_a_separate_bot_envelope() {
        let trigger = envelope(Role::Customer, Some("bonjour"), None);
        let outcome = decide(HandoffState::Offline, &trigger, Some(&reply()), 2);
        let HandoffOutcome::AutoReply(bot) = outcome else {
            panic!("expected auto reply, got {outcome:?}");
        };
        assert_eq!(bot.from_role, Role::Bot);
        assert_eq!(bot.seq, 2);
        assert_eq!(bot.reply_to.as_deref(), Some(trigger.id.as_str()));
        assert!(bot.bot_reply_text.is_some());
        assert!(bot.translated_text.is_some());
        assert!(!bot.is_suggestion());
    }

    #[test]
    fn online_only_suggests() {
        let trigger = envelope(Role::Customer, Some("bonjour"), None);
        let outcome = decide(HandoffState::Online, &trigger, Some(&reply()), 2);
        let HandoffOutcome::Suggestion(draft) = outcome else {
            panic!("expected suggestion, got {outcome:?}");
        };
        assert!(draft.is_suggestion());
        assert!(draft.bot_reply_text.is_none());
        assert!(draft.translated_text.is_none());
    }

    #[test]
    fn missing_reply_is_silent_in_both_states() {
        let trigger = envelope(Role::Customer, Some("bonjour"), None);
        assert_eq!(decide(HandoffState::Offline, &trigger, None, 2), HandoffOutcome::Silent);
        assert_eq!(decide(HandoffState::Online, &trigger, None, 2), HandoffOutcome::Silent);

        let blank = BotReply {
            agent_text: "  ".to_string(),
            customer_text: String::new(),
        };
        assert_eq!(
            decide(HandoffState::Offline, &trigger, Some(&blank), 2),
            HandoffOutcome::Silent
        );
    }

    #[test]
    fn agent_messages_and_images_skip_the_bot() {
        let agent = envelope(Role::Agent, Some("您好"), None);
        assert_eq!(decide(HandoffState::Offline, &agent, Some(&reply()), 2), HandoffOutcome::Skip);

        let image = envelope(Role::Customer, None, Some("data:image/png;base64,AAAA"));
        assert_eq!(decide(HandoffState::Offline, &image, Some(&reply()), 2), HandoffOutcome::Skip);
    }

    #[test]
    fn toggle_flips_registry_state() {
        let registry = SessionRegistry::new();
        assert_eq!(current(&registry, "cid_1"), HandoffState::Online);

        let (event, changed) = toggle(&registry, "cid_1", false);
        assert_eq!(
            event,
            HandoffEvent {
                cid: "cid_1".to_string(),
                online: false
            }
        );
        assert!(changed);
        assert_eq!(current(&registry, "cid_1"), HandoffState::Offline);

        let (_, changed) = toggle(&registry, "cid_1", false);
        assert!(!changed);
    }
}
