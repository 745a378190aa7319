use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    bot::{BotContext, BotResponder},
    envelope::EnvelopeBuilder,
    error::{Error, Result},
    handoff::{self, HandoffOutcome, HandoffState},
    registry::SessionRegistry,
    translate::{translate_or_original, Translator, AUTO_DETECT},
    typing::TypingNotifier,
    types::{
        AttentionEvent, BotReply, HandoffEvent, MessageEnvelope, RawInput, Role, TypingSignal,
    },
};

/// Events the pipeline asks the transport to deliver, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(MessageEnvelope),
    Status(HandoffEvent),
    Typing(TypingSignal),
    Attention(AttentionEvent),
}

/// Exclusive slot in one conversation's event stream. Everything done while
/// a turn is held (including delivering its outbound events) happens in
/// arrival order for that cid.
pub struct Turn {
    cid: String,
    _guard: OwnedMutexGuard<()>,
}

impl Turn {
    pub fn cid(&self) -> &str {
        &self.cid
    }
}

/// Upper bound on one bot answer; a slower bot counts as unavailable.
pub const DEFAULT_BOT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Pipeline {
    registry: SessionRegistry,
    builder: EnvelopeBuilder,
    translator: Arc<dyn Translator>,
    bot: Arc<dyn BotResponder>,
    bot_timeout: Duration,
    typing: TypingNotifier,
    streams: DashMap<String, Arc<Mutex<()>>>,
}

impl Pipeline {
    pub fn new(
        builder: EnvelopeBuilder,
        translator: Arc<dyn Translator>,
        bot: Arc<dyn BotResponder>,
        typing: TypingNotifier,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            builder,
            translator,
            bot,
            bot_timeout: DEFAULT_BOT_TIMEOUT,
            typing,
            streams: DashMap::new(),
        }
    }

    pub fn with_bot_timeout(mut self, timeout: Duration) -> Self {
        self.bot_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn begin(&self, cid: &str) -> Result<Turn> {
        let cid = cid.trim();
        if cid.is_empty() {
            return Err(Error::validation("cid is required"));
        }
        let stream = self.streams.entry(cid.to_string()).or_default().clone();
        Ok(Turn {
            cid: cid.to_string(),
            _guard: stream.lock_owned().await,
        })
    }

    /// Begins a turn and ingests in one step.
    pub async fn handle(&self, raw: RawInput, role: Role) -> Result<Vec<Outbound>> {
        let turn = self.begin(&raw.cid).await?;
        self.ingest(&turn, raw, role).await
    }

    /// Drops per-conversation bookkeeping once nobody watches `cid`. Presence
    /// and sequence numbers stay in the registry.
    pub fn release(&self, cid: &str) {
        self.streams.remove_if(cid, |_, stream| Arc::strong_count(stream) == 1);
        self.typing.forget(cid);
        self.bot.forget(cid);
        debug!(cid = %cid, "conversation released");
    }

    pub async fn ingest(&self, turn: &Turn, raw: RawInput, role: Role) -> Result<Vec<Outbound>> {
        if role == Role::Bot {
            return Err(Error::validation("bot messages are synthesized, not ingested"));
        }

        let envelope = self.builder.normalize(raw, role)?;
        if envelope.cid != turn.cid {
            return Err(Error::validation("message cid does not match the open turn"));
        }
        let cid = envelope.cid.clone();
        self.registry.get_or_create(&cid);

        let envelope = match envelope.source_text().map(str::to_string) {
            Some(text) => {
                // Customers may write in any language.
                let source = match envelope.from_role {
                    Role::Customer => AUTO_DETECT,
                    _ => envelope.original_lang.as_str(),
                };
                let translated = translate_or_original(
                    self.translator.as_ref(),
                    &text,
                    source,
                    &envelope.translated_lang,
                )
                .await;
                envelope.with_translation(translated)
            }
            None => envelope,
        };
        let envelope = envelope.at_seq(self.registry.next_seq(&cid));

        info!(
            cid = %cid,
            seq = envelope.seq,
            from = envelope.from_role.as_str(),
            image = envelope.is_image(),
            "message accepted"
        );

        let mut outbound = vec![Outbound::Message(envelope.clone())];
        if !handoff::engages_bot(&envelope) {
            return Ok(outbound);
        }

        let state = handoff::current(&self.registry, &cid);
        let reply = self.bot_reply(&envelope, state).await;
        let seq = if reply.is_some() {
            self.registry.next_seq(&cid)
        } else {
            0
        };

        match handoff::decide(state, &envelope, reply.as_ref(), seq) {
            HandoffOutcome::AutoReply(bot) => {
                info!(cid = %cid, seq = bot.seq, "bot answered customer");
                outbound.push(Outbound::Message(bot));
            }
            HandoffOutcome::Suggestion(draft) => {
                debug!(cid = %cid, seq = draft.seq, "bot drafted a suggestion");
                outbound.push(Outbound::Message(draft));
            }
            HandoffOutcome::Silent if state == HandoffState::Offline => {
                warn!(cid = %cid, "no bot reply while agent offline, flagging for follow-up");
                outbound.push(Outbound::Attention(AttentionEvent {
                    cid: cid.clone(),
                    reason: "bot reply unavailable; customer is waiting for a human".to_string(),
                }));
            }
            HandoffOutcome::Silent | HandoffOutcome::Skip => {}
        }

        Ok(outbound)
    }

    async fn bot_reply(&self, trigger: &MessageEnvelope, state: HandoffState) -> Option<BotReply> {
        let languages = self.builder.languages();
        let ctx = BotContext {
            cid: trigger.cid.clone(),
            customer_lang: trigger.original_lang.clone(),
            agent_lang: languages.agent.clone(),
            state,
        };
        let question = trigger
            .translated_text
            .as_deref()
            .or(trigger.original_text.as_deref())?;

        let answer = tokio::time::timeout(self.bot_timeout, self.bot.reply(question, &ctx)).await;
        let agent_text = match answer {
            Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(Ok(_)) => return None,
            Ok(Err(err)) => {
                warn!(cid = %ctx.cid, error = %err, "bot reply failed");
                return None;
            }
            Err(_) => {
                warn!(
                    cid = %ctx.cid,
                    timeout_ms = self.bot_timeout.as_millis() as u64,
                    "bot reply timed out"
                );
                return None;
            }
        };

        // A suggestion stays in the agent panel and needs no customer rendering.
        let customer_text = if state.is_online() {
            agent_text.clone()
        } else {
            translate_or_original(
                self.translator.as_ref(),
                &agent_text,
                &ctx.agent_lang,
                &ctx.customer_lang,
            )
            .await
            .unwrap_or_else(|| agent_text.clone())
        };

        Some(BotReply {
            agent_text,
            customer_text,
        })
    }

    /// Agent toggle; the returned event goes to every viewer of the cid.
    pub fn set_agent_online(&self, cid: &str, online: bool) -> Result<Outbound> {
        let cid = cid.trim();
        if cid.is_empty() {
            return Err(Error::validation("cid is required"));
        }
        let (event, changed) = handoff::toggle(&self.registry, cid, online);
        info!(cid = %cid, online, changed, "agent presence set");
        Ok(Outbound::Status(event))
    }

    pub fn status(&self, cid: &str) -> HandoffEvent {
        HandoffEvent {
            cid: cid.to_string(),
            online: self.registry.is_agent_online(cid),
        }
    }

    pub fn typing(&self, cid: &str, role: Role) -> Option<Outbound> {
        let cid = cid.trim();
        if cid.is_empty() {
            return None;
        }
        let signal = self.typing.notify_typing(cid, role)?;
        self.registry.touch_typing(cid);
        Some(Outbound::Typing(signal))
    }
}
