use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::{
    config::LlmConfig,
    error::{Error, Result},
    handoff::HandoffState,
    llm::{self, ChatTurn},
};

/// What the bot is told about the turn it answers.
#[derive(Debug, Clone)]
pub struct BotContext {
    pub cid: String,
    pub customer_lang: String,
    pub agent_lang: String,
    pub state: HandoffState,
}

/// Produces a reply in the agent language for a customer message that has
/// already been translated into the agent language.
#[async_trait]
pub trait BotResponder: Send + Sync {
    async fn reply(&self, text: &str, ctx: &BotContext) -> Result<String>;

    /// Drops whatever the responder keeps for `cid`.
    fn forget(&self, _cid: &str) {}
}

pub struct KeywordRule {
    pattern: Regex,
    answer: String,
}

impl KeywordRule {
    pub fn new(pattern: &str, answer: &str) -> Result<Self> {
        let pattern = Regex::new(&format!("(?i){pattern}"))
            .map_err(|err| Error::Config(format!("invalid keyword pattern {pattern:?}: {err}")))?;
        Ok(Self {
            pattern,
            answer: answer.to_string(),
        })
    }
}

/// First tier: canned answers picked by keyword.
pub struct KeywordBot {
    rules: Vec<KeywordRule>,
}

const DEFAULT_RULES: [(&str, &str); 7] = [
    (
        "注册|开户|开通|register|sign ?up",
        "您好，注册只需手机或邮箱即可完成，1分钟内通过验证码激活账号。",
    ),
    (
        "登录|登入|登陆|log ?in|password",
        "您好，登录支持账号加密码或短信验证码。如忘记密码可在登录页找回。",
    ),
    (
        "充值|存款|入金|top ?up|deposit",
        "您好，充值支持银行卡、电子钱包等方式，实时到账，无手续费。",
    ),
    (
        "提现|取款|出金|withdraw|cash ?out",
        "您好，提现提交后一般5到30分钟到账，请确保账户已完成实名与绑定。",
    ),
    (
        "优惠|活动|折扣|返利|bonus|promo",
        "您好，当前有新手礼包与每日返利，详情请在优惠活动页面查看。",
    ),
    (
        "规则|玩法|how to play|rules",
        "您好，游戏规则可在对应游戏入口的玩法说明查看。",
    ),
    (
        "安全|风控|2fa|kyc|verify",
        "您好，为保障账号安全，请开启二次验证并勿泄露验证码与密码。",
    ),
];

impl KeywordBot {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        Self { rules }
    }

    pub fn with_default_rules() -> Result<Self> {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(pattern, answer)| KeywordRule::new(pattern, answer))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn lookup(&self, text: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(text))
            .map(|rule| rule.answer.as_str())
    }
}

#[async_trait]
impl BotResponder for KeywordBot {
    async fn reply(&self, text: &str, _ctx: &BotContext) -> Result<String> {
        self.lookup(text)
            .map(str::to_string)
            .ok_or_else(|| Error::bot("no keyword rule matched"))
    }
}

/// Keeps the system prompt plus this many trailing turns per conversation.
const HISTORY_TURNS: usize = 24;

/// OpenAI-compatible chat completions with per-conversation history.
pub struct ChatCompletionBot {
    client: reqwest::Client,
    config: LlmConfig,
    system_prompt: String,
    history: DashMap<String, Vec<ChatTurn>>,
}

impl ChatCompletionBot {
    pub fn new(client: reqwest::Client, config: LlmConfig, system_prompt: String) -> Self {
        Self {
            client,
            config,
            system_prompt,
            history: DashMap::new(),
        }
    }

    fn messages_for(&self, cid: &str, text: &str) -> Vec<ChatTurn> {
        let mut messages = vec![ChatTurn::system(self.system_prompt.clone())];
        if let Some(turns) = self.history.get(cid) {
            messages.extend(turns.iter().cloned());
        }
        messages.push(ChatTurn::user(text));
        messages
    }

    /// Only replies the customer actually receives become history; an
    /// online-state draft may never be sent.
    fn record(&self, ctx: &BotContext, user: &str, assistant: &str) {
        if ctx.state.is_online() {
            return;
        }
        let mut turns = self.history.entry(ctx.cid.clone()).or_default();
        turns.push(ChatTurn::user(user));
        turns.push(ChatTurn::assistant(assistant));
        let excess = turns.len().saturating_sub(HISTORY_TURNS);
        turns.drain(..excess);
    }

    pub fn history_len(&self, cid: &str) -> usize {
        self.history.get(cid).map(|turns| turns.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BotResponder for ChatCompletionBot {
    async fn reply(&self, text: &str, ctx: &BotContext) -> Result<String> {
        let messages = self.messages_for(&ctx.cid, text);
        let reply = llm::complete(&self.client, &self.config, &messages, 256, 0.7)
            .await
            .map_err(|err| Error::bot(err.to_string()))?;
        if reply.is_empty() {
            return Err(Error::bot("completion had empty content"));
        }

        self.record(ctx, text, &reply);
        Ok(reply)
    }

    fn forget(&self, cid: &str) {
        self.history.remove(cid);
    }
}

/// Tries each tier in order; the first non-empty answer wins.
pub struct BotChain {
    tiers: Vec<Arc<dyn BotResponder>>,
}

impl BotChain {
    pub fn new(tiers: Vec<Arc<dyn BotResponder>>) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl BotResponder for BotChain {
    async fn reply(&self, text: &str, ctx: &BotContext) -> Result<String> {
        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.reply(text, ctx).await {
                Ok(reply) if !reply.trim().is_empty() => return Ok(reply.trim().to_string()),
                Ok(_) => debug!(cid = %ctx.cid, tier = index, "bot tier returned empty reply"),
                Err(err) => debug!(cid = %ctx.cid, tier = index, error = %err, "bot tier declined"),
            }
        }
        warn!(cid = %ctx.cid, "no bot tier produced a reply");
        Err(Error::bot("no tier produced a reply"))
    }

    fn forget(&self, cid: &str) {
        for tier in &self.tiers {
            tier.forget(cid);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ctx_in(state: HandoffState) -> BotContext {
        BotContext {
            cid: "cid_1".to_string(),
            customer_lang: "fr".to_string(),
            agent_lang: "zh".to_string(),
            state,
        }
    }

    fn ctx() -> BotContext {
        ctx_in(HandoffState::Offline)
    }

    fn completion_bot() -> ChatCompletionBot {
        ChatCompletionBot::new(
            reqwest::Client::new(),
            LlmConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: "sk-noauth".to_string(),
                model: "test".to_string(),
                timeout: Duration::from_millis(500),
            },
            "system".to_string(),
        )
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl BotResponder for Fixed {
        async fn reply(&self, _text: &str, _ctx: &BotContext) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn keyword_rules_match_aliases_case_insensitively() {
        let bot = KeywordBot::with_default_rules().unwrap();
        assert!(bot.lookup("我想充值").unwrap().contains("充值"));
        assert!(bot.lookup("How do I WITHDRAW?").unwrap().contains("提现"));
        assert!(bot.lookup("天气怎么样").is_none());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(KeywordRule::new("(unclosed", "x").is_err());
    }

    #[test]
    fn history_keeps_latest_turns() {
        let bot = completion_bot();
        for round in 0..20 {
            bot.record(&ctx(), &format!("q{round}"), &format!("a{round}"));
        }
        assert_eq!(bot.history_len("cid_1"), HISTORY_TURNS);
        assert_eq!(bot.history_len("cid_2"), 0);

        let messages = bot.messages_for("cid_1", "next");
        assert_eq!(messages.first().unwrap().role, "system");
        assert_eq!(messages.last().unwrap().content, "next");
        assert_eq!(messages[1].content, "q8");
    }

    #[test]
    fn unsent_suggestions_stay_out_of_history() {
        let bot = completion_bot();
        bot.record(&ctx_in(HandoffState::Online), "bonjour", "您好");
        assert_eq!(bot.history_len("cid_1"), 0);

        bot.record(&ctx(), "bonjour", "您好");
        assert_eq!(bot.history_len("cid_1"), 2);
    }

    #[test]
    fn forgetting_a_conversation_clears_its_history() {
        let bot = Arc::new(completion_bot());
        bot.record(&ctx(), "bonjour", "您好");
        let chain = BotChain::new(vec![
            bot.clone() as Arc<dyn BotResponder>,
            Arc::new(Fixed("x")),
        ]);
        chain.forget("cid_1");
        assert_eq!(bot.history_len("cid_1"), 0);
    }

    #[tokio::test]
    async fn unreachable_model_declines() {
        let bot = completion_bot();
        assert!(matches!(
            bot.reply("bonjour", &ctx()).await,
            Err(Error::BotUnavailable(_))
        ));
        assert_eq!(bot.history_len("cid_1"), 0);
    }

    #[tokio::test]
    async fn chain_falls_through_to_next_tier() {
        let chain = BotChain::new(vec![
            Arc::new(KeywordBot::with_default_rules().unwrap()),
            Arc::new(Fixed("您好")),
        ]);
        assert_eq!(chain.reply("天气怎么样", &ctx()).await.unwrap(), "您好");
        assert!(chain.reply("充值", &ctx()).await.unwrap().contains("充值"));
    }

    #[tokio::test]
    async fn empty_chain_is_unavailable() {
        let chain = BotChain::new(vec![Arc::new(Fixed("  "))]);
        assert!(matches!(
            chain.reply("bonjour", &ctx()).await,
            Err(Error::BotUnavailable(_))
        ));
    }
}
