use minijinja::{context, Environment};

const BOT_SYSTEM_TEMPLATE: &str = include_str!("prompts/bot_system.j2");

pub const DEFAULT_TOPICS: [&str; 7] = [
    "registration",
    "login",
    "deposit",
    "withdrawal",
    "promotions",
    "game rules",
    "account security",
];

pub struct BotPromptContext<'a> {
    pub bot_name: &'a str,
    pub workspace_name: &'a str,
    pub reply_lang: &'a str,
    pub topics: &'a [&'a str],
}

pub fn render_bot_prompt(ctx: &BotPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("bot_system", BOT_SYSTEM_TEMPLATE)
        .is_err()
    {
        return fallback_bot_prompt(ctx);
    }

    let Ok(template) = env.get_template("bot_system") else {
        return fallback_bot_prompt(ctx);
    };

    template
        .render(context! {
            bot_name => display_bot_name(ctx),
            workspace_name => ctx.workspace_name.trim(),
            reply_lang => ctx.reply_lang,
            topics => ctx.topics,
        })
        .unwrap_or_else(|_| fallback_bot_prompt(ctx))
}

fn display_bot_name<'a>(ctx: &BotPromptContext<'a>) -> &'a str {
    if ctx.bot_name.trim().is_empty() {
        "Support"
    } else {
        ctx.bot_name.trim()
    }
}

fn fallback_bot_prompt(ctx: &BotPromptContext<'_>) -> String {
    format!(
        "You are {}, a customer support assistant.\n\
         Answer only questions about: {}.\n\
         Keep replies short. Write in the language with code \"{}\".\n\
         Output only the final reply text.\n",
        display_bot_name(ctx),
        ctx.topics.join(", "),
        ctx.reply_lang,
    )
}

/// System and user prompts asking a chat model to translate `text` into `target`.
pub fn translation_prompts(target: &str, text: &str) -> (String, String) {
    match target {
        "zh" => (
            "你是一名专业翻译，仅负责把给定文本翻译成简体中文。只输出译文，不要任何解释或前后缀。"
                .to_string(),
            format!("将以下内容翻译成简体中文：\n\n{text}"),
        ),
        "fr" => (
            "Vous êtes un traducteur professionnel. Traduisez le texte fourni en français. \
             Répondez uniquement par la traduction, sans explications."
                .to_string(),
            format!("Traduisez en français:\n\n{text}"),
        ),
        other => (
            "You are a professional translator. Translate the provided text into the target \
             language. Output only the translation, with no extra text."
                .to_string(),
            format!("Target language: {other}\nText:\n{text}"),
        ),
    }
}
