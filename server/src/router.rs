//! Maps an envelope and a viewer to the directives each owned panel paints.
//!
//! Rules per panel:
//! 1. image: verbatim, right in the author's own panel, left elsewhere
//! 2. customer text: original right in the customer panel, translation left for the agent
//! 3. agent text: original right for the agent, translation left for the customer
//! 4. bot reply: customer-language left for the customer, agent-language right for the agent
//! 5. suggestion: agent panel only, right
//!
//! A panel that already painted its own message optimistically (local echo)
//! gets a suppressed directive, so every message is painted once per panel.

use crate::types::{
    Alignment, ContentVariant, MessageEnvelope, Panel, RenderDirective, Role, Viewer,
};

fn directive(
    envelope: &MessageEnvelope,
    panel: Panel,
    alignment: Alignment,
    variant: ContentVariant,
    content: &str,
) -> RenderDirective {
    RenderDirective {
        target_panel: panel,
        alignment,
        content_variant: variant,
        suppress: false,
        envelope_id: envelope.id.clone(),
        author: envelope.from_role,
        content: content.to_string(),
        timestamp: envelope.timestamp.clone(),
    }
}

fn translated_or_original(envelope: &MessageEnvelope) -> &str {
    envelope
        .translated_text
        .as_deref()
        .or(envelope.original_text.as_deref())
        .unwrap_or_default()
}

fn for_panel(envelope: &MessageEnvelope, panel: Panel) -> Option<RenderDirective> {
    if let Some(image) = envelope.image_payload.as_deref() {
        let alignment = if envelope.from_role == panel.owner() {
            Alignment::Right
        } else {
            Alignment::Left
        };
        return Some(directive(envelope, panel, alignment, ContentVariant::Image, image));
    }

    if let Some(draft) = envelope.suggestion_text.as_deref() {
        return match panel {
            Panel::Agent => Some(directive(
                envelope,
                panel,
                Alignment::Right,
                ContentVariant::Suggestion,
                draft,
            )),
            Panel::Customer => None,
        };
    }

    match (envelope.from_role, panel) {
        (Role::Customer, Panel::Customer) | (Role::Agent, Panel::Agent) => Some(directive(
            envelope,
            panel,
            Alignment::Right,
            ContentVariant::Original,
            envelope.original_text.as_deref()?,
        )),
        (Role::Customer, Panel::Agent) | (Role::Agent, Panel::Customer) => Some(directive(
            envelope,
            panel,
            Alignment::Left,
            ContentVariant::Translated,
            translated_or_original(envelope),
        )),
        (Role::Bot, Panel::Customer) => Some(directive(
            envelope,
            panel,
            Alignment::Left,
            ContentVariant::Bot,
            envelope
                .translated_text
                .as_deref()
                .or(envelope.bot_reply_text.as_deref())?,
        )),
        (Role::Bot, Panel::Agent) => Some(directive(
            envelope,
            panel,
            Alignment::Right,
            ContentVariant::Bot,
            envelope.bot_reply_text.as_deref()?,
        )),
    }
}

/// Every directive for `viewer`, including suppressed local echoes.
pub fn plan(envelope: &MessageEnvelope, viewer: Viewer, is_local_echo: bool) -> Vec<RenderDirective> {
    viewer
        .panels()
        .iter()
        .filter_map(|panel| {
            let mut directive = for_panel(envelope, *panel)?;
            directive.suppress = is_local_echo && envelope.from_role == panel.owner();
            Some(directive)
        })
        .collect()
}

/// Directives the viewer should actually paint.
pub fn route(envelope: &MessageEnvelope, viewer: Viewer, is_local_echo: bool) -> Vec<RenderDirective> {
    plan(envelope, viewer, is_local_echo)
        .into_iter()
        .filter(|directive| !directive.suppress)
        .collect()
}
