//! Provider-agnostic message preparation.
//!
//! Runs between capability negotiation and the adapter's wire encoding:
//! filters empty messages, degrades unsupported content to inline text
//! notices, inlines documents and search results, and performs the one-shot
//! system-to-user rewrite for providers without a system role.

use tracing::{debug, warn};

use crate::capabilities::Capabilities;
use crate::types::{
    ChatMessage, ChatOptions, ChatRole, ContentBlock, DocumentSource, MessageContent, SearchResult,
};

/// Prepare messages for one provider round trip.
///
/// The result is safe for any adapter whose capabilities were consulted:
/// no empty messages, no image blocks unless `caps.vision`, no document
/// blocks unless `caps.documents`.
pub fn prepare_messages(
    messages: &[ChatMessage],
    options: &mut ChatOptions,
    caps: &Capabilities,
) -> Vec<ChatMessage> {
    let mut prepared: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .cloned()
        .collect();

    fold_system_messages(&mut prepared, options);

    if !caps.vision {
        degrade_images(&mut prepared);
    }
    if !caps.documents {
        inline_documents(&mut prepared);
    }

    if !options.documents.is_empty() || !options.search_results.is_empty() {
        inject_context(&mut prepared, options, caps);
    }

    prepared
}

/// Merge system-role transcript messages into the system prompt option, so
/// their content reaches the wire through the provider's system field (or the
/// user-message rewrite when the provider has no system role).
fn fold_system_messages(messages: &mut Vec<ChatMessage>, options: &mut ChatOptions) {
    let mut parts: Vec<String> = options.system_prompt.take().into_iter().collect();
    let existing = parts.len();
    messages.retain(|m| {
        if m.role == ChatRole::System {
            parts.push(m.content.as_text());
            false
        } else {
            true
        }
    });
    if parts.len() > existing {
        debug!(
            count = parts.len() - existing,
            "folding system messages into the system prompt"
        );
    }
    if !parts.is_empty() {
        options.system_prompt = Some(parts.join("\n\n"));
    }
}

/// Replace image blocks with a counted textual notice on the nearest user
/// turn. Never drops silently, never errors.
fn degrade_images(messages: &mut [ChatMessage]) {
    for msg in messages.iter_mut() {
        let MessageContent::Blocks(blocks) = &msg.content else {
            continue;
        };
        let image_count = blocks
            .iter()
            .filter(|b| matches!(b, ContentBlock::Image { .. }))
            .count();
        if image_count == 0 {
            continue;
        }

        warn!(
            count = image_count,
            "provider lacks vision, replacing images with text notice"
        );
        let mut kept: Vec<ContentBlock> = blocks
            .iter()
            .filter(|b| !matches!(b, ContentBlock::Image { .. }))
            .cloned()
            .collect();
        let noun = if image_count == 1 { "image" } else { "images" };
        kept.push(ContentBlock::Text {
            text: format!(
                "[{} {} unavailable: this model does not support image input]",
                image_count, noun
            ),
        });
        msg.content = MessageContent::Blocks(kept);
    }
}

/// Flatten document blocks into plain text context for providers without
/// native document support.
fn inline_documents(messages: &mut [ChatMessage]) {
    for msg in messages.iter_mut() {
        let MessageContent::Blocks(blocks) = &msg.content else {
            continue;
        };
        if !blocks.iter().any(|b| matches!(b, ContentBlock::Document { .. })) {
            continue;
        }
        let rewritten = blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Document { source, title, .. } => ContentBlock::Text {
                    text: document_as_text(source, title.as_deref()),
                },
                other => other.clone(),
            })
            .collect();
        msg.content = MessageContent::Blocks(rewritten);
    }
}

fn document_as_text(source: &DocumentSource, title: Option<&str>) -> String {
    let title = title.unwrap_or("document");
    match source {
        DocumentSource::Text { data, .. } => {
            format!("<document title=\"{}\">\n{}\n</document>", title, data)
        }
        DocumentSource::Base64 { media_type, .. } => format!(
            "[Document \"{}\" ({}) unavailable: this model does not support document input]",
            title, media_type
        ),
    }
}

/// Attach option-level documents and search results ahead of the latest user
/// turn, as native blocks where supported and inline text otherwise.
fn inject_context(messages: &mut Vec<ChatMessage>, options: &ChatOptions, caps: &Capabilities) {
    let mut context_blocks: Vec<ContentBlock> = Vec::new();

    for doc in &options.documents {
        match doc {
            ContentBlock::Document { source, title, .. } if !caps.documents => {
                context_blocks.push(ContentBlock::Text {
                    text: document_as_text(source, title.as_deref()),
                });
            }
            other => context_blocks.push(other.clone()),
        }
    }
    for sr in &options.search_results {
        context_blocks.push(ContentBlock::Text {
            text: render_search_result(sr),
        });
    }

    if context_blocks.is_empty() {
        return;
    }
    debug!(blocks = context_blocks.len(), "injecting context blocks");

    // Prepend to the last user message so the context sits next to the
    // question it supports.
    if let Some(msg) = messages
        .iter_mut()
        .rev()
        .find(|m| m.role == ChatRole::User)
    {
        let mut blocks = context_blocks;
        match &msg.content {
            MessageContent::Text(text) => blocks.push(ContentBlock::Text { text: text.clone() }),
            MessageContent::Blocks(existing) => blocks.extend(existing.iter().cloned()),
        }
        msg.content = MessageContent::Blocks(blocks);
    } else {
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Blocks(context_blocks),
        });
    }
}

fn render_search_result(sr: &SearchResult) -> String {
    format!(
        "<search_result source=\"{}\" title=\"{}\">\n{}\n</search_result>",
        sr.source, sr.title, sr.content
    )
}

/// Rewrite the system prompt into a leading `[System Instructions]` user
/// message. Used for providers without a system role, and as the one-shot
/// retry after a system-role rejection.
pub fn system_prompt_to_user_message(
    messages: &[ChatMessage],
    system_prompt: &str,
) -> Vec<ChatMessage> {
    let mut rewritten = Vec::with_capacity(messages.len() + 1);
    rewritten.push(ChatMessage::user(format!(
        "[System Instructions]\n{}",
        system_prompt
    )));
    rewritten.extend(
        messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .cloned(),
    );
    rewritten
}
