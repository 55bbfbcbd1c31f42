//! チャット行からのメッセージ抽出
//!
//! 投稿者要素が見つからなければメッセージではない（`None`）。
//! 本文は専用要素があればそれを、無ければ行全体を複製して装飾要素を取り除いたテキストを使う。

use crate::dom::{ChatContainer, ElementNode, Selector};
use crate::text;

use super::message::ExtractedMessage;

/// 投稿者名
pub const USERNAME_SELECTORS: &[Selector] = &[Selector::class("chat-line__username")];

/// 時刻表示
pub const TIMESTAMP_SELECTORS: &[Selector] = &[Selector::class("chat-line__timestamp")];

/// 本文
pub const MESSAGE_BODY_SELECTORS: &[Selector] = &[
    Selector::attr_eq("data-test-selector", "chat-line-message-body"),
    Selector::class("chat-line__message-body"),
];

/// 本文テキストから取り除く要素
pub const BASE_REMOVE_SELECTORS: &[Selector] = &[
    Selector::class("chat-line__timestamp"),
    Selector::class("chat-line__username"),
    Selector::class("chat-line__username-container"),
    Selector::class("chat-badge"),
    Selector::attr_eq("aria-hidden", "true"),
    Selector::class("mention-fragment"),
    Selector::class("chat-line__status"),
    Selector::class("chat-line__message--system"),
];

/// リプライ文脈を示す要素
pub const REPLY_CONTEXT_SELECTORS: &[Selector] = &[
    Selector::attr_contains("data-test-selector", "reply"),
    Selector::attr_contains("data-a-target", "reply"),
    Selector::class("reply-line--mentioned-comment-author"),
    Selector::class("reply-line--mentioned-comment-text"),
];

/// リプライ宛先の投稿者名要素（優先順）
pub const REPLY_TARGET_AUTHOR_SELECTORS: &[Selector] = &[
    Selector::class("reply-line--mentioned-comment-author"),
    Selector::attr_contains("data-test-selector", "reply-author"),
    Selector::attr_contains("data-a-target", "reply-author"),
];

/// 安定IDを読む属性（優先順）
const MESSAGE_ID_ATTRIBUTES: &[&str] = &["data-message-id", "id"];

/// コンテナから抽出
pub fn extract(container: &dyn ChatContainer) -> Option<ExtractedMessage> {
    extract_from_node(&container.snapshot())
}

/// スナップショットから抽出
pub fn extract_from_node(root: &ElementNode) -> Option<ExtractedMessage> {
    let user_element = root.query(USERNAME_SELECTORS)?;
    let username = text::strip_author_suffix(&user_element.text_content());

    let time_element = root.query(TIMESTAMP_SELECTORS);
    let time_text = time_element
        .map(|e| e.text_content().trim().to_string())
        .unwrap_or_default();

    let body = extract_body(root);

    Some(ExtractedMessage {
        username,
        time_text,
        has_time: time_element.is_some(),
        raw_text: body.raw_text,
        text: body.text,
        is_reply: body.is_reply,
        reply_target_username: body.reply_target_username,
        stable_id: extract_message_id(root),
    })
}

/// ホストページが付与したメッセージID
pub fn extract_message_id(root: &ElementNode) -> String {
    MESSAGE_ID_ATTRIBUTES
        .iter()
        .filter_map(|name| root.attribute(name))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .unwrap_or_default()
        .to_string()
}

struct BodyText {
    raw_text: String,
    text: String,
    is_reply: bool,
    reply_target_username: String,
}

fn extract_body(container: &ElementNode) -> BodyText {
    let source = container.query(MESSAGE_BODY_SELECTORS).unwrap_or(container);

    let mut reply_target_username = reply_target_from(source);
    if reply_target_username.is_empty() {
        reply_target_username = reply_target_from(container);
    }

    let is_reply =
        source.contains_match(REPLY_CONTEXT_SELECTORS) || container.contains_match(REPLY_CONTEXT_SELECTORS);

    let remove: Vec<Selector> = BASE_REMOVE_SELECTORS
        .iter()
        .chain(REPLY_CONTEXT_SELECTORS)
        .copied()
        .collect();
    let raw_text = source.without(&remove).text_content().trim().to_string();

    let mut text = raw_text.clone();
    if is_reply {
        if reply_target_username.is_empty() {
            if let Some(mention) = text::leading_mention(&text) {
                reply_target_username = mention.username;
            }
        }
        if !reply_target_username.is_empty() {
            text = text::strip_leading_mentions(&text, &reply_target_username);
        }
    }

    BodyText {
        raw_text,
        text: text.trim().to_string(),
        is_reply,
        reply_target_username,
    }
}

fn reply_target_from(element: &ElementNode) -> String {
    REPLY_TARGET_AUTHOR_SELECTORS
        .iter()
        .filter_map(|selector| element.query_self_or_descendant(std::slice::from_ref(selector)))
        .map(|candidate| text::sanitize_reply_target(&candidate.text_content()))
        .find(|name| !name.is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn username(name: &str) -> ElementNode {
        ElementNode::span().with_class("chat-line__username").with_text(name)
    }

    fn timestamp(time: &str) -> ElementNode {
        ElementNode::span().with_class("chat-line__timestamp").with_text(time)
    }

    fn body(text: &str) -> ElementNode {
        ElementNode::span()
            .with_attr("data-test-selector", "chat-line-message-body")
            .with_text(text)
    }

    #[test]
    fn test_missing_author_is_not_a_message() {
        let node = ElementNode::new("div")
            .with_class("chat-line__message")
            .with_child(body("hello"));
        assert!(extract_from_node(&node).is_none());
    }

    #[test]
    fn test_basic_extraction() {
        let node = ElementNode::new("div")
            .with_class("chat-line__message")
            .with_child(timestamp("3:14"))
            .with_child(username("Zed (zed_login)"))
            .with_child(body(" !skip http://x.com "));

        let message = extract_from_node(&node).unwrap();
        assert_eq!(message.username, "Zed");
        assert_eq!(message.time_text, "3:14");
        assert!(message.has_time);
        assert_eq!(message.raw_text, "!skip http://x.com");
        assert_eq!(message.text, "!skip http://x.com");
        assert!(!message.is_reply);
        assert_eq!(message.stable_id, "");
    }

    #[test]
    fn test_body_fallback_strips_decorations() {
        let node = ElementNode::new("div")
            .with_class("chat-line__message")
            .with_child(timestamp("12:00"))
            .with_child(
                ElementNode::span()
                    .with_class("chat-line__username-container")
                    .with_child(ElementNode::span().with_class("chat-badge").with_text("VIP"))
                    .with_child(username("mo")),
            )
            .with_child(ElementNode::span().with_attr("aria-hidden", "true").with_text(": "))
            .with_child(ElementNode::span().with_text("hi hi hi there"));

        let message = extract_from_node(&node).unwrap();
        assert_eq!(message.username, "mo");
        assert_eq!(message.raw_text, "hi hi hi there");
    }

    #[test]
    fn test_stable_id_from_attributes() {
        let node = ElementNode::new("div")
            .with_attr("data-message-id", " abc ")
            .with_attr("id", "dom-id")
            .with_child(username("mo"))
            .with_child(body("hi"));
        assert_eq!(extract_from_node(&node).unwrap().stable_id, "abc");

        let node = ElementNode::new("div")
            .with_attr("id", "dom-id")
            .with_child(username("mo"))
            .with_child(body("hi"));
        assert_eq!(extract_from_node(&node).unwrap().stable_id, "dom-id");
    }

    #[test]
    fn test_reply_target_from_reply_author_element() {
        let node = ElementNode::new("div")
            .with_child(
                ElementNode::new("div")
                    .with_attr("data-test-selector", "chat-reply-header")
                    .with_child(
                        ElementNode::span()
                            .with_class("reply-line--mentioned-comment-author")
                            .with_text("@bob:"),
                    )
                    .with_child(
                        ElementNode::span()
                            .with_class("reply-line--mentioned-comment-text")
                            .with_text("original message"),
                    ),
            )
            .with_child(username("alice"))
            .with_child(ElementNode::span().with_text("@bob @bob gg"));

        let message = extract_from_node(&node).unwrap();
        assert!(message.is_reply);
        assert_eq!(message.reply_target_username, "bob");
        assert_eq!(message.raw_text, "@bob @bob gg");
        assert_eq!(message.text, "gg");
    }

    #[test]
    fn test_reply_target_from_leading_mention() {
        let node = ElementNode::new("div")
            .with_child(ElementNode::new("div").with_attr("data-a-target", "reply-context"))
            .with_child(username("alice"))
            .with_child(ElementNode::span().with_text("＠Ｂｏｂ ＠bob おはよう"));

        let message = extract_from_node(&node).unwrap();
        assert!(message.is_reply);
        assert_eq!(message.reply_target_username, "Ｂｏｂ");
        assert_eq!(message.text, "おはよう");
    }

    #[test]
    fn test_mentions_kept_without_reply_context() {
        let node = ElementNode::new("div")
            .with_child(username("alice"))
            .with_child(ElementNode::span().with_text("@bob gg"));

        let message = extract_from_node(&node).unwrap();
        assert!(!message.is_reply);
        assert_eq!(message.text, "@bob gg");
    }
}
