//! 要素セレクタ
//!
//! チャット行の判定に必要な範囲（クラス、属性の完全一致・部分一致）だけを扱う。

use std::fmt;

/// 属性比較方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrOp {
    /// `[name="value"]`
    Equals,
    /// `[name*="value"]`
    Contains,
}

/// 要素セレクタ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// `.class`
    Class(&'static str),
    /// `tag[name="value"]` / `[name*="value"]`
    Attr {
        tag: Option<&'static str>,
        name: &'static str,
        op: AttrOp,
        value: &'static str,
    },
}

impl Selector {
    pub const fn class(name: &'static str) -> Self {
        Self::Class(name)
    }

    pub const fn attr_eq(name: &'static str, value: &'static str) -> Self {
        Self::Attr {
            tag: None,
            name,
            op: AttrOp::Equals,
            value,
        }
    }

    pub const fn attr_contains(name: &'static str, value: &'static str) -> Self {
        Self::Attr {
            tag: None,
            name,
            op: AttrOp::Contains,
            value,
        }
    }

    /// タグ名で限定した属性セレクタ
    pub const fn tag_attr_eq(tag: &'static str, name: &'static str, value: &'static str) -> Self {
        Self::Attr {
            tag: Some(tag),
            name,
            op: AttrOp::Equals,
            value,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Class(name) => write!(f, ".{}", name),
            Selector::Attr {
                tag,
                name,
                op,
                value,
            } => {
                let op = match op {
                    AttrOp::Equals => "=",
                    AttrOp::Contains => "*=",
                };
                write!(f, "{}[{}{}\"{}\"]", tag.unwrap_or(""), name, op, value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_css_syntax() {
        assert_eq!(
            Selector::class("chat-line__message").to_string(),
            ".chat-line__message"
        );
        assert_eq!(
            Selector::tag_attr_eq("div", "data-test-selector", "chat-line-message").to_string(),
            "div[data-test-selector=\"chat-line-message\"]"
        );
        assert_eq!(
            Selector::attr_contains("data-a-target", "reply").to_string(),
            "[data-a-target*=\"reply\"]"
        );
    }
}
