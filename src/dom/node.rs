//! 要素スナップショット
//!
//! ホストページ上の要素をある時点で写し取った木構造。抽出処理はこの値だけを見る。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::selector::{AttrOp, Selector};

/// 子ノード（テキストまたは要素）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Text(String),
    Element(ElementNode),
}

impl From<ElementNode> for Node {
    fn from(element: ElementNode) -> Self {
        Node::Element(element)
    }
}

impl From<&str> for Node {
    fn from(text: &str) -> Self {
        Node::Text(text.to_string())
    }
}

fn default_tag() -> String {
    "div".to_string()
}

/// 要素ノード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementNode {
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Default for ElementNode {
    fn default() -> Self {
        Self::new("div")
    }
}

impl ElementNode {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            classes: Vec::new(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// `<span>`要素を作成
    pub fn span() -> Self {
        Self::new("span")
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn with_child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// セレクタに一致するか
    pub fn matches(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Class(name) => self.has_class(name),
            Selector::Attr {
                tag,
                name,
                op,
                value,
            } => {
                if tag.is_some_and(|t| !self.tag.eq_ignore_ascii_case(t)) {
                    return false;
                }
                match (self.attribute(name), op) {
                    (Some(actual), AttrOp::Equals) => actual == *value,
                    (Some(actual), AttrOp::Contains) => actual.contains(value),
                    (None, _) => false,
                }
            }
        }
    }

    /// いずれかのセレクタに一致するか
    pub fn matches_any(&self, selectors: &[Selector]) -> bool {
        selectors.iter().any(|s| self.matches(s))
    }

    /// 子孫要素（自身を除く）を文書順に列挙
    pub fn descendants(&self) -> Vec<&ElementNode> {
        let mut result = Vec::new();
        self.collect_descendants(&mut result);
        result
    }

    fn collect_descendants<'a>(&'a self, out: &mut Vec<&'a ElementNode>) {
        for child in &self.children {
            if let Node::Element(element) = child {
                out.push(element);
                element.collect_descendants(out);
            }
        }
    }

    /// いずれかのセレクタに一致する最初の子孫要素
    pub fn query(&self, selectors: &[Selector]) -> Option<&ElementNode> {
        self.descendants()
            .into_iter()
            .find(|element| element.matches_any(selectors))
    }

    /// 自身が一致すれば自身、そうでなければ最初に一致する子孫
    pub fn query_self_or_descendant(&self, selectors: &[Selector]) -> Option<&ElementNode> {
        if self.matches_any(selectors) {
            Some(self)
        } else {
            self.query(selectors)
        }
    }

    /// 自身または子孫にいずれかのセレクタに一致する要素があるか
    pub fn contains_match(&self, selectors: &[Selector]) -> bool {
        self.query_self_or_descendant(selectors).is_some()
    }

    /// 全テキストを連結
    pub fn text_content(&self) -> String {
        let mut text = String::new();
        self.collect_text(&mut text);
        text
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    /// セレクタに一致する子孫を取り除いた複製
    pub fn without(&self, selectors: &[Selector]) -> ElementNode {
        let mut clone = self.clone();
        clone.remove_matching(selectors);
        clone
    }

    fn remove_matching(&mut self, selectors: &[Selector]) {
        self.children.retain(|child| match child {
            Node::Element(e) => !e.matches_any(selectors),
            Node::Text(_) => true,
        });
        for child in &mut self.children {
            if let Node::Element(e) = child {
                e.remove_matching(selectors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ElementNode {
        ElementNode::new("div")
            .with_class("chat-line__message")
            .with_attr("data-message-id", "m1")
            .with_child(
                ElementNode::span()
                    .with_class("chat-line__username")
                    .with_text("Zed"),
            )
            .with_child(
                ElementNode::span()
                    .with_attr("aria-hidden", "true")
                    .with_text(": "),
            )
            .with_child(
                ElementNode::span()
                    .with_attr("data-a-target", "chat-message-text")
                    .with_text("hello"),
            )
    }

    #[test]
    fn test_matches_and_query() {
        let node = sample();
        assert!(node.matches(&Selector::class("chat-line__message")));
        assert!(!node.matches(&Selector::tag_attr_eq("span", "data-message-id", "m1")));

        let user = node.query(&[Selector::class("chat-line__username")]).unwrap();
        assert_eq!(user.text_content(), "Zed");

        let text = node
            .query(&[Selector::attr_contains("data-a-target", "message")])
            .unwrap();
        assert_eq!(text.text_content(), "hello");
    }

    #[test]
    fn test_query_excludes_self() {
        let node = sample();
        assert!(node.query(&[Selector::class("chat-line__message")]).is_none());
        assert!(node
            .query_self_or_descendant(&[Selector::class("chat-line__message")])
            .is_some());
    }

    #[test]
    fn test_without_strips_descendants() {
        let node = sample();
        let stripped = node.without(&[
            Selector::class("chat-line__username"),
            Selector::attr_eq("aria-hidden", "true"),
        ]);
        assert_eq!(stripped.text_content(), "hello");
        // 元の値は変わらない
        assert_eq!(node.text_content(), "Zed: hello");
    }

    #[test]
    fn test_deserialize_untagged_children() {
        let json = r#"{"classes":["chat-line__message"],"children":["hi ",{"tag":"span","classes":["x"],"children":["there"]}]}"#;
        let node: ElementNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.tag, "div");
        assert_eq!(node.text_content(), "hi there");
    }
}
