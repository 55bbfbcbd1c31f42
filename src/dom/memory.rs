//! メモリ上の文書モデル
//!
//! リプレイとテストでホストページの代わりに使う。ノードの追加・内容差し替え・切り離しで
//! チャットUIの段階的な描画や再マウントを再現できる。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{ChatContainer, ChatDocument, ContainerRef, ElementNode, MutationRecord, Node, NodeId, Selector};

/// 文書ルート（`<body>`相当）
const ROOT: NodeId = NodeId(0);

#[derive(Debug)]
enum Child {
    Text(String),
    Element(NodeId),
}

#[derive(Debug)]
struct Slot {
    tag: String,
    classes: Vec<String>,
    attributes: BTreeMap<String, String>,
    children: Vec<Child>,
    parent: Option<NodeId>,
    read: bool,
}

#[derive(Debug)]
struct Arena {
    slots: HashMap<NodeId, Slot>,
    next_id: u64,
    location: String,
    visible: bool,
}

impl Arena {
    fn allocate(&mut self, parent: Option<NodeId>, element: ElementNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        self.slots.insert(
            id,
            Slot {
                tag: element.tag,
                classes: element.classes,
                attributes: element.attributes,
                children: Vec::new(),
                parent,
                read: false,
            },
        );

        let children = self.allocate_children(id, element.children);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.children = children;
        }
        id
    }

    fn allocate_children(&mut self, parent: NodeId, children: Vec<Node>) -> Vec<Child> {
        children
            .into_iter()
            .map(|child| match child {
                Node::Text(text) => Child::Text(text),
                Node::Element(element) => Child::Element(self.allocate(Some(parent), element)),
            })
            .collect()
    }

    fn is_connected(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == ROOT {
                return true;
            }
            match self.slots.get(&current).and_then(|slot| slot.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn snapshot(&self, id: NodeId) -> ElementNode {
        let Some(slot) = self.slots.get(&id) else {
            return ElementNode::default();
        };
        ElementNode {
            tag: slot.tag.clone(),
            classes: slot.classes.clone(),
            attributes: slot.attributes.clone(),
            children: slot
                .children
                .iter()
                .map(|child| match child {
                    Child::Text(text) => Node::Text(text.clone()),
                    Child::Element(child_id) => Node::Element(self.snapshot(*child_id)),
                })
                .collect(),
        }
    }

    fn find_all(&self, id: NodeId, selectors: &[Selector], out: &mut Vec<NodeId>) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };
        for child in &slot.children {
            if let Child::Element(child_id) = child {
                if let Some(child_slot) = self.slots.get(child_id) {
                    let shallow = ElementNode {
                        tag: child_slot.tag.clone(),
                        classes: child_slot.classes.clone(),
                        attributes: child_slot.attributes.clone(),
                        children: Vec::new(),
                    };
                    if shallow.matches_any(selectors) {
                        out.push(*child_id);
                    }
                }
                self.find_all(*child_id, selectors, out);
            }
        }
    }

    fn detach_children(&mut self, id: NodeId) {
        let child_ids: Vec<NodeId> = self
            .slots
            .get(&id)
            .map(|slot| {
                slot.children
                    .iter()
                    .filter_map(|child| match child {
                        Child::Element(child_id) => Some(*child_id),
                        Child::Text(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for child_id in child_ids {
            if let Some(child) = self.slots.get_mut(&child_id) {
                child.parent = None;
            }
        }
    }
}

/// メモリ上の文書
#[derive(Clone)]
pub struct MemoryDocument {
    arena: Arc<RwLock<Arena>>,
}

impl fmt::Debug for MemoryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena.read();
        f.debug_struct("MemoryDocument")
            .field("nodes", &arena.slots.len())
            .field("location", &arena.location)
            .finish()
    }
}

impl MemoryDocument {
    pub fn new(location: &str) -> Self {
        let mut slots = HashMap::new();
        slots.insert(
            ROOT,
            Slot {
                tag: "body".to_string(),
                classes: Vec::new(),
                attributes: BTreeMap::new(),
                children: Vec::new(),
                parent: None,
                read: false,
            },
        );
        Self {
            arena: Arc::new(RwLock::new(Arena {
                slots,
                next_id: 1,
                location: location.to_string(),
                visible: true,
            })),
        }
    }

    /// 文書ルート
    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// 要素を親の末尾に追加し、追加した要素のIDを返す
    pub fn append(&self, parent: NodeId, element: ElementNode) -> NodeId {
        let mut arena = self.arena.write();
        let id = arena.allocate(Some(parent), element);
        if let Some(slot) = arena.slots.get_mut(&parent) {
            slot.children.push(Child::Element(id));
        }
        id
    }

    /// 要素の子を丸ごと差し替える（段階的な描画の再現）
    pub fn replace_children(&self, id: NodeId, children: Vec<Node>) {
        let mut arena = self.arena.write();
        arena.detach_children(id);
        let children = arena.allocate_children(id, children);
        if let Some(slot) = arena.slots.get_mut(&id) {
            slot.children = children;
        }
    }

    /// 要素の末尾に子を追加
    pub fn append_child(&self, id: NodeId, child: Node) {
        let mut arena = self.arena.write();
        let child = match child {
            Node::Text(text) => Child::Text(text),
            Node::Element(element) => Child::Element(arena.allocate(Some(id), element)),
        };
        if let Some(slot) = arena.slots.get_mut(&id) {
            slot.children.push(child);
        }
    }

    /// 要素を文書から切り離す
    pub fn detach(&self, id: NodeId) {
        let mut arena = self.arena.write();
        let parent = arena.slots.get_mut(&id).and_then(|slot| slot.parent.take());
        if let Some(parent) = parent.and_then(|p| arena.slots.get_mut(&p)) {
            parent
                .children
                .retain(|child| !matches!(child, Child::Element(c) if *c == id));
        }
    }

    pub fn set_location(&self, location: &str) {
        self.arena.write().location = location.to_string();
    }

    pub fn set_visible(&self, visible: bool) {
        self.arena.write().visible = visible;
    }

    /// ノードへのハンドル
    pub fn handle(&self, id: NodeId) -> ContainerRef {
        Arc::new(MemoryElement {
            arena: self.arena.clone(),
            id,
        })
    }

    /// 追加されたノード群から変更レコードを作る
    pub fn mutation(&self, added: &[NodeId]) -> MutationRecord {
        MutationRecord::new(added.iter().map(|id| self.handle(*id)).collect())
    }
}

impl ChatDocument for MemoryDocument {
    fn find_all(&self, selectors: &[Selector]) -> Vec<ContainerRef> {
        let mut ids = Vec::new();
        self.arena.read().find_all(ROOT, selectors, &mut ids);
        ids.into_iter().map(|id| self.handle(id)).collect()
    }

    fn location(&self) -> String {
        self.arena.read().location.clone()
    }

    fn is_visible(&self) -> bool {
        self.arena.read().visible
    }
}

/// メモリ文書上の要素ハンドル
pub struct MemoryElement {
    arena: Arc<RwLock<Arena>>,
    id: NodeId,
}

impl fmt::Debug for MemoryElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MemoryElement").field(&self.id).finish()
    }
}

impl ChatContainer for MemoryElement {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.arena.read().is_connected(self.id)
    }

    fn snapshot(&self) -> ElementNode {
        self.arena.read().snapshot(self.id)
    }

    fn is_read(&self) -> bool {
        self.arena
            .read()
            .slots
            .get(&self.id)
            .is_some_and(|slot| slot.read)
    }

    fn mark_read(&self) {
        if let Some(slot) = self.arena.write().slots.get_mut(&self.id) {
            slot.read = true;
        }
    }

    fn find_all(&self, selectors: &[Selector]) -> Vec<ContainerRef> {
        let mut ids = Vec::new();
        self.arena.read().find_all(self.id, selectors, &mut ids);
        ids.into_iter()
            .map(|id| {
                Arc::new(MemoryElement {
                    arena: self.arena.clone(),
                    id,
                }) as ContainerRef
            })
            .collect()
    }
}
