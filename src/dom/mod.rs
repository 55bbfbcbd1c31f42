//! ホストページのDOM抽象
//!
//! チャット行はホストページが所有し、いつ差し替え・削除されてもおかしくない。
//! パイプラインは不透明なハンドルと限られた操作（属性・テキストの読み取り、接続確認、既読マーク）
//! だけを通してアクセスする。

pub mod memory;
pub mod node;
pub mod selector;

use std::fmt;
use std::sync::Arc;

use derive_more::{Display, From};

pub use memory::MemoryDocument;
pub use node::{ElementNode, Node};
pub use selector::{AttrOp, Selector};

/// ノードの同一性（内容ではなくノードそのもの）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
#[display("node#{_0}")]
pub struct NodeId(pub u64);

/// チャット行コンテナへのハンドル
pub trait ChatContainer: Send + Sync + fmt::Debug {
    /// ノードの同一性
    fn node_id(&self) -> NodeId;

    /// 文書に接続されているか
    fn is_connected(&self) -> bool;

    /// 現在の内容のスナップショット
    fn snapshot(&self) -> ElementNode;

    /// 既読マークが付いているか
    fn is_read(&self) -> bool;

    /// 既読マークを付ける（パイプラインが書き込む唯一の状態）
    fn mark_read(&self);

    /// いずれかのセレクタに一致する子孫を文書順に取得
    fn find_all(&self, selectors: &[Selector]) -> Vec<ContainerRef>;
}

/// 共有ハンドル
pub type ContainerRef = Arc<dyn ChatContainer>;

/// ホストページ全体
pub trait ChatDocument: Send + Sync {
    /// いずれかのセレクタに一致する要素を文書順に取得
    fn find_all(&self, selectors: &[Selector]) -> Vec<ContainerRef>;

    /// 現在のURL
    fn location(&self) -> String;

    /// ページが表示中か
    fn is_visible(&self) -> bool;
}

/// 1件の構造変更（追加されたノード）
#[derive(Debug, Clone, Default)]
pub struct MutationRecord {
    pub added_nodes: Vec<ContainerRef>,
}

impl MutationRecord {
    pub fn new(added_nodes: Vec<ContainerRef>) -> Self {
        Self { added_nodes }
    }
}
