//! 全タブ共有のキーバリューストア
//!
//! 設定値とリーダーロックのレコードを保持し、変更を購読者へ通知する。
//! トランザクションは無く、読み取り→書き込みの競合はリーダーロック側の規則で吸収する。

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// 変更通知チャネルの容量
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// ストア操作のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("拡張コンテキストが無効化されました")]
    ContextInvalidated,

    #[error("ストアアクセスに失敗しました: {0}")]
    Backend(String),

    #[error("値のシリアライズに失敗しました: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 1キー分の変更通知
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// 共有ストアの抽象インタフェース
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// 値を取得
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// 値を保存（購読者へ変更を通知）
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// 値を削除
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// 変更通知を購読
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// 型付きで値を取得（デシリアライズできない値は`None`扱い）
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let value = store.get(key).await?;
    Ok(value.and_then(|v| match serde_json::from_value(v) {
        Ok(typed) => Some(typed),
        Err(e) => {
            tracing::debug!(key = key, error = %e, "⚠️ ストア値の型が一致しません");
            None
        }
    }))
}

/// メモリ上の共有ストア
///
/// 同一プロセス内の複数インスタンス（タブ）で`Arc`共有して使う。
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// 初期値付きで作成
    pub fn with_values(values: HashMap<String, Value>) -> Self {
        let store = Self::new();
        *store.values.write() = values;
        store
    }

    /// 現在の値を同期的に参照
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn publish(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        // 購読者がいない場合の送信エラーは無視
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let old_value = self.values.write().insert(key.to_string(), value.clone());
        self.publish(key, old_value, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let old_value = self.values.write().remove(key);
        if old_value.is_some() {
            self.publish(key, old_value, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
