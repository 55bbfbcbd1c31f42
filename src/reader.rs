//! 1インスタンス（1タブ）分の読み上げリーダー
//!
//! 共有ストア・ホストコンテキスト・時計・中継を受け取り、設定キャッシュ、リーダーロック、
//! メッセージ処理、安定待ちゲート、構造変更の監視を組み立てる。ホストページからの通知
//! （構造変更、ページ遷移、表示状態、ユーザー操作）はこの型を通して各部品へ届ける。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{ConfigHandle, PipelineSettings, ReaderConfig};
use crate::dom::{ChatDocument, MutationRecord};
use crate::lock::{HostContext, LeaderLock, LeaderState};
use crate::pipeline::{MessageProcessor, MutationWatcher, StabilityGate, WatchOutcome};
use crate::relay::{Relay, RelayError, RelayRequest};
use crate::store::{SharedStore, StoreError};
use crate::ChatvoxResult;

/// 読み上げリーダー
pub struct ChatReader {
    store: Arc<dyn SharedStore>,
    relay: Arc<dyn Relay>,
    config: ConfigHandle,
    lock: Arc<LeaderLock>,
    processor: Arc<MessageProcessor>,
    gate: Arc<StabilityGate>,
    watcher: MutationWatcher,
    config_sync: Mutex<Option<JoinHandle<()>>>,
}

impl ChatReader {
    pub fn new(
        store: Arc<dyn SharedStore>,
        host: Arc<dyn HostContext>,
        clock: Arc<dyn Clock>,
        relay: Arc<dyn Relay>,
        initial: ReaderConfig,
        settings: PipelineSettings,
    ) -> Self {
        let config = ConfigHandle::new(initial);
        let lock = Arc::new(LeaderLock::new(
            store.clone(),
            host,
            clock.clone(),
            settings.lock,
        ));
        let processor = Arc::new(MessageProcessor::new(
            config.clone(),
            lock.clone(),
            relay.clone(),
            clock.clone(),
            settings,
        ));
        let gate = Arc::new(StabilityGate::new(
            processor.clone(),
            lock.clone(),
            Duration::from_millis(settings.stable_check_delay_ms),
            settings.stable_max_tries,
        ));
        let watcher = MutationWatcher::new(
            config.clone(),
            lock.clone(),
            processor.clone(),
            gate.clone(),
            clock,
            settings.mass_redraw,
        );

        Self {
            store,
            relay,
            config,
            lock,
            processor,
            gate,
            watcher,
            config_sync: Mutex::new(None),
        }
    }

    /// 保存済み設定の読み込み、変更購読、リーダーロックの開始を行う
    ///
    /// 猶予期間はこの時点から数え始める。
    pub async fn start(&self, doc: &dyn ChatDocument) -> ChatvoxResult<LeaderState> {
        match self.config.load_from_store(self.store.as_ref()).await {
            Ok(()) => {}
            Err(StoreError::ContextInvalidated) => {
                self.lock.teardown();
                return Ok(LeaderState::TornDown);
            }
            Err(e) => return Err(e.into()),
        }

        {
            let mut sync = self.config_sync.lock();
            if sync.is_none() {
                *sync = Some(self.config.spawn_sync(self.store.as_ref()));
            }
        }

        let state = self.lock.start().await;
        self.watcher.check_location(doc);
        self.watcher.restart_grace_period();

        tracing::info!(
            instance_id = %self.lock.instance_id(),
            state = ?state,
            location = %doc.location(),
            "🚀 読み上げリーダーを開始"
        );
        Ok(state)
    }

    /// 構造変更の通知
    pub fn on_mutations(&self, doc: &dyn ChatDocument, records: &[MutationRecord]) -> WatchOutcome {
        self.watcher.check_location(doc);
        self.watcher.on_mutations(records)
    }

    /// ページ内遷移の通知
    pub fn on_location_change(&self, doc: &dyn ChatDocument) -> bool {
        self.watcher.check_location(doc)
    }

    /// 表示状態の変化の通知
    pub fn on_visibility_change(&self, doc: &dyn ChatDocument) {
        self.watcher.on_visibility_change(doc, doc.is_visible());
    }

    /// ユーザー操作（pointerdown/keydown）の通知
    pub async fn on_user_interaction(&self) -> Option<LeaderState> {
        self.lock.on_user_interaction().await
    }

    /// 再生待ちの読み上げをすべて破棄させる
    pub async fn clear_queue(&self) -> Result<(), RelayError> {
        self.relay.notify(RelayRequest::ClearQueue).await
    }

    /// 合成エンジンの話者一覧を問い合わせる
    pub async fn speakers(&self) -> Result<Value, RelayError> {
        let response = self.relay.request(RelayRequest::GetSpeakers).await?;
        Ok(response.data.unwrap_or(Value::Null))
    }

    /// 現在の設定を共有ストアへ書き込む（他のインスタンスへも通知される）
    pub async fn save_config(&self) -> ChatvoxResult<()> {
        self.config.save_to_store(self.store.as_ref()).await?;
        Ok(())
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn lock(&self) -> &Arc<LeaderLock> {
        &self.lock
    }

    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    pub fn is_leader(&self) -> bool {
        self.lock.is_leader()
    }

    /// 安定待ち中のコンテナ数
    pub fn pending_count(&self) -> usize {
        self.gate.pending_count()
    }

    /// 停止（安定待ちの破棄、設定購読の終了、リーダーロックの停止）
    pub fn shutdown(&self) {
        self.gate.shutdown();
        if let Some(task) = self.config_sync.lock().take() {
            task.abort();
        }
        self.lock.teardown();
        tracing::info!(instance_id = %self.lock.instance_id(), "👋 読み上げリーダーを停止");
    }
}

impl Drop for ChatReader {
    fn drop(&mut self) {
        self.gate.shutdown();
        if let Some(task) = self.config_sync.get_mut().take() {
            task.abort();
        }
    }
}
