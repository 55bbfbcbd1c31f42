//! メッセージ処理（重複判定・各種フィルタ・読み上げ要求の送出）

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::extractor;
use super::ledger::HistoryLedger;
use super::speech;
use crate::clock::Clock;
use crate::config::{ConfigHandle, PipelineSettings, ReaderConfig};
use crate::dom::ChatContainer;
use crate::lock::LeaderLock;
use crate::recency;
use crate::relay::{Relay, RelayError, RelayRequest};
use crate::text;

/// 1コンテナの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 既読マーク済み
    AlreadyRead,
    /// リーダーではない
    NotLeader,
    /// 投稿者または本文が無い（何も記録しない）
    NotAMessage,
    /// 履歴上の重複
    Duplicate,
    /// 時刻表示が古い
    Stale,
    /// ブロック対象ユーザー
    Blocked,
    /// `!`コマンド
    Command,
    /// 読み上げる本文が空
    Empty,
    /// 読み上げ要求を送った
    Dispatched,
    /// 読み上げ要求の送出に失敗した（履歴には記録済み）
    DispatchFailed,
}

impl ProcessOutcome {
    /// 既読として履歴に記録されたか
    pub fn is_recorded(self) -> bool {
        matches!(
            self,
            ProcessOutcome::Stale
                | ProcessOutcome::Blocked
                | ProcessOutcome::Command
                | ProcessOutcome::Empty
                | ProcessOutcome::Dispatched
                | ProcessOutcome::DispatchFailed
        )
    }
}

#[derive(Default)]
struct BlockListCache {
    raw: Option<String>,
    names: HashSet<String>,
}

impl BlockListCache {
    /// 設定文字列が変わったときだけ作り直す
    fn contains(&mut self, config: &ReaderConfig, normalized_name: &str) -> bool {
        if self.raw.as_deref() != Some(config.block_list.as_str()) {
            self.names = config.blocked_names();
            self.raw = Some(config.block_list.clone());
        }
        self.names.contains(normalized_name)
    }
}

/// メッセージ処理
pub struct MessageProcessor {
    config: ConfigHandle,
    lock: Arc<LeaderLock>,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    ledger: Mutex<HistoryLedger>,
    block_list: Mutex<BlockListCache>,
}

impl MessageProcessor {
    pub fn new(
        config: ConfigHandle,
        lock: Arc<LeaderLock>,
        relay: Arc<dyn Relay>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            config,
            lock,
            relay,
            clock,
            settings,
            ledger: Mutex::new(HistoryLedger::new(
                settings.history_retention_ms,
                settings.dedup_window_ms,
            )),
            block_list: Mutex::new(BlockListCache::default()),
        }
    }

    /// 履歴の件数
    pub fn history_len(&self) -> usize {
        self.ledger.lock().len()
    }

    /// コンテナを処理する
    ///
    /// `allow_stale`はリーダーだった時点で予約された処理に限り、その後リーダーを失っていても
    /// 最後まで処理させるためのもの。
    pub async fn process(&self, container: &dyn ChatContainer, allow_stale: bool) -> ProcessOutcome {
        if container.is_read() {
            return ProcessOutcome::AlreadyRead;
        }
        if self.lock.is_torn_down() || (!self.lock.is_leader() && !allow_stale) {
            return ProcessOutcome::NotLeader;
        }

        let now = self.clock.now_millis();
        self.ledger.lock().prune(now);

        let Some(message) = extractor::extract(container) else {
            return ProcessOutcome::NotAMessage;
        };
        if message.raw_text.is_empty() {
            return ProcessOutcome::NotAMessage;
        }

        let signature = message.signature();
        if self.ledger.lock().check_duplicate(&signature, now) {
            container.mark_read();
            tracing::trace!(signature = %signature, "🔁 重複メッセージをスキップ");
            return ProcessOutcome::Duplicate;
        }

        let config = self.config.snapshot();

        let outcome = if !message.time_text.is_empty()
            && !recency::is_recent(
                &message.time_text,
                self.clock.local_time(),
                self.settings.recency,
            ) {
            tracing::debug!(time = %message.time_text, "⏪ 時刻が古いためスキップ");
            Some(ProcessOutcome::Stale)
        } else if self.is_blocked(&config, &message.username) {
            tracing::debug!(user = %message.username, "🚫 ブロック対象ユーザー");
            Some(ProcessOutcome::Blocked)
        } else if config.ignore_command && message.text.starts_with('!') {
            tracing::debug!("⌨️ コマンドをスキップ");
            Some(ProcessOutcome::Command)
        } else if message.text.is_empty() {
            Some(ProcessOutcome::Empty)
        } else {
            None
        };

        // 読み上げ前に一度だけ記録と既読マークを行う
        self.ledger.lock().record(signature.clone(), now);
        container.mark_read();

        if let Some(outcome) = outcome {
            return outcome;
        }

        let payload = speech::build_speak_payload(&message, &signature, &config);
        tracing::info!(
            user = %message.username,
            reply = message.is_reply,
            text = %payload.text,
            "🗣️ 読み上げ要求"
        );

        match self
            .relay
            .request(RelayRequest::SpeakRequest { payload })
            .await
        {
            Ok(response) if response.success => ProcessOutcome::Dispatched,
            Ok(response) => {
                tracing::warn!(
                    error = response.error.as_deref().unwrap_or("unknown"),
                    "⚠️ 読み上げ要求が拒否されました"
                );
                ProcessOutcome::DispatchFailed
            }
            Err(RelayError::ContextInvalidated) => {
                self.lock.teardown();
                ProcessOutcome::DispatchFailed
            }
            Err(e) => {
                tracing::warn!(error = %e, "⚠️ 読み上げ要求を送れませんでした");
                ProcessOutcome::DispatchFailed
            }
        }
    }

    fn is_blocked(&self, config: &ReaderConfig, username: &str) -> bool {
        if config.block_list.is_empty() {
            return false;
        }
        let normalized = text::normalize_display_name(username);
        if normalized.is_empty() {
            return false;
        }
        self.block_list.lock().contains(config, &normalized)
    }

    /// 既に表示されているコンテナを読み上げずに既読として記録する
    pub fn remember_existing(&self, container: &dyn ChatContainer) {
        let now = self.clock.now_millis();
        if let Some(message) = extractor::extract(container) {
            if !message.raw_text.is_empty() {
                self.ledger.lock().record(message.signature(), now);
            }
        }
        container.mark_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ReaderConfig;
    use crate::dom::{ChatDocument, ElementNode, MemoryDocument};
    use crate::lock::{LockSettings, RuntimeContext};
    use crate::relay::{RelayResponse, SpeakPayload};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct CapturingRelay {
        sent: Mutex<Vec<SpeakPayload>>,
        fail_with: Mutex<Option<RelayError>>,
    }

    #[async_trait]
    impl Relay for CapturingRelay {
        async fn request(&self, request: RelayRequest) -> Result<RelayResponse, RelayError> {
            if let Some(error) = self.fail_with.lock().clone() {
                return Err(error);
            }
            if let RelayRequest::SpeakRequest { payload } = request {
                self.sent.lock().push(payload);
            }
            Ok(RelayResponse::ok())
        }

        async fn notify(&self, _request: RelayRequest) -> Result<(), RelayError> {
            Ok(())
        }
    }

    struct Fixture {
        doc: MemoryDocument,
        clock: Arc<ManualClock>,
        relay: Arc<CapturingRelay>,
        lock: Arc<LeaderLock>,
        config: ConfigHandle,
        processor: MessageProcessor,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::at(12, 0).await
        }

        async fn at(hour: u32, minute: u32) -> Self {
            let clock = Arc::new(ManualClock::at(hour, minute));
            let store = Arc::new(MemoryStore::new());
            let lock = Arc::new(LeaderLock::new(
                store,
                Arc::new(RuntimeContext::new()),
                clock.clone(),
                LockSettings::default(),
            ));
            lock.claim(false).await;

            let relay = Arc::new(CapturingRelay::default());
            let config = ConfigHandle::new(ReaderConfig::default());
            let processor = MessageProcessor::new(
                config.clone(),
                lock.clone(),
                relay.clone(),
                clock.clone(),
                PipelineSettings::default(),
            );
            Self {
                doc: MemoryDocument::new("https://www.twitch.tv/popout/test/chat"),
                clock,
                relay,
                lock,
                config,
                processor,
            }
        }

        fn line(&self, user: &str, time: Option<&str>, text: &str) -> crate::dom::ContainerRef {
            let mut node = ElementNode::new("div").with_class("chat-line__message");
            if let Some(time) = time {
                node = node.with_child(
                    ElementNode::span()
                        .with_class("chat-line__timestamp")
                        .with_text(time),
                );
            }
            node = node
                .with_child(ElementNode::span().with_class("chat-line__username").with_text(user))
                .with_child(
                    ElementNode::span()
                        .with_attr("data-test-selector", "chat-line-message-body")
                        .with_text(text),
                );
            let id = self.doc.append(self.doc.root(), node);
            self.doc.handle(id)
        }

        fn sent_texts(&self) -> Vec<String> {
            self.relay.sent.lock().iter().map(|p| p.text.clone()).collect()
        }
    }

    #[tokio::test]
    async fn test_accepted_message_is_dispatched_once() {
        let fx = Fixture::new().await;
        let line = fx.line("alice", Some("12:00"), "hello");

        assert_eq!(fx.processor.process(line.as_ref(), false).await, ProcessOutcome::Dispatched);
        assert!(line.is_read());
        assert_eq!(fx.sent_texts(), vec!["hello"]);

        assert_eq!(fx.processor.process(line.as_ref(), false).await, ProcessOutcome::AlreadyRead);
    }

    #[tokio::test]
    async fn test_redrawn_copy_within_window_is_duplicate() {
        let fx = Fixture::new().await;
        let first = fx.line("alice", Some("12:00"), "hello");
        fx.processor.process(first.as_ref(), false).await;

        fx.clock.advance(Duration::from_millis(1000));
        let copy = fx.line("alice", Some("12:00"), "hello");
        assert_eq!(fx.processor.process(copy.as_ref(), false).await, ProcessOutcome::Duplicate);
        assert!(copy.is_read());

        // 窓の外なら同じ文面でも新規
        fx.clock.advance(Duration::from_millis(5000));
        let repeat = fx.line("alice", Some("12:00"), "hello");
        assert_eq!(fx.processor.process(repeat.as_ref(), false).await, ProcessOutcome::Dispatched);
        assert_eq!(fx.sent_texts().len(), 2);
    }

    #[tokio::test]
    async fn test_command_is_recorded_but_not_spoken() {
        let fx = Fixture::at(3, 14).await;
        let line = fx.line("Zed", Some("3:14"), "!skip http://x.com");

        assert_eq!(fx.processor.process(line.as_ref(), false).await, ProcessOutcome::Command);
        assert!(line.is_read());
        assert_eq!(fx.processor.history_len(), 1);
        assert!(fx.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_stale_and_blocked_messages() {
        let fx = Fixture::new().await;
        let old = fx.line("alice", Some("8:00"), "old news");
        assert_eq!(fx.processor.process(old.as_ref(), false).await, ProcessOutcome::Stale);

        fx.config.update(|c| c.block_list = "Alice".to_string());
        let a = fx.line("alice", None, "hi");
        let b = fx.line("Ａｌｉｃｅ", None, "hi again");
        assert_eq!(fx.processor.process(a.as_ref(), false).await, ProcessOutcome::Blocked);
        assert_eq!(fx.processor.process(b.as_ref(), false).await, ProcessOutcome::Blocked);

        assert!(fx.sent_texts().is_empty());
        assert_eq!(fx.processor.history_len(), 3);

        // ブロックリストの変更は次の判定から反映される
        fx.config.update(|c| c.block_list = "bob".to_string());
        let c = fx.line("alice", None, "back again");
        assert_eq!(fx.processor.process(c.as_ref(), false).await, ProcessOutcome::Dispatched);
    }

    #[test]
    fn test_outcome_recorded_flags() {
        for outcome in [
            ProcessOutcome::Stale,
            ProcessOutcome::Blocked,
            ProcessOutcome::Command,
            ProcessOutcome::Empty,
            ProcessOutcome::Dispatched,
            ProcessOutcome::DispatchFailed,
        ] {
            assert!(outcome.is_recorded(), "{:?}", outcome);
        }
        for outcome in [
            ProcessOutcome::AlreadyRead,
            ProcessOutcome::NotLeader,
            ProcessOutcome::NotAMessage,
            ProcessOutcome::Duplicate,
        ] {
            assert!(!outcome.is_recorded(), "{:?}", outcome);
        }
    }

    #[tokio::test]
    async fn test_not_leader_unless_grandfathered() {
        let fx = Fixture::new().await;
        fx.lock.apply_change(&crate::store::StoreChange {
            key: crate::lock::ACTIVE_READER_KEY.to_string(),
            old_value: None,
            new_value: Some(serde_json::json!({"id": "other", "lastSeen": 1})),
        });
        assert!(!fx.lock.is_leader());

        let line = fx.line("alice", None, "hello");
        assert_eq!(fx.processor.process(line.as_ref(), false).await, ProcessOutcome::NotLeader);
        assert!(!line.is_read());

        assert_eq!(fx.processor.process(line.as_ref(), true).await, ProcessOutcome::Dispatched);
    }

    #[tokio::test]
    async fn test_missing_author_records_nothing() {
        let fx = Fixture::new().await;
        let id = fx.doc.append(
            fx.doc.root(),
            ElementNode::new("div")
                .with_class("chat-line__message")
                .with_text("system notice"),
        );
        let line = fx.doc.handle(id);

        assert_eq!(fx.processor.process(line.as_ref(), false).await, ProcessOutcome::NotAMessage);
        assert!(!line.is_read());
        assert_eq!(fx.processor.history_len(), 0);
    }

    #[tokio::test]
    async fn test_invalidated_relay_tears_down_lock() {
        let fx = Fixture::new().await;
        *fx.relay.fail_with.lock() = Some(RelayError::ContextInvalidated);

        let line = fx.line("alice", None, "hello");
        assert_eq!(
            fx.processor.process(line.as_ref(), false).await,
            ProcessOutcome::DispatchFailed
        );
        // 送出失敗でも記録済みなので再処理されない
        assert!(line.is_read());
        assert!(fx.lock.is_torn_down());
    }

    #[tokio::test]
    async fn test_remember_existing_marks_backlog() {
        let fx = Fixture::new().await;
        let line = fx.line("alice", None, "backlog");
        fx.processor.remember_existing(line.as_ref());
        assert!(line.is_read());

        let copy = fx.line("alice", None, "backlog");
        assert_eq!(fx.processor.process(copy.as_ref(), false).await, ProcessOutcome::Duplicate);
        assert_eq!(fx.doc.find_all(&[crate::dom::Selector::class("chat-line__message")]).len(), 2);
    }
}
