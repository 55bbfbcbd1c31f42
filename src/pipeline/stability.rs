//! 描画安定待ち
//!
//! チャット行は中身が揃う前に挿入されることがあるため、一定間隔で抽出を繰り返し、
//! 直前の抽出結果と一致した時点で処理に回す。試行回数を使い切った場合も、
//! 抽出できていれば最後の結果で処理する。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use super::extractor;
use super::processor::{MessageProcessor, ProcessOutcome};
use crate::dom::{ContainerRef, NodeId};
use crate::lock::LeaderLock;

/// 1コンテナ分の安定判定状態
#[derive(Debug, Clone, Default)]
struct StabilityState {
    attempts: u32,
    previous_key: Option<String>,
    /// 予約時点でリーダーだったか
    was_leader: bool,
}

type PendingMap = Arc<Mutex<HashMap<NodeId, AbortHandle>>>;

/// 描画安定待ちゲート
pub struct StabilityGate {
    processor: Arc<MessageProcessor>,
    lock: Arc<LeaderLock>,
    delay: Duration,
    max_tries: u32,
    pending: PendingMap,
}

impl StabilityGate {
    pub fn new(
        processor: Arc<MessageProcessor>,
        lock: Arc<LeaderLock>,
        delay: Duration,
        max_tries: u32,
    ) -> Self {
        Self {
            processor,
            lock,
            delay,
            max_tries: max_tries.max(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 安定判定を予約する（予約しなかった場合は`false`）
    ///
    /// 既読・予約済み・非リーダーのときは何もしない。
    pub fn schedule(&self, container: ContainerRef) -> bool {
        if container.is_read() || !self.lock.is_leader() {
            return false;
        }

        let id = container.node_id();
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return false;
        }

        let state = StabilityState {
            was_leader: self.lock.is_leader(),
            ..StabilityState::default()
        };
        let task = tokio::spawn(Self::run(
            self.processor.clone(),
            self.pending.clone(),
            container,
            state,
            self.delay,
            self.max_tries,
        ));
        pending.insert(id, task.abort_handle());
        true
    }

    /// 安定待ち中のコンテナ数
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// すべての安定待ちを中止
    pub fn shutdown(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }

    async fn run(
        processor: Arc<MessageProcessor>,
        pending: PendingMap,
        container: ContainerRef,
        mut state: StabilityState,
        delay: Duration,
        max_tries: u32,
    ) {
        let id = container.node_id();

        loop {
            tokio::time::sleep(delay).await;

            if !container.is_connected() || container.is_read() {
                tracing::trace!(node = %id, "🫥 安定待ち中に切り離し・既読化");
                pending.lock().remove(&id);
                return;
            }

            let key = extractor::extract(container.as_ref()).and_then(|m| m.stability_key());
            state.attempts += 1;

            if key.is_some() && key == state.previous_key {
                pending.lock().remove(&id);
                let outcome = processor.process(container.as_ref(), state.was_leader).await;
                log_outcome(id, outcome, state.attempts);
                return;
            }

            if state.attempts >= max_tries {
                pending.lock().remove(&id);
                if key.is_some() {
                    tracing::debug!(node = %id, attempts = state.attempts, "⌛ 安定しないまま処理");
                    let outcome = processor.process(container.as_ref(), state.was_leader).await;
                    log_outcome(id, outcome, state.attempts);
                } else {
                    tracing::debug!(node = %id, "⌛ 抽出できないまま試行回数を超過");
                }
                return;
            }

            state.previous_key = key;
        }
    }
}

impl Drop for StabilityGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_outcome(id: NodeId, outcome: ProcessOutcome, attempts: u32) {
    tracing::trace!(
        node = %id,
        outcome = ?outcome,
        recorded = outcome.is_recorded(),
        attempts = attempts,
        "✅ 安定判定完了"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ConfigHandle, PipelineSettings};
    use crate::dom::{ChatContainer, ElementNode, MemoryDocument, Node};
    use crate::lock::{LockSettings, RuntimeContext, ACTIVE_READER_KEY};
    use crate::relay::{Relay, RelayError, RelayRequest, RelayResponse};
    use crate::store::{MemoryStore, StoreChange};
    use async_trait::async_trait;

    #[derive(Default)]
    struct CapturingRelay {
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Relay for CapturingRelay {
        async fn request(&self, request: RelayRequest) -> Result<RelayResponse, RelayError> {
            if let RelayRequest::SpeakRequest { payload } = request {
                self.texts.lock().push(payload.text);
            }
            Ok(RelayResponse::ok())
        }

        async fn notify(&self, _request: RelayRequest) -> Result<(), RelayError> {
            Ok(())
        }
    }

    struct Fixture {
        doc: MemoryDocument,
        relay: Arc<CapturingRelay>,
        lock: Arc<LeaderLock>,
        gate: StabilityGate,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at(12, 0));
        let lock = Arc::new(LeaderLock::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RuntimeContext::new()),
            clock.clone(),
            LockSettings::default(),
        ));
        lock.claim(false).await;

        let relay = Arc::new(CapturingRelay::default());
        let processor = Arc::new(MessageProcessor::new(
            ConfigHandle::default(),
            lock.clone(),
            relay.clone(),
            clock,
            PipelineSettings::default(),
        ));
        let gate = StabilityGate::new(processor, lock.clone(), Duration::from_millis(100), 12);
        Fixture {
            doc: MemoryDocument::new("https://www.twitch.tv/test"),
            relay,
            lock,
            gate,
        }
    }

    fn username(name: &str) -> Node {
        ElementNode::span()
            .with_class("chat-line__username")
            .with_text(name)
            .into()
    }

    fn body(text: &str) -> Node {
        ElementNode::span()
            .with_class("chat-line__message-body")
            .with_text(text)
            .into()
    }

    fn empty_line() -> ElementNode {
        ElementNode::new("div").with_class("chat-line__message")
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_content_to_settle() {
        let fx = fixture().await;
        let id = fx.doc.append(fx.doc.root(), empty_line());

        assert!(fx.gate.schedule(fx.doc.handle(id)));
        // 予約済みなら二重に予約しない
        assert!(!fx.gate.schedule(fx.doc.handle(id)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        fx.doc.replace_children(id, vec![username("mo"), body("hel")]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.doc.replace_children(id, vec![username("mo"), body("hello")]);

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*fx.relay.texts.lock(), vec!["hello".to_string()]);
        assert_eq!(fx.gate.pending_count(), 0);
        assert!(fx.doc.handle(id).is_read());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_container_is_abandoned() {
        let fx = fixture().await;
        let id = fx.doc.append(fx.doc.root(), empty_line());
        fx.gate.schedule(fx.doc.handle(id));

        fx.doc.detach(id);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(fx.relay.texts.lock().is_empty());
        assert_eq!(fx.gate.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_after_retry_budget() {
        let fx = fixture().await;
        let id = fx.doc.append(fx.doc.root(), empty_line());
        fx.gate.schedule(fx.doc.handle(id));

        // 毎回内容が変わり続ける
        for i in 0..12 {
            fx.doc
                .replace_children(id, vec![username("mo"), body(&format!("typing {}", i))]);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let texts = fx.relay.texts.lock().clone();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("typing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_loss_does_not_drop_scheduled_message() {
        let fx = fixture().await;
        let id = fx.doc.append(
            fx.doc.root(),
            empty_line().with_child(username("mo")).with_child(body("still spoken")),
        );
        fx.gate.schedule(fx.doc.handle(id));

        fx.lock.apply_change(&StoreChange {
            key: ACTIVE_READER_KEY.to_string(),
            old_value: None,
            new_value: Some(serde_json::json!({"id": "other-tab", "lastSeen": 1})),
        });
        assert!(!fx.lock.is_leader());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*fx.relay.texts.lock(), vec!["still spoken".to_string()]);

        // 非リーダーの間は新たに予約しない
        let other = fx.doc.append(
            fx.doc.root(),
            empty_line().with_child(username("mo")).with_child(body("later")),
        );
        assert!(!fx.gate.schedule(fx.doc.handle(other)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_checks() {
        let fx = fixture().await;
        let id = fx.doc.append(
            fx.doc.root(),
            empty_line().with_child(username("mo")).with_child(body("never")),
        );
        fx.gate.schedule(fx.doc.handle(id));
        fx.gate.shutdown();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fx.relay.texts.lock().is_empty());
    }
}
