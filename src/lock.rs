//! 読み上げリーダーロック
//!
//! 同じページを複数タブで開いていても、読み上げを行うのは1インスタンスだけにする。
//! 共有ストア上の`{id, lastSeen}`レコードを「期限内の最新の主張が勝つ」規則で奪い合い、
//! ハートビートで延長する。書き込みの競合はハートビート1周期以内に自己修復される。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::store::{get_typed, SharedStore, StoreChange, StoreError};

/// リーダーレコードを保持するストアキー
pub const ACTIVE_READER_KEY: &str = "voxActiveReader";

/// ホスト実行環境（拡張コンテキスト）の生存確認
pub trait HostContext: Send + Sync {
    /// コンテキストが有効か（拡張の再読み込み等で無効化される）
    fn is_valid(&self) -> bool;
}

/// フラグで有効/無効を切り替えるホストコンテキスト
#[derive(Debug)]
pub struct RuntimeContext {
    valid: AtomicBool,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self {
            valid: AtomicBool::new(true),
        }
    }

    /// コンテキストを無効化（以降は復帰しない）
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HostContext for RuntimeContext {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

/// 共有リーダーレコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderLockRecord {
    pub id: String,
    #[serde(default)]
    pub last_seen: i64,
}

impl ReaderLockRecord {
    /// TTLを過ぎているか（`lastSeen`が無いレコードも期限切れ扱い）
    pub fn is_expired(&self, now_millis: i64, ttl_ms: i64) -> bool {
        self.last_seen <= 0 || now_millis - self.last_seen > ttl_ms
    }
}

/// リーダーロックのタイミング設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// レコードの有効期限（ミリ秒）
    pub ttl_ms: i64,
    /// ハートビート間隔（ミリ秒）
    pub heartbeat_ms: u64,
    /// ユーザー操作による強制取得の最小間隔（ミリ秒）
    pub interaction_debounce_ms: i64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 8000,
            heartbeat_ms: 2000,
            interaction_debounce_ms: 1000,
        }
    }
}

/// 取得処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Leader,
    Follower,
    /// コンテキスト無効化により停止済み（終端状態）
    TornDown,
}

/// リーダーロック
pub struct LeaderLock {
    instance_id: String,
    store: Arc<dyn SharedStore>,
    host: Arc<dyn HostContext>,
    clock: Arc<dyn Clock>,
    settings: LockSettings,
    is_leader: AtomicBool,
    torn_down: AtomicBool,
    last_forced_claim_at: Mutex<Option<i64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LeaderLock {
    /// 新しいインスタンスIDでロックを作成
    pub fn new(
        store: Arc<dyn SharedStore>,
        host: Arc<dyn HostContext>,
        clock: Arc<dyn Clock>,
        settings: LockSettings,
    ) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            store,
            host,
            clock,
            settings,
            is_leader: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            last_forced_claim_at: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 現在リーダーか
    pub fn is_leader(&self) -> bool {
        !self.is_torn_down() && self.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn state(&self) -> LeaderState {
        if self.is_torn_down() {
            LeaderState::TornDown
        } else if self.is_leader() {
            LeaderState::Leader
        } else {
            LeaderState::Follower
        }
    }

    fn set_leader(&self, leader: bool) {
        let was = self.is_leader.swap(leader, Ordering::SeqCst);
        if was != leader {
            if leader {
                tracing::info!(instance_id = %self.instance_id, "👑 読み上げリーダーになりました");
            } else {
                tracing::info!(instance_id = %self.instance_id, "💤 読み上げリーダーを譲りました");
            }
        }
    }

    /// ホストコンテキストを確認し、無効なら停止する
    fn ensure_valid(&self) -> bool {
        if self.is_torn_down() {
            return false;
        }
        if !self.host.is_valid() {
            self.teardown();
            return false;
        }
        true
    }

    /// リーダーの取得を試みる
    ///
    /// `force`、レコード無し、期限切れ、または自分のレコードであれば書き込んでリーダーになる。
    pub async fn claim(&self, force: bool) -> LeaderState {
        if !self.ensure_valid() {
            return LeaderState::TornDown;
        }

        let fetched = get_typed::<ReaderLockRecord>(self.store.as_ref(), ACTIVE_READER_KEY).await;
        let record = match fetched {
            Ok(record) => record,
            Err(StoreError::ContextInvalidated) => {
                self.teardown();
                return LeaderState::TornDown;
            }
            Err(e) => {
                tracing::debug!(error = %e, "⚠️ リーダーレコード読み取りエラーを無視");
                return self.state();
            }
        };

        if !self.ensure_valid() {
            return LeaderState::TornDown;
        }

        let now = self.clock.now_millis();
        let owned = record
            .as_ref()
            .is_some_and(|r| r.id == self.instance_id);
        let expired = record
            .as_ref()
            .map_or(true, |r| r.is_expired(now, self.settings.ttl_ms));

        if !(force || expired || owned) {
            self.set_leader(false);
            return LeaderState::Follower;
        }

        let fresh = ReaderLockRecord {
            id: self.instance_id.clone(),
            last_seen: now,
        };
        let value = match serde_json::to_value(&fresh) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "❌ リーダーレコードのシリアライズに失敗");
                return self.state();
            }
        };

        match self.store.set(ACTIVE_READER_KEY, value).await {
            Ok(()) => {
                self.set_leader(true);
                LeaderState::Leader
            }
            Err(StoreError::ContextInvalidated) => {
                self.teardown();
                LeaderState::TornDown
            }
            Err(e) => {
                tracing::warn!(error = %e, "⚠️ リーダーレコードの書き込みに失敗");
                self.state()
            }
        }
    }

    /// 定期ハートビート（自分のレコードなら延長、期限切れなら奪取、それ以外は降格）
    pub async fn heartbeat(&self) -> LeaderState {
        self.claim(false).await
    }

    /// ページ上のユーザー操作（pointerdown/keydown）
    ///
    /// 操作中のタブがリーダーになるよう強制取得する。間隔制限内なら`None`。
    pub async fn on_user_interaction(&self) -> Option<LeaderState> {
        let now = self.clock.now_millis();
        {
            let mut last = self.last_forced_claim_at.lock();
            if let Some(previous) = *last {
                if now - previous < self.settings.interaction_debounce_ms {
                    return None;
                }
            }
            *last = Some(now);
        }
        Some(self.claim(true).await)
    }

    /// ストア変更通知を反映
    pub fn apply_change(&self, change: &StoreChange) {
        if change.key != ACTIVE_READER_KEY || !self.ensure_valid() {
            return;
        }

        let owner_is_self = change
            .new_value
            .clone()
            .and_then(|v| serde_json::from_value::<ReaderLockRecord>(v).ok())
            .is_some_and(|record| record.id == self.instance_id);
        self.set_leader(owner_is_self);
    }

    /// 初回取得を行い、ハートビートと変更購読を開始
    pub async fn start(self: &Arc<Self>) -> LeaderState {
        let state = self.claim(false).await;
        if state == LeaderState::TornDown {
            return state;
        }

        let heartbeat = tokio::spawn(Self::run_heartbeat(
            Arc::downgrade(self),
            Duration::from_millis(self.settings.heartbeat_ms),
        ));
        let listener = tokio::spawn(Self::run_change_listener(
            Arc::downgrade(self),
            self.store.subscribe(),
        ));
        self.tasks.lock().extend([heartbeat, listener]);

        tracing::info!(
            instance_id = %self.instance_id,
            state = ?state,
            "🔒 リーダーロックを開始"
        );
        state
    }

    async fn run_heartbeat(lock: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            let Some(lock) = lock.upgrade() else { break };
            if lock.heartbeat().await == LeaderState::TornDown {
                break;
            }
        }
    }

    async fn run_change_listener(
        lock: Weak<Self>,
        mut changes: tokio::sync::broadcast::Receiver<StoreChange>,
    ) {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let Some(lock) = lock.upgrade() else { break };
                    lock.apply_change(&change);
                    if lock.is_torn_down() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped = skipped, "⚠️ ストア変更通知を取りこぼしました");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// 停止（ハートビート解除、以降の書き込みなし）
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.is_leader.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::warn!(
            instance_id = %self.instance_id,
            "🛑 拡張コンテキストが無効化されたためリーダーロックを停止"
        );
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::at(12, 0)),
            }
        }

        fn lock(&self) -> (LeaderLock, Arc<RuntimeContext>) {
            let host = Arc::new(RuntimeContext::new());
            let lock = LeaderLock::new(
                self.store.clone(),
                host.clone(),
                self.clock.clone(),
                LockSettings::default(),
            );
            (lock, host)
        }

        fn record(&self) -> Option<ReaderLockRecord> {
            self.store
                .peek(ACTIVE_READER_KEY)
                .and_then(|v| serde_json::from_value(v).ok())
        }
    }

    #[tokio::test]
    async fn test_first_claim_wins_when_no_record() {
        let fx = Fixture::new();
        let (a, _) = fx.lock();
        let (b, _) = fx.lock();

        assert_eq!(a.claim(false).await, LeaderState::Leader);
        assert_eq!(b.claim(false).await, LeaderState::Follower);
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(fx.record().unwrap().id, a.instance_id());
    }

    #[tokio::test]
    async fn test_malformed_record_counts_as_absent() {
        let values = [(ACTIVE_READER_KEY.to_string(), serde_json::json!("not a record"))]
            .into_iter()
            .collect();
        let fx = Fixture {
            store: Arc::new(MemoryStore::with_values(values)),
            clock: Arc::new(ManualClock::at(12, 0)),
        };
        let (a, _) = fx.lock();

        assert_eq!(a.claim(false).await, LeaderState::Leader);
        assert_eq!(fx.record().unwrap().id, a.instance_id());
    }

    #[tokio::test]
    async fn test_expired_record_is_taken_over() {
        let fx = Fixture::new();
        let (a, _) = fx.lock();
        let (b, _) = fx.lock();

        a.claim(false).await;
        fx.clock.advance(Duration::from_millis(8001));

        assert_eq!(b.heartbeat().await, LeaderState::Leader);
        // 旧リーダーは次のハートビートで降格する
        assert_eq!(a.heartbeat().await, LeaderState::Follower);
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_heartbeat_renews_own_record() {
        let fx = Fixture::new();
        let (a, _) = fx.lock();
        let (b, _) = fx.lock();

        a.claim(false).await;
        for _ in 0..10 {
            fx.clock.advance(Duration::from_millis(2000));
            assert_eq!(a.heartbeat().await, LeaderState::Leader);
            assert_eq!(b.heartbeat().await, LeaderState::Follower);
        }
    }

    #[tokio::test]
    async fn test_forced_claim_and_interaction_debounce() {
        let fx = Fixture::new();
        let (a, _) = fx.lock();
        let (b, _) = fx.lock();

        a.claim(false).await;
        assert_eq!(b.on_user_interaction().await, Some(LeaderState::Leader));

        // 1秒以内の再操作は無視
        fx.clock.advance(Duration::from_millis(500));
        assert_eq!(b.on_user_interaction().await, None);

        fx.clock.advance(Duration::from_millis(600));
        assert_eq!(a.on_user_interaction().await, Some(LeaderState::Leader));
        assert_eq!(fx.record().unwrap().id, a.instance_id());
    }

    #[tokio::test]
    async fn test_apply_change_tracks_owner() {
        let fx = Fixture::new();
        let (a, _) = fx.lock();
        a.claim(false).await;

        let other = ReaderLockRecord {
            id: "other".to_string(),
            last_seen: fx.clock.now_millis(),
        };
        a.apply_change(&StoreChange {
            key: ACTIVE_READER_KEY.to_string(),
            old_value: None,
            new_value: Some(serde_json::to_value(&other).unwrap()),
        });
        assert!(!a.is_leader());

        // 無関係なキーは無視
        a.apply_change(&StoreChange {
            key: "speakerId".to_string(),
            old_value: None,
            new_value: Some(serde_json::json!(1)),
        });
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_invalidated_context_is_terminal() {
        let fx = Fixture::new();
        let (a, host) = fx.lock();
        a.claim(false).await;
        let before = fx.record();

        host.invalidate();
        fx.clock.advance(Duration::from_millis(2000));

        assert_eq!(a.heartbeat().await, LeaderState::TornDown);
        assert_eq!(a.claim(true).await, LeaderState::TornDown);
        assert!(!a.is_leader());
        assert!(a.is_torn_down());
        // 無効化後はレコードを書き換えない
        assert_eq!(fx.record(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_locks_converge_through_notifications() {
        let fx = Fixture::new();
        let (a, _) = fx.lock();
        let (b, _) = fx.lock();
        let a = Arc::new(a);
        let b = Arc::new(b);

        assert_eq!(a.start().await, LeaderState::Leader);
        assert_eq!(b.start().await, LeaderState::Follower);

        b.on_user_interaction().await;
        // 変更通知タスクを進める
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(b.is_leader());
        assert!(!a.is_leader());
    }

    #[test]
    fn test_record_expiry() {
        let record = ReaderLockRecord {
            id: "x".to_string(),
            last_seen: 1000,
        };
        assert!(!record.is_expired(9000, 8000));
        assert!(record.is_expired(9001, 8000));

        let missing = ReaderLockRecord {
            id: "x".to_string(),
            last_seen: 0,
        };
        assert!(missing.is_expired(1, 8000));
    }
}
