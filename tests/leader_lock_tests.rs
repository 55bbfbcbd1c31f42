//! リーダーロック統合テスト
//!
//! 同じ共有ストアを使う複数インスタンス（タブ）の間で、読み上げ担当が1つに収束することを確認する。

use std::sync::Arc;
use std::time::Duration;

use chatvox::lock::{LeaderLock, LeaderState, LockSettings, ReaderLockRecord, ACTIVE_READER_KEY};
use chatvox::{ManualClock, MemoryStore, RuntimeContext};

struct Tabs {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl Tabs {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::at(21, 0)),
        }
    }

    fn open(&self) -> (Arc<LeaderLock>, Arc<RuntimeContext>) {
        let host = Arc::new(RuntimeContext::new());
        let lock = Arc::new(LeaderLock::new(
            self.store.clone(),
            host.clone(),
            self.clock.clone(),
            LockSettings::default(),
        ));
        (lock, host)
    }

    fn owner(&self) -> Option<String> {
        self.store
            .peek(ACTIVE_READER_KEY)
            .and_then(|v| serde_json::from_value::<ReaderLockRecord>(v).ok())
            .map(|record| record.id)
    }
}

fn leaders(locks: &[&Arc<LeaderLock>]) -> usize {
    locks.iter().filter(|lock| lock.is_leader()).count()
}

#[cfg(test)]
mod convergence_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_two_tabs_converge_on_one_leader() {
        let tabs = Tabs::new();
        let (a, _) = tabs.open();
        let (b, _) = tabs.open();

        assert_eq!(a.start().await, LeaderState::Leader);
        assert_eq!(b.start().await, LeaderState::Follower);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(leaders(&[&a, &b]), 1);
        assert_eq!(tabs.owner().as_deref(), Some(a.instance_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interaction_moves_leadership() {
        let tabs = Tabs::new();
        let (a, _) = tabs.open();
        let (b, _) = tabs.open();
        a.start().await;
        b.start().await;

        assert_eq!(b.on_user_interaction().await, Some(LeaderState::Leader));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(b.is_leader());
        assert!(!a.is_leader());

        // 間隔制限内の操作は無視
        assert_eq!(b.on_user_interaction().await, None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(leaders(&[&a, &b]), 1);
        assert_eq!(tabs.owner().as_deref(), Some(b.instance_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_after_leader_stops() {
        let tabs = Tabs::new();
        let (a, _) = tabs.open();
        let (b, _) = tabs.open();
        a.start().await;
        b.start().await;

        // リーダー側のタブが閉じられてハートビートが止まる
        a.teardown();
        tabs.clock.advance(Duration::from_secs(9));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(b.is_leader());
        assert_eq!(tabs.owner().as_deref(), Some(b.instance_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_tabs_converge() {
        let tabs = Tabs::new();
        let locks: Vec<Arc<LeaderLock>> = (0..5).map(|_| tabs.open().0).collect();
        for lock in &locks {
            lock.start().await;
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        let refs: Vec<&Arc<LeaderLock>> = locks.iter().collect();
        assert_eq!(leaders(&refs), 1);
    }
}

#[cfg(test)]
mod invalidation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_context_stops_writes() {
        let tabs = Tabs::new();
        let (a, host) = tabs.open();
        a.start().await;
        let before = tabs.store.peek(ACTIVE_READER_KEY);

        host.invalidate();
        tabs.clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(a.is_torn_down());
        assert!(!a.is_leader());
        // 無効化後はレコードを更新しない
        assert_eq!(tabs.store.peek(ACTIVE_READER_KEY), before);
        assert_eq!(a.claim(true).await, LeaderState::TornDown);
        assert_eq!(a.on_user_interaction().await, Some(LeaderState::TornDown));
    }
}
