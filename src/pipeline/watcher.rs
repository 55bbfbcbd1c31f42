//! 構造変更の監視
//!
//! 追加されたノードからチャット行コンテナを集め、安定待ちゲートへ渡す。
//! 起動直後の猶予期間中と非リーダーの間は何もしない。一度に大量の行が追加された場合は
//! 履歴の再描画とみなし、新着として読み上げない。

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::processor::MessageProcessor;
use super::stability::StabilityGate;
use crate::clock::Clock;
use crate::config::{ConfigHandle, MassRedrawPolicy, MassRedrawSettings};
use crate::dom::{ChatDocument, ContainerRef, MutationRecord, NodeId, Selector};
use crate::lock::LeaderLock;

/// チャット行コンテナ
pub const CONTAINER_SELECTORS: &[Selector] = &[
    Selector::class("chat-line__message"),
    Selector::tag_attr_eq("div", "data-test-selector", "chat-line-message"),
    Selector::class("chat-line__message-container"),
];

/// 「新着メッセージ」インジケーター
const NEW_MESSAGES_INDICATOR_CLASS: &str = "chat-list__new-messages-indicator";
const NEW_MESSAGES_INDICATOR_TEXT: &str = "新着メッセージ";

/// 1回の変更通知に対する結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// 読み上げ無効
    Disabled,
    /// リーダーではない
    NotLeader,
    /// 起動・復帰直後の猶予期間中
    WarmingUp,
    /// 候補を安定待ちへ渡した
    Scheduled { candidates: usize, scheduled: usize },
    /// 大量再描画として扱った
    MassRedraw { candidates: usize, forwarded: usize },
}

/// 構造変更の監視
pub struct MutationWatcher {
    config: ConfigHandle,
    lock: Arc<LeaderLock>,
    processor: Arc<MessageProcessor>,
    gate: Arc<StabilityGate>,
    clock: Arc<dyn Clock>,
    mass_redraw: MassRedrawSettings,
    /// 猶予期間の起点（エポックミリ秒）
    grace_started_at: Mutex<i64>,
    last_location: Mutex<Option<String>>,
}

impl MutationWatcher {
    pub fn new(
        config: ConfigHandle,
        lock: Arc<LeaderLock>,
        processor: Arc<MessageProcessor>,
        gate: Arc<StabilityGate>,
        clock: Arc<dyn Clock>,
        mass_redraw: MassRedrawSettings,
    ) -> Self {
        let started_at = clock.now_millis();
        Self {
            config,
            lock,
            processor,
            gate,
            clock,
            mass_redraw,
            grace_started_at: Mutex::new(started_at),
            last_location: Mutex::new(None),
        }
    }

    /// 猶予期間をいまから数え直す
    pub fn restart_grace_period(&self) {
        *self.grace_started_at.lock() = self.clock.now_millis();
    }

    /// 猶予期間中か
    pub fn in_grace_period(&self) -> bool {
        let skip = self.config.snapshot().skip_duration();
        let started_at = *self.grace_started_at.lock();
        let elapsed = self.clock.now_millis().saturating_sub(started_at).max(0) as u128;
        elapsed < skip.as_millis()
    }

    /// 変更通知を処理
    pub fn on_mutations(&self, records: &[MutationRecord]) -> WatchOutcome {
        if !self.config.snapshot().enabled {
            return WatchOutcome::Disabled;
        }
        if !self.lock.is_leader() {
            return WatchOutcome::NotLeader;
        }
        if self.in_grace_period() {
            return WatchOutcome::WarmingUp;
        }

        let candidates = collect_candidates(records);
        if candidates.is_empty() {
            return WatchOutcome::Scheduled {
                candidates: 0,
                scheduled: 0,
            };
        }

        if candidates.len() >= self.mass_redraw.threshold {
            return self.handle_mass_redraw(candidates);
        }

        let total = candidates.len();
        let scheduled = candidates
            .into_iter()
            .filter(|container| self.gate.schedule(container.clone()))
            .count();
        WatchOutcome::Scheduled {
            candidates: total,
            scheduled,
        }
    }

    fn handle_mass_redraw(&self, candidates: Vec<ContainerRef>) -> WatchOutcome {
        let total = candidates.len();
        let keep = match self.mass_redraw.policy {
            MassRedrawPolicy::MarkAllRead => 0,
            MassRedrawPolicy::ProcessMostRecent { limit } => limit.min(total),
        };

        tracing::warn!(
            candidates = total,
            forwarded = keep,
            policy = ?self.mass_redraw.policy,
            "🌊 大量再描画を検出しました"
        );

        let (older, recent) = candidates.split_at(total - keep);
        for container in older {
            container.mark_read();
        }
        let forwarded = recent
            .iter()
            .filter(|container| self.gate.schedule((*container).clone()))
            .count();

        WatchOutcome::MassRedraw {
            candidates: total,
            forwarded,
        }
    }

    /// 表示中のコンテナをすべて既読の履歴として扱い、猶予期間をやり直す
    pub fn mark_backlog(&self, doc: &dyn ChatDocument) -> usize {
        let containers = doc.find_all(CONTAINER_SELECTORS);
        let count = containers.len();
        for container in containers {
            self.processor.remember_existing(container.as_ref());
        }
        self.restart_grace_period();
        count
    }

    /// URLが変わっていれば履歴扱いにする（変わっていれば`true`）
    pub fn check_location(&self, doc: &dyn ChatDocument) -> bool {
        let location = doc.location();
        let changed = {
            let mut last = self.last_location.lock();
            let changed = last.as_deref().is_some_and(|previous| previous != location);
            *last = Some(location.clone());
            changed
        };
        if changed {
            self.on_location_change(doc);
        }
        changed
    }

    /// ページ内遷移
    pub fn on_location_change(&self, doc: &dyn ChatDocument) {
        *self.last_location.lock() = Some(doc.location());
        let count = self.mark_backlog(doc);
        tracing::info!(location = %doc.location(), backlog = count, "🧭 ページ遷移を検出");
    }

    /// 表示状態の変化（再表示時のみ履歴扱いにする）
    pub fn on_visibility_change(&self, doc: &dyn ChatDocument, visible: bool) {
        if !visible {
            return;
        }
        let count = self.mark_backlog(doc);
        tracing::info!(backlog = count, "👀 タブの再表示を検出");
    }
}

fn is_indicator(node: &ContainerRef) -> bool {
    let snapshot = node.snapshot();
    snapshot.has_class(NEW_MESSAGES_INDICATOR_CLASS)
        || snapshot.text_content().contains(NEW_MESSAGES_INDICATOR_TEXT)
}

/// 追加ノードからコンテナ候補を文書順・重複なしで集める（既読は除外）
pub fn collect_candidates(records: &[MutationRecord]) -> Vec<ContainerRef> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut candidates = Vec::new();

    for record in records {
        for node in &record.added_nodes {
            if is_indicator(node) {
                continue;
            }

            let mut found = Vec::new();
            if node.snapshot().matches_any(CONTAINER_SELECTORS) {
                found.push(node.clone());
            }
            found.extend(node.find_all(CONTAINER_SELECTORS));

            for container in found {
                if container.is_read() {
                    continue;
                }
                if seen.insert(container.node_id()) {
                    candidates.push(container);
                }
            }
        }
    }

    candidates
}
