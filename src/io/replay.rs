//! リプレイスクリプトの再生
//!
//! メモリ上の文書にイベントを順に適用し、読み上げリーダーへ通知する。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::ndjson::{ReplayError, ReplayEvent};
use crate::clock::ManualClock;
use crate::dom::{MemoryDocument, NodeId};
use crate::pipeline::WatchOutcome;
use crate::reader::ChatReader;

/// 再生結果の集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub inserted: usize,
    pub scheduled: usize,
    pub mass_redraws: usize,
    pub ignored_batches: usize,
    pub navigations: usize,
}

/// リプレイの実行器
pub struct ReplayDriver<'a> {
    reader: &'a ChatReader,
    doc: MemoryDocument,
    nodes: HashMap<String, NodeId>,
    summary: ReplaySummary,
    virtual_clock: Option<Arc<ManualClock>>,
}

impl<'a> ReplayDriver<'a> {
    pub fn new(reader: &'a ChatReader, doc: MemoryDocument) -> Self {
        Self {
            reader,
            doc,
            nodes: HashMap::new(),
            summary: ReplaySummary::default(),
            virtual_clock: None,
        }
    }

    /// `wait`イベントで手動時計も進める
    pub fn with_manual_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.virtual_clock = Some(clock);
        self
    }

    pub fn document(&self) -> &MemoryDocument {
        &self.doc
    }

    /// スクリプト内のキーに対応するノード
    pub fn node(&self, key: &str) -> Option<NodeId> {
        self.nodes.get(key).copied()
    }

    fn resolve(&self, key: &str) -> Result<NodeId, ReplayError> {
        self.node(key).ok_or_else(|| ReplayError::UnknownKey {
            key: key.to_string(),
        })
    }

    /// 1イベントを適用
    pub async fn apply(&mut self, event: ReplayEvent) -> Result<(), ReplayError> {
        self.summary.events += 1;

        match event {
            ReplayEvent::Insert { key, parent, node } => {
                let parent = match parent {
                    Some(parent) => self.resolve(&parent)?,
                    None => self.doc.root(),
                };
                let id = self.doc.append(parent, node);
                if self.nodes.insert(key.clone(), id).is_some() {
                    tracing::debug!(key = %key, "🔁 同じキーのノードを上書き");
                }
                self.summary.inserted += 1;

                let outcome = self
                    .reader
                    .on_mutations(&self.doc, &[self.doc.mutation(&[id])]);
                self.record(outcome);
            }
            ReplayEvent::Detach { key } => {
                let id = self.resolve(&key)?;
                self.doc.detach(id);
            }
            ReplayEvent::Replace { key, children } => {
                let id = self.resolve(&key)?;
                self.doc.replace_children(id, children);
            }
            ReplayEvent::Navigate { url } => {
                self.doc.set_location(&url);
                if self.reader.on_location_change(&self.doc) {
                    self.summary.navigations += 1;
                }
            }
            ReplayEvent::Visibility { visible } => {
                self.doc.set_visible(visible);
                self.reader.on_visibility_change(&self.doc);
            }
            ReplayEvent::Interact => {
                let state = self.reader.on_user_interaction().await;
                tracing::debug!(state = ?state, "🖱️ ユーザー操作");
            }
            ReplayEvent::Wait { ms } => {
                let wait = Duration::from_millis(ms);
                if let Some(clock) = &self.virtual_clock {
                    clock.advance(wait);
                }
                tokio::time::sleep(wait).await;
            }
        }
        Ok(())
    }

    fn record(&mut self, outcome: WatchOutcome) {
        match outcome {
            WatchOutcome::Scheduled { scheduled, .. } => self.summary.scheduled += scheduled,
            WatchOutcome::MassRedraw { forwarded, .. } => {
                self.summary.mass_redraws += 1;
                self.summary.scheduled += forwarded;
            }
            WatchOutcome::Disabled | WatchOutcome::NotLeader | WatchOutcome::WarmingUp => {
                self.summary.ignored_batches += 1;
            }
        }
    }

    /// 全イベントを適用し、安定待ちが片付くまで待つ
    pub async fn run(
        mut self,
        events: Vec<ReplayEvent>,
        settle: Duration,
    ) -> Result<ReplaySummary, ReplayError> {
        for event in events {
            self.apply(event).await?;
        }

        let deadline = tokio::time::Instant::now() + settle;
        while self.reader.pending_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tracing::info!(summary = ?self.summary, "🏁 リプレイ完了");
        Ok(self.summary)
    }
}
