//! 既読履歴（シグネチャ → 最終確認時刻）

use std::collections::HashMap;

use super::message::MessageSignature;

/// 重複判定と保持期間を管理する履歴
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    entries: HashMap<MessageSignature, i64>,
    retention_ms: i64,
    dedup_window_ms: i64,
}

impl HistoryLedger {
    pub fn new(retention_ms: i64, dedup_window_ms: i64) -> Self {
        Self {
            entries: HashMap::new(),
            retention_ms,
            dedup_window_ms,
        }
    }

    /// 保持期間を過ぎたエントリを削除
    pub fn prune(&mut self, now_millis: i64) -> usize {
        let before = self.entries.len();
        let retention = self.retention_ms;
        self.entries
            .retain(|_, last_seen| now_millis - *last_seen <= retention);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::trace!(removed = removed, remaining = self.entries.len(), "🧹 履歴を整理");
        }
        removed
    }

    /// 重複か判定する（重複なら確認時刻を更新して`true`）
    ///
    /// ID由来のシグネチャは保持期間中ずっと重複扱い、内容由来は重複判定窓の内側だけ。
    pub fn check_duplicate(&mut self, signature: &MessageSignature, now_millis: i64) -> bool {
        let Some(last_seen) = self.entries.get_mut(signature) else {
            return false;
        };

        let duplicate =
            signature.is_id_based() || now_millis - *last_seen < self.dedup_window_ms;
        if duplicate {
            *last_seen = now_millis;
        }
        duplicate
    }

    /// 確認時刻を記録
    pub fn record(&mut self, signature: MessageSignature, now_millis: i64) {
        self.entries.insert(signature, now_millis);
    }

    pub fn last_seen(&self, signature: &MessageSignature) -> Option<i64> {
        self.entries.get(signature).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
