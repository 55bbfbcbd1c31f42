//! 時刻ソース
//!
//! 履歴の有効期限やリーダーロックのTTLはエポックミリ秒、鮮度判定はローカル時刻を使う。

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, Utc};

/// 時刻の取得元
pub trait Clock: Send + Sync {
    /// 現在時刻（エポックミリ秒）
    fn now_millis(&self) -> i64;

    /// 現在のローカル時刻
    fn local_time(&self) -> NaiveTime;
}

/// システム時計
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// 手動で進める時計（テスト・リプレイ用）
#[derive(Debug)]
pub struct ManualClock {
    base_local: NaiveDateTime,
    base_millis: i64,
    now_millis: AtomicI64,
}

impl ManualClock {
    const BASE_MILLIS: i64 = 1_700_000_000_000;

    /// 指定したローカル時刻から始まる時計を作成
    pub fn new(local: NaiveDateTime) -> Self {
        Self {
            base_local: local,
            base_millis: Self::BASE_MILLIS,
            now_millis: AtomicI64::new(Self::BASE_MILLIS),
        }
    }

    /// 任意の日付の`hour:minute`から始まる時計を作成
    pub fn at(hour: u32, minute: u32) -> Self {
        let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
        Self::new(NaiveDateTime::new(chrono::NaiveDate::default(), time))
    }

    /// 時計を進める
    pub fn advance(&self, duration: Duration) {
        self.now_millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_millis.load(Ordering::SeqCst)
    }

    fn local_time(&self) -> NaiveTime {
        let elapsed = self.now_millis() - self.base_millis;
        (self.base_local + chrono::Duration::milliseconds(elapsed)).time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_views() {
        let clock = ManualClock::at(23, 59);
        let start = clock.now_millis();

        clock.advance(Duration::from_secs(120));

        assert_eq!(clock.now_millis() - start, 120_000);
        assert_eq!(clock.local_time(), NaiveTime::from_hms_opt(0, 1, 0).unwrap());
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }
}
