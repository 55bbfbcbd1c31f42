//! チャット時刻表示の鮮度判定
//!
//! `H:MM`（am/pm付き可）の時刻表示から、そのメッセージが「いま」投稿されたものかを推定する。
//! 分単位の表示しか無いため厳密な判定はできず、迷った場合は読み上げ側に倒す。

use std::sync::OnceLock;

use chrono::{NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: i32 = 1440;

/// 日付またぎ補正を行う差分の閾値（分）
const WRAPAROUND_THRESHOLD: i32 = 1000;

fn time_pattern() -> &'static Regex {
    static TIME_PATTERN: OnceLock<Regex> = OnceLock::new();
    TIME_PATTERN.get_or_init(|| Regex::new(r"(\d{1,2}):(\d{2})").expect("時刻パターンは固定値"))
}

/// 「最近」とみなす時間幅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecencyWindow {
    /// 過去方向の許容幅（分）
    pub past_minutes: i32,
    /// 未来方向の許容幅（分）
    pub future_minutes: i32,
}

impl Default for RecencyWindow {
    fn default() -> Self {
        // ダッシュボードの再描画遅延を吸収するため前後10分
        Self {
            past_minutes: 10,
            future_minutes: 10,
        }
    }
}

/// 時刻表示を0時からの経過分に変換
///
/// 解釈できない場合は`None`。
pub fn parse_minutes_of_day(time_text: &str) -> Option<i32> {
    let captures = time_pattern().captures(time_text)?;
    let mut hour: i32 = captures.get(1)?.as_str().parse().ok()?;
    let minute: i32 = captures.get(2)?.as_str().parse().ok()?;

    let lower = time_text.to_lowercase();
    if lower.contains("pm") && hour < 12 {
        hour += 12;
    }
    if lower.contains("am") && hour == 12 {
        hour = 0;
    }

    Some(hour * 60 + minute)
}

/// 現在時刻との符号付き差分（分）。日付またぎを補正済み
pub fn minutes_since(message_minutes: i32, now: NaiveTime) -> i32 {
    let now_minutes = (now.hour() * 60 + now.minute()) as i32;
    let mut diff = now_minutes - message_minutes;

    if diff < -WRAPAROUND_THRESHOLD {
        diff += MINUTES_PER_DAY;
    }
    if diff > WRAPAROUND_THRESHOLD {
        diff -= MINUTES_PER_DAY;
    }
    diff
}

/// 時刻表示が最近のものかを判定
///
/// 空文字列や解釈できない表示は「最近」として扱う。
pub fn is_recent(time_text: &str, now: NaiveTime, window: RecencyWindow) -> bool {
    if time_text.trim().is_empty() {
        return true;
    }

    match parse_minutes_of_day(time_text) {
        Some(message_minutes) => {
            let diff = minutes_since(message_minutes, now);
            diff >= -window.future_minutes && diff <= window.past_minutes
        }
        None => true,
    }
}
