//! チャット文字列の正規化ユーティリティ
//!
//! 表示名の正規化、リプライ宛先の整形、読み上げ前のテキスト加工を行う純粋関数群

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// 読み上げ文字数超過時に付与する省略マーカー
pub const ELISION_MARKER: &str = "、以下省略";

/// リプライ宛先名の末尾から除去する句読点
const TRAILING_PUNCTUATION: &[char] = &[',', ':', '：', '、', '。', '.', '!', '?', '！', '？'];

/// メンション記号（半角・全角）
const MENTION_MARKS: &[char] = &['@', '＠'];

fn url_pattern() -> &'static Regex {
    static URL_PATTERN: OnceLock<Regex> = OnceLock::new();
    URL_PATTERN.get_or_init(|| Regex::new(r"https?://\S+").expect("URLパターンは固定値"))
}

/// 表示名を比較用に正規化（前後空白除去 → NFKC → 小文字化）
pub fn normalize_display_name(name: &str) -> String {
    name.trim().nfkc().collect::<String>().to_lowercase()
}

/// リプライ宛先ユーザー名を整形
///
/// 先頭の`@`/`＠`と末尾の句読点を取り除く。
pub fn sanitize_reply_target(name: &str) -> String {
    name.trim()
        .trim_start_matches(MENTION_MARKS)
        .trim_end_matches(TRAILING_PUNCTUATION)
        .trim()
        .to_string()
}

/// 先頭メンション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadingMention {
    /// メンション部分（後続の空白を含む）のバイト長
    pub raw_len: usize,
    /// 整形済みユーザー名
    pub username: String,
}

/// テキスト先頭の`@name`を取り出す
pub fn leading_mention(text: &str) -> Option<LeadingMention> {
    let rest = text.strip_prefix(MENTION_MARKS)?;
    let name_len = rest
        .find(|c: char| c.is_whitespace() || MENTION_MARKS.contains(&c))
        .unwrap_or(rest.len());
    if name_len == 0 {
        return None;
    }

    let after = rest[name_len..].trim_start();
    Some(LeadingMention {
        raw_len: text.len() - after.len(),
        username: sanitize_reply_target(&rest[..name_len]),
    })
}

/// 宛先ユーザーへの先頭メンションを繰り返し除去
///
/// `"@alice @alice hello"` を宛先`alice`で処理すると`"hello"`になる。
/// 別ユーザーへのメンションに達した時点で停止する。
pub fn strip_leading_mentions(text: &str, target: &str) -> String {
    let normalized_target = normalize_display_name(target);
    if normalized_target.is_empty() {
        return text.trim().to_string();
    }

    let mut remaining = text;
    while let Some(mention) = leading_mention(remaining) {
        if mention.username.is_empty()
            || normalize_display_name(&mention.username) != normalized_target
        {
            break;
        }
        remaining = &remaining[mention.raw_len..];
    }

    remaining.trim().to_string()
}

/// 表示名末尾の` (ログイン名)`を除去
pub fn strip_author_suffix(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.ends_with(')') {
        if let Some(open) = trimmed.find('(') {
            return trimmed[..open].trim().to_string();
        }
    }
    trimmed.to_string()
}

/// URLを`URL`という語に置換
pub fn replace_urls(text: &str) -> String {
    url_pattern().replace_all(text, "URL").into_owned()
}

/// 同一文字の3連続以上を1文字に縮約
///
/// 単語の繰り返し（`"hi hi hi"`）は対象外。
pub fn collapse_repeats(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }

        if run >= 3 && !is_line_terminator(c) {
            result.push(c);
        } else {
            result.extend(std::iter::repeat(c).take(run));
        }
        i += run;
    }

    result
}

/// 連続の畳み込み対象外にする改行文字
fn is_line_terminator(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}')
}

/// 文字数で切り詰め、切り詰めた場合はマーカーを付与
pub fn truncate_chars(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(marker);
    truncated
}

/// 名前を読み上げ用の呼びかけ形式にする（`名前さん。`）
pub fn speech_name(name: &str) -> String {
    let trimmed = name.trim();
    let safe = trimmed
        .strip_suffix(':')
        .or_else(|| trimmed.strip_suffix('：'))
        .unwrap_or(trimmed);
    if safe.is_empty() {
        String::new()
    } else {
        format!("{}さん。", safe)
    }
}
