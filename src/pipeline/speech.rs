//! 読み上げ要求の組み立て
//!
//! URL置換 → 辞書置換 → 名前の前置 → 連続文字の縮約 → 文字数制限 の順に加工する。

use regex::{NoExpand, RegexBuilder};

use super::message::{ExtractedMessage, MessageSignature};
use crate::config::{DictionaryRule, ReaderConfig};
use crate::relay::SpeakPayload;
use crate::text;

/// 話者IDが未設定（0）の場合に使う話者
const FALLBACK_SPEAKER_ID: i64 = 3;

/// 辞書ルールを順に適用（大文字小文字を区別しない全置換）
///
/// パターンを組み立てられない場合は単純な部分文字列置換に切り替える。
pub fn apply_dictionary(input: &str, rules: &[DictionaryRule]) -> String {
    let mut output = input.to_string();
    for rule in rules {
        if rule.from.is_empty() || rule.to.is_empty() {
            continue;
        }
        output = match RegexBuilder::new(&regex::escape(&rule.from))
            .case_insensitive(true)
            .build()
        {
            Ok(pattern) => pattern
                .replace_all(&output, NoExpand(rule.to.as_str()))
                .into_owned(),
            Err(e) => {
                tracing::debug!(from = %rule.from, error = %e, "⚠️ 辞書パターンを単純置換で適用");
                output.replace(&rule.from, &rule.to)
            }
        };
    }
    output
}

/// 読み上げテキストを組み立てる
pub fn build_speech_text(message: &ExtractedMessage, config: &ReaderConfig) -> String {
    let body = text::replace_urls(&message.text);
    let body = apply_dictionary(&body, &config.dictionary);

    let mut prefix = String::new();
    if config.read_name {
        prefix.push_str(&text::speech_name(&message.username));
    }
    if message.is_reply && !message.reply_target_username.is_empty() {
        prefix.push_str(&text::speech_name(&message.reply_target_username));
    }

    let spoken = text::collapse_repeats(&format!("{}{}", prefix, body));
    text::truncate_chars(&spoken, config.max_length, text::ELISION_MARKER)
}

/// 読み上げ要求を組み立てる
pub fn build_speak_payload(
    message: &ExtractedMessage,
    signature: &MessageSignature,
    config: &ReaderConfig,
) -> SpeakPayload {
    SpeakPayload {
        text: build_speech_text(message, config),
        speaker_id: if config.speaker_id == 0 {
            FALLBACK_SPEAKER_ID
        } else {
            config.speaker_id
        },
        speed: positive_or_one(config.speed),
        volume: positive_or_one(config.volume),
        device_id: config.audio_device_id.trim().to_string(),
        unique_id: signature.to_string(),
    }
}

fn positive_or_one(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(username: &str, text: &str) -> ExtractedMessage {
        ExtractedMessage {
            username: username.to_string(),
            raw_text: text.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_truncation_keeps_repeated_words() {
        let config = ReaderConfig {
            max_length: 10,
            ..ReaderConfig::default()
        };
        let spoken = build_speech_text(&message("Mo", "hi hi hi there"), &config);
        assert_eq!(spoken, "hi hi hi t、以下省略");
    }

    #[test]
    fn test_url_and_repeat_collapse() {
        let config = ReaderConfig::default();
        let spoken = build_speech_text(&message("a", "見て http://x.com/abc wwwww"), &config);
        assert_eq!(spoken, "見て URL w");
    }

    #[test]
    fn test_dictionary_is_case_insensitive_and_literal() {
        let rules = vec![
            DictionaryRule::new("GG", "グッドゲーム"),
            DictionaryRule::new("a.b", "$1"),
            DictionaryRule::new("", "ignored"),
            DictionaryRule::new("skip", ""),
        ];
        assert_eq!(apply_dictionary("gg Gg", &rules), "グッドゲーム グッドゲーム");
        // メタ文字はエスケープ、置換先の`$`はそのまま
        assert_eq!(apply_dictionary("a.b axb", &rules), "$1 axb");
        assert_eq!(apply_dictionary("skip", &rules), "skip");
    }

    #[test]
    fn test_name_prefixes() {
        let config = ReaderConfig {
            read_name: true,
            ..ReaderConfig::default()
        };
        let mut reply = message("alice", "gg");
        reply.is_reply = true;
        reply.reply_target_username = "bob".to_string();

        assert_eq!(build_speech_text(&reply, &config), "aliceさん。bobさん。gg");

        let config = ReaderConfig::default();
        assert_eq!(build_speech_text(&reply, &config), "bobさん。gg");
    }

    #[test]
    fn test_payload_fallbacks() {
        let config = ReaderConfig {
            speaker_id: 0,
            speed: 0.0,
            volume: -1.0,
            audio_device_id: " speakers ".to_string(),
            ..ReaderConfig::default()
        };
        let m = message("mo", "hi");
        let payload = build_speak_payload(&m, &m.signature(), &config);

        assert_eq!(payload.speaker_id, 3);
        assert_eq!(payload.speed, 1.0);
        assert_eq!(payload.volume, 1.0);
        assert_eq!(payload.device_id, "speakers");
        assert_eq!(payload.unique_id, "mo::no-time::no-reply-target::hi");
    }
}
