//! NDJSON (Newline Delimited JSON) file processing utilities.
//!
//! リプレイスクリプト（1行1イベント）の読み込みに使う。

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dom::{ElementNode, Node};

/// Comprehensive error types for replay file I/O and parsing.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// I/O error when reading files
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error at line {line}: {source}")]
    JsonParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid file format
    #[error("Invalid file format at line {line}: {reason}")]
    InvalidFormat { line: usize, reason: String },

    /// Empty or invalid data
    #[error("No valid data found: {context}")]
    NoData { context: String },

    /// Event refers to a node the script never inserted
    #[error("Unknown node key '{key}'")]
    UnknownKey { key: String },
}

impl ReplayError {
    /// Create an invalid format error
    pub fn invalid_format(line: usize, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            line,
            reason: reason.into(),
        }
    }

    /// Create a no data error
    pub fn no_data(context: impl Into<String>) -> Self {
        Self::NoData {
            context: context.into(),
        }
    }
}

/// リプレイスクリプトの1イベント
///
/// `key`はスクリプト内でノードを指す名前。`parent`を省略すると文書ルートへ挿入する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    /// 要素を挿入して構造変更を通知
    Insert {
        key: String,
        #[serde(default)]
        parent: Option<String>,
        node: ElementNode,
    },
    /// 要素を文書から切り離す
    Detach { key: String },
    /// 子要素を差し替える（描画途中の行の更新）
    Replace { key: String, children: Vec<Node> },
    /// ページ内遷移
    Navigate { url: String },
    /// 表示状態の変化
    Visibility { visible: bool },
    /// ユーザー操作
    Interact,
    /// 指定ミリ秒待つ
    Wait { ms: u64 },
}

impl ReplayEvent {
    /// 参照しているノードキー
    pub fn key(&self) -> Option<&str> {
        match self {
            ReplayEvent::Insert { key, .. }
            | ReplayEvent::Detach { key }
            | ReplayEvent::Replace { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Parse NDJSON lines from any reader.
///
/// 空行と`#`で始まる行は読み飛ばす。`validate_entry`には行番号（1始まり）も渡す。
pub fn parse_ndjson_reader<T, R, F>(
    reader: R,
    source_name: &str,
    validate_entry: Option<F>,
) -> Result<Vec<T>, ReplayError>
where
    T: for<'de> Deserialize<'de>,
    R: BufRead,
    F: Fn(usize, &T) -> Result<(), ReplayError>,
{
    let mut entries = Vec::new();

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();

        // Skip empty lines and comments
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let entry: T = serde_json::from_str(trimmed).map_err(|e| ReplayError::JsonParse {
            line: line_number + 1,
            source: e,
        })?;

        if let Some(ref validator) = validate_entry {
            validator(line_number + 1, &entry)?;
        }

        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(ReplayError::no_data(format!(
            "No valid entries found in '{}'",
            source_name
        )));
    }

    Ok(entries)
}

/// Parse an NDJSON file with an optional per-entry validator.
pub fn parse_ndjson_file_generic<T, F>(
    path: impl AsRef<Path>,
    validate_entry: Option<F>,
) -> Result<Vec<T>, ReplayError>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(usize, &T) -> Result<(), ReplayError>,
{
    let path = path.as_ref();
    let file = File::open(path)?;
    parse_ndjson_reader(
        BufReader::new(file),
        &path.display().to_string(),
        validate_entry,
    )
}

fn validate_event(line: usize, event: &ReplayEvent) -> Result<(), ReplayError> {
    if let Some(key) = event.key() {
        if key.trim().is_empty() {
            return Err(ReplayError::invalid_format(line, "empty node key"));
        }
    }
    if let ReplayEvent::Insert {
        parent: Some(parent),
        ..
    } = event
    {
        if parent.trim().is_empty() {
            return Err(ReplayError::invalid_format(line, "empty parent key"));
        }
    }
    Ok(())
}

/// リプレイスクリプトを読み込む
pub fn parse_replay_file(path: impl AsRef<Path>) -> Result<Vec<ReplayEvent>, ReplayError> {
    parse_ndjson_file_generic(path, Some(validate_event))
}

/// 文字列からリプレイスクリプトを読み込む
pub fn parse_replay_str(script: &str) -> Result<Vec<ReplayEvent>, ReplayError> {
    parse_ndjson_reader(script.as_bytes(), "<inline>", Some(validate_event))
}
