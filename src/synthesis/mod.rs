//! 音声合成と再生
//!
//! 中継チャネルの受信側。VOICEVOXで音声を合成し、単一の再生キューで順番に鳴らす。

pub mod dispatcher;
pub mod playback;
pub mod voicevox;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use dispatcher::SpeechDispatcher;
pub use playback::{AudioOutput, PlaybackQueue, RodioOutput};
pub use voicevox::{VoicevoxClient, VoicevoxConfig};

/// エラー本文を切り詰める文字数
const ERROR_TEXT_MAX_CHARS: usize = 160;

/// 合成・再生のエラー
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("接続に失敗しました: {0}")]
    Connection(String),

    #[error("HTTPリクエストに失敗しました: {0}")]
    Http(#[from] reqwest::Error),

    #[error("VOICEVOXに接続できません ({path})。試行先: {tried}。{errors}")]
    BackendUnavailable {
        path: String,
        tried: String,
        errors: String,
    },

    #[error("音声出力エラー: {0}")]
    AudioOutput(String),

    #[error("音声デコードエラー: {0}")]
    AudioDecode(String),

    #[error("JSONパースエラー: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// 音声合成エンジン
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// 話者一覧
    async fn speakers(&self) -> Result<Value, SynthesisError>;

    /// テキストをWAVに合成
    async fn synthesize(
        &self,
        text: &str,
        speaker_id: i64,
        speed: f64,
    ) -> Result<Vec<u8>, SynthesisError>;

    /// エンジン名
    fn name(&self) -> &'static str;
}

/// エラー本文を1行に整形して切り詰める
pub fn sanitize_error_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(ERROR_TEXT_MAX_CHARS)
        .collect()
}
