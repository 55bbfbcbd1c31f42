//! チャット取り込みパイプライン
//!
//! 構造変更の監視 → 描画安定待ち → 抽出 → 重複判定・フィルタ → 読み上げ要求 の順に流れる。

pub mod extractor;
pub mod ledger;
pub mod message;
pub mod processor;
pub mod speech;
pub mod stability;
pub mod watcher;

pub use extractor::{extract, extract_from_node};
pub use ledger::HistoryLedger;
pub use message::{ExtractedMessage, MessageSignature};
pub use processor::{MessageProcessor, ProcessOutcome};
pub use speech::{build_speak_payload, build_speech_text};
pub use stability::StabilityGate;
pub use watcher::{MutationWatcher, WatchOutcome, CONTAINER_SELECTORS};
