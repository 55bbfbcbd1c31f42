pub mod clock;
pub mod config;
pub mod dom;
pub mod io;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod reader;
pub mod recency;
pub mod relay;
pub mod store;
pub mod synthesis;
pub mod text;

use thiserror::Error;

// Re-export the main error types for convenience
pub use config::ConfigError;
pub use io::ReplayError;
pub use relay::RelayError;
pub use store::StoreError;
pub use synthesis::SynthesisError;

// Re-export the reader and its collaborators
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, ConfigHandle, ConfigManager, PipelineSettings, ReaderConfig};
pub use dom::{ChatContainer, ChatDocument, ContainerRef, MemoryDocument, MutationRecord};
pub use lock::{HostContext, LeaderLock, LeaderState, RuntimeContext};
pub use pipeline::{ExtractedMessage, MessageSignature, ProcessOutcome, WatchOutcome};
pub use reader::ChatReader;
pub use relay::{serve_relay, ChannelRelay, Relay, RelayRequest, RelayResponse, SpeakPayload};
pub use store::{MemoryStore, SharedStore};

/// クレート全体のエラー
#[derive(Debug, Error)]
pub enum ChatvoxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("{context}: {message}")]
    Generic { context: String, message: String },
}

impl ChatvoxError {
    /// Create a new generic error with context
    pub fn generic(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generic {
            context: context.into(),
            message: message.into(),
        }
    }
}

pub type ChatvoxResult<T> = Result<T, ChatvoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        assert!(std::any::type_name::<ChatReader>().contains("ChatReader"));
        assert!(std::any::type_name::<pipeline::MessageProcessor>().contains("MessageProcessor"));
    }

    #[test]
    fn test_error_conversions() {
        let error: ChatvoxError = StoreError::ContextInvalidated.into();
        assert!(matches!(error, ChatvoxError::Store(StoreError::ContextInvalidated)));

        let error: ChatvoxError = RelayError::ChannelClosed.into();
        assert_eq!(error.to_string(), RelayError::ChannelClosed.to_string());

        let error = ChatvoxError::generic("replay", "unknown node");
        assert_eq!(error.to_string(), "replay: unknown node");
    }
}
