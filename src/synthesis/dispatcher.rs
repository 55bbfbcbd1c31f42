//! 中継メッセージの受信処理

use std::sync::Arc;

use async_trait::async_trait;

use super::{PlaybackQueue, SpeechSynthesizer};
use crate::relay::{RelayHandler, RelayRequest, RelayResponse};

/// 話者一覧・読み上げ・キュー破棄を受け付ける
pub struct SpeechDispatcher {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    queue: PlaybackQueue,
}

impl SpeechDispatcher {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, queue: PlaybackQueue) -> Self {
        Self { synthesizer, queue }
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }
}

#[async_trait]
impl RelayHandler for SpeechDispatcher {
    async fn handle(&self, request: RelayRequest) -> Option<RelayResponse> {
        match request {
            RelayRequest::GetSpeakers => Some(match self.synthesizer.speakers().await {
                Ok(speakers) => RelayResponse::ok_with(speakers),
                Err(e) => {
                    tracing::warn!(error = %e, "⚠️ 話者一覧を取得できません");
                    RelayResponse::failure(e.to_string())
                }
            }),
            RelayRequest::SpeakRequest { payload } => {
                // 重複で捨てた場合も要求自体は受理として返す
                let accepted = self.queue.enqueue(payload);
                tracing::debug!(accepted = accepted, pending = self.queue.len(), "📥 読み上げ要求を受信");
                Some(RelayResponse::ok())
            }
            RelayRequest::ClearQueue => {
                self.queue.clear();
                None
            }
        }
    }
}
