//! 読み上げ側との中継チャネル
//!
//! パイプラインは`GET_SPEAKERS`・`SPEAK_REQUEST`・`CLEAR_QUEUE`の3種類のメッセージだけを
//! 外へ送る。下位の伝送路は配達を保証しないため、`request`は必ず「応答が返る」か
//! 「応答が来ないことが確定する（タイムアウト・チャネル切断）」かのどちらかで終わる。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::lock::HostContext;

/// 読み上げ要求の内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakPayload {
    pub text: String,
    pub speaker_id: i64,
    pub speed: f64,
    pub volume: f64,
    #[serde(default)]
    pub device_id: String,
    /// 再生側での重複抑止キー（メッセージシグネチャ）
    #[serde(default)]
    pub unique_id: String,
}

/// 中継メッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayRequest {
    /// 話者一覧の取得
    GetSpeakers,
    /// 読み上げ
    SpeakRequest { payload: SpeakPayload },
    /// 再生キューの破棄（応答なし）
    ClearQueue,
}

impl RelayRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayRequest::GetSpeakers => "GET_SPEAKERS",
            RelayRequest::SpeakRequest { .. } => "SPEAK_REQUEST",
            RelayRequest::ClearQueue => "CLEAR_QUEUE",
        }
    }
}

/// 中継応答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// 中継のエラー
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("応答がタイムアウトしました ({0:?})")]
    Timeout(Duration),

    #[error("中継チャネルが閉じています")]
    ChannelClosed,

    #[error("受信側が応答せずに終了しました")]
    NoResponse,

    #[error("拡張コンテキストが無効化されました")]
    ContextInvalidated,
}

/// パイプラインから見た送信口
#[async_trait]
pub trait Relay: Send + Sync {
    /// 応答を待つ送信
    async fn request(&self, request: RelayRequest) -> Result<RelayResponse, RelayError>;

    /// 応答を待たない送信
    async fn notify(&self, request: RelayRequest) -> Result<(), RelayError>;
}

/// 受信側の処理
#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// 応答しない場合は`None`
    async fn handle(&self, request: RelayRequest) -> Option<RelayResponse>;
}

struct Envelope {
    request: RelayRequest,
    reply: Option<oneshot::Sender<RelayResponse>>,
}

/// tokioチャネルによる中継
#[derive(Clone)]
pub struct ChannelRelay {
    sender: mpsc::Sender<Envelope>,
    timeout: Duration,
    host: Option<Arc<dyn HostContext>>,
}

impl ChannelRelay {
    /// 送信前にホストコンテキストを確認する
    pub fn with_host(mut self, host: Arc<dyn HostContext>) -> Self {
        self.host = Some(host);
        self
    }

    fn ensure_valid(&self) -> Result<(), RelayError> {
        match &self.host {
            Some(host) if !host.is_valid() => Err(RelayError::ContextInvalidated),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Relay for ChannelRelay {
    async fn request(&self, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        self.ensure_valid()?;

        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::NoResponse),
            Err(_) => Err(RelayError::Timeout(self.timeout)),
        }
    }

    async fn notify(&self, request: RelayRequest) -> Result<(), RelayError> {
        self.ensure_valid()?;
        self.sender
            .send(Envelope {
                request,
                reply: None,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}

/// 受信タスクを起動し、対応する送信口を返す
///
/// 受信側は届いた順に1件ずつ処理する。送信口がすべて破棄されるとタスクは終了する。
pub fn serve_relay(
    handler: Arc<dyn RelayHandler>,
    capacity: usize,
    timeout: Duration,
) -> (ChannelRelay, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<Envelope>(capacity.max(1));

    let task = tokio::spawn(async move {
        tracing::debug!("📡 中継受信タスクを開始");
        while let Some(envelope) = receiver.recv().await {
            let kind = envelope.request.kind();
            let response = handler.handle(envelope.request).await;
            match (envelope.reply, response) {
                (Some(reply), Some(response)) => {
                    if reply.send(response).is_err() {
                        tracing::debug!(kind = kind, "⚠️ 送信元が応答を待たずに終了");
                    }
                }
                (Some(_), None) => {
                    tracing::debug!(kind = kind, "📭 応答なしで処理を終了");
                }
                (None, _) => {}
            }
        }
        tracing::debug!("📡 中継受信タスクを終了");
    });

    (
        ChannelRelay {
            sender,
            timeout,
            host: None,
        },
        task,
    )
}
