//! VOICEVOXエンジンクライアント

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{sanitize_error_text, SpeechSynthesizer, SynthesisError};

/// 既定の接続先（`127.0.0.1`と`localhost`の両表記）
pub const DEFAULT_BASE_URLS: &[&str] = &["http://127.0.0.1:50021", "http://localhost:50021"];

/// VOICEVOX接続設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicevoxConfig {
    /// 接続先候補（順に試行）
    pub base_urls: Vec<String>,
    /// HTTPタイムアウト（秒）
    pub timeout_secs: u64,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            base_urls: DEFAULT_BASE_URLS.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 30,
        }
    }
}

/// VOICEVOXクライアント
///
/// 最後に成功した接続先を優先して試す。
pub struct VoicevoxClient {
    config: VoicevoxConfig,
    client: reqwest::Client,
    preferred: Mutex<Option<String>>,
}

impl VoicevoxClient {
    /// 新しいインスタンスを作成
    pub fn new(config: VoicevoxConfig) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SynthesisError::Connection(format!("HTTPクライアントの作成に失敗: {}", e)))?;

        Ok(Self {
            config,
            client,
            preferred: Mutex::new(None),
        })
    }

    /// 試行順の接続先（前回成功した接続先が先頭、重複なし）
    pub fn base_candidates(&self) -> Vec<String> {
        let preferred = self.preferred.lock().clone();
        let mut ordered: Vec<String> = Vec::new();
        for base in preferred.into_iter().chain(self.config.base_urls.iter().cloned()) {
            if !base.is_empty() && !ordered.contains(&base) {
                ordered.push(base);
            }
        }
        ordered
    }

    /// 最後に成功した接続先
    pub fn preferred_base_url(&self) -> Option<String> {
        self.preferred.lock().clone()
    }

    /// 接続先を順に試してリクエストを送る
    async fn fetch<F>(&self, path: &str, build: F) -> Result<reqwest::Response, SynthesisError>
    where
        F: Fn(&reqwest::Client, String) -> reqwest::RequestBuilder,
    {
        let candidates = self.base_candidates();
        let mut errors = Vec::new();

        for base in &candidates {
            let url = format!("{}{}", base, path);
            match build(&self.client, url).send().await {
                Ok(response) if response.status().is_success() => {
                    *self.preferred.lock() = Some(base.clone());
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = sanitize_error_text(&response.text().await.unwrap_or_default());
                    let reason = if body.is_empty() {
                        format!("HTTP {}", status.as_u16())
                    } else {
                        format!("HTTP {}: {}", status.as_u16(), body)
                    };
                    errors.push(format!("{}: {}", base, reason));
                }
                Err(e) => {
                    errors.push(format!("{}: {}", base, e));
                }
            }
        }

        tracing::warn!(path = path, tried = candidates.len(), "❌ VOICEVOXへの接続に失敗");
        Err(SynthesisError::BackendUnavailable {
            path: path.to_string(),
            tried: candidates.join(", "),
            errors: errors.join(" | "),
        })
    }

    /// audio_queryを取得
    async fn audio_query(&self, text: &str, speaker_id: i64) -> Result<Value, SynthesisError> {
        let path = format!(
            "/audio_query?speaker={}&text={}",
            speaker_id,
            urlencoding::encode(text)
        );
        let response = self.fetch(&path, |client, url| client.post(url)).await?;
        Ok(response.json().await?)
    }
}

/// audio_queryへ話速・音量を設定（音量は再生側で掛けるので1.0固定）
pub fn apply_voice_parameters(query: &mut Value, speed: f64) {
    if let Some(obj) = query.as_object_mut() {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        obj.insert("speedScale".to_string(), Value::from(speed));
        obj.insert("volumeScale".to_string(), Value::from(1.0));
    }
}

#[async_trait]
impl SpeechSynthesizer for VoicevoxClient {
    async fn speakers(&self) -> Result<Value, SynthesisError> {
        let response = self
            .fetch("/speakers", |client, url| client.get(url))
            .await?;
        Ok(response.json().await?)
    }

    async fn synthesize(
        &self,
        text: &str,
        speaker_id: i64,
        speed: f64,
    ) -> Result<Vec<u8>, SynthesisError> {
        tracing::debug!(speaker_id = speaker_id, "🔊 VOICEVOXに送信: {}", text);

        let mut query = self.audio_query(text, speaker_id).await?;
        apply_voice_parameters(&mut query, speed);

        let path = format!("/synthesis?speaker={}", speaker_id);
        let response = self
            .fetch(&path, |client, url| {
                client
                    .post(url)
                    .header("Content-Type", "application/json")
                    .json(&query)
            })
            .await?;

        let wav = response.bytes().await?.to_vec();
        tracing::debug!(bytes = wav.len(), "✅ VOICEVOX合成完了");
        Ok(wav)
    }

    fn name(&self) -> &'static str {
        "VOICEVOX"
    }
}
