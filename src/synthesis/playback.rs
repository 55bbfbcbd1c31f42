//! 再生キュー
//!
//! 読み上げ要求を1本のワーカーで先着順に合成・再生する。同じ`uniqueId`の要求は
//! キュー内にある間と再生後30秒間は受け付けない。

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{SpeechSynthesizer, SynthesisError};
use crate::relay::SpeakPayload;

/// 再生済み`uniqueId`を覚えておく期間
pub const UNIQUE_ID_DEDUP_TTL: Duration = Duration::from_secs(30);

/// 失敗した出力デバイスを再試行するまでの期間
pub const DEVICE_RETRY_COOLDOWN: Duration = Duration::from_secs(30);

/// 音声出力
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// WAVを再生し、再生終了まで待つ
    async fn play(&self, wav: Vec<u8>, volume: f64, device_id: &str) -> Result<(), SynthesisError>;
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<SpeakPayload>,
    in_queue: HashSet<String>,
    recent: HashMap<String, Instant>,
    /// `clear()`のたびに進む世代
    generation: u64,
}

impl QueueState {
    fn prune_recent(&mut self, now: Instant) {
        self.recent
            .retain(|_, played_at| now.duration_since(*played_at) <= UNIQUE_ID_DEDUP_TTL);
    }
}

/// 再生キュー
pub struct PlaybackQueue {
    state: Arc<Mutex<QueueState>>,
    wakeup: Arc<Notify>,
    interrupt: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackQueue {
    /// キューを作成し、再生ワーカーを開始
    pub fn start(synthesizer: Arc<dyn SpeechSynthesizer>, output: Arc<dyn AudioOutput>) -> Self {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let wakeup = Arc::new(Notify::new());
        let interrupt = Arc::new(Notify::new());

        let worker = tokio::spawn(Self::run_worker(
            state.clone(),
            wakeup.clone(),
            interrupt.clone(),
            synthesizer,
            output,
        ));

        Self {
            state,
            wakeup,
            interrupt,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// 読み上げ要求を追加（受け付けなかった場合は`false`）
    pub fn enqueue(&self, payload: SpeakPayload) -> bool {
        if payload.text.trim().is_empty() {
            return false;
        }

        {
            let mut state = self.state.lock();
            if !payload.unique_id.is_empty() {
                let now = Instant::now();
                state.prune_recent(now);
                if state.in_queue.contains(&payload.unique_id) {
                    tracing::debug!(unique_id = %payload.unique_id, "🔁 キュー内の重複要求を無視");
                    return false;
                }
                if state.recent.contains_key(&payload.unique_id) {
                    tracing::debug!(unique_id = %payload.unique_id, "🔁 再生済みの要求を無視");
                    return false;
                }
                state.in_queue.insert(payload.unique_id.clone());
            }
            state.items.push_back(payload);
        }

        self.wakeup.notify_one();
        true
    }

    /// キューと重複抑止の記録を破棄し、再生中の音声を止める
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.in_queue.clear();
            state.recent.clear();
            state.generation += 1;
            dropped
        };
        self.interrupt.notify_waiters();
        tracing::info!(dropped = dropped, "🗑️ 再生キューをクリア");
    }

    /// 待機中の要求数
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ワーカーを停止
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    async fn run_worker(
        state: Arc<Mutex<QueueState>>,
        wakeup: Arc<Notify>,
        interrupt: Arc<Notify>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        output: Arc<dyn AudioOutput>,
    ) {
        tracing::info!(engine = synthesizer.name(), "🔊 再生キュー処理を開始");

        loop {
            let next = {
                let mut state = state.lock();
                state.items.pop_front().map(|item| (item, state.generation))
            };
            let Some((item, generation)) = next else {
                wakeup.notified().await;
                continue;
            };

            let interrupted = interrupt.notified();
            tokio::select! {
                result = Self::play_item(&item, synthesizer.as_ref(), output.as_ref()) => {
                    if let Err(e) = result {
                        tracing::error!("❌ 読み上げエラー: {}", e);
                    }
                }
                _ = interrupted => {
                    tracing::info!("⏹️ 再生を中断");
                }
            }

            if !item.unique_id.is_empty() {
                let mut state = state.lock();
                if state.generation == generation {
                    state.in_queue.remove(&item.unique_id);
                    state.recent.insert(item.unique_id.clone(), Instant::now());
                }
            }
        }
    }

    async fn play_item(
        item: &SpeakPayload,
        synthesizer: &dyn SpeechSynthesizer,
        output: &dyn AudioOutput,
    ) -> Result<(), SynthesisError> {
        tracing::debug!(
            text = %item.text.chars().take(50).collect::<String>(),
            "📢 読み上げ開始"
        );
        let wav = synthesizer
            .synthesize(&item.text, item.speaker_id, item.speed)
            .await?;
        output.play(wav, item.volume, &item.device_id).await?;
        tracing::debug!("✅ 読み上げ完了");
        Ok(())
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 出力デバイスIDをログ用に短縮
pub fn short_device_id(device_id: &str) -> String {
    let chars: Vec<char> = device_id.chars().collect();
    if chars.is_empty() {
        return "<default>".to_string();
    }
    if chars.len() <= 12 {
        return device_id.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// 失敗した出力デバイスの記録
#[derive(Debug, Default)]
pub struct DeviceCooldown {
    failed: HashMap<String, std::time::Instant>,
}

impl DeviceCooldown {
    /// 再試行してよいか（期間を過ぎた記録はここで消える）
    pub fn should_retry(&mut self, device_id: &str, now: std::time::Instant) -> bool {
        match self.failed.get(device_id) {
            None => true,
            Some(failed_at) if now.duration_since(*failed_at) >= DEVICE_RETRY_COOLDOWN => {
                self.failed.remove(device_id);
                true
            }
            Some(_) => false,
        }
    }

    pub fn mark_failed(&mut self, device_id: &str, now: std::time::Instant) {
        self.failed.insert(device_id.to_string(), now);
    }

    pub fn mark_ok(&mut self, device_id: &str) {
        self.failed.remove(device_id);
    }
}

/// rodioによる音声出力
///
/// `device_id`は出力デバイス名として解釈する。見つからない・開けないデバイスは
/// 一定時間記録して既定デバイスで再生する。
#[derive(Default)]
pub struct RodioOutput {
    cooldown: Arc<Mutex<DeviceCooldown>>,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// 利用可能な出力デバイス名
    pub fn list_output_devices() -> Result<Vec<String>, SynthesisError> {
        use rodio::cpal::traits::{DeviceTrait, HostTrait};

        let host = rodio::cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SynthesisError::AudioOutput(format!("出力デバイスの列挙に失敗: {}", e)))?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }

    fn open_device(
        device_id: &str,
    ) -> Result<(rodio::OutputStream, rodio::OutputStreamHandle), SynthesisError> {
        use rodio::cpal::traits::{DeviceTrait, HostTrait};

        let host = rodio::cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| SynthesisError::AudioOutput(format!("出力デバイスの列挙に失敗: {}", e)))?
            .find(|device| device.name().map(|name| name == device_id).unwrap_or(false))
            .ok_or_else(|| SynthesisError::AudioOutput("出力デバイスが見つかりません".to_string()))?;

        rodio::OutputStream::try_from_device(&device)
            .map_err(|e| SynthesisError::AudioOutput(format!("出力デバイスを開けません: {}", e)))
    }

    fn open_stream(
        cooldown: &Mutex<DeviceCooldown>,
        device_id: &str,
    ) -> Result<(rodio::OutputStream, rodio::OutputStreamHandle), SynthesisError> {
        let device_id = device_id.trim();
        if !device_id.is_empty() && cooldown.lock().should_retry(device_id, std::time::Instant::now()) {
            match Self::open_device(device_id) {
                Ok(stream) => {
                    cooldown.lock().mark_ok(device_id);
                    return Ok(stream);
                }
                Err(e) => {
                    cooldown.lock().mark_failed(device_id, std::time::Instant::now());
                    tracing::warn!(
                        device = %short_device_id(device_id),
                        error = %e,
                        "⚠️ 出力デバイスを設定できません。既定デバイスで再生します"
                    );
                }
            }
        }

        rodio::OutputStream::try_default()
            .map_err(|e| SynthesisError::AudioOutput(format!("音声出力の初期化に失敗: {}", e)))
    }

    /// WAVデータを再生（ブロッキング）
    fn play_wav_blocking(
        cooldown: &Mutex<DeviceCooldown>,
        wav: Vec<u8>,
        volume: f64,
        device_id: &str,
    ) -> Result<(), SynthesisError> {
        use rodio::{Decoder, Sink};

        let (_stream, stream_handle) = Self::open_stream(cooldown, device_id)?;

        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| SynthesisError::AudioOutput(format!("音声シンクの作成に失敗: {}", e)))?;
        sink.set_volume(volume.clamp(0.0, 1.0) as f32);

        let source = Decoder::new(Cursor::new(wav))
            .map_err(|e| SynthesisError::AudioDecode(format!("WAVデコードに失敗: {}", e)))?;

        sink.append(source);
        sink.sleep_until_end();

        Ok(())
    }
}

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn play(&self, wav: Vec<u8>, volume: f64, device_id: &str) -> Result<(), SynthesisError> {
        let cooldown = self.cooldown.clone();
        let device_id = device_id.to_string();
        tokio::task::spawn_blocking(move || {
            Self::play_wav_blocking(&cooldown, wav, volume, &device_id)
        })
        .await
        .map_err(|e| SynthesisError::AudioOutput(format!("再生タスクエラー: {}", e)))?
    }
}
