//! 設定管理モジュール
//!
//! 読み上げ設定（共有ストアに平坦なキーで保存され、変更通知でキャッシュを更新する）と、
//! パイプラインの調整値・VOICEVOX接続・ログ設定をまとめたTOML設定ファイルを扱う。

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lock::LockSettings;
use crate::logging::LogConfig;
use crate::recency::RecencyWindow;
use crate::store::{SharedStore, StoreChange, StoreError};
use crate::synthesis::voicevox::VoicevoxConfig;
use crate::text;

/// 共有ストア上の設定キー
pub const CONFIG_KEYS: &[&str] = &[
    "enabled",
    "speakerId",
    "speed",
    "volume",
    "maxLength",
    "readName",
    "ignoreCommand",
    "skipTime",
    "blockList",
    "audioDeviceId",
    "dictionary",
];

/// 設定値のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("設定値 '{key}' の型が不正です: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("設定の保存に失敗しました: {0}")]
    Store(#[from] StoreError),
}

/// 読み上げ辞書の置換ルール
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DictionaryRule {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

impl DictionaryRule {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// 読み上げ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderConfig {
    /// 読み上げ有効
    pub enabled: bool,
    /// VOICEVOX話者ID
    pub speaker_id: i64,
    /// 話速
    pub speed: f64,
    /// 音量
    pub volume: f64,
    /// 読み上げ最大文字数
    pub max_length: usize,
    /// 投稿者名を読み上げる
    pub read_name: bool,
    /// `!`で始まるコマンドを読み上げない
    pub ignore_command: bool,
    /// 起動・復帰直後に読み上げを控える秒数
    pub skip_time: f64,
    /// ブロックするユーザー名（カンマ・改行区切り）
    pub block_list: String,
    /// 出力デバイス（空なら既定デバイス）
    pub audio_device_id: String,
    /// 読み上げ辞書（上から順に適用）
    pub dictionary: Vec<DictionaryRule>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speaker_id: 3,
            speed: 1.0,
            volume: 1.0,
            max_length: 70,
            read_name: false,
            ignore_command: true,
            skip_time: 3.0,
            block_list: String::new(),
            audio_device_id: String::new(),
            dictionary: Vec::new(),
        }
    }
}

fn parse_value<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidValue {
        key: key.to_string(),
        source,
    })
}

impl ReaderConfig {
    /// 1キー分の値を反映（`None`は削除扱いで既定値に戻す）
    ///
    /// 設定キー以外は`Ok(false)`。型が合わない値は反映せずエラーを返す。
    pub fn apply_value(&mut self, key: &str, value: Option<&Value>) -> Result<bool, ConfigError> {
        let defaults = ReaderConfig::default();
        let Some(value) = value else {
            return self.reset_key(key, defaults);
        };

        match key {
            "enabled" => self.enabled = parse_value(key, value)?,
            "speakerId" => self.speaker_id = parse_value(key, value)?,
            "speed" => self.speed = parse_value(key, value)?,
            "volume" => self.volume = parse_value(key, value)?,
            "maxLength" => self.max_length = parse_value(key, value)?,
            "readName" => self.read_name = parse_value(key, value)?,
            "ignoreCommand" => self.ignore_command = parse_value(key, value)?,
            "skipTime" => self.skip_time = parse_value(key, value)?,
            "blockList" => self.block_list = parse_value(key, value)?,
            "audioDeviceId" => self.audio_device_id = parse_value(key, value)?,
            "dictionary" => self.dictionary = parse_value(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn reset_key(&mut self, key: &str, defaults: ReaderConfig) -> Result<bool, ConfigError> {
        match key {
            "enabled" => self.enabled = defaults.enabled,
            "speakerId" => self.speaker_id = defaults.speaker_id,
            "speed" => self.speed = defaults.speed,
            "volume" => self.volume = defaults.volume,
            "maxLength" => self.max_length = defaults.max_length,
            "readName" => self.read_name = defaults.read_name,
            "ignoreCommand" => self.ignore_command = defaults.ignore_command,
            "skipTime" => self.skip_time = defaults.skip_time,
            "blockList" => self.block_list = defaults.block_list,
            "audioDeviceId" => self.audio_device_id = defaults.audio_device_id,
            "dictionary" => self.dictionary = defaults.dictionary,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// キーごとの値に展開
    pub fn to_entries(&self) -> Result<Vec<(String, Value)>, ConfigError> {
        let value = serde_json::to_value(self).map_err(|source| ConfigError::InvalidValue {
            key: "*".to_string(),
            source,
        })?;
        Ok(match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Vec::new(),
        })
    }

    /// 起動猶予期間
    pub fn skip_duration(&self) -> std::time::Duration {
        if self.skip_time.is_finite() && self.skip_time > 0.0 {
            // 表現できない長さは上限に丸める
            std::time::Duration::try_from_secs_f64(self.skip_time)
                .unwrap_or(std::time::Duration::MAX)
        } else {
            std::time::Duration::ZERO
        }
    }

    /// ブロックリストを正規化済みの集合にする
    pub fn blocked_names(&self) -> HashSet<String> {
        parse_block_list(&self.block_list)
    }
}

/// ブロックリスト文字列（カンマ・改行区切り）を正規化済みの名前集合にする
pub fn parse_block_list(raw: &str) -> HashSet<String> {
    raw.split([',', '\n', '\r'])
        .map(text::normalize_display_name)
        .filter(|name| !name.is_empty())
        .collect()
}

/// 大量再描画時の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MassRedrawPolicy {
    /// 全候補を既読にして読み上げない
    MarkAllRead,
    /// 末尾の`limit`件だけ処理し、残りは既読にする
    ProcessMostRecent { limit: usize },
}

impl Default for MassRedrawPolicy {
    fn default() -> Self {
        Self::MarkAllRead
    }
}

/// 大量再描画ガード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MassRedrawSettings {
    /// この件数以上の同時候補を再描画とみなす
    pub threshold: usize,
    pub policy: MassRedrawPolicy,
}

impl Default for MassRedrawSettings {
    fn default() -> Self {
        Self {
            threshold: 50,
            policy: MassRedrawPolicy::default(),
        }
    }
}

/// パイプラインの調整値
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// 履歴の保持期間（ミリ秒）
    pub history_retention_ms: i64,
    /// 内容由来シグネチャの重複判定窓（ミリ秒）
    pub dedup_window_ms: i64,
    /// 安定判定の再確認間隔（ミリ秒）
    pub stable_check_delay_ms: u64,
    /// 安定判定の最大試行回数
    pub stable_max_tries: u32,
    /// 中継リクエストのタイムアウト（ミリ秒）
    pub relay_timeout_ms: u64,
    pub mass_redraw: MassRedrawSettings,
    pub recency: RecencyWindow,
    pub lock: LockSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            history_retention_ms: 180_000,
            dedup_window_ms: 3000,
            stable_check_delay_ms: 100,
            stable_max_tries: 12,
            relay_timeout_ms: 10_000,
            mass_redraw: MassRedrawSettings::default(),
            recency: RecencyWindow::default(),
            lock: LockSettings::default(),
        }
    }
}

/// 読み上げ設定のキャッシュ
///
/// 共有ストアの変更通知を受けてその場で更新する。読み取り側は`snapshot()`で
/// その時点の値を取り出して使う。
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<ReaderConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ReaderConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// 現在の設定の複製
    pub fn snapshot(&self) -> ReaderConfig {
        self.inner.read().clone()
    }

    /// 設定を直接更新
    pub fn update(&self, f: impl FnOnce(&mut ReaderConfig)) {
        f(&mut self.inner.write());
    }

    /// ストア変更通知を反映（設定キーでなければ何もしない）
    pub fn apply_change(&self, change: &StoreChange) -> bool {
        match self
            .inner
            .write()
            .apply_value(&change.key, change.new_value.as_ref())
        {
            Ok(applied) => {
                if applied {
                    debug!(key = %change.key, "🔧 設定を更新");
                }
                applied
            }
            Err(e) => {
                warn!(error = %e, "⚠️ 設定変更を無視しました");
                false
            }
        }
    }

    /// ストアから全設定キーを読み込む
    pub async fn load_from_store(&self, store: &dyn SharedStore) -> Result<(), StoreError> {
        for key in CONFIG_KEYS {
            let value = store.get(key).await?;
            if let Some(value) = value {
                if let Err(e) = self.inner.write().apply_value(key, Some(&value)) {
                    warn!(error = %e, "⚠️ 保存済み設定を読み込めませんでした");
                }
            }
        }
        info!("✅ 読み上げ設定を読み込みました");
        Ok(())
    }

    /// 現在の設定を全キー分ストアへ書き込む
    pub async fn save_to_store(&self, store: &dyn SharedStore) -> Result<(), ConfigError> {
        let entries = self.snapshot().to_entries()?;
        for (key, value) in entries {
            store.set(&key, value).await?;
        }
        info!("💾 読み上げ設定を保存しました");
        Ok(())
    }

    /// ストア変更通知の購読タスクを開始
    pub fn spawn_sync(&self, store: &dyn SharedStore) -> JoinHandle<()> {
        let handle = self.clone();
        let mut changes = store.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        handle.apply_change(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "⚠️ 設定変更通知を取りこぼしました");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// アプリケーション設定（TOMLファイル）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 読み上げ設定の初期値
    #[serde(default)]
    pub reader: ReaderConfig,

    /// パイプライン調整値
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// VOICEVOX接続設定
    #[serde(default)]
    pub voicevox: VoicevoxConfig,

    /// ログ設定
    #[serde(default)]
    pub log: LogConfig,
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// 新しい設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        // 設定ディレクトリを作成（存在しない場合）
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 指定パスの設定ファイルを使う
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// XDGディレクトリに基づく設定ファイルパスを取得
    fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "sifyfy", "chatvox")
            .context("Failed to get project directories")?;

        let config_file = project_dirs.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());

        Ok(config_file)
    }

    /// 設定を読み込み
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());

        Ok(())
    }

    /// 設定ファイルパスを取得
    pub fn config_file_path(&self) -> &PathBuf {
        &self.config_path
    }
}
