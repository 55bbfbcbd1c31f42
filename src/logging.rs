//! ログ初期化

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ログ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// 保存するログファイル数上限
    pub max_log_files: usize,
    /// ログファイル名パターン（`*`の位置に日付が入る）
    pub log_filename_pattern: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            max_log_files: 30,
            log_filename_pattern: "chatvox_*.log".to_string(),
        }
    }
}

impl LogConfig {
    /// ログディレクトリ（未指定ならXDGデータディレクトリ配下）
    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.log_dir {
            return Ok(dir.clone());
        }
        let project_dirs = ProjectDirs::from("dev", "sifyfy", "chatvox")
            .context("Failed to get project directories")?;
        Ok(project_dirs.data_dir().join("logs"))
    }

    /// ファイル名パターンを接頭辞と接尾辞に分ける
    pub fn filename_parts(&self) -> (String, String) {
        match self.log_filename_pattern.split_once('*') {
            Some((prefix, suffix)) => (
                prefix.trim_end_matches(['_', '.']).to_string(),
                suffix.trim_start_matches('.').to_string(),
            ),
            None => (self.log_filename_pattern.clone(), String::new()),
        }
    }

    fn env_filter(&self, level_override: Option<&str>) -> EnvFilter {
        if let Some(level) = level_override {
            if let Ok(filter) = EnvFilter::try_new(level) {
                return filter;
            }
        }
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// ログを初期化
///
/// 標準エラーへのコンパクト出力に加え、設定されていれば日次ローテーションのファイル出力を行う。
/// 戻り値のガードはプロセス終了まで保持すること（破棄するとファイル出力が止まる）。
pub fn init_logging(config: &LogConfig, level_override: Option<&str>) -> Result<Option<WorkerGuard>> {
    let env_filter = config.env_filter(level_override);

    let (file_layer, guard) = if config.enable_file_logging {
        let dir = config.resolve_log_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        let (prefix, suffix) = config.filename_parts();
        let mut builder = rolling::Builder::new()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files(config.max_log_files.max(1));
        if !suffix.is_empty() {
            builder = builder.filename_suffix(suffix);
        }
        let appender = builder
            .build(&dir)
            .with_context(|| format!("Failed to open log file in: {}", dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
