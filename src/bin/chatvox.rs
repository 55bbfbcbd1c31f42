//! chatvox CLI
//!
//! リプレイスクリプトを読み上げパイプラインに通す。`--speak`を付けるとVOICEVOXで実際に読み上げる。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chatvox::config::ConfigManager;
use chatvox::io::{parse_replay_file, ReplayDriver};
use chatvox::logging::init_logging;
use chatvox::relay::{serve_relay, Relay, RelayHandler, RelayRequest, RelayResponse};
use chatvox::synthesis::{
    PlaybackQueue, RodioOutput, SpeechDispatcher, SpeechSynthesizer, VoicevoxClient,
};
use chatvox::{AppConfig, ChatReader, MemoryDocument, MemoryStore, RuntimeContext, SystemClock};
use clap::{Parser, Subcommand};

/// 中継チャネルの容量
const RELAY_CAPACITY: usize = 64;

/// chatvox: チャット読み上げパイプラインのリプレイ実行
#[derive(Parser)]
#[command(name = "chatvox", version, about)]
struct Cli {
    /// 設定ファイル（省略時はXDG設定ディレクトリのconfig.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ログレベル（RUST_LOGより優先）
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// NDJSONのリプレイスクリプトを再生する
    Replay {
        /// スクリプトファイル
        input: PathBuf,

        /// VOICEVOXで実際に読み上げる（省略時はログ出力のみ）
        #[arg(long)]
        speak: bool,

        /// 最初に表示するページURL
        #[arg(long, default_value = "https://www.twitch.tv/")]
        location: String,

        /// スクリプト終了後に読み上げ完了を待つ最大秒数
        #[arg(long, default_value_t = 30)]
        settle_secs: u64,
    },

    /// 音声出力デバイスを一覧表示する
    Devices,

    /// VOICEVOXの話者一覧を表示する
    Speakers,
}

/// 読み上げ要求をログに出すだけの受信側
struct DryRunHandler;

#[async_trait]
impl RelayHandler for DryRunHandler {
    async fn handle(&self, request: RelayRequest) -> Option<RelayResponse> {
        match request {
            RelayRequest::SpeakRequest { payload } => {
                tracing::info!(
                    text = %payload.text,
                    speaker_id = payload.speaker_id,
                    unique_id = %payload.unique_id,
                    "🔈 [dry-run] 読み上げ"
                );
                Some(RelayResponse::ok())
            }
            RelayRequest::GetSpeakers => Some(RelayResponse::failure("dry-run")),
            RelayRequest::ClearQueue => None,
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    manager.load_config()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    let _log_guard = init_logging(&config.log, cli.log_level.as_deref())?;

    match cli.command {
        Command::Replay {
            input,
            speak,
            location,
            settle_secs,
        } => run_replay(config, input, speak, &location, Duration::from_secs(settle_secs)).await,
        Command::Devices => list_devices(),
        Command::Speakers => list_speakers(config).await,
    }
}

async fn run_replay(
    config: AppConfig,
    input: PathBuf,
    speak: bool,
    location: &str,
    settle: Duration,
) -> anyhow::Result<()> {
    let events = parse_replay_file(&input)
        .with_context(|| format!("Failed to load replay script: {}", input.display()))?;
    tracing::info!(events = events.len(), speak = speak, "🎬 リプレイを開始");

    let relay_timeout = Duration::from_millis(config.pipeline.relay_timeout_ms);
    let host = Arc::new(RuntimeContext::new());

    let dispatcher = if speak {
        let synthesizer: Arc<dyn SpeechSynthesizer> =
            Arc::new(VoicevoxClient::new(config.voicevox.clone())?);
        let queue = PlaybackQueue::start(synthesizer.clone(), Arc::new(RodioOutput::new()));
        Some(Arc::new(SpeechDispatcher::new(synthesizer, queue)))
    } else {
        None
    };
    let handler: Arc<dyn RelayHandler> = match &dispatcher {
        Some(dispatcher) => dispatcher.clone(),
        None => Arc::new(DryRunHandler),
    };
    let (relay, relay_task) = serve_relay(handler, RELAY_CAPACITY, relay_timeout);
    let relay: Arc<dyn Relay> = Arc::new(relay.with_host(host.clone()));

    // 共有ストアは設定ファイルの読み上げ設定で初期化する
    let store = MemoryStore::with_values(config.reader.to_entries()?.into_iter().collect());
    let reader = ChatReader::new(
        Arc::new(store),
        host,
        Arc::new(SystemClock),
        relay,
        config.reader.clone(),
        config.pipeline,
    );
    let doc = MemoryDocument::new(location);
    reader.start(&doc).await?;

    let replay = ReplayDriver::new(&reader, doc).run(events, settle);
    let summary = tokio::select! {
        result = replay => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("⏹️ 中断されました");
            reader.shutdown();
            return Ok(());
        }
    };

    if let Some(dispatcher) = &dispatcher {
        let deadline = tokio::time::Instant::now() + settle;
        while !dispatcher.queue().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    reader.shutdown();
    drop(reader);
    relay_task.abort();

    println!(
        "events={} inserted={} scheduled={} mass_redraws={} ignored_batches={} navigations={}",
        summary.events,
        summary.inserted,
        summary.scheduled,
        summary.mass_redraws,
        summary.ignored_batches,
        summary.navigations
    );
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    for name in RodioOutput::list_output_devices()? {
        println!("{}", name);
    }
    Ok(())
}

async fn list_speakers(config: AppConfig) -> anyhow::Result<()> {
    let client = VoicevoxClient::new(config.voicevox)?;
    let speakers = client.speakers().await?;
    println!("{}", serde_json::to_string_pretty(&speakers)?);
    Ok(())
}
