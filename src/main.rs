use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use futures::stream;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fishaudio_client::{AudioFormat, Client, ClientConfig, DEFAULT_BACKEND, TtsRequest};

/// Fish Audio text-to-speech client
#[derive(Parser, Debug)]
#[command(name = "fishaudio")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct VoiceArgs {
    /// Output format (wav, pcm, mp3, opus)
    #[arg(short = 'f', long = "format", default_value = "mp3")]
    format: AudioFormat,

    /// Synthesis backend
    #[arg(short = 'b', long = "backend", default_value = DEFAULT_BACKEND)]
    backend: String,

    /// Voice model to synthesize with
    #[arg(short = 'r', long = "reference-id")]
    reference_id: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize text in a single HTTP request
    Convert {
        #[arg(short = 't', long = "text")]
        text: String,

        /// Output audio file
        #[arg(short = 'o', long = "out")]
        out: PathBuf,

        #[command(flatten)]
        voice: VoiceArgs,
    },

    /// Stream text fragments over a realtime session
    Realtime {
        /// Text fragment; repeat for several fragments
        #[arg(short = 't', long = "text", required = true)]
        text: Vec<String>,

        /// Output audio file
        #[arg(short = 'o', long = "out")]
        out: PathBuf,

        /// Directory receiving each demuxed Opus packet
        #[arg(long = "packets-dir")]
        packets_dir: Option<PathBuf>,

        #[command(flatten)]
        voice: VoiceArgs,
    },
}

fn build_request(text: String, voice: &VoiceArgs) -> TtsRequest {
    let mut request = TtsRequest::new(text).with_format(voice.format);
    if let Some(reference_id) = &voice.reference_id {
        request = request.with_reference_id(reference_id.clone());
    }
    request
}

async fn next_packet(packets: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match packets {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn write_packet(dir: &Path, index: usize, packet: &[u8]) -> anyhow::Result<()> {
    let path = dir.join(format!("packet_{index:05}.opus"));
    std::fs::write(&path, packet)
        .with_context(|| format!("Failed to write packet to {}", path.display()))
}

async fn run_convert(
    client: &Client,
    text: String,
    out: &Path,
    voice: &VoiceArgs,
) -> anyhow::Result<serde_json::Value> {
    let request = build_request(text, voice);
    let started = Instant::now();
    let audio = client.convert(&request, &voice.backend).await?;

    std::fs::write(out, &audio)
        .with_context(|| format!("Failed to write audio to {}", out.display()))?;

    Ok(serde_json::json!({
        "mode": "convert",
        "backend": voice.backend,
        "format": voice.format.as_str(),
        "bytes": audio.len(),
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "out": out.display().to_string(),
    }))
}

async fn run_realtime(
    client: &Client,
    texts: Vec<String>,
    out: &Path,
    packets_dir: Option<&Path>,
    voice: &VoiceArgs,
) -> anyhow::Result<serde_json::Value> {
    if let Some(dir) = packets_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let fragments = texts.len();
    let request = build_request(String::new(), voice);
    let started = Instant::now();
    let mut session = client
        .convert_realtime(request, stream::iter(texts), &voice.backend)
        .await?;
    info!(session_id = %session.id(), fragments, "Realtime session opened");

    let mut packets = session.packets.take();
    let mut audio_open = true;
    let mut packets_open = packets.is_some();
    let mut audio = Vec::new();
    let mut packet_count = 0usize;
    let mut first_audio_ms = None;

    while audio_open || packets_open {
        tokio::select! {
            chunk = session.audio.recv(), if audio_open => match chunk {
                Some(chunk) => {
                    first_audio_ms.get_or_insert(started.elapsed().as_millis() as u64);
                    audio.extend_from_slice(&chunk);
                }
                None => audio_open = false,
            },
            packet = next_packet(&mut packets), if packets_open => match packet {
                Some(packet) => {
                    if let Some(dir) = packets_dir {
                        write_packet(dir, packet_count, &packet)?;
                    }
                    packet_count += 1;
                }
                None => packets_open = false,
            },
        }
    }

    if let Ok(err) = session.errors.try_recv() {
        session.force_close().await;
        return Err(anyhow!("Realtime session failed: {err}"));
    }
    session.release().await;

    std::fs::write(out, &audio)
        .with_context(|| format!("Failed to write audio to {}", out.display()))?;

    Ok(serde_json::json!({
        "mode": "realtime",
        "session_id": session.id().to_string(),
        "backend": voice.backend,
        "format": voice.format.as_str(),
        "fragments": fragments,
        "bytes": audio.len(),
        "packets": packet_count,
        "first_audio_ms": first_audio_ms,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "out": out.display().to_string(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Initialize crypto provider for TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from {}", config_path.display());
        ClientConfig::from_file(config_path)?
    } else {
        ClientConfig::from_env()?
    };
    // The CLI knows its full text up front, so it always ends the stream.
    config.auto_stop = true;
    let client = Client::new(config)?;

    let summary = match cli.command {
        Commands::Convert { text, out, voice } => run_convert(&client, text, &out, &voice).await,
        Commands::Realtime {
            text,
            out,
            packets_dir,
            voice,
        } => run_realtime(&client, text, &out, packets_dir.as_deref(), &voice).await,
    };
    client.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&summary?)?);
    Ok(())
}
