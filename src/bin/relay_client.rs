//! # Relay Client
//!
//! Command-line client for exercising a running relay.
//!
//! ## Commands:
//! - **prewarm**: `GET /prewarm` and print the readiness map
//! - **turn**: upload WAV chunks over `/pipeline`, then print the transcript and reply
//!   sentences and save each reply WAV
//! - **duplex**: stream a 16-bit WAV over `/ws` as raw PCM in real time, print the text
//!   tokens, and save the audio that comes back

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::pipeline::history::HistoryEntry;
use voice_relay::protocol::{ClientMessage, ProtocolCodec, ServerMessage, TaggedMessage};

/// Voice relay test client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base HTTP URL of the relay
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Warm every collaborator
    Prewarm,

    /// Run one discrete turn
    Turn(TurnCommand),

    /// Stream a WAV file through a duplex session
    Duplex(DuplexCommand),
}

#[derive(Parser, Debug)]
struct TurnCommand {
    /// WAV chunks, sent in order
    #[arg(required = true)]
    wavs: Vec<PathBuf>,

    /// JSON file holding a list of {"role", "content"} entries
    #[arg(long)]
    history: Option<PathBuf>,

    /// Directory for the reply WAV files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Wait out each chunk's duration before sending it, like a live speaker
    #[arg(long)]
    realtime: bool,

    /// Skip the prewarm call
    #[arg(long)]
    no_prewarm: bool,
}

#[derive(Parser, Debug)]
struct DuplexCommand {
    /// 16-bit mono WAV to stream
    input: PathBuf,

    /// Where to write the returned audio
    #[arg(short, long, default_value = "duplex_output.wav")]
    output: PathBuf,

    /// Sample rate the relay's codec runs at
    #[arg(long, default_value_t = 24000)]
    sample_rate: u32,

    /// Milliseconds of audio per frame sent
    #[arg(long, default_value_t = 80)]
    frame_ms: u64,

    /// How long to keep listening after the input is exhausted
    #[arg(long, default_value_t = 2000)]
    linger_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Prewarm => prewarm(&server).await,
        Commands::Turn(command) => {
            if !command.no_prewarm {
                prewarm(&server).await?;
            }
            turn(&server, command).await
        }
        Commands::Duplex(command) => duplex(&server, command).await,
    }
}

fn websocket_url(server: &str, path: &str) -> Result<String> {
    let base = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        bail!("server URL must start with http:// or https://: {}", server);
    };
    Ok(format!("{}{}", base, path))
}

async fn prewarm(server: &str) -> Result<()> {
    info!("Prewarming collaborators");
    let response = reqwest::get(format!("{}/prewarm", server))
        .await
        .context("prewarm request failed")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid prewarm response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("prewarm returned {}", status);
    }
    Ok(())
}

/// Playback length of a WAV file.
fn wav_duration(path: &Path) -> Result<Duration> {
    let mut file = File::open(path)?;
    let (header, data) = wav::read(&mut file).with_context(|| format!("reading {}", path.display()))?;
    let samples = match &data {
        wav::BitDepth::Eight(s) => s.len(),
        wav::BitDepth::Sixteen(s) => s.len(),
        wav::BitDepth::TwentyFour(s) => s.len(),
        wav::BitDepth::ThirtyTwoFloat(s) => s.len(),
        wav::BitDepth::Empty => 0,
    };
    let frames = samples as f64 / header.channel_count.max(1) as f64;
    Ok(Duration::from_secs_f64(frames / header.sampling_rate.max(1) as f64))
}

async fn turn(server: &str, command: TurnCommand) -> Result<()> {
    let url = websocket_url(server, "/pipeline")?;
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {}", url))?;
    let (mut write, mut read) = stream.split();
    info!("WebSocket connection established");

    for path in &command.wavs {
        if command.realtime {
            let duration = wav_duration(path)?;
            debug!(?duration, "Speaking chunk");
            tokio::time::sleep(duration).await;
        }
        let audio = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let sent = Instant::now();
        write
            .send(Message::Text(ProtocolCodec::encode_client(&ClientMessage::Wav(audio))))
            .await?;
        info!(path = %path.display(), elapsed = ?sent.elapsed(), "Sent WAV chunk");
    }

    if let Some(path) = &command.history {
        let entries: Vec<HistoryEntry> = serde_json::from_slice(&std::fs::read(path)?)
            .with_context(|| format!("parsing history {}", path.display()))?;
        write
            .send(Message::Text(ProtocolCodec::encode_client(&ClientMessage::History(entries))))
            .await?;
    }

    write
        .send(Message::Text(ProtocolCodec::encode_client(&ClientMessage::End)))
        .await?;
    let finished_speaking = Instant::now();
    info!("Finished speaking, waiting for reply");

    std::fs::create_dir_all(&command.output_dir)?;
    let mut replies = 0;

    while let Some(message) = read.next().await {
        let payload = match message? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                info!(?frame, "Server closed connection");
                break;
            }
            _ => continue,
        };

        match ProtocolCodec::decode_server(&payload) {
            Ok(ServerMessage::Transcript(text)) => println!("Transcript: {}", text),
            Ok(ServerMessage::Text(text)) => println!("Reply: {}", text.trim()),
            Ok(ServerMessage::Wav(audio)) => {
                if replies == 0 {
                    println!(
                        "First audio {:.3}s after end of speech",
                        finished_speaking.elapsed().as_secs_f64()
                    );
                }
                let path = command.output_dir.join(format!("reply_{}.wav", replies));
                std::fs::write(&path, audio)?;
                replies += 1;
            }
            Err(e) => warn!(error = %e, "Skipping unreadable message"),
        }
    }

    println!("Saved {} reply chunks to {}", replies, command.output_dir.display());
    Ok(())
}

/// Read a 16-bit mono WAV as little-endian PCM bytes.
fn read_pcm_bytes(path: &Path, expected_rate: u32) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let (header, data) = wav::read(&mut file).with_context(|| format!("reading {}", path.display()))?;
    if header.channel_count != 1 {
        bail!("expected a mono WAV, got {} channels", header.channel_count);
    }
    if header.sampling_rate != expected_rate {
        warn!(
            file_rate = header.sampling_rate,
            expected_rate, "Sample rate mismatch; audio will play at the wrong speed"
        );
    }
    let samples = data
        .try_into_sixteen()
        .map_err(|_| anyhow!("expected 16-bit samples"))?;

    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(&samples, &mut bytes);
    Ok(bytes)
}

async fn duplex(server: &str, command: DuplexCommand) -> Result<()> {
    let pcm = read_pcm_bytes(&command.input, command.sample_rate)?;
    let frame_bytes = ((command.sample_rate as u64 * command.frame_ms / 1000) as usize * 2).max(2);
    let frame_interval = Duration::from_millis(command.frame_ms);
    let linger = Duration::from_millis(command.linger_ms);

    let url = websocket_url(server, "/ws")?;
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {}", url))?;
    let (mut write, mut read) = stream.split();
    info!(frames = pcm.len().div_ceil(frame_bytes), "Streaming audio");

    let sender = tokio::spawn(async move {
        for chunk in pcm.chunks(frame_bytes) {
            write.send(Message::Binary(chunk.to_vec())).await?;
            tokio::time::sleep(frame_interval).await;
        }
        tokio::time::sleep(linger).await;
        write.send(Message::Close(None)).await?;
        Ok::<_, tokio_tungstenite::tungstenite::Error>(())
    });

    let mut audio = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(message) = read.next().await {
        match message? {
            Message::Binary(frame) => match TaggedMessage::decode(&frame) {
                Ok(TaggedMessage::Audio(bytes)) => audio.extend_from_slice(&bytes),
                Ok(TaggedMessage::Text(token)) => {
                    print!("{}", token);
                    stdout.flush()?;
                }
                Err(e) => warn!(error = %e, "Skipping unreadable frame"),
            },
            Message::Close(frame) => {
                info!(?frame, "Server closed connection");
                break;
            }
            _ => {}
        }
    }
    println!();

    match sender.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Sender stopped early"),
        Err(e) => warn!(error = %e, "Sender task failed"),
    }

    let mut samples = vec![0i16; audio.len() / 2];
    LittleEndian::read_i16_into(&audio[..samples.len() * 2], &mut samples);
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, command.sample_rate, 16);
    let mut out = File::create(&command.output)?;
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)?;
    println!(
        "Wrote {:.2}s of audio to {}",
        (audio.len() / 2) as f64 / command.sample_rate as f64,
        command.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://127.0.0.1:8080", "/ws").unwrap(),
            "ws://127.0.0.1:8080/ws"
        );
        assert_eq!(
            websocket_url("https://relay.example.com", "/pipeline").unwrap(),
            "wss://relay.example.com/pipeline"
        );
        assert!(websocket_url("relay.example.com", "/ws").is_err());
    }

    #[test]
    fn test_cli_parses_turn() {
        let cli = Cli::try_parse_from([
            "relay-client",
            "turn",
            "a.wav",
            "b.wav",
            "--history",
            "history.json",
            "--realtime",
        ])
        .unwrap();
        match cli.command {
            Commands::Turn(turn) => {
                assert_eq!(turn.wavs.len(), 2);
                assert!(turn.realtime);
                assert_eq!(turn.history, Some(PathBuf::from("history.json")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
