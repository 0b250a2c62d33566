use anyhow::Context;
use clap::Parser;
use sign_stream::connection::ConnectionState;
use sign_stream::{DirectoryFrameSource, SessionConfig, SessionController, SessionEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "sign-stream")]
#[command(about = "Stream camera frames to a sign recognition server and print the transcript")]
struct Args {
    /// Directory of JPEG frames to replay as the camera
    #[arg(short, long)]
    frames: PathBuf,

    /// WebSocket endpoint (overrides SIGN_STREAM_URL)
    #[arg(short, long)]
    url: Option<String>,

    /// Motion threshold factor to send once connected
    #[arg(long)]
    threshold_factor: Option<f64>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(short, long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    log::info!("🚀 Starting sign-stream with args: {:?}", args);

    let mut config = SessionConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = &args.url {
        config = config.with_endpoint(url)?;
    }

    let source = DirectoryFrameSource::open(&args.frames)
        .with_context(|| format!("Cannot use frames from {}", args.frames.display()))?;
    log::info!("📷 Replaying {} frames from {}", source.len(), args.frames.display());

    let controller = SessionController::spawn(config, Arc::new(source));
    let mut events = controller.subscribe();
    controller.start()?;

    println!("🎥 Streaming... press Ctrl+C to stop");

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged(state)) => {
                    println!("🔌 Connection: {}", state);
                    if let (ConnectionState::Connected, Some(factor)) = (state, args.threshold_factor) {
                        controller.adjust_motion_threshold(factor)?;
                    }
                }
                Ok(SessionEvent::Prediction(p)) => {
                    log::debug!("Prediction {} ({:.3})", p.predicted_class, p.confidence);
                }
                Ok(SessionEvent::Transcript(entries)) => {
                    println!("📝 {}", entries.join(" "));
                }
                Ok(SessionEvent::FrameDropped { size_kb }) => {
                    println!("⚠️  Frame dropped ({:.0}KB)", size_kb);
                }
                Ok(SessionEvent::Alert(alert)) => {
                    println!("❌ {}: {}", alert.title(), alert);
                }
                Ok(SessionEvent::Stopped) => {
                    println!("🛑 Session stopped");
                    break;
                }
                Ok(SessionEvent::Stats(_)) => {}
                Err(RecvError::Lagged(n)) => log::warn!("Missed {} session events", n),
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline, if !stopping => {
                log::info!("Duration elapsed, stopping");
                stopping = true;
                controller.stop()?;
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                log::info!("Received Ctrl+C, shutting down...");
                stopping = true;
                controller.stop()?;
            }
        }
    }

    let snapshot = controller.snapshot();
    println!(
        "📊 {} frames sent, transcript: \"{}\"",
        snapshot.frames_sent,
        snapshot.transcript_text()
    );
    controller.shutdown().await;

    println!("\n👋 Goodbye!");
    Ok(())
}
