//! Example: Live Call
//!
//! Runs a real voice call against the default microphone and speakers, using
//! the OpenAI-compatible APIs for transcription, replies and speech.
//!
//! ```text
//! SOLACE_API_KEY=sk-... cargo run -p solace-call --example live_call
//! ```
//!
//! Press Ctrl+C to hang up.

use anyhow::Context;
use solace_call::{
    CallConfig, ChunkedRecognizer, Collaborators, CpalCapture, DevicePermission, OpenAiResponseClient,
    OpenAiStt, RodioPlayback, TurnController, TurnState,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("📞 Solace Live Call");
    info!("===================");

    let config = CallConfig::load().context("loading call config")?;
    for name in CpalCapture::list_input_devices()? {
        info!("🎙️  Input device: {name}");
    }

    let stt = OpenAiStt::from_env(&config.response.base_url, &config.recognizer)?;
    let recognizer = ChunkedRecognizer::new(stt, &config.capture, &config.recognizer);
    let client = OpenAiResponseClient::from_env(config.response.clone())?;
    let playback = RodioPlayback::new().context("opening audio output")?;

    let collaborators = Collaborators {
        capture: Box::new(CpalCapture::new(config.capture.clone())),
        recognizer: Arc::new(recognizer),
        client: Arc::new(client),
        playback: Box::new(playback),
        permission: Arc::new(DevicePermission),
    };

    let (controller, inbox) = TurnController::new(config, collaborators);
    let call = controller.spawn(inbox);
    let mut changes = call.subscribe();

    call.start_session().await?;
    info!("✅ Call started, speak whenever you like. Ctrl+C hangs up.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    let session = call.snapshot();
                    match &change.to {
                        TurnState::Processing => info!("🗣️  You: {}", session.transcript),
                        TurnState::Speaking => info!("💬 Solace: {}", session.last_response_text),
                        TurnState::Error(reason) => {
                            warn!("❌ {reason}");
                            break;
                        }
                        _ => {}
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "state changes lagged"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    call.end_session().await?;
    let session = call.snapshot();
    info!("📴 Call ended after {}s", session.duration_seconds);
    call.shutdown().await?;
    Ok(())
}
