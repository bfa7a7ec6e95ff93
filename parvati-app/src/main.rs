//! PARVATI headless session host.
//!
//! Drives one call session from an intent script and streams every session
//! event to stdout as JSON lines. Logs go to stderr.
//!
//! ```text
//! parvati start wait:500 video wait:200 status end
//! ```

mod commands;
mod settings;
mod state;

use std::path::PathBuf;

use clap::Parser;
use commands::Intent;
use serde_json::json;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use state::{emit_line, AppState};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "PARVATI call-session host", author, version)]
struct Cli {
    /// Settings file (defaults to the per-user app data directory)
    #[arg(long, env = "PARVATI_SETTINGS")]
    settings: Option<PathBuf>,

    /// Write default settings to the settings path and exit
    #[arg(long = "write-default-settings", default_value_t = false)]
    write_default_settings: bool,

    /// Persist a preferred microphone name before starting
    #[arg(long = "input-device", value_name = "NAME")]
    input_device: Option<String>,

    /// Intents to run in order: start, end, mic, video, status,
    /// wait:<ms>, widget:<text>
    #[arg(value_name = "INTENT")]
    intents: Vec<Intent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parvati=info,parvati_core=info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);

    if cli.write_default_settings {
        save_settings(&settings_path, &AppSettings::default())?;
        info!(path = %settings_path.display(), "default settings written");
        return Ok(());
    }

    let app_settings = load_settings(&settings_path);
    info!(
        path = %settings_path.display(),
        backend = %app_settings.media_backend,
        frame_interval_ms = app_settings.frame_interval_ms,
        "PARVATI starting"
    );

    let state = AppState::new(app_settings, settings_path)?;
    if let Some(name) = cli.input_device {
        if let Err(e) = commands::set_preferred_input_device(&state, Some(name)) {
            warn!("saving preferred input device: {e}");
        }
    }
    let forwarders = state.spawn_event_forwarders();

    emit_line(&json!({
        "channel": "widget",
        "payload": {
            "src": state.widget.src,
            "allow": state.widget.allow_attr(),
            "sandbox": state.widget.sandbox_attr(),
            "handshake": commands::widget_loaded(),
        }
    }));

    for intent in &cli.intents {
        if let Err(e) = commands::dispatch(&state, intent).await {
            warn!(?intent, "intent failed: {e}");
            emit_line(&json!({
                "channel": "error",
                "payload": { "intent": format!("{intent:?}"), "message": e },
            }));
        }
    }

    state.session.shutdown().await;
    // Let forwarders drain the final events before exiting.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    for handle in forwarders {
        handle.abort();
    }

    let diag = state.session.detection_diagnostics();
    info!(
        ticks = diag.ticks,
        passes = diag.passes,
        samples_emitted = diag.samples_emitted,
        classification_failures = diag.classification_failures,
        "detection diagnostics on exit"
    );
    Ok(())
}
