use anyhow::Context;
use async_trait::async_trait;
use meter_core::{MeterConfig, SessionStore};
use meter_ocr::{OcrBackend, OcrError, OcrResponse, VisionRecognizer};
use meter_verify::{spawn_sweeper, Prompter, VerificationService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod commands;

pub type Backend = Box<dyn OcrBackend>;

pub struct AppState {
    pub db: meter_storage::DbPool,
    pub service: Arc<VerificationService<Backend>>,
}

/// Stands in for the Vision backend when no API key is configured, so every
/// photo falls through to manual entry.
#[cfg_attr(feature = "tesseract", allow(dead_code))]
struct DisabledRecognizer;

#[async_trait]
impl OcrBackend for DisabledRecognizer {
    async fn recognize(&self, _image_png: &[u8]) -> Result<OcrResponse, OcrError> {
        Err(OcrError::NotAvailable)
    }
}

#[cfg(feature = "tesseract")]
fn local_recognizer() -> Backend {
    tracing::info!("GOOGLE_VISION_API_KEY is not set; using local Tesseract");
    Box::new(meter_ocr::recognizer::tesseract_backend::TesseractRecognizer::new(None, "eng"))
}

#[cfg(not(feature = "tesseract"))]
fn local_recognizer() -> Backend {
    tracing::warn!("GOOGLE_VISION_API_KEY is not set; photos will require manual entry");
    Box::new(DisabledRecognizer)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dirs = directories::ProjectDirs::from("com", "meter", "MeterVerify")
        .context("Failed to get app directory")?;
    let data_dir = project_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| project_dirs.config_dir().join("meter.toml"));
    let config = if config_path.exists() {
        tracing::info!("Loading config: {}", config_path.display());
        MeterConfig::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        tracing::info!("No config at {}, using defaults", config_path.display());
        MeterConfig::default()
    };

    let db = meter_storage::create_db(&data_dir.join("sessions.db"))
        .await
        .context("Failed to create database")?;

    let recognizer: Backend = match std::env::var("GOOGLE_VISION_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            Box::new(VisionRecognizer::new(config.ocr.vision_endpoint.clone(), key))
        }
        _ => local_recognizer(),
    };

    let sessions: Arc<dyn SessionStore> =
        Arc::new(meter_storage::SqliteSessionStore::new(db.clone()));
    let prompter: Arc<dyn Prompter> = Arc::new(commands::ConsolePrompter);
    let service = Arc::new(VerificationService::from_config(
        recognizer, &config, sessions, prompter,
    ));

    // ── Expiry sweep ──────────────────────────────────────────────────────────
    let _sweeper = spawn_sweeper(service.clone(), config.verification.sweep_interval());

    // ── Console transport ─────────────────────────────────────────────────────
    let state = AppState { db, service };
    println!("{}", commands::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match commands::parse(&line) {
            Ok(commands::Command::Quit) => break,
            Ok(cmd) => match commands::execute(&state, cmd).await {
                Ok(reply) => println!("{reply}"),
                Err(e) => println!("error: {}", e.message),
            },
            Err(e) => println!("error: {}", e.message),
        }
    }

    Ok(())
}
