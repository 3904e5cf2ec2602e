use parkwatch::api;
use parkwatch::audit::{AuditLog, AuditSink};
use parkwatch::config::{self, Config};
use parkwatch::fare::rates::{RateProvider, RateSource};
use parkwatch::pipeline::DetectionPipeline;
use parkwatch::recognition::PlateRecognizer;
use parkwatch::recognition::remote::PlateRecognizerClient;
use parkwatch::reconcile::Reconciler;
use parkwatch::session::SessionStore;
use parkwatch::session::memory::MemoryStore;
use parkwatch::session::sqlite::SqliteStore;
use parkwatch::state::AppState;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use time::OffsetDateTime;

fn init_tracing(level: tracing::Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_default()?;
    init_tracing(config.log_level());
    tracing::info!(
        config_path = config::DEFAULT_CONFIG_PATH,
        app = %config.app.name,
        "parkwatch starting"
    );

    let recognizer = build_recognizer(&config);
    let (pipeline, audit_handle) = match config.database_path() {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path)?);
            tracing::info!(path = %path.display(), "SQLite session store opened");
            build_pipeline(store, &config, recognizer)?
        }
        None => {
            tracing::warn!("No [storage].database_path configured, sessions kept in memory");
            build_pipeline(Arc::new(MemoryStore::new()), &config, recognizer)?
        }
    };

    match pipeline.refresh_recent() {
        Ok(count) => tracing::info!(count, "Recent sessions cache loaded"),
        Err(err) => tracing::warn!(error = %err, "Failed to load recent sessions cache"),
    }

    let app = api::router(Arc::new(pipeline));
    let port = config.server_port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last audit handle; the worker drains and exits.
    if audit_handle.join().is_err() {
        tracing::warn!("Audit worker panicked");
    }
    tracing::info!("parkwatch stopped");
    Ok(())
}

fn build_pipeline<S>(
    store: Arc<S>,
    config: &Config,
    recognizer: Option<Arc<dyn PlateRecognizer>>,
) -> Result<(DetectionPipeline, JoinHandle<()>), Box<dyn std::error::Error>>
where
    S: SessionStore + RateSource + AuditSink + 'static,
{
    seed_rate(store.as_ref(), config)?;

    let (audit, audit_handle) = AuditLog::spawn(store.clone());
    let reconciler = Reconciler::new(
        store.clone(),
        RateProvider::new(store),
        audit,
        config.camera_locations(),
    );
    let pipeline = DetectionPipeline::new(
        reconciler,
        recognizer,
        Arc::new(RwLock::new(AppState::new())),
        config.pipeline_settings(),
    );
    Ok((pipeline, audit_handle))
}

/// Store the `[fare]` policy when no active policy exists yet.
fn seed_rate(rates: &dyn RateSource, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let Some(policy) = config.seed_rate(OffsetDateTime::now_utc())? else {
        return Ok(());
    };
    if let Some(active) = rates.find_active_rate()? {
        tracing::info!(rate = %active.name, hourly_rate = active.hourly_rate, "Active rate policy found");
        return Ok(());
    }
    let stored = rates.insert_rate(policy)?;
    tracing::info!(
        rate = %stored.name,
        hourly_rate = stored.hourly_rate,
        minimum_charge = stored.minimum_charge,
        grace_period_minutes = stored.grace_period_minutes,
        "Seeded rate policy from config"
    );
    Ok(())
}

fn build_recognizer(config: &Config) -> Option<Arc<dyn PlateRecognizer>> {
    let token_env = config.recognition_token_env();
    let token = match std::env::var(token_env) {
        Ok(token) if !token.trim().is_empty() => token,
        _ => {
            tracing::warn!(
                token_env = token_env,
                "Recognition token not set, frame capture disabled"
            );
            return None;
        }
    };

    match PlateRecognizerClient::new(
        config.recognition_endpoint().to_string(),
        token,
        config.recognition_regions(),
        config.recognition_camera_id(),
        config.recognition_timeout(),
    ) {
        Ok(client) => {
            tracing::info!(
                endpoint = config.recognition_endpoint(),
                min_confidence = config.min_confidence(),
                "Plate recognizer configured"
            );
            let recognizer: Arc<dyn PlateRecognizer> = Arc::new(client);
            Some(recognizer)
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to build plate recognizer client");
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
