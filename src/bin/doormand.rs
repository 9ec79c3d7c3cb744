//! doormand - Doorman access daemon
//!
//! This daemon:
//! 1. Reads frames from the configured source
//! 2. Detects and recognizes people against the identity gallery
//! 3. Holds one decision at a time for a human to allow or deny
//! 4. Serves the operator API and dispatches alerts
//! 5. Records every resolved event in the hash-chained event log

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use doorman::{
    api::{ApiConfig, ApiServer},
    detect::{detector_by_name, embedder_by_name},
    ingest::open_source,
    AlertDispatch, ArbiterService, DecisionArbiter, DoormanConfig, Embedder, EventLog,
    IdentityGallery, LinearMatcher, LogDispatch, MqttDispatch, Pipeline, PipelineParts,
    RetryPolicy, SqliteStore,
};

const ARBITER_INBOX: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the doorman database. Overrides the config file.
    #[arg(long)]
    db_path: Option<String>,
    /// Frame source URL (stub://name, file:///path.rgb). Overrides the config file.
    #[arg(long)]
    source: Option<String>,
    /// Where to write the API capability token.
    #[arg(long, env = "DOORMAN_API_TOKEN_PATH")]
    token_path: Option<PathBuf>,
    /// Seconds between pipeline health lines in the log. 0 disables them.
    #[arg(long, default_value_t = 60)]
    health_interval_s: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = DoormanConfig::load()?;
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }
    if let Some(source) = args.source {
        cfg.source.url = source;
    }
    if args.token_path.is_some() {
        cfg.api_token_path = args.token_path;
    }

    let store = Arc::new(SqliteStore::open(&cfg.db_path)?);
    let retry = RetryPolicy::default();
    let gallery = Arc::new(IdentityGallery::load(
        store.clone(),
        cfg.recognition.embedding_dimension,
        retry.clone(),
    )?);
    let events = Arc::new(EventLog::new(store.clone(), retry));
    let first_event_id = events.max_event_id()? + 1;

    let alerts: Box<dyn AlertDispatch> = match &cfg.alerts.mqtt_broker {
        Some(broker) => Box::new(MqttDispatch::connect(
            broker,
            &cfg.alerts.client_id,
            &cfg.alerts.topic_prefix,
        )?),
        None => Box::new(LogDispatch),
    };
    log::info!("alerts: dispatching via {}", alerts.name());

    let arbiter = DecisionArbiter::new(
        cfg.arbiter.clone(),
        Arc::clone(&gallery),
        Arc::clone(&events),
        alerts,
    );
    let service = ArbiterService::spawn(arbiter, ARBITER_INBOX)?;

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        token_path: cfg.api_token_path.clone(),
    };
    let api_handle = ApiServer::new(
        api_config,
        service.handle(),
        Arc::clone(&events),
        Arc::clone(&gallery),
    )
    .spawn()?;
    if let Some(path) = &api_handle.token_path {
        log::info!("api capability token written to {}", path.display());
    }

    let embedder: Arc<dyn Embedder> = Arc::from(embedder_by_name(
        &cfg.recognition.embedder,
        cfg.recognition.embedding_dimension,
    )?);
    let mut pipeline = Pipeline::spawn(
        cfg.pipeline.clone(),
        PipelineParts {
            source: open_source(&cfg.source)?,
            detector: detector_by_name(&cfg.recognition.detector)?,
            embedder,
            matcher: Arc::new(LinearMatcher),
            gallery,
            sink: Box::new(service.handle()),
            first_event_id,
        },
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || running_handler.store(false, Ordering::SeqCst))?;

    log::info!("doormand running. writing to {}", cfg.db_path);
    log::info!(
        "source={}, detector={}, embedder={}, threshold={:.2}, decision timeout={}s, policy={:?}",
        cfg.source.url,
        cfg.recognition.detector,
        cfg.recognition.embedder,
        cfg.pipeline.recognition_threshold,
        cfg.arbiter.decision_timeout.as_secs(),
        cfg.arbiter.pending_policy
    );

    let health_interval = Duration::from_secs(args.health_interval_s);
    let mut last_health_log = Instant::now();
    let mut pipeline_done = false;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if !pipeline_done && pipeline.is_finished() {
            pipeline_done = true;
            log::warn!("pipeline stopped; still serving pending decisions until Ctrl-C");
        }
        if !health_interval.is_zero() && last_health_log.elapsed() >= health_interval {
            log::info!("health: {:?}", pipeline.stats());
            last_health_log = Instant::now();
        }
    }

    log::info!("shutting down");
    pipeline.shutdown();
    let exit = pipeline.join()?;
    log::info!("capture exit: {:?}; {:?}", exit, pipeline.stats());
    let closed = service.shutdown()?;
    if !closed.is_empty() {
        log::info!("{} open decision(s) closed as timed out", closed.len());
    }
    api_handle.stop()?;
    Ok(())
}
