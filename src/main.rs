//! Dose Verification CLI
//!
//! Runs one verification session against the configured socket.io backend.
//! With `--simulate` an in-process backend echoes frames back as overlays
//! and reports the dose verified after a configurable number of frames.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use clap::Parser;
use dose_verify::{
    capture::{shared, Camera, MockCamera},
    channel::{
        BackendEndpoint, LocalChannel, OutboundEvent, SocketChannel, SocketIoChannel,
        EVENT_ANNOTATED_FRAME, EVENT_SUCCESS,
    },
    config::FileConfig,
    metrics::MetricsRegistry,
    notify::{LocalNotifier, Notifier},
    session::{Phase, SessionRequest, VerificationSession},
    store::{JsonFileStore, Medicine, Store, StoreExt, UID_KEY},
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dose-verify", about = "Camera-based dose verification", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `storage.data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Medicine to verify
    #[arg(short, long, default_value = "1")]
    medicine: String,

    /// Store a demo user and schedule a reminder for the medicine first
    #[arg(long)]
    seed: bool,

    /// Use an in-process backend simulator instead of the socket.io server
    #[arg(long)]
    simulate: bool,

    /// Frames the simulated backend annotates before verifying
    #[arg(long, default_value_t = 3)]
    verify_after: u32,

    /// Capture from the system webcam instead of synthetic frames
    #[cfg(feature = "camera")]
    #[arg(long)]
    webcam: bool,
}

/// Everything a session run needs besides its camera.
struct SessionContext {
    config: FileConfig,
    store: JsonFileStore,
    notifier: Arc<LocalNotifier<JsonFileStore>>,
    metrics: MetricsRegistry,
    request: SessionRequest,
    /// `Some(frames before verifying)` runs against the simulator.
    simulate: Option<u32>,
    shutdown: CancellationToken,
}

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Dose Verify v{}", dose_verify::VERSION);

    if let Err(e) = run(Cli::parse()).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let mut config = match &cli.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    let store = JsonFileStore::open(&config.storage.data_dir)?;
    let notifier = Arc::new(LocalNotifier::new(store.clone()));
    let metrics = MetricsRegistry::new()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.cancel())?;
    }

    #[cfg(feature = "metrics")]
    if config.metrics.port != 0 {
        use dose_verify::metrics::{MetricsServer, MetricsServerConfig};

        let server = MetricsServer::new(
            MetricsServerConfig::with_port(config.metrics.port),
            metrics.clone(),
        );
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                warn!("Metrics server stopped: {}", e);
            }
        });
    }

    let request = if cli.seed {
        seed_demo(&store, notifier.as_ref(), &cli.medicine)?
    } else {
        SessionRequest::new(cli.medicine.clone())
    };

    let ctx = SessionContext {
        config,
        store,
        notifier,
        metrics,
        request,
        simulate: cli.simulate.then_some(cli.verify_after),
        shutdown,
    };

    #[cfg(feature = "camera")]
    if cli.webcam {
        for (index, name) in dose_verify::capture::WebcamCamera::list_devices()?
            .iter()
            .enumerate()
        {
            info!(index, %name, "Camera device");
        }
        return drive(dose_verify::capture::WebcamCamera::new(), ctx).await;
    }

    drive(MockCamera::new(), ctx).await
}

/// Connects the backend channel and runs one session with `camera`.
async fn drive<C: Camera>(camera: C, ctx: SessionContext) -> AppResult<()> {
    if let Some(verify_after) = ctx.simulate {
        let (channel, backend) = LocalChannel::new();
        let backend_task = tokio::spawn(simulate_backend(
            backend,
            verify_after,
            ctx.shutdown.clone(),
        ));
        let result = run_session(camera, Arc::new(channel), &ctx).await;
        ctx.shutdown.cancel();
        if let Err(e) = backend_task.await {
            warn!("Backend simulator failed: {}", e);
        }
        return result;
    }

    info!(url = %ctx.config.backend.socket_url(), "Connecting to backend");
    let channel = Arc::new(SocketIoChannel::connect(&ctx.config.backend).await?);
    let result = run_session(camera, Arc::clone(&channel), &ctx).await;
    if let Err(e) = channel.disconnect().await {
        warn!("Socket disconnect failed: {}", e);
    }
    result
}

/// Runs one session until it navigates away or is interrupted.
async fn run_session<C, K>(mut camera: C, channel: Arc<K>, ctx: &SessionContext) -> AppResult<()>
where
    C: Camera,
    K: SocketChannel,
{
    let SessionContext {
        config,
        store,
        notifier,
        metrics,
        request,
        shutdown,
        ..
    } = ctx;

    camera.open(&config.capture)?;
    let camera = shared(camera);

    let session = VerificationSession::new(
        Arc::clone(&camera),
        channel,
        Arc::clone(notifier),
        config,
        metrics.clone(),
    );
    session.resolve(store, request)?;
    session.start()?;

    let mut updates = session.subscribe();
    let mut last_phase = Phase::Ready;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Interrupted, cancelling session");
                session.cancel();
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.phase != last_phase {
                    info!(phase = %snapshot.phase, frames = snapshot.frame_sequence, "Session phase changed");
                    last_phase = snapshot.phase;
                }
                if snapshot.navigate_back {
                    break;
                }
            }
        }
    }

    session.close();
    shutdown.cancel();
    camera.lock().await.close();

    let history = store.history()?;
    if let Some(entry) = history.first() {
        info!(
            medicine = %entry.medicine_name,
            status = %entry.status,
            "Latest dose"
        );
    }
    info!("Done. {:?}", metrics.snapshot());
    Ok(())
}

/// Logs a demo user in and schedules the medicine's reminder one minute out.
fn seed_demo(
    store: &JsonFileStore,
    notifier: &impl Notifier,
    medicine_id: &str,
) -> AppResult<SessionRequest> {
    store.set(UID_KEY, "42")?;

    let mut medicine = Medicine::new(medicine_id, medicine_id, "Amoxicillin");
    medicine.dosage = "500 mg".to_string();
    medicine.time = (Utc::now() + ChronoDuration::minutes(1)).to_rfc3339_opts(SecondsFormat::Secs, true);

    if store.find_medicine(medicine_id)?.is_none() {
        let alarm = notifier.schedule_reminder(&medicine)?;
        info!(title = %alarm.title, body = %alarm.body, "Reminder set");
        return Ok(alarm.tap().into());
    }
    Ok(SessionRequest::new(medicine_id))
}

/// Stands in for the inference backend.
async fn simulate_backend(
    mut backend: BackendEndpoint,
    verify_after: u32,
    shutdown: CancellationToken,
) {
    let mut received = 0u32;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = backend.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            OutboundEvent::RawFrame(message) => {
                received += 1;
                info!(
                    uid = message.uid,
                    rid = message.rid,
                    bytes = message.frame.len(),
                    "Backend received frame {}",
                    received
                );
                if received >= verify_after {
                    backend.push(dose_verify::InboundEvent::Verified);
                    continue;
                }
                let frame = Value::Array(message.frame.into_iter().map(Value::from).collect());
                for (name, payload) in [
                    (EVENT_SUCCESS, json!({ "message": "Frame received" })),
                    (EVENT_ANNOTATED_FRAME, frame),
                ] {
                    if let Err(e) = backend.push_wire(name, payload) {
                        warn!("Simulator produced a bad event: {}", e);
                    }
                }
            }
            OutboundEvent::NotVerified(report) => {
                info!(uid = report.uid, rid = report.rid, "Backend recorded unverified dose");
            }
        }
    }
}
