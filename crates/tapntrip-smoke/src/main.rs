//! TapNTrip Smoke Harness
//!
//! Installs and activates the offline controller against a running origin,
//! fetches the app shell online and offline, and prints a JSON summary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde_json::json;
use tapntrip_common::{init_logging, LogConfig, LogFormat};
use tapntrip_net::{LoaderConfig, NetError, Network, Request, ResourceLoader, Response};
use tapntrip_sw::{
    CacheStorage, Clients, ControllerConfig, EventOutcome, HostServices, MemoryCacheStorage,
    MemoryQueue, NotificationCenter, OfflineController, ServiceWorkerEvent,
    ServiceWorkerRegistration,
};
use tracing::{info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
#[derive(Default)]
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let count = durations.len();
            let total_ms: f64 = durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            let max_ms = durations
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": (total_ms * 100.0).round() / 100.0,
                    "avg_ms": (total_ms / count as f64 * 100.0).round() / 100.0,
                    "max_ms": (max_ms * 100.0).round() / 100.0,
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

struct Args {
    config: Option<PathBuf>,
    origin: Option<String>,
    log_format: LogFormat,
    log_filter: Option<String>,
    verbose: bool,
    perf_output: Option<PathBuf>,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            origin: None,
            log_format: LogFormat::Compact,
            log_filter: None,
            verbose: false,
            perf_output: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next().map(PathBuf::from),
                "--origin" => parsed.origin = args.next(),
                "--log-format" => {
                    if let Some(val) = args.next() {
                        parsed.log_format = val.parse()?;
                    }
                }
                "--log-filter" => parsed.log_filter = args.next(),
                "--perf-output" => parsed.perf_output = args.next().map(PathBuf::from),
                "--verbose" | "-v" => parsed.verbose = true,
                other => bail!("unknown argument '{other}'"),
            }
        }
        Ok(parsed)
    }

    fn load_config(&self) -> anyhow::Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::load(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            config.origin = Url::parse(origin).with_context(|| format!("bad origin '{origin}'"))?;
            config.validate()?;
        }
        Ok(config)
    }
}

/// Wraps the real loader with a switch that simulates losing connectivity.
struct Switchable {
    inner: ResourceLoader,
    offline: AtomicBool,
}

impl Switchable {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Network for Switchable {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline("simulated".to_string()));
        }
        self.inner.fetch(request).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse()?;
    let mut log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    if let Some(filter) = &args.log_filter {
        log_config = log_config.with_filter(filter.as_str());
    }
    init_logging(log_config.with_format(args.log_format))?;

    let config = args.load_config()?;
    info!(
        version = %config.version_tag,
        origin = %config.origin,
        assets = config.static_assets.len(),
        "Starting TapNTrip smoke harness"
    );

    let mut perf = PerfTiming::default();
    let network = Arc::new(Switchable {
        inner: ResourceLoader::new(LoaderConfig::default())?,
        offline: Default::default(),
    });
    let caches = Arc::new(MemoryCacheStorage::new());
    let clients = Arc::new(Clients::new());
    let host = HostServices {
        caches: caches.clone(),
        notifier: Arc::new(NotificationCenter::new()),
        clients: clients.clone(),
    };

    let (controller, mut controller_events) =
        OfflineController::new(config.clone(), host, network.clone())?;
    let controller = Arc::new(controller.with_offline_queue(Arc::new(MemoryQueue::new())));

    let (registration, _registration_events) =
        ServiceWorkerRegistration::new(config.app_root(), network.clone());
    let mut registration = registration.with_skip_waiting(config.skip_waiting);
    clients.add_window(config.app_root()).await;

    let start = Instant::now();
    registration
        .install(config.version_tag.clone(), controller.clone())
        .await
        .context("install failed")?;
    perf.record("install", start.elapsed());

    if registration.get_active().is_none() {
        let start = Instant::now();
        registration.activate().await?;
        perf.record("activate", start.elapsed());
    }

    let mut fetches = Vec::new();
    for offline in [false, true] {
        network.set_offline(offline);
        for url in config.precache_urls()? {
            let start = Instant::now();
            let fetched = registration.handle_fetch(Request::get(url.clone())).await?;
            let op = if offline { "fetch_offline" } else { "fetch_online" };
            perf.record(op, start.elapsed());
            fetches.push(json!({
                "url": url.as_str(),
                "offline": offline,
                "status": fetched.response.status.as_u16(),
                "source": format!("{:?}", fetched.source),
                "bytes": fetched.response.bytes().len(),
            }));
        }
    }
    let uncached = config.resolve("/smoke/never-cached")?;
    let fallback = registration.handle_fetch(Request::navigate(uncached)).await?;
    fetches.push(json!({
        "url": fallback.response.url.as_str(),
        "offline": true,
        "status": fallback.response.status.as_u16(),
        "source": format!("{:?}", fallback.source),
        "bytes": fallback.response.bytes().len(),
    }));

    network.set_offline(false);
    controller.flush().await;

    let sync = match registration
        .dispatch(ServiceWorkerEvent::Sync(config.sync_tag.clone()))
        .await?
    {
        EventOutcome::Sync(report) => json!({
            "tag": report.tag,
            "matched": report.matched,
            "replayed": report.replayed,
            "failed": report.failed,
        }),
        other => {
            warn!(?other, "Unexpected sync outcome");
            serde_json::Value::Null
        }
    };

    let mut events = Vec::new();
    while let Ok(event) = controller_events.try_recv() {
        events.push(format!("{event:?}"));
    }

    let summary = json!({
        "version": config.version_tag,
        "active": registration.get_active().map(|w| w.version.clone()),
        "cached_entries": caches.entry_count(&config.version_tag).await,
        "fetches": fetches,
        "sync": sync,
        "events": events,
        "perf": perf.summary(),
    });

    let rendered = serde_json::to_string_pretty(&summary)?;
    match &args.perf_output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("cannot write {}", path.display()))?;
            info!(path = %path.display(), "Wrote smoke summary");
        }
        None => println!("{rendered}"),
    }

    Ok(())
}
