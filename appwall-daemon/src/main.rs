//! appwall daemon
//!
//! Runs the firewall engine on a Linux tun device until interrupted.
//!
//! Usage: `appwall [--config <settings.json>]`

mod forwarder;

use anyhow::{anyhow, Context};
use appwall_core::settings::{load_settings_from, settings_path};
use appwall_core::utils::{is_root, rotate_log_if_needed};
use appwall_core::vpn::dpi::{DpiBridge, SignatureClassifier};
use appwall_core::vpn::proc_net::tables_present;
use appwall_core::vpn::{
    reader_stop_timeout, user_friendly_error, DecisionEngine, FilePolicyStore, FirewallError,
    FlowRecorder, JsonLinesFlowStore, LoopComponents, OwnerResolver, PacketLoop, PolicyCache,
    PolicyObserver, PolicyStore, PreflightProber, ProcNetLookup, ReqwestTransport, TunAdapter,
};
use appwall_core::{
    AppIdentityCache, AppSettings, EngineConfig, LogNotificationSink, NotificationSink, PasswdDirectory,
};
use forwarder::RawSocketForwarder;
use log::{error, info, warn};
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Path for single-instance lock file
const LOCK_FILE_PATH: &str = "/run/appwall.lock";

/// How often the main task checks whether the loop stopped on its own
const LOOP_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the flock for the life of the process
struct SingleInstanceGuard {
    _file: std::fs::File,
}

/// Try to take an exclusive, non-blocking flock on the lock file. Returns
/// None (and continues) if the lock file cannot be opened.
fn try_acquire_single_instance() -> Result<Option<SingleInstanceGuard>, ()> {
    use std::os::fd::AsRawFd;

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(LOCK_FILE_PATH)
    {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open lock file {}: {}, continuing anyway", LOCK_FILE_PATH, e);
            return Ok(None);
        }
    };

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(Some(SingleInstanceGuard { _file: file }));
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(())
    } else {
        warn!("flock() failed: {}, continuing anyway", err);
        Ok(None)
    }
}

/// Log panics with their location before the default hook runs
fn setup_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let thread = std::thread::current();
        error!(
            "PANIC in thread '{}' at {}: {}",
            thread.name().unwrap_or("unnamed"),
            location,
            message
        );
        default_hook(info);
    }));
}

fn init_logging(config: &EngineConfig) {
    let log_level = config
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level).parse_default_env().format_timestamp_millis();

    if let Some(log_file_path) = &config.log_file {
        if let Some(dir) = log_file_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = rotate_log_if_needed(log_file_path) {
            eprintln!("Failed to rotate log: {}", e);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(log_file_path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}, logging to stderr", log_file_path.display(), e),
        }
    }
    builder.init();
}

/// `--config <path>` or the default settings location
fn config_path_from_args() -> anyhow::Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                return args
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("--config needs a path"));
            }
            other => return Err(anyhow!("unknown argument '{}'", other)),
        }
    }
    settings_path().ok_or_else(|| anyhow!("cannot determine the settings directory; pass --config"))
}

/// Everything that must outlive the packet loop, in shutdown order
struct Engine {
    packet_loop: PacketLoop,
    observer: PolicyObserver,
    policy_store: FilePolicyStore,
    recorder: FlowRecorder,
}

impl Engine {
    fn build(settings: &AppSettings, settings_file: &Path) -> anyhow::Result<Self> {
        let engine_config = &settings.engine;

        if !tables_present(Path::new("/proc/net")) {
            warn!("/proc/net socket tables missing, every packet will have an unknown owner");
        }

        let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink::default());

        let policies = Arc::new(PolicyCache::from_settings(&settings.firewall, &settings.access_policies));
        let policy_store = FilePolicyStore::new(
            settings_file,
            Duration::from_millis(engine_config.policy_poll_interval_ms),
        );
        let observer = PolicyObserver::start(Arc::clone(&policies), policy_store.subscribe())
            .context("failed to start policy observer")?;
        policy_store.start().context("failed to start policy store")?;

        let resolver = OwnerResolver::new(Arc::new(ProcNetLookup::new()), engine_config.owner_candidates.clone());
        let apps = Arc::new(AppIdentityCache::with_overrides(
            Arc::new(PasswdDirectory::default()),
            settings.no_system_override.clone(),
        ));

        let transport = ReqwestTransport::new(Duration::from_secs(engine_config.preflight.timeout_secs))
            .map_err(fatal)?;
        let prober = PreflightProber::new(Arc::new(transport), &engine_config.preflight)
            .with_notifier(Arc::clone(&notifier));

        let decision_engine =
            DecisionEngine::new(policies, resolver, apps, notifier).with_prober(Arc::new(prober));

        let flow_store = JsonLinesFlowStore::open(&engine_config.flow_log_path).map_err(fatal)?;
        let recorder = FlowRecorder::start(Box::new(flow_store), engine_config.flow_queue_capacity)
            .context("failed to start flow writer")?;

        let forwarder = RawSocketForwarder::new(engine_config.fwmark)
            .map_err(|e| fatal(FirewallError::Adapter(format!("raw socket: {}", e))))?;
        let adapter = Arc::new(TunAdapter::create(engine_config).map_err(fatal)?);

        let packet_loop = PacketLoop::new(LoopComponents {
            interface: adapter.clone(),
            sink: adapter,
            engine: Arc::new(decision_engine),
            dpi: Arc::new(DpiBridge::new(Box::new(SignatureClassifier::new()))),
            forwarder: Arc::new(forwarder),
            recorder: recorder.clone(),
            writer_queue_capacity: engine_config.writer_queue_capacity,
            flow_idle_timeout: Duration::from_secs(engine_config.flow_idle_timeout_secs),
            stop_timeout: reader_stop_timeout(&engine_config.preflight),
        });

        Ok(Self {
            packet_loop,
            observer,
            policy_store,
            recorder,
        })
    }

    fn shutdown(mut self) {
        if self.packet_loop.is_running() {
            self.packet_loop.stop();
        }
        self.policy_store.stop();
        self.observer.stop();
        self.recorder.stop();

        let stats = self.recorder.stats();
        info!(
            "Flow recorder stopped - {} persisted, {} dropped, {} failed",
            stats.persisted.load(std::sync::atomic::Ordering::Relaxed),
            stats.dropped.load(std::sync::atomic::Ordering::Relaxed),
            stats.failed.load(std::sync::atomic::Ordering::Relaxed)
        );
    }
}

/// Turn a firewall error into an anyhow error carrying the friendly text
fn fatal(e: FirewallError) -> anyhow::Error {
    error!("{}", e);
    anyhow!("{}", user_friendly_error(&e))
}

async fn wait_for_shutdown(packet_loop: &PacketLoop) {
    let mut watch = tokio::time::interval(LOOP_WATCH_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received, shutting down"),
                    Err(e) => error!("Cannot listen for interrupt: {}", e),
                }
                return;
            }
            _ = watch.tick() => {
                if !packet_loop.is_running() {
                    warn!("Packet loop stopped on its own, shutting down");
                    return;
                }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    setup_panic_hook();

    let settings_file = config_path_from_args()?;
    let settings = load_settings_from(&settings_file);
    init_logging(&settings.engine);

    info!("========================================");
    info!("Starting appwall v{}", env!("CARGO_PKG_VERSION"));
    info!("Settings file: {}", settings_file.display());
    info!("Running as root: {}", is_root());

    settings
        .engine
        .validate()
        .map_err(|e| fatal(FirewallError::InvalidConfig(e)))?;

    let _instance_guard = match try_acquire_single_instance() {
        Ok(guard) => guard,
        Err(()) => {
            eprintln!("appwall is already running.");
            return Ok(());
        }
    };

    let engine = Engine::build(&settings, &settings_file)?;
    engine.packet_loop.start().map_err(fatal)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    runtime.block_on(wait_for_shutdown(&engine.packet_loop));

    engine.shutdown();
    info!("appwall stopped");
    Ok(())
}
