use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use clap::Parser;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::{error, info, warn};
use mimalloc::MiMalloc;

use gpu_scheduler::config::Config;
use gpu_scheduler::ownership::OwnershipMap;
use gpu_scheduler::probe::{GpuProbe, NvmlProbe};
use gpu_scheduler::runner::{self, Engine, QueueOutcome};
use gpu_scheduler::selector::Sampling;
use gpu_scheduler::status::{FileStatusSink, ProgressStatusSink, StatusEvent, StatusSink};
use gpu_scheduler::task::parse_task_file;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(version, about, author, long_about = None)]
/// Multi-tenant GPU task scheduler daemon.
struct Cli {
    /// Path to the plain-text task file (spec §6).
    #[arg(short = 't', long, default_value = "tasks.txt")]
    task_file: PathBuf,

    /// Path to the YAML configuration file (spec §6).
    #[arg(short = 'c', long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides the config's status-file directory.
    #[arg(long)]
    status_dir: Option<String>,

    /// Ignores `compete_gpus`/`use_all_gpus` from the config file and
    /// enumerates every visible device.
    #[arg(long)]
    use_all_gpus: bool,
}

/// Resolves the engine's candidate device list (spec §3's "either
/// user-specified or enumerated by the probe at startup").
fn resolve_candidates(config: &Config, cli_use_all: bool, probe: &dyn GpuProbe) -> Vec<u32> {
    if cli_use_all || config.use_all_gpus {
        return probe.enumerate_devices();
    }
    if !config.compete_gpus.is_empty() {
        return config.compete_gpus.clone();
    }
    warn!("no compete_gpus configured and use_all_gpus is false; falling back to enumerating all devices");
    probe.enumerate_devices()
}

fn main() {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let multi = MultiProgress::new();
    if LogWrapper::new(multi.clone(), logger).try_init().is_err() {
        eprintln!("failed to initialize logger");
    }

    let cli = Cli::parse();

    info!(
        "gpu-scheduler starting at {}",
        chrono::Local::now().format("%H:%M:%S")
    );

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("failed to load config file {:?} ({}); using defaults", cli.config, e);
            Config::default()
        }
    };
    let mut config = config;
    if let Some(dir) = cli.status_dir.clone() {
        config.status_dir = dir;
    }
    let config = Arc::new(config);

    let probe: Arc<dyn GpuProbe> = match NvmlProbe::init() {
        Ok(probe) => Arc::new(probe),
        Err(e) => {
            error!("failed to initialize the GPU probe: {}", e);
            exit(1);
        }
    };

    let candidates = resolve_candidates(&config, cli.use_all_gpus, probe.as_ref());
    if candidates.is_empty() {
        error!("no candidate devices available; exiting");
        exit(1);
    }
    info!("candidate devices: {:?}", candidates);

    let queues = match parse_task_file(&cli.task_file) {
        Ok(queues) => queues,
        Err(e) => {
            error!("failed to read task file {:?}: {}", cli.task_file, e);
            warn!("zero tasks parsed; exiting cleanly");
            exit(0);
        }
    };
    if queues.is_empty() {
        warn!("task file {:?} produced zero tasks; exiting cleanly", cli.task_file);
        exit(0);
    }

    let pid = std::process::id();
    let file_sink = match FileStatusSink::new(&config.status_dir, pid) {
        Ok(sink) => sink,
        Err(e) => {
            warn!("failed to create status sink under {:?}: {}", config.status_dir, e);
            exit(1);
        }
    };
    let status: Arc<dyn StatusSink> = Arc::new(ProgressStatusSink::new(file_sink, multi.clone()));
    status.record(StatusEvent::SetState { state: "running".to_string() });

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
    let shutdown_tx_holder = Arc::new(Mutex::new(Some(shutdown_tx)));
    {
        let flag = shutdown_flag.clone();
        let holder = shutdown_tx_holder.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown signal received; workers will stop at their next suspension point");
            flag.store(true, Ordering::SeqCst);
            // Closing the channel (dropping every sender) wakes every
            // worker's interruptible sleep immediately.
            holder.lock().expect("shutdown sender mutex poisoned").take();
        }) {
            warn!("failed to install signal handler: {}", e);
        }
    }

    let ownership = OwnershipMap::new();
    let engine = Arc::new(Engine {
        config: config.clone(),
        probe: probe.clone(),
        ownership,
        status: status.clone(),
        candidates,
        shutdown_flag: shutdown_flag.clone(),
        shutdown_rx,
        sampling: Sampling::default(),
    });

    let handles: Vec<_> = queues
        .into_iter()
        .map(|queue| {
            let queue_id = queue.id;
            let engine = engine.clone();
            thread::Builder::new()
                .name(format!("queue-{queue_id}"))
                .spawn(move || runner::run_queue(queue, engine))
                .expect("failed to spawn queue worker thread")
        })
        .collect();

    let mut all_completed = true;
    for handle in handles {
        match handle.join() {
            Ok(QueueOutcome::Completed) => {}
            Ok(QueueOutcome::Aborted { reason }) => {
                all_completed = false;
                warn!("a queue aborted: {}", reason);
            }
            Err(_) => {
                all_completed = false;
                error!("a queue worker thread panicked");
            }
        }
    }

    status.record(StatusEvent::SetState {
        state: if all_completed { "completed" } else { "failed" }.to_string(),
    });
    info!("gpu-scheduler exiting ({})", if all_completed { "all queues completed" } else { "some queue did not complete" });

    exit(if all_completed { 0 } else { 1 });
}
