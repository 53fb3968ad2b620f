// This binary is the central recording server: it accepts camera clients,
// writes their streams to disk, schedules FFmpeg encodes, concatenates
// finished segments, and reclaims disk space. See component design in
// DESIGN.md for how each module maps onto the architecture.

mod clock_sched;
mod concat;
mod config;
mod encode;
mod ffmpeg;
mod ingest;
mod janitor;
mod layout;
mod live;
mod registry;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use bpaf::Bpaf;
use tracing::{error, info};

use base::clock::RealClocks;
use config::Config;
use live::LiveSurface;
use registry::{Registry, ServerContext};

#[derive(Clone, Debug, Bpaf)]
#[bpaf(options)]
struct Args {
    /// Path to server.ini.
    #[bpaf(long, short, argument("PATH"), fallback(PathBuf::from("conf/server.ini")))]
    config: PathBuf,
}

fn main() {
    let args = args().run();
    let cfg = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load {}: {e:#}", args.config.display());
            std::process::exit(1);
        }
    };

    base::tracing_setup::install(cfg.debug_mode);

    if let Err(e) = run(cfg) {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

fn run(cfg: Config) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let shutdown_tx = Arc::new(parking_lot::Mutex::new(Some(shutdown_tx)));
    {
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            info!("received interrupt; shutting down");
            shutdown_tx.lock().take();
        })?;
    }

    let clocks: Arc<dyn base::clock::Clocks> = Arc::new(RealClocks);
    let live = LiveSurface::new();
    let scheduler = encode::Scheduler::new();
    let concatenator = concat::Concatenator::new(cfg.concat_amount);
    let registry = Registry::new();

    std::fs::create_dir_all(cfg.storage_path.join("cams"))?;
    janitor::startup_scan(&cfg.storage_path, &scheduler, &cfg.ffmpeg_output_file_options);

    let concat_hook: Arc<dyn encode::ConcatHook> = concatenator.clone();
    let still_running = {
        let rx = shutdown_rx.clone();
        Arc::new(move || !rx.is_shutdown()) as Arc<dyn Fn() -> bool + Send + Sync>
    };
    let worker_handles = scheduler.start(cfg.consecutive_ffmpeg_threads, concat_hook, still_running.clone());

    let listener = TcpListener::bind((cfg.server_ip, cfg.server_port))?;
    info!(addr = %listener.local_addr()?, "listening");

    let ctx = ServerContext {
        root: cfg.storage_path.clone(),
        default_height: cfg.default_height,
        default_width: cfg.default_width,
        output_opts: cfg.ffmpeg_output_file_options.clone(),
        output_ext: cfg.output_file_extension.clone(),
        live: live.clone(),
        scheduler: scheduler.clone(),
        clocks: clocks.clone(),
    };

    let disk_monitor = {
        let root = cfg.storage_path.clone();
        let threshold = cfg.free_storage_amount_before_deleting;
        let still_running = still_running.clone();
        std::thread::Builder::new()
            .name("disk-monitor".to_string())
            .spawn(move || janitor::run_disk_monitor(&root, threshold, move || still_running()))
            .expect("spawning disk monitor")
    };

    let cut_clock = cfg.video_cut_time.map(|cut_time| {
        let period = std::time::Duration::from_secs(cut_time.seconds_since_midnight() as u64);
        let registry = registry.clone();
        let clocks = clocks.clone();
        let still_running = still_running.clone();
        std::thread::Builder::new()
            .name("cut-clock".to_string())
            .spawn(move || clock_sched::run_cut_clock(period, registry, clocks, move || still_running()))
            .expect("spawning cut clock")
    });

    let stopping_point = cfg.client_stopping_point.map(|target| {
        let registry = registry.clone();
        let scheduler = scheduler.clone();
        let concatenator = concatenator.clone();
        let root = cfg.storage_path.clone();
        let clocks = clocks.clone();
        let still_running = still_running.clone();
        std::thread::Builder::new()
            .name("stopping-point".to_string())
            .spawn(move || {
                clock_sched::run_client_stopping_point(
                    target,
                    registry,
                    scheduler,
                    concatenator,
                    root,
                    clocks,
                    |clocks| {
                        let now = clocks.now();
                        let dt: jiff::Zoned = jiff::Timestamp::try_from(now)
                            .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
                            .to_zoned(jiff::tz::TimeZone::system());
                        let t = dt.time();
                        config::TimeOfDay {
                            hour: t.hour() as u8,
                            minute: t.minute() as u8,
                            second: t.second() as u8,
                        }
                    },
                    move || still_running(),
                )
            })
            .expect("spawning client-stopping-point scheduler")
    });

    registry::accept_loop(listener, registry.clone(), ctx, shutdown_rx.clone());

    shutdown_tx.lock().take();
    for h in worker_handles {
        let _ = h.join();
    }
    let _ = disk_monitor.join();
    if let Some(h) = cut_clock {
        let _ = h.join();
    }
    if let Some(h) = stopping_point {
        let _ = h.join();
    }

    Ok(())
}
