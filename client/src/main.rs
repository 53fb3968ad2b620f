// This binary is the camera client: it captures frames from a local
// device, annotates them, and streams them to a vigil-server instance over
// the control/camera TCP connections. See component design in DESIGN.md.

mod capture;
mod config;
mod device;
mod streaming;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bpaf::Bpaf;
use tracing::{error, info};

use base::clock::RealClocks;
use config::Config;
use device::UnimplementedOpener;
use streaming::ClientConfig;

#[derive(Clone, Debug, Bpaf)]
#[bpaf(options)]
struct Args {
    /// Path to client.ini.
    #[bpaf(long, short, argument("PATH"), fallback(PathBuf::from("conf/client.ini")))]
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
        error!(error = %e, "client exited with error");
        std::process::exit(1);
    }
}

fn run(cfg: Config) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("received interrupt; shutting down");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let clocks: Arc<dyn base::clock::Clocks> = Arc::new(RealClocks);
    let opener: Arc<dyn device::Opener> = Arc::new(UnimplementedOpener);

    let client_cfg = ClientConfig {
        server_ip: cfg.server_ip,
        server_port: cfg.server_port,
        wait_after_frame: std::time::Duration::from_secs_f64(cfg.wait_after_frame),
        retry_after_server_crash: (cfg.retry_after_server_crash > 0)
            .then(|| std::time::Duration::from_secs(cfg.retry_after_server_crash)),
        use_custom_resolution: cfg.use_custom_resolution,
        custom_frame_height: cfg.custom_frame_height,
        custom_frame_width: cfg.custom_frame_width,
        capture_device: cfg.capture_device,
    };

    streaming::run(client_cfg, opener, running, clocks)
}
