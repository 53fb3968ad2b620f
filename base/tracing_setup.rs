//! Logic for setting up a `tracing` subscriber according to our preferences.
//!
//! Simplified from the teacher's `base::tracing_setup`: the systemd and json
//! formats aren't needed here (there's no systemd unit or log-shipping
//! pipeline in scope), so only the human-readable format remains. The
//! default filter level is driven by each binary's `DebugMode` config flag
//! rather than an env var alone, mirroring the original Python's
//! `Logger.py`, which switches its root level between `INFO` and `DEBUG`
//! based on a config-file flag of the same name.

use tracing::error;
use tracing_subscriber::{
    fmt::{format::Writer, time::FormatTime},
    layer::SubscriberExt,
};

struct JiffTimer;

impl FormatTime for JiffTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = jiff::Zoned::now();
        write!(w, "{}", now.strftime("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

/// Custom panic hook that logs instead of writing directly to stderr, so a
/// panic in a worker thread shows up with the same timestamp and thread name
/// as the rest of the log.
fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(*s)
    } else if let Some(s) = p.payload().downcast_ref::<String>() {
        Some(s)
    } else {
        None
    };
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        "panic",
    );
}

/// Installs the global `tracing` subscriber.
///
/// `debug_mode` sets the default filter level (`debug` vs. `info`) when
/// `VIGIL_LOG` isn't set; `VIGIL_LOG` always wins when present, same as the
/// teacher's `MOONFIRE_LOG`.
pub fn install(debug_mode: bool) {
    let default_level = if debug_mode {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("VIGIL_LOG")
        .from_env_lossy();
    tracing_log::LogTracer::init().unwrap();

    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_timer(JiffTimer)
            .with_thread_names(true)
            .with_filter(filter),
    );
    tracing::subscriber::set_global_default(sub).unwrap();

    let use_panic_hook = std::env::var("VIGIL_PANIC_HOOK")
        .map(|s| s != "false" && s != "0")
        .unwrap_or(true);
    if use_panic_hook {
        std::panic::set_hook(Box::new(&panic_hook));
    }
}

pub fn install_for_tests() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
        .with_env_var("VIGIL_LOG")
        .from_env_lossy();
    let _ = tracing_log::LogTracer::init();
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_timer(JiffTimer)
            .with_thread_names(true)
            .with_filter(filter),
    );
    let _ = tracing::subscriber::set_global_default(sub);
}
