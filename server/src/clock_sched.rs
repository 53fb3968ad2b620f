//! Scheduler/Clock (C10): the wall-clock cut boundary shared by every
//! active session, and the optional global `ClientStoppingPoint`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::concat::Concatenator;
use crate::config::TimeOfDay;
use crate::encode::Scheduler;
use crate::layout::CONCAT_MANIFEST_NAME;
use crate::registry::Registry;

/// Runs forever, raising every active session's cut flag every `period`.
/// A `period` of `None` (§4.5: `VideoCutTime` unset) means this is a no-op;
/// callers should simply not spawn the thread in that case.
pub fn run_cut_clock(
    period: Duration,
    registry: Registry,
    clocks: Arc<dyn base::clock::Clocks>,
    still_running: impl Fn() -> bool,
) {
    while still_running() {
        clocks.sleep(period);
        if !still_running() {
            return;
        }
        for session in registry.all_sessions() {
            session.request_cut();
        }
    }
}

/// Seconds from `now` until the next occurrence of `target` time-of-day.
/// A result of exactly zero is treated as "never" (spec.md §9: firing
/// precisely at `00:00:00` is undefined in the source, which skips past
/// midnight rather than scheduling immediately).
pub fn seconds_until_next(now: TimeOfDay, target: TimeOfDay) -> Option<u32> {
    const DAY: u32 = 24 * 3600;
    let now_s = now.seconds_since_midnight();
    let target_s = target.seconds_since_midnight();
    let delta = (target_s + DAY - now_s) % DAY;
    if delta == 0 {
        None
    } else {
        Some(delta)
    }
}

/// Runs once: sleeps until `target` next occurs, then broadcasts `q` to
/// every registered session, waits for every ingest pipeline to drain, and
/// finally flushes every directory's trailing concat manifest.
pub fn run_client_stopping_point(
    target: TimeOfDay,
    registry: Registry,
    scheduler: Arc<Scheduler>,
    concatenator: Arc<Concatenator>,
    root: std::path::PathBuf,
    clocks: Arc<dyn base::clock::Clocks>,
    now_time_of_day: impl Fn(&dyn base::clock::Clocks) -> TimeOfDay,
    still_running: impl Fn() -> bool,
) {
    loop {
        if !still_running() {
            return;
        }
        let now = now_time_of_day(&*clocks);
        let Some(delay_secs) = seconds_until_next(now, target) else {
            // Never fires; sleep a while and re-check in case the clock
            // implementation's notion of "now" only advances on sleep.
            clocks.sleep(Duration::from_secs(3600));
            continue;
        };
        clocks.sleep(Duration::from_secs(delay_secs as u64));
        if !still_running() {
            return;
        }
        break;
    }

    info!("ClientStoppingPoint reached; broadcasting shutdown to all clients");
    for session in registry.all_sessions() {
        if let Err(e) = session.send_shutdown() {
            tracing::warn!(peer = %session.peer, error = %e, "failed to send shutdown byte");
        }
    }

    while !registry.is_empty() {
        std::thread::sleep(Duration::from_millis(100));
    }

    scheduler.wait_until_idle();

    flush_all_manifests(&root, &concatenator);
}

fn flush_all_manifests(root: &std::path::Path, concatenator: &Concatenator) {
    let cams_dir = root.join("cams");
    let Ok(peers) = std::fs::read_dir(&cams_dir) else {
        return;
    };
    for peer in peers.filter_map(|e| e.ok()) {
        let Ok(days) = std::fs::read_dir(peer.path()) else {
            continue;
        };
        for day in days.filter_map(|e| e.ok()) {
            let manifest = day.path().join(CONCAT_MANIFEST_NAME);
            if manifest.exists() {
                concatenator.flush(&manifest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u8, m: u8, s: u8) -> TimeOfDay {
        TimeOfDay {
            hour: h,
            minute: m,
            second: s,
        }
    }

    #[test]
    fn seconds_until_next_same_day() {
        assert_eq!(seconds_until_next(t(10, 0, 0), t(12, 0, 0)), Some(7200));
    }

    #[test]
    fn seconds_until_next_wraps_past_midnight() {
        assert_eq!(seconds_until_next(t(23, 0, 0), t(1, 0, 0)), Some(7200));
    }

    #[test]
    fn exact_midnight_target_equal_to_now_is_never() {
        assert_eq!(seconds_until_next(t(0, 0, 0), t(0, 0, 0)), None);
    }
}
