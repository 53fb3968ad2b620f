//! Janitor / reconciliation (C8): startup scan for leftover files and a
//! runtime disk-space monitor that evicts the oldest recording when free
//! space drops below the configured threshold.

use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::encode::{self, EncodeJob, Scheduler};
use crate::ffmpeg;
use crate::layout;

/// Ensures `<root>/cams/` and `<root>/cams/<peer>/` exist, and deletes any
/// `*.temp` manifest left over in the peer's directory from a previous run.
pub fn init_peer_dir(root: &Path, peer: &str) -> std::io::Result<()> {
    let dir = layout::peer_dir(root, peer);
    std::fs::create_dir_all(&dir)?;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if layout::is_temp(&path) {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Walks `<root>/cams/` at startup, enqueuing leftover raw segments for
/// encoding and renaming leftover encoded-but-unrenamed files.
pub fn startup_scan(root: &Path, scheduler: &Scheduler, output_opts: &str) {
    let cams_dir = root.join("cams");
    if !cams_dir.is_dir() {
        return;
    }
    for peer_entry in walk_dir(&cams_dir) {
        if !peer_entry.is_dir() {
            continue;
        }
        for day_entry in walk_dir(&peer_entry) {
            if !day_entry.is_dir() {
                continue;
            }
            scan_day_dir(&day_entry, scheduler, output_opts);
        }
    }
}

fn walk_dir(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to read directory during startup scan");
            Vec::new()
        }
    }
}

fn scan_day_dir(dir: &Path, scheduler: &Scheduler, output_opts: &str) {
    for path in walk_dir(dir) {
        if layout::is_temp(&path) {
            continue;
        }
        if path.extension().is_some_and(|e| e == "raw") {
            enqueue_leftover_raw(&path, scheduler, output_opts);
            continue;
        }
        let has_dash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.contains('-'));
        if !has_dash {
            rename_leftover_encoded(&path);
        }
    }
}

fn enqueue_leftover_raw(path: &Path, scheduler: &Scheduler, output_opts: &str) {
    let meta = match layout::read_meta(path) {
        Ok(m) => m,
        Err(e) => {
            error!(path = %path.display(), error = %e, "missing metadata on leftover raw file; skipping");
            return;
        }
    };
    let encoded_path = path.with_extension("mp4");
    scheduler.enqueue(
        encode::PRIORITY_RECOVERED,
        EncodeJob {
            raw_path: path.to_path_buf(),
            encoded_path,
            width: meta.width,
            height: meta.height,
            fps: meta.fps,
            output_opts: output_opts.to_string(),
        },
    );
    info!(path = %path.display(), "recovered leftover raw segment");
}

fn rename_leftover_encoded(path: &Path) {
    let result = ffmpeg::probe_duration_secs(path)
        .and_then(|secs| layout::rename_with_end_time(path, secs));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "probe or rename failed for leftover file; leaving unrenamed");
    }
}

/// Free bytes on the volume containing `path`, or `None` if unreadable —
/// treated by the caller as zero bytes free (spec.md §7g).
fn free_bytes(path: &Path) -> Option<u64> {
    use sysinfo::Disks;
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&Path, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let is_better = best.map(|(m, _)| mount.as_os_str().len() > m.as_os_str().len()).unwrap_or(true);
            if is_better {
                best = Some((mount, disk.available_space()));
            }
        }
    }
    best.map(|(_, bytes)| bytes)
}

/// Runs forever (until `still_running` returns false), checking free space
/// every 10 seconds and deleting the single oldest eligible file if the
/// volume has dropped below `threshold_bytes`.
pub fn run_disk_monitor(root: &Path, threshold_bytes: u64, still_running: impl Fn() -> bool) {
    while still_running() {
        std::thread::sleep(Duration::from_secs(10));
        if !still_running() {
            return;
        }
        let free = free_bytes(root).unwrap_or(0);
        if free >= threshold_bytes {
            continue;
        }
        if let Some(victim) = oldest_evictable_file(root) {
            match std::fs::remove_file(&victim) {
                Ok(()) => info!(path = %victim.display(), free, threshold_bytes, "evicted oldest recording for free space"),
                Err(e) => error!(path = %victim.display(), error = %e, "failed to evict file"),
            }
        }
    }
}

fn oldest_evictable_file(root: &Path) -> Option<std::path::PathBuf> {
    let cams_dir = root.join("cams");
    let mut oldest: Option<(std::path::PathBuf, std::time::SystemTime)> = None;
    for peer_dir in walk_dir(&cams_dir) {
        if !peer_dir.is_dir() {
            continue;
        }
        for day_dir in walk_dir(&peer_dir) {
            if !day_dir.is_dir() {
                continue;
            }
            for path in walk_dir(&day_dir) {
                if layout::is_temp(&path) || layout::is_open_raw(&path) {
                    continue;
                }
                let Ok(meta) = std::fs::metadata(&path) else {
                    continue;
                };
                let Ok(modified) = meta.modified() else {
                    continue;
                };
                if oldest.as_ref().is_none_or(|(_, t)| modified < *t) {
                    oldest = Some((path, modified));
                }
            }
        }
    }
    oldest.map(|(path, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_peer_dir_removes_stale_temp_files() {
        let root = tempfile::tempdir().unwrap();
        let peer_dir = layout::peer_dir(root.path(), "1.2.3.4");
        std::fs::create_dir_all(&peer_dir).unwrap();
        let stale = peer_dir.join("to_be_concat.temp");
        std::fs::write(&stale, b"file 'x'\n").unwrap();

        init_peer_dir(root.path(), "1.2.3.4").unwrap();

        assert!(!stale.exists());
        assert!(peer_dir.is_dir());
    }

    #[test]
    fn oldest_evictable_file_skips_open_raw_and_temp() {
        let root = tempfile::tempdir().unwrap();
        let day_dir = root.path().join("cams").join("1.2.3.4").join("2024-01-01");
        std::fs::create_dir_all(&day_dir).unwrap();
        std::fs::write(day_dir.join("01_00_00.raw"), b"open").unwrap();
        std::fs::write(day_dir.join("to_be_concat.temp"), b"manifest").unwrap();
        std::fs::write(day_dir.join("01_00_00-01_00_02.mp4"), b"encoded").unwrap();

        let victim = oldest_evictable_file(root.path()).unwrap();
        assert_eq!(victim.file_name().unwrap(), "01_00_00-01_00_02.mp4");
    }
}
