//! Server ingest writer (C5): the stream reader that assembles raw frames
//! off the wire and the segment writer that turns them into `.raw` files,
//! rotating at cut boundaries and on stream stop.

use std::io::Write as _;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::encode::{EncodeJob, Scheduler, PRIORITY_LIVE};
use crate::layout;
use crate::live::LiveSurface;

#[derive(Clone)]
pub struct IngestConfig {
    pub root: PathBuf,
    pub peer: String,
    pub width: u16,
    pub height: u16,
    pub fps: u16,
    pub output_opts: String,
    pub output_ext: String,
}

/// Spawns the stream reader and segment writer threads for one session.
/// Both exit once `running` is cleared: the reader on its next blocking
/// read attempt, the writer once the reader's channel closes.
pub fn spawn(
    stream_conn: TcpStream,
    cfg: IngestConfig,
    running: Arc<AtomicBool>,
    cut: Arc<AtomicBool>,
    live: LiveSurface,
    scheduler: Arc<Scheduler>,
    clocks: Arc<dyn base::clock::Clocks>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded::<Arc<[u8]>>(8);

    let reader_cfg = cfg.clone();
    let reader_running = running.clone();
    let reader = std::thread::Builder::new()
        .name(format!("ingest-reader-{}", cfg.peer))
        .spawn(move || stream_reader_loop(stream_conn, reader_cfg, reader_running, live, tx))
        .expect("spawning ingest reader thread");

    let writer = std::thread::Builder::new()
        .name(format!("ingest-writer-{}", cfg.peer))
        .spawn(move || segment_writer_loop(cfg, running, cut, scheduler, rx, clocks))
        .expect("spawning ingest writer thread");

    (reader, writer)
}

fn stream_reader_loop(
    mut stream_conn: TcpStream,
    cfg: IngestConfig,
    running: Arc<AtomicBool>,
    live: LiveSurface,
    tx: crossbeam_channel::Sender<Arc<[u8]>>,
) {
    let frame_len = proto::frame_len(cfg.height, cfg.width);
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        let mut buf = vec![0u8; frame_len];
        let still_running = || running.load(Ordering::SeqCst);
        match proto::read_frame(&mut stream_conn, &mut buf, still_running) {
            Ok(true) => {
                let bytes: Arc<[u8]> = Arc::from(buf);
                live.publish(&cfg.peer, bytes.clone(), cfg.height, cfg.width);
                if tx.send(bytes).is_err() {
                    return;
                }
            }
            Ok(false) => return,
            Err(e) => {
                warn!(peer = %cfg.peer, error = %e, "stream connection closed or errored");
                return;
            }
        }
    }
}

/// Outcome of the writer's inner per-segment loop: whether it ended at a
/// cut boundary (start a new segment) or because the stream itself ended.
enum SegmentEnd {
    Cut,
    StreamEnded,
}

fn segment_writer_loop(
    cfg: IngestConfig,
    running: Arc<AtomicBool>,
    cut: Arc<AtomicBool>,
    scheduler: Arc<Scheduler>,
    rx: crossbeam_channel::Receiver<Arc<[u8]>>,
    clocks: Arc<dyn base::clock::Clocks>,
) {
    loop {
        match write_one_segment(&cfg, &cut, &scheduler, &rx, &clocks) {
            Some(SegmentEnd::Cut) => {
                cut.store(false, Ordering::SeqCst);
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
            Some(SegmentEnd::StreamEnded) | None => return,
        }
    }
}

fn local_time(clocks: &dyn base::clock::Clocks) -> jiff::civil::DateTime {
    jiff::Timestamp::try_from(clocks.now())
        .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
        .to_zoned(jiff::tz::TimeZone::system())
        .datetime()
}

fn write_one_segment(
    cfg: &IngestConfig,
    cut: &Arc<AtomicBool>,
    scheduler: &Arc<Scheduler>,
    rx: &crossbeam_channel::Receiver<Arc<[u8]>>,
    clocks: &Arc<dyn base::clock::Clocks>,
) -> Option<SegmentEnd> {
    let start_dt = local_time(&**clocks);
    let dir = layout::day_dir(&cfg.root, &cfg.peer, start_dt.date());
    if let Err(e) = std::fs::create_dir_all(&dir) {
        error!(peer = %cfg.peer, error = %e, "failed to create segment directory");
        return None;
    }

    let path = layout::open_segment_path(&dir, start_dt.time());
    let mut file = match std::fs::File::create(&path) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to create segment file");
            return None;
        }
    };
    if let Err(e) = layout::write_meta(
        &path,
        layout::SegmentMeta {
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
        },
    ) {
        error!(path = %path.display(), error = %e, "failed to write segment metadata");
    }

    let end = loop {
        if cut.swap(false, Ordering::SeqCst) {
            break SegmentEnd::Cut;
        }
        match rx.recv_timeout(std::time::Duration::from_millis(250)) {
            Ok(frame) => {
                if let Err(e) = file.write_all(&frame) {
                    error!(path = %path.display(), error = %e, "failed to write frame to segment");
                    return None;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break SegmentEnd::StreamEnded,
        }
    };

    let end_dt = local_time(&**clocks);
    let closed_path = layout::closed_segment_path(&dir, start_dt.time(), end_dt.time());
    if let Err(e) = std::fs::rename(&path, &closed_path) {
        error!(path = %path.display(), error = %e, "failed to close segment");
        return None;
    }

    let encoded_path = closed_path.with_extension(cfg.output_ext.trim_start_matches('.'));
    scheduler.enqueue(
        PRIORITY_LIVE,
        EncodeJob {
            raw_path: closed_path,
            encoded_path,
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
            output_opts: cfg.output_opts.clone(),
        },
    );
    info!(peer = %cfg.peer, "closed segment and enqueued for encoding");

    Some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;

    #[test]
    fn single_segment_on_stream_end() {
        let root = tempfile::tempdir().unwrap();
        let cfg = IngestConfig {
            root: root.path().to_path_buf(),
            peer: "1.2.3.4".to_string(),
            width: 2,
            height: 1,
            fps: 1,
            output_opts: String::new(),
            output_ext: ".mp4".to_string(),
        };
        let cut = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(Arc::from(vec![1u8, 2, 3, 4, 5, 6])).unwrap();
        drop(tx);
        let clocks: Arc<dyn base::clock::Clocks> =
            Arc::new(SimulatedClocks::new(std::time::SystemTime::UNIX_EPOCH));

        let end = write_one_segment(&cfg, &cut, &scheduler, &rx, &clocks);
        assert!(matches!(end, Some(SegmentEnd::StreamEnded)));
        assert_eq!(scheduler.queue_len(), 1);

        let day_dir = layout::day_dir(&cfg.root, &cfg.peer, jiff::civil::date(1970, 1, 1));
        let entries: Vec<_> = std::fs::read_dir(&day_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn cut_flag_ends_segment_without_closing_stream() {
        let root = tempfile::tempdir().unwrap();
        let cfg = IngestConfig {
            root: root.path().to_path_buf(),
            peer: "1.2.3.4".to_string(),
            width: 1,
            height: 1,
            fps: 1,
            output_opts: String::new(),
            output_ext: ".mp4".to_string(),
        };
        let cut = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new();
        let (_tx, rx) = crossbeam_channel::bounded::<Arc<[u8]>>(1);
        let clocks: Arc<dyn base::clock::Clocks> =
            Arc::new(SimulatedClocks::new(std::time::SystemTime::UNIX_EPOCH));

        let end = write_one_segment(&cfg, &cut, &scheduler, &rx, &clocks);
        assert!(matches!(end, Some(SegmentEnd::Cut)));
        assert!(!cut.load(Ordering::SeqCst), "the swap that detected the cut already cleared it");
    }
}
