//! Encoding scheduler (C6): a priority queue of pending encode jobs drained
//! by a fixed-size worker pool, plus the rename/cleanup policy that runs
//! after each encoder subprocess exits.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::ffmpeg;
use crate::layout;

/// Startup-recovered leftover raw files drain ahead of freshly produced
/// segments (spec.md §3).
pub const PRIORITY_RECOVERED: i32 = 2;
pub const PRIORITY_LIVE: i32 = 3;

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub raw_path: PathBuf,
    pub encoded_path: PathBuf,
    pub width: u16,
    pub height: u16,
    pub fps: u16,
    pub output_opts: String,
}

struct QueueEntry {
    priority: i32,
    seq: u64,
    job: EncodeJob,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Reversed so a `BinaryHeap` (a max-heap) pops the lowest priority
    /// number first, and FIFO among equal priorities (earliest `seq` first).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Called after a job's encoded output is finalized (renamed, if needed)
/// and its priority was `PRIORITY_LIVE`, so segment concatenation can
/// consider appending it to the directory's manifest.
pub trait ConcatHook: Send + Sync {
    fn on_encoded(&self, dir: &Path, encoded_path: &Path);
}

pub struct Scheduler {
    queue: Mutex<std::collections::BinaryHeap<QueueEntry>>,
    not_empty: Condvar,
    seq: AtomicU64,
    active: AtomicUsize,
    idle: Condvar,
    idle_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            queue: Mutex::new(std::collections::BinaryHeap::new()),
            not_empty: Condvar::new(),
            seq: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
        })
    }

    pub fn enqueue(&self, priority: i32, job: EncodeJob) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let mut q = self.queue.lock();
        q.push(QueueEntry { priority, seq, job });
        self.not_empty.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True once the queue is empty and no worker is mid-job. Used by the
    /// clock scheduler (C10) before running trailing concats at shutdown.
    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty() && self.active.load(AtomicOrdering::SeqCst) == 0
    }

    pub fn wait_until_idle(&self) {
        let mut guard = self.idle_lock.lock();
        while !self.is_idle() {
            self.idle.wait(&mut guard);
        }
    }

    fn pop_blocking(&self, still_running: &dyn Fn() -> bool) -> Option<(i32, EncodeJob)> {
        let mut q = self.queue.lock();
        loop {
            if let Some(entry) = q.pop() {
                self.active.fetch_add(1, AtomicOrdering::SeqCst);
                return Some((entry.priority, entry.job));
            }
            if !still_running() {
                return None;
            }
            self.not_empty
                .wait_for(&mut q, std::time::Duration::from_millis(500));
        }
    }

    fn job_finished(&self) {
        self.active.fetch_sub(1, AtomicOrdering::SeqCst);
        if self.is_idle() {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    /// Spawns `threads` worker threads (`ConsecutiveFFMPEGThreads` from
    /// config); each runs until `still_running` returns false and the queue
    /// is drained.
    pub fn start(
        self: &Arc<Self>,
        threads: u32,
        concat_hook: Arc<dyn ConcatHook>,
        still_running: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Vec<JoinHandle<()>> {
        (0..threads)
            .map(|i| {
                let scheduler = self.clone();
                let concat_hook = concat_hook.clone();
                let still_running = still_running.clone();
                std::thread::Builder::new()
                    .name(format!("encode-worker-{i}"))
                    .spawn(move || scheduler.worker_loop(&*still_running, &*concat_hook))
                    .expect("spawning encode worker")
            })
            .collect()
    }

    fn worker_loop(&self, still_running: &dyn Fn() -> bool, concat_hook: &dyn ConcatHook) {
        loop {
            let Some((priority, job)) = self.pop_blocking(still_running) else {
                return;
            };
            run_job(priority, &job, concat_hook);
            self.job_finished();
        }
    }
}

fn run_job(priority: i32, job: &EncodeJob, concat_hook: &dyn ConcatHook) {
    let cmd = ffmpeg::encode_command(
        &job.raw_path,
        job.width,
        job.height,
        job.fps,
        &job.output_opts,
        &job.encoded_path,
    );
    let ok = match ffmpeg::run_to_completion(cmd) {
        Ok(ok) => ok,
        Err(e) => {
            error!(path = %job.raw_path.display(), error = %e, "failed to spawn encoder");
            return;
        }
    };
    if !ok {
        error!(path = %job.raw_path.display(), "encoder exited non-zero; leaving input and output in place");
        return;
    }

    if let Err(e) = std::fs::remove_file(&job.raw_path) {
        warn!(path = %job.raw_path.display(), error = %e, "failed to delete encoded raw input");
    }
    layout::remove_sidecar(&job.raw_path);

    let final_path = if filename_has_dash(&job.encoded_path) {
        job.encoded_path.clone()
    } else {
        match ffmpeg::probe_duration_secs(&job.encoded_path)
            .and_then(|secs| layout::rename_with_end_time(&job.encoded_path, secs))
        {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %job.encoded_path.display(), error = %e, "probe failed; leaving unrenamed");
                job.encoded_path.clone()
            }
        }
    };

    if priority == PRIORITY_LIVE {
        if let Some(dir) = final_path.parent() {
            concat_hook.on_encoded(dir, &final_path);
        }
    }

    info!(path = %final_path.display(), "encoded segment");
}

fn filename_has_dash(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.contains('-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct NoopHook;
    impl ConcatHook for NoopHook {
        fn on_encoded(&self, _dir: &Path, _encoded_path: &Path) {}
    }

    #[test]
    fn recovered_jobs_pop_before_live_jobs_enqueued_after() {
        let scheduler = Scheduler::new();
        scheduler.enqueue(
            PRIORITY_LIVE,
            EncodeJob {
                raw_path: "a.raw".into(),
                encoded_path: "a.mp4".into(),
                width: 1,
                height: 1,
                fps: 1,
                output_opts: String::new(),
            },
        );
        scheduler.enqueue(
            PRIORITY_RECOVERED,
            EncodeJob {
                raw_path: "b.raw".into(),
                encoded_path: "b.mp4".into(),
                width: 1,
                height: 1,
                fps: 1,
                output_opts: String::new(),
            },
        );
        let still_running: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| true);
        let (priority, job) = scheduler.pop_blocking(&*still_running).unwrap();
        assert_eq!(priority, PRIORITY_RECOVERED);
        assert_eq!(job.raw_path, PathBuf::from("b.raw"));
    }

    #[test]
    fn equal_priority_is_fifo() {
        let scheduler = Scheduler::new();
        for name in ["a", "b", "c"] {
            scheduler.enqueue(
                PRIORITY_LIVE,
                EncodeJob {
                    raw_path: format!("{name}.raw").into(),
                    encoded_path: format!("{name}.mp4").into(),
                    width: 1,
                    height: 1,
                    fps: 1,
                    output_opts: String::new(),
                },
            );
        }
        let still_running: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| true);
        let first = scheduler.pop_blocking(&*still_running).unwrap().1;
        assert_eq!(first.raw_path, PathBuf::from("a.raw"));
    }

    #[test]
    fn idle_when_queue_empty_and_nothing_active() {
        let scheduler = Scheduler::new();
        assert!(scheduler.is_idle());
        scheduler.enqueue(
            PRIORITY_LIVE,
            EncodeJob {
                raw_path: "a.raw".into(),
                encoded_path: "a.mp4".into(),
                width: 1,
                height: 1,
                fps: 1,
                output_opts: String::new(),
            },
        );
        assert!(!scheduler.is_idle());
        let still_running: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| true);
        let _ = scheduler.pop_blocking(&*still_running).unwrap();
        assert!(!scheduler.is_idle(), "popped job is active until job_finished");
        scheduler.job_finished();
        assert!(scheduler.is_idle());
    }

    #[test]
    fn pop_blocking_returns_none_once_stopped() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicBool::new(false));
        let r2 = running.clone();
        let still_running: Arc<dyn Fn() -> bool + Send + Sync> =
            Arc::new(move || r2.load(AtomicOrdering::SeqCst));
        assert!(scheduler.pop_blocking(&*still_running).is_none());
    }

    #[test]
    fn unrenamed_filename_detection() {
        assert!(!filename_has_dash(Path::new("01_02_03.mp4")));
        assert!(filename_has_dash(Path::new("01_02_03-01_02_05.mp4")));
    }
}
