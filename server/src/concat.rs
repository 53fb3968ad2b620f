//! Segment concatenation (C7): a per-directory manifest of completed
//! encoded segments that triggers a concat run once it reaches
//! `ConcatAmount` entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::encode::ConcatHook;
use crate::ffmpeg;
use crate::layout::CONCAT_MANIFEST_NAME;

/// Guards manifest append/evaluate per directory so only one thread appends
/// to or runs a concat on a given manifest at a time (spec.md §5).
pub struct Concatenator {
    amount: u32,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Concatenator {
    pub fn new(amount: u32) -> Arc<Concatenator> {
        Arc::new(Concatenator {
            amount,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Appends `encoded_path` to `dir`'s manifest; if that brings the
    /// manifest to exactly `amount` entries, runs the concat immediately.
    pub fn append_and_maybe_run(&self, dir: &Path, encoded_path: &Path) {
        let lock = self.dir_lock(dir);
        let _guard = lock.lock();

        let manifest_path = dir.join(CONCAT_MANIFEST_NAME);
        if let Err(e) = append_line(&manifest_path, encoded_path) {
            error!(path = %manifest_path.display(), error = %e, "failed to append to concat manifest");
            return;
        }

        let entries = match read_manifest(&manifest_path) {
            Ok(e) => e,
            Err(e) => {
                error!(path = %manifest_path.display(), error = %e, "failed to read concat manifest");
                return;
            }
        };

        if entries.len() != self.amount as usize {
            return;
        }

        self.run_concat(&manifest_path, &entries);
    }

    /// Forces a concat run on whatever a directory's manifest currently
    /// holds, even if it hasn't reached `amount` entries. Used by the clock
    /// scheduler at `ClientStoppingPoint` to clear trailing partial concats
    /// before considering the stop complete.
    pub fn flush(&self, manifest_path: &Path) {
        let lock = self.dir_lock(manifest_path.parent().unwrap_or(Path::new(".")));
        let _guard = lock.lock();
        let entries = match read_manifest(manifest_path) {
            Ok(e) if !e.is_empty() => e,
            Ok(_) => return,
            Err(e) => {
                error!(path = %manifest_path.display(), error = %e, "failed to read concat manifest during flush");
                return;
            }
        };
        self.run_concat(manifest_path, &entries);
    }

    fn run_concat(&self, manifest_path: &Path, entries: &[PathBuf]) {
        let mut sorted = entries.to_vec();
        sorted.sort();

        let output = match output_name(&sorted) {
            Some(p) => p,
            None => {
                error!(manifest = %manifest_path.display(), "could not derive concat output name");
                return;
            }
        };

        let cmd = ffmpeg::concat_command(manifest_path, &output);
        match ffmpeg::run_to_completion(cmd) {
            Ok(true) => {
                if let Err(e) = std::fs::remove_file(manifest_path) {
                    error!(path = %manifest_path.display(), error = %e, "failed to delete concat manifest");
                }
                for entry in &sorted {
                    if let Err(e) = std::fs::remove_file(entry) {
                        error!(path = %entry.display(), error = %e, "failed to delete concatenated input");
                    }
                }
                info!(output = %output.display(), "concatenated segments");
            }
            Ok(false) => {
                error!(manifest = %manifest_path.display(), "concat exited non-zero; leaving inputs and manifest in place");
            }
            Err(e) => {
                error!(manifest = %manifest_path.display(), error = %e, "failed to spawn concat subprocess");
            }
        }
    }
}

impl ConcatHook for Concatenator {
    fn on_encoded(&self, dir: &Path, encoded_path: &Path) {
        if self.amount <= 1 {
            // ConcatAmount=1 is a no-op pass-through: nothing to wait for,
            // and re-running ffmpeg on a single input just to copy it adds
            // no value, so skip the manifest machinery entirely.
            return;
        }
        self.append_and_maybe_run(dir, encoded_path);
    }
}

fn append_line(manifest_path: &Path, encoded_path: &Path) -> std::io::Result<()> {
    use std::io::Write as _;
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manifest_path)?;
    writeln!(f, "file '{}'", encoded_path.display())
}

fn read_manifest(manifest_path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let text = std::fs::read_to_string(manifest_path)?;
    Ok(text
        .lines()
        .filter_map(|line| {
            line.strip_prefix("file '")
                .and_then(|rest| rest.strip_suffix('\''))
                .map(PathBuf::from)
        })
        .collect())
}

/// Derives the concat output filename from the sorted manifest: the first
/// entry's leading (start-time) prefix, with its trailing dash-separated
/// field substituted for the last entry's trailing field. E.g.
/// `01_00_00-01_05_00.mp4` + `...-01_20_00.mp4` -> `01_00_00-01_20_00.mp4`.
fn output_name(sorted: &[PathBuf]) -> Option<PathBuf> {
    let first = sorted.first()?;
    let last = sorted.last()?;
    let dir = first.parent()?;
    let ext = first.extension()?.to_str()?;
    let first_stem = first.file_stem()?.to_str()?;
    let last_stem = last.file_stem()?.to_str()?;

    let prefix = first_stem.rsplit_once('-').map(|(p, _)| p)?;
    let last_suffix = last_stem.rsplit_once('-').map(|(_, s)| s).unwrap_or(last_stem);

    Some(dir.join(format!("{prefix}-{last_suffix}.{ext}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_substitutes_trailing_field() {
        let entries = vec![
            PathBuf::from("/x/01_00_00-01_05_00.mp4"),
            PathBuf::from("/x/01_05_00-01_10_00.mp4"),
            PathBuf::from("/x/01_10_00-01_20_00.mp4"),
        ];
        assert_eq!(
            output_name(&entries).unwrap(),
            PathBuf::from("/x/01_00_00-01_20_00.mp4")
        );
    }

    #[test]
    fn manifest_append_and_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join(CONCAT_MANIFEST_NAME);
        append_line(&manifest, Path::new("/a/b.mp4")).unwrap();
        append_line(&manifest, Path::new("/a/c.mp4")).unwrap();
        assert_eq!(
            read_manifest(&manifest).unwrap(),
            vec![PathBuf::from("/a/b.mp4"), PathBuf::from("/a/c.mp4")]
        );
    }

    #[test]
    fn concat_amount_one_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let concatenator = Concatenator::new(1);
        concatenator.on_encoded(dir.path(), &dir.path().join("a.mp4"));
        assert!(!dir.path().join(CONCAT_MANIFEST_NAME).exists());
    }
}
