//! On-disk layout conventions (§6) and the per-raw-file width/height/fps
//! metadata that must be set before the first frame byte is written.
//!
//! Metadata is stored as extended file attributes where the filesystem
//! supports them, via the `xattr` crate; on filesystems that don't, a
//! sidecar `<path>.meta` file carries the same three 16-bit big-endian
//! fields concatenated, per spec.md's portability note.

use std::io;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const XATTR_WIDTH: &str = "user.width";
const XATTR_HEIGHT: &str = "user.height";
const XATTR_FPS: &str = "user.fps";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMeta {
    pub width: u16,
    pub height: u16,
    pub fps: u16,
}

fn sidecar_path(raw_path: &Path) -> PathBuf {
    let mut s = raw_path.as_os_str().to_owned();
    s.push(".meta");
    PathBuf::from(s)
}

/// Writes width/height/fps metadata for `raw_path`, which must already
/// exist. Tries extended attributes first; if the filesystem doesn't
/// support them, falls back to a sidecar file.
pub fn write_meta(raw_path: &Path, meta: SegmentMeta) -> io::Result<()> {
    match write_xattr_meta(raw_path, meta) {
        Ok(()) => Ok(()),
        Err(_) => write_sidecar_meta(raw_path, meta),
    }
}

fn write_xattr_meta(raw_path: &Path, meta: SegmentMeta) -> io::Result<()> {
    xattr::set(raw_path, XATTR_WIDTH, &meta.width.to_be_bytes())?;
    xattr::set(raw_path, XATTR_HEIGHT, &meta.height.to_be_bytes())?;
    xattr::set(raw_path, XATTR_FPS, &meta.fps.to_be_bytes())?;
    Ok(())
}

fn write_sidecar_meta(raw_path: &Path, meta: SegmentMeta) -> io::Result<()> {
    let mut buf = Vec::with_capacity(6);
    buf.write_u16::<BigEndian>(meta.width)?;
    buf.write_u16::<BigEndian>(meta.height)?;
    buf.write_u16::<BigEndian>(meta.fps)?;
    std::fs::write(sidecar_path(raw_path), buf)
}

/// Reads back metadata written by `write_meta`, trying xattrs then the
/// sidecar file.
pub fn read_meta(raw_path: &Path) -> io::Result<SegmentMeta> {
    if let Some(meta) = read_xattr_meta(raw_path)? {
        return Ok(meta);
    }
    read_sidecar_meta(raw_path)
}

fn read_xattr_meta(raw_path: &Path) -> io::Result<Option<SegmentMeta>> {
    let width = xattr::get(raw_path, XATTR_WIDTH)?;
    let height = xattr::get(raw_path, XATTR_HEIGHT)?;
    let fps = xattr::get(raw_path, XATTR_FPS)?;
    match (width, height, fps) {
        (Some(w), Some(h), Some(f)) if w.len() == 2 && h.len() == 2 && f.len() == 2 => {
            Ok(Some(SegmentMeta {
                width: u16::from_be_bytes([w[0], w[1]]),
                height: u16::from_be_bytes([h[0], h[1]]),
                fps: u16::from_be_bytes([f[0], f[1]]),
            }))
        }
        _ => Ok(None),
    }
}

fn read_sidecar_meta(raw_path: &Path) -> io::Result<SegmentMeta> {
    let bytes = std::fs::read(sidecar_path(raw_path))?;
    let mut c = io::Cursor::new(bytes);
    Ok(SegmentMeta {
        width: c.read_u16::<BigEndian>()?,
        height: c.read_u16::<BigEndian>()?,
        fps: c.read_u16::<BigEndian>()?,
    })
}

/// Removes a sidecar meta file if one exists; no-op otherwise. Called
/// alongside raw-file deletion so fallback-mode installs don't accumulate
/// stale `.meta` files.
pub fn remove_sidecar(raw_path: &Path) {
    let _ = std::fs::remove_file(sidecar_path(raw_path));
}

/// Directory holding one client's recordings for one calendar day:
/// `<root>/cams/<peer>/<YYYY-MM-DD>/`.
pub fn day_dir(root: &Path, peer: &str, day: jiff::civil::Date) -> PathBuf {
    root.join("cams").join(peer).join(day.strftime("%Y-%m-%d").to_string())
}

/// Path to a peer's directory, `<root>/cams/<peer>/`.
pub fn peer_dir(root: &Path, peer: &str) -> PathBuf {
    root.join("cams").join(peer)
}

/// Path to the open (in-progress) segment file for a start timestamp.
pub fn open_segment_path(dir: &Path, start: jiff::civil::Time) -> PathBuf {
    dir.join(format!("{}.raw", stamp(start)))
}

/// Path the open segment is renamed to on close.
pub fn closed_segment_path(dir: &Path, start: jiff::civil::Time, end: jiff::civil::Time) -> PathBuf {
    dir.join(format!("{}-{}.raw", stamp(start), stamp(end)))
}

fn stamp(t: jiff::civil::Time) -> String {
    t.strftime("%H_%M_%S").to_string()
}

/// Parses a `HH_MM_SS` stamp, the inverse of `stamp`. Used to recover a
/// leftover file's start time before appending a probed end-time suffix.
pub fn parse_stamp(s: &str) -> Option<jiff::civil::Time> {
    let mut parts = s.splitn(3, '_');
    let h: i8 = parts.next()?.parse().ok()?;
    let m: i8 = parts.next()?.parse().ok()?;
    let sec: i8 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    jiff::civil::Time::new(h, m, sec, 0).ok()
}

/// Renames `path` (whose base name has no `-`, i.e. was never closed via
/// the normal rename-on-cut rule) to `<stem>-<end>.ext`, where `end` is
/// `start + probed_secs`. Returns the new path.
pub fn rename_with_end_time(path: &Path, probed_secs: u64) -> anyhow::Result<PathBuf> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("non-UTF8 filename: {}", path.display()))?;
    let start = parse_stamp(stem)
        .ok_or_else(|| anyhow::anyhow!("filename {stem:?} isn't HH_MM_SS"))?;
    let end = start.wrapping_add(jiff::Span::new().seconds(probed_secs as i64));
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let new_name = format!("{stem}-{}.{ext}", end.strftime("%H_%M_%S"));
    let new_path = path.with_file_name(new_name);
    std::fs::rename(path, &new_path)?;
    Ok(new_path)
}

/// True for raw files still being written to: no `-` in the base name.
/// These must never be touched by the janitor's eviction pass.
pub fn is_open_raw(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "raw")
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| !s.contains('-'))
}

pub fn is_temp(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "temp")
}

pub fn is_closed_raw(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "raw")
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.contains('-'))
}

/// Manifest file name for a directory's concat queue.
pub const CONCAT_MANIFEST_NAME: &str = "to_be_concat.temp";

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::civil::time;

    #[test]
    fn open_and_closed_segment_names() {
        let dir = Path::new("/x");
        let open = open_segment_path(dir, time(1, 2, 3, 0));
        assert_eq!(open, Path::new("/x/01_02_03.raw"));
        let closed = closed_segment_path(dir, time(1, 2, 3, 0), time(1, 2, 5, 0));
        assert_eq!(closed, Path::new("/x/01_02_03-01_02_05.raw"));
    }

    #[test]
    fn open_raw_detection() {
        assert!(is_open_raw(Path::new("01_02_03.raw")));
        assert!(!is_open_raw(Path::new("01_02_03-01_02_05.raw")));
        assert!(!is_open_raw(Path::new("01_02_03-01_02_05.mp4")));
    }

    #[test]
    fn meta_round_trips_through_sidecar_when_xattrs_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("01_02_03.raw");
        std::fs::write(&raw, []).unwrap();
        // Force the sidecar path directly to exercise it regardless of
        // whether the test filesystem happens to support xattrs.
        let meta = SegmentMeta {
            width: 640,
            height: 480,
            fps: 30,
        };
        write_sidecar_meta(&raw, meta).unwrap();
        assert_eq!(read_sidecar_meta(&raw).unwrap(), meta);
    }
}
