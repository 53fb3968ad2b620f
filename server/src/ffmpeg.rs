//! Subprocess helpers shared by the encoding scheduler, concatenation, and
//! janitor: spawning the encoder and probing a finished file's duration.
//! Neither the encoder nor the prober is implemented here — both are
//! external collaborators invoked by argument vector, per spec.md §1.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Name of the encoder binary. Configurable via `VIGIL_FFMPEG_BIN`
/// (defaults to `ffmpeg` on `$PATH`) so tests and packagers can point at an
/// alternate build without patching the argument vector construction.
pub fn encoder_bin() -> String {
    std::env::var("VIGIL_FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string())
}

/// Name of the length-probe binary (`ffprobe` by default).
pub fn prober_bin() -> String {
    std::env::var("VIGIL_FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string())
}

/// Builds the encode command for one raw segment, per §4.6:
/// `encoder -y -f rawvideo -vcodec rawvideo -video_size WxH -pixel_format
/// bgr24 -framerate FPS -i <raw_path> <user-configured-output-opts>
/// <encoded_path>`.
pub fn encode_command(
    raw_path: &Path,
    width: u16,
    height: u16,
    fps: u16,
    output_opts: &str,
    encoded_path: &Path,
) -> Command {
    let mut cmd = Command::new(encoder_bin());
    cmd.arg("-y")
        .arg("-f")
        .arg("rawvideo")
        .arg("-vcodec")
        .arg("rawvideo")
        .arg("-video_size")
        .arg(format!("{width}x{height}"))
        .arg("-pixel_format")
        .arg("bgr24")
        .arg("-framerate")
        .arg(fps.to_string())
        .arg("-i")
        .arg(raw_path);
    for opt in output_opts.split_whitespace() {
        cmd.arg(opt);
    }
    cmd.arg(encoded_path);
    cmd
}

/// Builds the concat command for §4.7:
/// `encoder -f concat -safe 0 -i <manifest> -c copy <output>`.
pub fn concat_command(manifest: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(encoder_bin());
    cmd.arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(manifest)
        .arg("-c")
        .arg("copy")
        .arg(output);
    cmd
}

/// Runs `cmd` to completion, returning whether it exited 0.
pub fn run_to_completion(mut cmd: Command) -> Result<bool> {
    let status = cmd.status().context("spawning subprocess")?;
    Ok(status.success())
}

/// Probes `path`'s duration in whole seconds via the length-probe tool.
/// Used only to recover an end-time suffix for leftover unrenamed files.
pub fn probe_duration_secs(path: &Path) -> Result<u64> {
    let output = Command::new(prober_bin())
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .context("spawning probe subprocess")?;
    if !output.status.success() {
        bail!("probe exited with {}", output.status);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let secs: f64 = text.trim().parse().context("parsing probe output")?;
    Ok(secs.round() as u64)
}
