//! Client Capture Pipeline (C2): device reader, record-timer ticker, and
//! annotator, cooperating over bounded channels per spec.md §4.2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use image::{imageops, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::device::{CaptureDevice, Opener};

/// Record timer stops advancing once it would overflow this, per spec.md
/// §4.2 ("capped at `99:23:59:59`, after which the ticker exits").
const RECORD_TIMER_CAP_SECS: u64 = 99 * 86400 + 23 * 3600 + 59 * 60 + 59;

pub struct CaptureConfig {
    pub device_index: u32,
    pub target_height: u32,
    pub target_width: u32,
}

/// Bytes of one annotated frame: row-major, three channels per pixel,
/// matching the wire format read by the server's stream connection.
pub type AnnotatedFrame = Arc<[u8]>;

/// Starts the three cooperating workers and returns the channel annotated
/// frames arrive on plus their join handles. `running` flipping to `false`
/// drains and stops all three; `Stop()` in spec.md terms is just dropping
/// the running flag and joining these handles.
pub fn start(
    opener: Arc<dyn Opener>,
    cfg: CaptureConfig,
    running: Arc<AtomicBool>,
    clocks: Arc<dyn base::clock::Clocks>,
) -> anyhow::Result<(crossbeam_channel::Receiver<AnnotatedFrame>, Vec<JoinHandle<()>>)> {
    let device = opener.open(cfg.device_index)?;

    let (raw_tx, raw_rx) = crossbeam_channel::bounded::<RgbImage>(4);
    let (out_tx, out_rx) = crossbeam_channel::bounded::<AnnotatedFrame>(4);
    let record_timer = Arc::new(Mutex::new(String::from("00:00:00:00")));

    let reader = {
        let running = running.clone();
        let target = (cfg.target_width, cfg.target_height);
        std::thread::Builder::new()
            .name("capture-device-reader".to_string())
            .spawn(move || device_reader_loop(device, target, running, raw_tx))
            .expect("spawning device reader thread")
    };

    let ticker = {
        let running = running.clone();
        let record_timer = record_timer.clone();
        let clocks = clocks.clone();
        std::thread::Builder::new()
            .name("capture-record-timer".to_string())
            .spawn(move || record_timer_loop(running, clocks, record_timer))
            .expect("spawning record timer thread")
    };

    let annotator = {
        let running = running.clone();
        std::thread::Builder::new()
            .name("capture-annotator".to_string())
            .spawn(move || annotator_loop(raw_rx, out_tx, record_timer, running, clocks))
            .expect("spawning annotator thread")
    };

    Ok((out_rx, vec![reader, ticker, annotator]))
}

/// Error policy per spec.md §4.2: a read failure produces a frame of
/// indeterminate content but the pipeline continues.
fn device_reader_loop(
    mut device: Box<dyn CaptureDevice>,
    target: (u32, u32),
    running: Arc<AtomicBool>,
    tx: crossbeam_channel::Sender<RgbImage>,
) {
    let (target_width, target_height) = target;
    while running.load(Ordering::SeqCst) {
        let frame = match device.read() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "capture device read failed; substituting blank frame");
                RgbImage::from_pixel(target_width.max(1), target_height.max(1), image::Rgb([0, 0, 0]))
            }
        };
        let mirrored = imageops::flip_horizontal(&frame);
        let resized = if (mirrored.width(), mirrored.height()) == (target_width, target_height) {
            mirrored
        } else {
            imageops::resize(
                &mirrored,
                target_width,
                target_height,
                imageops::FilterType::Triangle,
            )
        };
        if tx.send(resized).is_err() {
            return;
        }
    }
}

fn record_timer_loop(
    running: Arc<AtomicBool>,
    clocks: Arc<dyn base::clock::Clocks>,
    record_timer: Arc<Mutex<String>>,
) {
    let started = clocks.now();
    while running.load(Ordering::SeqCst) {
        clocks.sleep(Duration::from_secs(1));
        let elapsed = clocks
            .now()
            .duration_since(started)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        if elapsed > RECORD_TIMER_CAP_SECS {
            info!("record timer reached its cap; ticker exiting");
            return;
        }
        *record_timer.lock().unwrap() = format_record_timer(elapsed);
    }
}

fn format_record_timer(total_secs: u64) -> String {
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{days:02}:{hours:02}:{minutes:02}:{secs:02}")
}

/// Common Linux font install paths, tried in order. No font is bundled
/// with this crate; if none are found, frames still get the label
/// background bars but no glyphs.
const FONT_SEARCH_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
];

fn load_font() -> Option<rusttype::Font<'static>> {
    for path in FONT_SEARCH_PATHS {
        if let Ok(bytes) = std::fs::read(path) {
            if let Some(font) = rusttype::Font::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    None
}

fn annotator_loop(
    rx: crossbeam_channel::Receiver<RgbImage>,
    tx: crossbeam_channel::Sender<AnnotatedFrame>,
    record_timer: Arc<Mutex<String>>,
    running: Arc<AtomicBool>,
    clocks: Arc<dyn base::clock::Clocks>,
) {
    let font = load_font();
    if font.is_none() {
        warn!("no system font found; annotating with background bars only, no text");
    }

    while running.load(Ordering::SeqCst) {
        let frame = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(f) => f,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };
        let mut frame = frame;
        let now = clocks.now();
        let stamp = jiff::Timestamp::try_from(now)
            .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
            .to_zoned(jiff::tz::TimeZone::system())
            .strftime("%Y-%m-%d %H:%M:%S")
            .to_string();
        let elapsed_label = record_timer.lock().unwrap().clone();

        annotate(&mut frame, &stamp, &elapsed_label, font.as_ref());

        let bytes: AnnotatedFrame = Arc::from(frame.into_raw().into_boxed_slice());
        if tx.send(bytes).is_err() {
            return;
        }
    }
}

const BAR_HEIGHT: u32 = 16;
const BAR_WIDTH: u32 = 160;

fn annotate(frame: &mut RgbImage, wall_clock: &str, record_timer: &str, font: Option<&rusttype::Font<'static>>) {
    let (w, h) = (frame.width(), frame.height());
    let bar_w = BAR_WIDTH.min(w);

    draw_filled_rect_mut(
        frame,
        Rect::at(0, h.saturating_sub(BAR_HEIGHT) as i32).of_size(bar_w, BAR_HEIGHT.min(h)),
        image::Rgb([0, 0, 0]),
    );
    draw_filled_rect_mut(
        frame,
        Rect::at(w.saturating_sub(bar_w) as i32, h.saturating_sub(BAR_HEIGHT) as i32)
            .of_size(bar_w, BAR_HEIGHT.min(h)),
        image::Rgb([0, 0, 0]),
    );

    if let Some(font) = font {
        let scale = rusttype::Scale::uniform(12.0);
        let white = image::Rgb([255u8, 255, 255]);
        imageproc::drawing::draw_text_mut(
            frame,
            white,
            2,
            h.saturating_sub(BAR_HEIGHT) as i32 + 2,
            scale,
            font,
            wall_clock,
        );
        imageproc::drawing::draw_text_mut(
            frame,
            white,
            w.saturating_sub(bar_w) as i32 + 2,
            h.saturating_sub(BAR_HEIGHT) as i32 + 2,
            scale,
            font,
            record_timer,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyntheticOpener;
    use base::clock::SimulatedClocks;

    #[test]
    fn format_record_timer_matches_dd_hh_mm_ss() {
        assert_eq!(format_record_timer(0), "00:00:00:00");
        assert_eq!(format_record_timer(90061), "01:01:01:01");
    }

    #[test]
    fn record_timer_caps_and_ticker_exits() {
        // A simulated clock's sleep() advances time without blocking, so
        // this spins straight through to the cap and returns on its own,
        // without needing the running flag to be cleared.
        let running = Arc::new(AtomicBool::new(true));
        let clocks = Arc::new(SimulatedClocks::new(std::time::SystemTime::UNIX_EPOCH));
        let record_timer = Arc::new(Mutex::new(String::new()));
        record_timer_loop(running, clocks, record_timer);
    }

    #[test]
    fn pipeline_emits_frames_until_stopped() {
        let opener: Arc<dyn crate::device::Opener> = Arc::new(SyntheticOpener { width: 4, height: 4 });
        let cfg = CaptureConfig {
            device_index: 0,
            target_height: 4,
            target_width: 4,
        };
        let running = Arc::new(AtomicBool::new(true));
        let clocks: Arc<dyn base::clock::Clocks> = Arc::new(SimulatedClocks::new(std::time::SystemTime::UNIX_EPOCH));

        let (rx, handles) = start(opener, cfg, running.clone(), clocks).unwrap();
        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.len(), 4 * 4 * 3);

        running.store(false, Ordering::SeqCst);
        for h in handles {
            let _ = h.join();
        }
    }
}
