//! Capture device abstraction. The actual device driver is an external
//! collaborator (spec.md §1 Non-goals); this module only defines the trait
//! boundary, grounded on the teacher's `server/src/stream.rs` `Opener`/
//! `Stream` test-injection pattern, plus a synthetic device for tests.

use anyhow::Result;
use image::RgbImage;

/// One open capture device. `read` blocks until a frame is available.
pub trait CaptureDevice: Send {
    fn read(&mut self) -> Result<RgbImage>;

    /// The device's reported capture rate, queried once at startup the same
    /// way `original_source/src/client/Capture.py`'s `__get_camera_fps`
    /// reads `cv2.CAP_PROP_FPS` before any frames are captured.
    fn fps(&self) -> u8;
}

/// Opens a `CaptureDevice` by index. A trait so tests can inject a
/// synthetic device instead of a real one.
pub trait Opener: Send + Sync {
    fn open(&self, device_index: u32) -> Result<Box<dyn CaptureDevice>>;
}

/// The real device driver is out of scope for this crate (spec.md §1): it
/// names only the interface the capture pipeline needs. Wire up a
/// platform-specific `Opener` (e.g. over V4L2 or a vendor SDK) at the
/// deployment site instead of using this one.
pub struct UnimplementedOpener;

impl Opener for UnimplementedOpener {
    fn open(&self, device_index: u32) -> Result<Box<dyn CaptureDevice>> {
        anyhow::bail!(
            "no capture device driver is linked in; device {device_index} cannot be opened \
             (inject a platform-specific Opener)"
        )
    }
}

/// Deterministic synthetic frames for tests: a solid color that advances
/// each call, so pipeline tests can assert distinct frames flow through
/// without a real camera.
pub struct SyntheticDevice {
    width: u32,
    height: u32,
    counter: u8,
}

impl SyntheticDevice {
    pub fn new(width: u32, height: u32) -> Self {
        SyntheticDevice {
            width,
            height,
            counter: 0,
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> Result<RgbImage> {
        let shade = self.counter;
        self.counter = self.counter.wrapping_add(1);
        Ok(RgbImage::from_pixel(
            self.width,
            self.height,
            image::Rgb([shade, shade, shade]),
        ))
    }

    fn fps(&self) -> u8 {
        30
    }
}

pub struct SyntheticOpener {
    pub width: u32,
    pub height: u32,
}

impl Opener for SyntheticOpener {
    fn open(&self, _device_index: u32) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(SyntheticDevice::new(self.width, self.height)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_device_advances_each_frame() {
        let mut dev = SyntheticDevice::new(4, 2);
        let a = dev.read().unwrap();
        let b = dev.read().unwrap();
        assert_ne!(a.get_pixel(0, 0), b.get_pixel(0, 0));
    }

    #[test]
    fn unimplemented_opener_errors() {
        assert!(UnimplementedOpener.open(0).is_err());
    }
}
