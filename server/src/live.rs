//! Live-frame surface (C9): a concurrent map from client id to the latest
//! raw frame and resolution, published by the ingest stream reader and
//! consumed by the (out-of-scope) dashboard.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct LiveFrame {
    pub bytes: Arc<[u8]>,
    pub height: u16,
    pub width: u16,
}

/// Cheaply cloneable; every session and every dashboard consumer holds a
/// handle to the same underlying map.
#[derive(Clone, Default)]
pub struct LiveSurface {
    inner: Arc<RwLock<HashMap<String, LiveFrame>>>,
}

impl LiveSurface {
    pub fn new() -> LiveSurface {
        LiveSurface::default()
    }

    /// Publishes the latest frame for `peer`, overwriting any previous one.
    pub fn publish(&self, peer: &str, bytes: Arc<[u8]>, height: u16, width: u16) {
        self.inner.write().insert(
            peer.to_string(),
            LiveFrame {
                bytes,
                height,
                width,
            },
        );
    }

    /// Removes `peer`'s entry on session teardown. Consumers racing a
    /// concurrent `get` simply see a missing key, not an error.
    pub fn remove(&self, peer: &str) {
        self.inner.write().remove(peer);
    }

    pub fn get(&self, peer: &str) -> Option<LiveFrame> {
        self.inner.read().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_get() {
        let surface = LiveSurface::new();
        surface.publish("1.2.3.4", Arc::from(vec![1, 2, 3]), 480, 640);
        let frame = surface.get("1.2.3.4").unwrap();
        assert_eq!(&*frame.bytes, &[1, 2, 3]);
        assert_eq!((frame.height, frame.width), (480, 640));
    }

    #[test]
    fn remove_clears_entry() {
        let surface = LiveSurface::new();
        surface.publish("1.2.3.4", Arc::from(vec![1]), 1, 1);
        surface.remove("1.2.3.4");
        assert!(surface.get("1.2.3.4").is_none());
    }

    #[test]
    fn missing_peer_is_none_not_error() {
        let surface = LiveSurface::new();
        assert!(surface.get("nope").is_none());
    }
}
