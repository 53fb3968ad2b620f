//! Error conventions shared by both binaries.
//!
//! The teacher's own `base::Error`/`ErrorKind` (grounded in the `failure`
//! crate) doesn't compile against its own `Cargo.toml` in this snapshot, so
//! this crate follows `anyhow::Error` for the same role instead, with
//! `.context(...)` used the way the teacher uses `with_context`.

/// Extension methods mirroring `anyhow::Context`, kept here so call sites
/// can `use base::ResultExt` without also depending on `anyhow` directly.
pub trait ResultExt<T> {
    fn context_with<C, F>(self, f: F) -> anyhow::Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_with<C, F>(self, f: F) -> anyhow::Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        use anyhow::Context;
        self.with_context(f)
    }
}
