//! Backend logging policy.
//!
//! Emission goes through `tracing`; this module owns the environment policy
//! shared by every backend:
//!
//! * `VFC_BACKENDS_LOGGER` — anything but `True` (default) disables info
//!   records.
//! * `VFC_BACKENDS_SILENT_LOAD` — `True` suppresses the load banner.
//! * `VFC_BACKENDS_LOGFILE` — base name for a log file; the thread id is
//!   appended so parallel runs do not interleave.
//! * `VFC_BACKENDS_COLORED_LOGGER` — `True` requests ANSI colors.
//!
//! Subscriber installation is the host's job (the `mcasim` binary builds a
//! `tracing-subscriber` honoring the file and color settings); the engine
//! only emits events.

use std::sync::OnceLock;

static ENABLED: OnceLock<bool> = OnceLock::new();
static COLORED: OnceLock<bool> = OnceLock::new();

fn env_is_true(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| value.eq_ignore_ascii_case("true"))
}

/// Warms the environment caches. Called by every backend's `pre_init`.
pub fn init(backend: &str) {
    let _ = enabled();
    let _ = colored();
    tracing::debug!(target: "mcasim", backend, "logger initialized");
}

/// Returns true when info records are emitted (default).
pub fn enabled() -> bool {
    *ENABLED.get_or_init(|| env_is_true("VFC_BACKENDS_LOGGER").unwrap_or(true))
}

/// Returns true when the load banner must be suppressed.
pub fn silent_load() -> bool {
    env_is_true("VFC_BACKENDS_SILENT_LOAD").unwrap_or(false)
}

/// Returns true when ANSI colors were requested.
pub fn colored() -> bool {
    *COLORED.get_or_init(|| env_is_true("VFC_BACKENDS_COLORED_LOGGER").unwrap_or(false))
}

/// Log file path for this thread, if `VFC_BACKENDS_LOGFILE` is set.
///
/// The thread id is appended to the base name so concurrent threads never
/// interleave their output.
pub fn logfile() -> Option<String> {
    let base = std::env::var("VFC_BACKENDS_LOGFILE").ok()?;
    // SAFETY: gettid has no preconditions and always succeeds on Linux.
    let tid = unsafe { libc::gettid() };
    Some(format!("{base}.{tid}"))
}

/// Emits an info record unless the logger is disabled.
pub fn info(backend: &str, message: &str) {
    if enabled() {
        tracing::info!(target: "mcasim", backend, "{message}");
    }
}

/// Emits a warning record. Warnings are not gated by the enable flag.
pub fn warn(backend: &str, message: &str) {
    tracing::warn!(target: "mcasim", backend, "{message}");
}

/// Emits an error record and terminates through the panic path.
///
/// Hooks cannot return errors, so invalid runtime requests (for example an
/// out-of-range precision through a user call) are fatal.
pub fn fatal(backend: &str, message: &str) -> ! {
    tracing::error!(target: "mcasim", backend, "{message}");
    panic!("{backend}: {message}");
}
