//! Host-facing status channel. Distinct from the `log` crate: this is for
//! a UI to render, not a developer to grep through `RUST_LOG=debug`.

/// Everything the core ever tells a host UI.
///
/// Implementors typically forward `add_user_message`/`add_debug_message`
/// into a UI log pane and the `status_update_*` methods into progress
/// widgets. A no-op implementation is provided for callers (and tests)
/// that don't care.
pub trait StatusObserver: Send + Sync {
    fn status_update_activity(&self, _msg: &str) {}
    fn status_update_percent_done(&self, _msg: &str) {}
    fn status_update_time_remaining(&self, _msg: &str) {}
    fn status_update_kbps(&self, _msg: &str) {}
    fn status_update_retry_count(&self, _msg: &str) {}
    fn status_update_progress_bar(&self, _fraction: f64, _indeterminate: bool) {}
    fn status_update_reset(&self) {}
    fn add_user_message(&self, _msg: &str) {}
    fn add_debug_message(&self, _msg: &str) {}
}

/// Discards everything. Used where a caller doesn't have a real UI to wire
/// up (the CLI's non-interactive subcommands, most unit tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusObserver;

impl StatusObserver for NullStatusObserver {}
