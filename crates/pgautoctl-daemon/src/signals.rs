//! Process-wide signal intake.
//!
//! Signals land on one intake task which only flips flags; the reconcile
//! loop and the supervisor poll those flags at their named barriers. No
//! work ever happens inside a signal context.
//!
//! - `SIGHUP` asks for a configuration reload
//! - `SIGTERM` asks for a graceful stop (finish the tick, then exit)
//! - `SIGINT` / `SIGQUIT` ask for a fast stop (exit at the next barrier)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

/// Flags published by the signal intake task.
#[derive(Debug, Default)]
pub struct SignalFlags {
    asked_to_reload: AtomicBool,
    asked_to_stop: AtomicBool,
    asked_to_stop_fast: AtomicBool,
}

impl SignalFlags {
    /// Fresh flags, all clear.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn the intake task. Must run inside a tokio runtime.
    pub fn install(self: &Arc<Self>) {
        let flags = Arc::clone(self);

        tokio::spawn(async move {
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => return error!("failed to register SIGHUP handler: {e}"),
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => return error!("failed to register SIGTERM handler: {e}"),
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => return error!("failed to register SIGINT handler: {e}"),
            };
            let mut sigquit = match signal(SignalKind::quit()) {
                Ok(s) => s,
                Err(e) => return error!("failed to register SIGQUIT handler: {e}"),
            };

            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        info!("received SIGHUP, will reload configuration");
                        flags.asked_to_reload.store(true, Ordering::SeqCst);
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, will stop after the current tick");
                        flags.asked_to_stop.store(true, Ordering::SeqCst);
                    }
                    _ = sigint.recv() => {
                        info!("received SIGINT, stopping fast");
                        flags.asked_to_stop.store(true, Ordering::SeqCst);
                        flags.asked_to_stop_fast.store(true, Ordering::SeqCst);
                    }
                    _ = sigquit.recv() => {
                        info!("received SIGQUIT, stopping fast");
                        flags.asked_to_stop.store(true, Ordering::SeqCst);
                        flags.asked_to_stop_fast.store(true, Ordering::SeqCst);
                    }
                }
            }
        });
    }

    /// Whether a reload is pending.
    #[must_use]
    pub fn reload_requested(&self) -> bool {
        self.asked_to_reload.load(Ordering::SeqCst)
    }

    /// Acknowledge a reload.
    pub fn clear_reload(&self) {
        self.asked_to_reload.store(false, Ordering::SeqCst);
    }

    /// Whether a graceful stop is pending.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.asked_to_stop.load(Ordering::SeqCst)
    }

    /// Whether a fast stop is pending.
    #[must_use]
    pub fn fast_stop_requested(&self) -> bool {
        self.asked_to_stop_fast.load(Ordering::SeqCst)
    }

    /// Ask for a graceful stop, as SIGTERM would.
    pub fn request_stop(&self) {
        self.asked_to_stop.store(true, Ordering::SeqCst);
    }

    /// Ask for a fast stop, as SIGINT/SIGQUIT would.
    pub fn request_fast_stop(&self) {
        self.asked_to_stop.store(true, Ordering::SeqCst);
        self.asked_to_stop_fast.store(true, Ordering::SeqCst);
    }

    /// Ask for a reload, as SIGHUP would.
    pub fn request_reload(&self) {
        self.asked_to_reload.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_start_clear() {
        let flags = SignalFlags::new();
        assert!(!flags.reload_requested());
        assert!(!flags.stop_requested());
        assert!(!flags.fast_stop_requested());
    }

    #[test]
    fn test_fast_stop_implies_stop() {
        let flags = SignalFlags::new();
        flags.request_fast_stop();
        assert!(flags.stop_requested());
        assert!(flags.fast_stop_requested());
    }

    #[test]
    fn test_reload_is_acknowledged() {
        let flags = SignalFlags::new();
        flags.request_reload();
        assert!(flags.reload_requested());
        flags.clear_reload();
        assert!(!flags.reload_requested());
    }
}
