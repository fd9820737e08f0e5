use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use axum_server::Handle;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::Millis;

/// Grace period granted to in-flight connections during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Active,
    Stopping,
}

/// Lifecycle counter shared by every service: ready → active → stopping.
/// Activation happens exclusively through [`ServiceStatus::try_activate`]
/// so concurrent admissions race on a single compare-and-swap.
#[derive(Debug)]
pub struct ServiceStatus(AtomicU32);

impl ServiceStatus {
    const READY: u32 = 0;
    const ACTIVE: u32 = 1;
    const STOPPING: u32 = 2;

    pub fn new() -> Self {
        ServiceStatus(AtomicU32::new(Self::READY))
    }

    /// For services that are active for their whole lifetime.
    pub fn new_active() -> Self {
        ServiceStatus(AtomicU32::new(Self::ACTIVE))
    }

    pub fn load(&self) -> Status {
        match self.0.load(Ordering::Acquire) {
            Self::ACTIVE => Status::Active,
            Self::STOPPING => Status::Stopping,
            _ => Status::Ready,
        }
    }

    /// Admits a new run; fails when one is already active.
    pub fn try_activate(&self) -> bool {
        self.0
            .compare_exchange(Self::READY, Self::ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns to ready only when still active, so a shutdown already in
    /// progress is not clobbered.
    pub fn deactivate(&self) -> bool {
        self.0
            .compare_exchange(Self::ACTIVE, Self::READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_ready(&self) {
        self.0.store(Self::READY, Ordering::Release);
    }

    pub fn set_stopping(&self) {
        self.0.store(Self::STOPPING, Ordering::Release);
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Response body of `GET /__service`.
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Millis>,
}

/// Span left until `until`, for the status endpoint of an active service.
pub fn remaining(until: DateTime<Local>) -> Millis {
    Millis::from_millis((until - Local::now()).num_milliseconds())
}

/// One-shot graceful shutdown switch shared with the terminate handler.
#[derive(Clone)]
pub struct Shutdown {
    handle: Handle,
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new(handle: Handle) -> Self {
        Shutdown {
            handle,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// First call cancels the active run (when one was handed in) and starts
    /// the graceful server shutdown; later calls are no-ops.
    pub fn trigger(&self, service: &'static str, cancel: Option<CancellationToken>) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(service, "shutting down server, process will terminate");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_activation_wins() {
        let status = ServiceStatus::new();
        assert!(status.try_activate());
        assert!(!status.try_activate());
        assert_eq!(status.load(), Status::Active);
        assert!(status.deactivate());
        assert!(status.try_activate());
    }

    #[test]
    fn stopping_is_not_clobbered_by_deactivate() {
        let status = ServiceStatus::new();
        assert!(status.try_activate());
        status.set_stopping();
        assert!(!status.deactivate());
        assert_eq!(status.load(), Status::Stopping);
    }

    #[test]
    fn status_body_omits_absent_duration() {
        let body = StatusBody {
            status: "ready",
            duration: None,
        };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"status":"ready"}"#);
        let body = StatusBody {
            status: "testing",
            duration: Some(Millis::from_millis(1500)),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"status":"testing","duration":"1500ms"}"#
        );
    }
}
