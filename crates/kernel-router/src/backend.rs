//! Boundary between the router and the outside world.
//!
//! [`KernelBackend`] starts, drives and stops kernels; lifecycle and comm
//! traffic flows back as [`KernelEvent`]s on a channel the backend owns.
//! [`DocumentProvider`] creates a document when no path is supplied, and
//! [`DisplaySink`] receives content for the structured-data display.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque kernel identity. A restart keeps the identity; a new kernel gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KernelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for KernelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Execution state reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

impl KernelStatus {
    /// Idle and busy both mean the kernel is up and accepting requests.
    pub fn is_ready(self) -> bool {
        matches!(self, KernelStatus::Idle | KernelStatus::Busy)
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Lifecycle and comm notifications from a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// The session's kernel identity changed. `None` means it went away.
    KernelChanged { kernel: Option<KernelId> },
    /// The session's document path changed.
    PathChanged { path: String },
    Status {
        kernel: KernelId,
        status: KernelStatus,
    },
    /// The kernel opened a comm.
    CommOpen {
        kernel: KernelId,
        comm_id: String,
        target_name: String,
    },
    CommMsg {
        kernel: KernelId,
        comm_id: String,
        data: Value,
    },
    CommClose { kernel: KernelId, comm_id: String },
}

impl KernelEvent {
    /// The kernel this event concerns, if it names one.
    pub fn kernel(&self) -> Option<&KernelId> {
        match self {
            KernelEvent::KernelChanged { kernel } => kernel.as_ref(),
            KernelEvent::PathChanged { .. } => None,
            KernelEvent::Status { kernel, .. }
            | KernelEvent::CommOpen { kernel, .. }
            | KernelEvent::CommMsg { kernel, .. }
            | KernelEvent::CommClose { kernel, .. } => Some(kernel),
        }
    }
}

/// What to start a session with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub path: String,
    pub name: String,
    pub kernel_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("No kernel running")]
    NotRunning,
    #[error("Unknown kernel: {0}")]
    UnknownKernel(KernelId),
    #[error("Kernel did not respond within {0:?}")]
    Timeout(Duration),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Drives kernels on behalf of the router.
///
/// Requests name the kernel they target so that a request racing a kernel
/// change can be rejected instead of landing on the wrong kernel.
#[async_trait]
pub trait KernelBackend: Send + Sync {
    /// Start a kernel for `options.path`. Readiness arrives later as a
    /// [`KernelEvent::Status`].
    async fn start_session(&self, options: &SessionOptions) -> Result<KernelId, KernelError>;

    /// Submit code without waiting for it to run.
    async fn execute(&self, kernel: &KernelId, code: &str) -> Result<(), KernelError>;

    /// Submit code and wait for the kernel's reply.
    async fn execute_to_completion(&self, kernel: &KernelId, code: &str)
        -> Result<(), KernelError>;

    /// Send `data` on an open comm.
    async fn send_comm(
        &self,
        kernel: &KernelId,
        comm_id: &str,
        data: Value,
    ) -> Result<(), KernelError>;

    /// Restart in place. The identity is kept.
    async fn restart(&self, kernel: &KernelId) -> Result<(), KernelError>;

    /// Replace `from` with a fresh `kernel_name` kernel in the same session.
    ///
    /// Reports [`KernelEvent::KernelChanged`] with the new identity, retires
    /// `from`, then reports the new kernel's status.
    async fn change_kernel(
        &self,
        from: &KernelId,
        kernel_name: &str,
    ) -> Result<KernelId, KernelError>;

    /// Stop the kernel. The session is left without one, reported as
    /// `KernelChanged { kernel: None }`.
    async fn shutdown(&self, kernel: &KernelId) -> Result<(), KernelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("No document provider configured")]
    Unavailable,
    #[error("Failed to create document: {0}")]
    Create(String),
}

/// Creates a fresh document when a session is started without a path.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    /// Returns the path of the new document.
    async fn new_untitled(&self) -> Result<String, DocumentError>;
}

/// Provider for hosts that always supply a path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDocuments;

#[async_trait]
impl DocumentProvider for NoDocuments {
    async fn new_untitled(&self) -> Result<String, DocumentError> {
        Err(DocumentError::Unavailable)
    }
}

/// Receives content for the structured-data display.
pub trait DisplaySink: Send + Sync {
    fn set_display(&self, content: &Value);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn set_display(&self, _content: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_statuses() {
        assert!(KernelStatus::Idle.is_ready());
        assert!(KernelStatus::Busy.is_ready());
        assert!(!KernelStatus::Starting.is_ready());
        assert!(!KernelStatus::Restarting.is_ready());
        assert!(!KernelStatus::Dead.is_ready());
    }

    #[test]
    fn test_event_kernel() {
        let k = KernelId::from("k1");
        let event = KernelEvent::CommClose {
            kernel: k.clone(),
            comm_id: "c".into(),
        };
        assert_eq!(event.kernel(), Some(&k));
        assert_eq!(KernelEvent::KernelChanged { kernel: None }.kernel(), None);
    }

    #[tokio::test]
    async fn test_no_documents_is_unavailable() {
        assert!(matches!(
            NoDocuments.new_untitled().await,
            Err(DocumentError::Unavailable)
        ));
    }
}
