//! The session slot: one document path, at most one kernel.
//!
//! The controller tracks which kernel the session is attached to and what
//! state it is in, and publishes `session` and `status` events as those
//! change. It does not register the side-channel itself. Each handler
//! returns a [`SessionTransition`] telling the caller what the change
//! means for the registration.

use std::sync::Arc;

use log::{debug, info};
use router_protocol::{RouterEvent, SessionStatus, DISCONNECTED};

use crate::backend::{KernelBackend, KernelError, KernelId, KernelStatus, SessionOptions};
use crate::bus::SubscriberBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    path: String,
    kernel: Option<KernelId>,
    status: SessionStatus,
}

impl Session {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kernel(&self) -> Option<&KernelId> {
        self.kernel.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }
}

/// What a lifecycle change means for the side-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// Nothing the registration cares about.
    Unchanged,
    /// A different kernel took over. It is not ready yet.
    KernelAttached(KernelId),
    /// The kernel went away.
    KernelDetached,
    /// The kernel began restarting.
    Restarting(KernelId),
    /// The kernel became ready after not being ready. The caller makes
    /// sure the channel is registered, then calls
    /// [`SessionController::mark_ready`].
    KernelReady(KernelId),
    /// The kernel died.
    Lost(KernelId),
}

pub struct SessionController {
    label: String,
    backend: Arc<dyn KernelBackend>,
    bus: SubscriberBus<RouterEvent>,
    session: Option<Session>,
    title: String,
}

impl SessionController {
    pub fn new(
        label: impl Into<String>,
        backend: Arc<dyn KernelBackend>,
        bus: SubscriberBus<RouterEvent>,
    ) -> Self {
        let label = label.into();
        let title = format!("[{}] {}", label, DISCONNECTED);
        Self {
            label,
            backend,
            bus,
            session: None,
            title,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn kernel(&self) -> Option<&KernelId> {
        self.session.as_ref().and_then(|s| s.kernel.as_ref())
    }

    pub fn status(&self) -> SessionStatus {
        self.session
            .as_ref()
            .map_or(SessionStatus::Unattached, |s| s.status)
    }

    /// `[<label>] <path>`, or `[<label>] DISCONNECTED` without a kernel.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Create the session, or return the existing one.
    pub async fn attach(&mut self, options: SessionOptions) -> Result<Session, KernelError> {
        if let Some(session) = &self.session {
            if session.path != options.path {
                debug!(
                    "[session] Already attached to {}; ignoring {}",
                    session.path, options.path
                );
            }
            return Ok(session.clone());
        }

        info!(
            "[session] Starting {} kernel for {}",
            options.kernel_name, options.path
        );
        let kernel = self.backend.start_session(&options).await?;
        info!("[session] Kernel {} attached to {}", kernel, options.path);

        let session = Session {
            path: options.path,
            kernel: Some(kernel),
            status: SessionStatus::Starting,
        };
        self.session = Some(session.clone());
        self.bus.publish(RouterEvent::Status(SessionStatus::Starting));
        self.notify_kernel_changed();
        Ok(session)
    }

    fn set_status(&mut self, status: SessionStatus) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.status == status {
            return false;
        }
        debug!("[session] {} -> {}", session.status, status);
        session.status = status;
        self.bus.publish(RouterEvent::Status(status));
        true
    }

    /// The session's kernel identity changed.
    pub fn handle_kernel_changed(&mut self, kernel: Option<KernelId>) -> SessionTransition {
        let Some(session) = self.session.as_mut() else {
            debug!("[session] Kernel change before attach ignored");
            return SessionTransition::Unchanged;
        };
        if session.kernel == kernel {
            return SessionTransition::Unchanged;
        }
        session.kernel = kernel.clone();

        let transition = match kernel {
            Some(kernel) => {
                info!("[session] Kernel changed to {}", kernel);
                self.set_status(SessionStatus::Starting);
                SessionTransition::KernelAttached(kernel)
            }
            None => {
                info!("[session] Kernel detached");
                self.set_status(SessionStatus::Disconnected);
                SessionTransition::KernelDetached
            }
        };
        self.notify_kernel_changed();
        transition
    }

    pub fn handle_path_changed(&mut self, path: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.path = path;
        self.notify_path_changed();
    }

    /// Map a kernel status report onto the session.
    ///
    /// Reports from a kernel other than the attached one are ignored.
    /// Busy/idle churn while ready is [`SessionTransition::Unchanged`].
    pub fn handle_status(&mut self, kernel: &KernelId, status: KernelStatus) -> SessionTransition {
        let Some(session) = self.session.as_ref() else {
            return SessionTransition::Unchanged;
        };
        if session.kernel.as_ref() != Some(kernel) {
            debug!("[session] Status {} from foreign kernel {}", status, kernel);
            return SessionTransition::Unchanged;
        }
        let current = session.status;

        match status {
            KernelStatus::Restarting => {
                if self.set_status(SessionStatus::Restarting) {
                    info!("[session] Kernel {} restarting", kernel);
                    SessionTransition::Restarting(kernel.clone())
                } else {
                    SessionTransition::Unchanged
                }
            }
            KernelStatus::Dead => {
                if self.set_status(SessionStatus::Disconnected) {
                    info!("[session] Kernel {} died", kernel);
                    SessionTransition::Lost(kernel.clone())
                } else {
                    SessionTransition::Unchanged
                }
            }
            s if s.is_ready() && current != SessionStatus::Ready => {
                SessionTransition::KernelReady(kernel.clone())
            }
            _ => SessionTransition::Unchanged,
        }
    }

    /// Declare the session usable.
    pub fn mark_ready(&mut self) {
        self.set_status(SessionStatus::Ready);
    }

    /// Publish the session notice for the current kernel identity: the
    /// path when a kernel is attached, [`DISCONNECTED`] otherwise.
    pub fn notify_kernel_changed(&mut self) {
        if self.kernel().is_some() {
            self.notify_path_changed();
        } else {
            self.title = format!("[{}] {}", self.label, DISCONNECTED);
            self.bus.publish(RouterEvent::Session(DISCONNECTED.to_string()));
        }
    }

    /// Publish the current path. Does nothing without a kernel.
    pub fn notify_path_changed(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if session.kernel.is_none() {
            return;
        }
        let path = session.path.clone();
        self.title = format!("[{}] {}", self.label, path);
        self.bus.publish(RouterEvent::Session(path));
    }

    /// Shut down the kernel and release the session. Safe to call twice.
    pub async fn shutdown(&mut self) -> Result<(), KernelError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.title = format!("[{}] {}", self.label, DISCONNECTED);
        match session.kernel {
            Some(kernel) => {
                info!("[session] Shutting down kernel {}", kernel);
                self.backend.shutdown(&kernel).await
            }
            None => Ok(()),
        }
    }
}
