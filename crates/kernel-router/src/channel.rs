//! Registration of the named side-channel on the session's kernel.
//!
//! Registering means running a bootstrap snippet in the kernel; the kernel
//! then opens a comm whose target is the channel name and streams frames
//! on it. A registration is bound to exactly one kernel identity:
//!
//! ```text
//! Unregistered ──begin──▶ Registering ──complete(ok)──▶ Live
//!       ▲                     │                          │
//!       └──complete(err)──────┘     invalidate           │
//!                             └──────────▶ Stale ◀───────┘
//! ```
//!
//! At most one handle is ever open. Beginning a registration for a
//! different kernel closes the previous handle first, and a completion
//! that arrives for a superseded attempt is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use serde_json::Value;

use crate::backend::{KernelBackend, KernelError, KernelId};

const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Callback for frames arriving on the bound comm.
pub type FrameCallback = Arc<dyn Fn(Value) + Send + Sync>;
/// Callback fired once when a handle closes.
pub type CloseCallback = Arc<dyn Fn(CloseReason) + Send + Sync>;

/// Why a registration handle was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Another kernel took over the session.
    Superseded,
    /// The kernel restarted; its comms are gone.
    Restarted,
    /// The kernel died or was detached.
    KernelGone,
    /// The kernel closed the comm.
    Remote,
    /// The bootstrap request failed.
    Failed,
    /// The owning component was disposed.
    Disposed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Superseded => write!(f, "superseded"),
            CloseReason::Restarted => write!(f, "kernel restarted"),
            CloseReason::KernelGone => write!(f, "kernel gone"),
            CloseReason::Remote => write!(f, "closed by kernel"),
            CloseReason::Failed => write!(f, "registration failed"),
            CloseReason::Disposed => write!(f, "disposed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("No live registration")]
    NotLive,
    #[error("Registration handle is closed")]
    Closed,
    #[error("The kernel has not opened the channel yet")]
    NoComm,
    #[error("A registration is already in flight for kernel {0}")]
    InFlight(KernelId),
    #[error("Registration {0} was superseded before it completed")]
    Superseded(u64),
    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[source] KernelError),
    #[error("Send failed: {0}")]
    Send(#[source] KernelError),
}

struct HandleInner {
    id: u64,
    kernel: KernelId,
    comm_ids: StdMutex<Vec<String>>,
    closed: AtomicBool,
    on_frame: FrameCallback,
    on_close: CloseCallback,
}

/// One registration attempt, bound to one kernel.
#[derive(Clone)]
pub struct RegistrationHandle {
    inner: Arc<HandleInner>,
}

impl RegistrationHandle {
    fn new(id: u64, kernel: KernelId, on_frame: FrameCallback, on_close: CloseCallback) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                kernel,
                comm_ids: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                on_frame,
                on_close,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kernel(&self) -> &KernelId {
        &self.inner.kernel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Comms the kernel has opened on this registration, oldest first.
    pub fn comm_ids(&self) -> Vec<String> {
        self.lock_comms().clone()
    }

    fn lock_comms(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.inner
            .comm_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(&self, comm_id: &str) {
        let mut comms = self.lock_comms();
        if !comms.iter().any(|c| c == comm_id) {
            comms.push(comm_id.to_string());
        }
    }

    /// Returns whether `comm_id` was bound here.
    fn unbind(&self, comm_id: &str) -> bool {
        let mut comms = self.lock_comms();
        let before = comms.len();
        comms.retain(|c| c != comm_id);
        comms.len() != before
    }

    fn is_bound(&self, comm_id: &str) -> bool {
        self.lock_comms().iter().any(|c| c == comm_id)
    }

    fn deliver(&self, payload: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        (self.inner.on_frame)(payload);
        true
    }

    /// Fires `on_close` unless already closed.
    fn close(&self, reason: CloseReason) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(
            "[comm] Registration {} on kernel {} closed: {}",
            self.id(),
            self.kernel(),
            reason
        );
        (self.inner.on_close)(reason);
        true
    }
}

impl std::fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.id())
            .field("kernel", self.kernel())
            .field("comm_ids", &self.comm_ids())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum RegistrationState {
    Unregistered,
    /// Bootstrap submitted, reply pending. Comms may already open.
    Registering(RegistrationHandle),
    Live(RegistrationHandle),
    /// The last registration's kernel restarted or went away.
    Stale { kernel: KernelId },
}

impl RegistrationState {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering(_) => "registering",
            RegistrationState::Live(_) => "live",
            RegistrationState::Stale { .. } => "stale",
        }
    }
}

/// The bootstrap request for one registration attempt.
#[derive(Debug, Clone)]
pub struct RegistrationTicket {
    pub generation: u64,
    pub kernel: KernelId,
    pub code: String,
    /// A bootstrap without a reply by then fails with [`KernelError::Timeout`].
    pub timeout: Duration,
}

/// Result of a bootstrap request, tagged with its attempt.
pub type BootstrapFuture = BoxFuture<'static, (u64, Result<(), KernelError>)>;

impl RegistrationTicket {
    /// Submit the bootstrap and resolve with `(generation, result)`.
    pub fn run(self, backend: Arc<dyn KernelBackend>) -> BootstrapFuture {
        async move {
            let request = backend.execute_to_completion(&self.kernel, &self.code);
            let result = match tokio::time::timeout(self.timeout, request).await {
                Ok(result) => result,
                Err(_) => Err(KernelError::Timeout(self.timeout)),
            };
            (self.generation, result)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub enum RegisterStart {
    /// Already live on this kernel.
    AlreadyLive(RegistrationHandle),
    /// A bootstrap for this kernel is already pending.
    InFlight,
    /// Submit this bootstrap, then report back via [`CommChannel::complete`].
    Bootstrap(RegistrationTicket),
}

pub struct CommChannel {
    channel_name: String,
    bootstrap_template: String,
    backend: Arc<dyn KernelBackend>,
    bootstrap_timeout: Duration,
    state: RegistrationState,
    next_generation: u64,
}

impl CommChannel {
    /// `bootstrap_template` may reference the channel name as `{channel}`.
    pub fn new(
        channel_name: impl Into<String>,
        bootstrap_template: impl Into<String>,
        backend: Arc<dyn KernelBackend>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            bootstrap_template: bootstrap_template.into(),
            backend,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            state: RegistrationState::Unregistered,
            next_generation: 1,
        }
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn bootstrap_code(&self) -> String {
        self.bootstrap_template.replace("{channel}", &self.channel_name)
    }

    /// The live handle, if any.
    pub fn live(&self) -> Option<&RegistrationHandle> {
        match &self.state {
            RegistrationState::Live(handle) => Some(handle),
            _ => None,
        }
    }

    /// Kernel of the live registration.
    pub fn live_kernel(&self) -> Option<&KernelId> {
        self.live().map(|h| h.kernel())
    }

    /// The open handle, live or still registering.
    fn current(&self) -> Option<&RegistrationHandle> {
        match &self.state {
            RegistrationState::Registering(handle) | RegistrationState::Live(handle) => {
                Some(handle)
            }
            _ => None,
        }
    }

    /// Start registering on `kernel`.
    ///
    /// Idempotent per kernel: a live or pending registration on the same
    /// kernel is left alone. Anything bound to another kernel is closed
    /// with [`CloseReason::Superseded`] before the new attempt begins.
    pub fn begin(
        &mut self,
        kernel: &KernelId,
        on_frame: FrameCallback,
        on_close: CloseCallback,
    ) -> RegisterStart {
        match &self.state {
            RegistrationState::Live(handle) if handle.kernel() == kernel => {
                return RegisterStart::AlreadyLive(handle.clone());
            }
            RegistrationState::Registering(handle) if handle.kernel() == kernel => {
                return RegisterStart::InFlight;
            }
            _ => {}
        }

        self.invalidate(CloseReason::Superseded);

        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = RegistrationHandle::new(generation, kernel.clone(), on_frame, on_close);
        self.state = RegistrationState::Registering(handle);

        info!(
            "[comm] Registering {} on kernel {} (attempt {})",
            self.channel_name, kernel, generation
        );
        RegisterStart::Bootstrap(RegistrationTicket {
            generation,
            kernel: kernel.clone(),
            code: self.bootstrap_code(),
            timeout: self.bootstrap_timeout,
        })
    }

    /// Record the outcome of the bootstrap for attempt `generation`.
    ///
    /// A failed attempt closes its handle and returns to `Unregistered`;
    /// the next lifecycle transition retries.
    pub fn complete(
        &mut self,
        generation: u64,
        result: Result<(), KernelError>,
    ) -> Result<RegistrationHandle, CommError> {
        let handle = match &self.state {
            RegistrationState::Registering(handle) if handle.id() == generation => handle.clone(),
            _ => {
                debug!(
                    "[comm] Discarding completion of superseded attempt {}",
                    generation
                );
                return Err(CommError::Superseded(generation));
            }
        };

        match result {
            Ok(()) => {
                info!(
                    "[comm] {} live on kernel {}",
                    self.channel_name,
                    handle.kernel()
                );
                self.state = RegistrationState::Live(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!(
                    "[comm] Registration on kernel {} failed: {}",
                    handle.kernel(),
                    e
                );
                handle.close(CloseReason::Failed);
                self.state = RegistrationState::Unregistered;
                Err(CommError::Bootstrap(e))
            }
        }
    }

    /// Register on `kernel` and wait for the bootstrap reply.
    pub async fn register(
        &mut self,
        kernel: &KernelId,
        on_frame: FrameCallback,
        on_close: CloseCallback,
    ) -> Result<RegistrationHandle, CommError> {
        match self.begin(kernel, on_frame, on_close) {
            RegisterStart::AlreadyLive(handle) => Ok(handle),
            RegisterStart::InFlight => Err(CommError::InFlight(kernel.clone())),
            RegisterStart::Bootstrap(ticket) => {
                let (generation, result) = ticket.run(self.backend.clone()).await;
                self.complete(generation, result)
            }
        }
    }

    /// Close the open handle, if any, and mark the registration stale.
    pub fn invalidate(&mut self, reason: CloseReason) {
        let state = std::mem::replace(&mut self.state, RegistrationState::Unregistered);
        self.state = match state {
            RegistrationState::Registering(handle) | RegistrationState::Live(handle) => {
                handle.close(reason);
                RegistrationState::Stale {
                    kernel: handle.kernel().clone(),
                }
            }
            other => other,
        };
    }

    /// Close everything and forget the last kernel.
    pub fn teardown(&mut self) {
        self.invalidate(CloseReason::Disposed);
        self.state = RegistrationState::Unregistered;
    }

    /// Bind a newly opened comm if it targets this channel on the
    /// registration's kernel. Returns whether it was bound.
    pub fn on_comm_open(&mut self, kernel: &KernelId, comm_id: &str, target_name: &str) -> bool {
        if target_name != self.channel_name {
            debug!("[comm] Ignoring comm {} for target {}", comm_id, target_name);
            return false;
        }
        match self.current() {
            Some(handle) if handle.kernel() == kernel => {
                info!("[comm] Kernel {} opened {} as {}", kernel, target_name, comm_id);
                handle.bind(comm_id);
                true
            }
            _ => {
                debug!(
                    "[comm] No registration on kernel {} for comm {}",
                    kernel, comm_id
                );
                false
            }
        }
    }

    /// Deliver a frame to the bound handle. Frames for comms not bound to
    /// the current registration are dropped.
    pub fn on_comm_msg(&self, kernel: &KernelId, comm_id: &str, data: Value) -> bool {
        match self.current() {
            Some(handle) if handle.kernel() == kernel && handle.is_bound(comm_id) => {
                handle.deliver(data)
            }
            _ => {
                debug!("[comm] Dropping frame on unbound comm {}", comm_id);
                false
            }
        }
    }

    /// The kernel closed a comm. Closing the last bound comm of the live
    /// registration leaves it stale.
    pub fn on_comm_close(&mut self, kernel: &KernelId, comm_id: &str) {
        let Some(handle) = self.current().cloned() else {
            return;
        };
        if handle.kernel() != kernel || !handle.unbind(comm_id) {
            return;
        }
        if handle.comm_ids().is_empty() && matches!(self.state, RegistrationState::Live(_)) {
            self.invalidate(CloseReason::Remote);
        }
    }

    /// Send `data` to the kernel over the live registration's comm.
    pub async fn send(&self, data: Value) -> Result<(), CommError> {
        let handle = self.live().ok_or(CommError::NotLive)?;
        if handle.is_closed() {
            return Err(CommError::Closed);
        }
        let comm_id = handle.comm_ids().pop().ok_or(CommError::NoComm)?;
        self.backend
            .send_comm(handle.kernel(), &comm_id, data)
            .await
            .map_err(CommError::Send)
    }
}

impl std::fmt::Debug for CommChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommChannel")
            .field("channel_name", &self.channel_name)
            .field("state", &self.state)
            .finish()
    }
}
