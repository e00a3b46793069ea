//! The top-level component tying session, channel, router and model together.
//!
//! [`Master`] owns one session slot and one side-channel registration. It is
//! driven from a single task: kernel lifecycle events, subscriber actions
//! and bootstrap completions are all handled on `&mut self`, so lifecycle
//! transitions never interleave. [`Master::run`] is the event loop; tests
//! can instead feed events with [`Master::handle_event`] and drain pending
//! work with [`Master::settle`].

use std::sync::Arc;

use log::{debug, error, info, warn};
use router_protocol::{Action, RouterEvent, SessionStatus};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::backend::{
    DisplaySink, DocumentError, DocumentProvider, KernelBackend, KernelError, KernelEvent,
    KernelId, SessionOptions,
};
use crate::bus::{SubscriberBus, SubscriptionId};
use crate::channel::{
    BootstrapFuture, CloseCallback, CloseReason, CommChannel, CommError, FrameCallback,
    RegisterStart, RegistrationState,
};
use crate::commands::ToolbarCommand;
use crate::config::RouterConfig;
use crate::model::Model;
use crate::router::{DispatchError, DispatchOutcome, MessageRouter};
use crate::session::{Session, SessionTransition, SessionController};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Could not create a document: {0}")]
    Document(#[from] DocumentError),
    #[error("Could not start a session: {0}")]
    Session(#[from] KernelError),
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Disposed")]
    Disposed,
}

/// Requests queued for the component's task.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Action(Action),
    Command(ToolbarCommand),
    /// Restart the session's kernel.
    Restart,
    /// Replace the session's kernel with a fresh one of this kernelspec.
    ChangeKernel { kernel_name: String },
    /// The session's document moved.
    Rename { path: String },
    /// Send a frame to the kernel over the side-channel.
    Send(Value),
}

/// Queues inputs for a [`Master`] from any thread.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<Input>,
}

impl InputSender {
    /// Returns false once the component is gone.
    pub fn send(&self, input: Input) -> bool {
        self.tx.send(input).is_ok()
    }

    pub fn action(&self, action: Action) -> bool {
        self.send(Input::Action(action))
    }

    pub fn command(&self, command: ToolbarCommand) -> bool {
        self.send(Input::Command(command))
    }
}

/// Resolves once the side-channel first becomes live.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<bool>,
}

impl ReadySignal {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for readiness. Returns false if the component was dropped first.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|ready| *ready).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Initialized,
    Failed,
    Disposed,
}

pub struct Master {
    config: RouterConfig,
    documents: Arc<dyn DocumentProvider>,
    bus: SubscriberBus<RouterEvent>,
    model: Model,
    router: MessageRouter,
    session: SessionController,
    channel: CommChannel,
    backend: Arc<dyn KernelBackend>,
    bootstrap: Option<BootstrapFuture>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,
    ready_tx: watch::Sender<bool>,
    lifecycle: Lifecycle,
    has_been_ready: bool,
}

impl Master {
    pub fn new(
        config: RouterConfig,
        backend: Arc<dyn KernelBackend>,
        documents: Arc<dyn DocumentProvider>,
        display: Arc<dyn DisplaySink>,
    ) -> Self {
        let bus = SubscriberBus::new();
        let model = Model::new();
        let router = MessageRouter::new(bus.clone(), model.clone(), display, backend.clone());
        let session = SessionController::new(config.label.clone(), backend.clone(), bus.clone());
        let channel = CommChannel::new(
            config.channel_name.clone(),
            config.bootstrap_template.clone(),
            backend.clone(),
        )
        .with_bootstrap_timeout(config.bootstrap_timeout());
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(false);

        Self {
            config,
            documents,
            bus,
            model,
            router,
            session,
            channel,
            backend,
            bootstrap: None,
            inputs_tx,
            inputs_rx,
            ready_tx,
            lifecycle: Lifecycle::Created,
            has_been_ready: false,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Bus that children subscribe to for router events.
    pub fn bus(&self) -> &SubscriberBus<RouterEvent> {
        &self.bus
    }

    pub fn subscribe<F>(&self, owner: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&RouterEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(owner, callback)
    }

    pub fn unsubscribe(&self, owner: &str) -> usize {
        self.bus.unsubscribe(owner)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.session()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn kernel(&self) -> Option<&KernelId> {
        self.session.kernel()
    }

    pub fn title(&self) -> &str {
        self.session.title()
    }

    /// Kernel the side-channel is live on.
    pub fn registered_kernel(&self) -> Option<&KernelId> {
        self.channel.live_kernel()
    }

    pub fn registration_state(&self) -> &RegistrationState {
        self.channel.state()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.model.ids()
    }

    pub fn model_value(&self, id: &str) -> Option<Value> {
        self.model.get(id)
    }

    pub fn model_snapshot(&self) -> Value {
        self.model.snapshot()
    }

    pub fn ready(&self) -> ReadySignal {
        ReadySignal {
            rx: self.ready_tx.subscribe(),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle == Lifecycle::Disposed
    }

    pub fn inputs(&self) -> InputSender {
        InputSender {
            tx: self.inputs_tx.clone(),
        }
    }

    /// Feed a child's published actions into this component.
    pub fn connect_child(&self, child: &SubscriberBus<Action>) -> SubscriptionId {
        let tx = self.inputs_tx.clone();
        child.subscribe(self.config.label.clone(), move |action: &Action| {
            if tx.send(Input::Action(action.clone())).is_err() {
                debug!("[master] Dropping child action {}: component gone", action.name());
            }
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Attach a session for `path`, creating a document when none is given.
    ///
    /// A failure is reported once, through the returned error, and leaves
    /// the component without a session; calling again retries.
    pub async fn initialize(&mut self, path: Option<String>) -> Result<(), InitError> {
        match self.lifecycle {
            Lifecycle::Disposed => return Err(InitError::Disposed),
            Lifecycle::Initialized => return Err(InitError::AlreadyInitialized),
            Lifecycle::Created | Lifecycle::Failed => {}
        }

        let path = match path.or_else(|| self.config.default_path.clone()) {
            Some(path) => path,
            None => match self.documents.new_untitled().await {
                Ok(path) => {
                    info!("[master] Created document {}", path);
                    path
                }
                Err(e) => return Err(self.fail(e.into())),
            },
        };

        let options = SessionOptions {
            path,
            name: self.config.session_name.clone(),
            kernel_name: self.config.kernel_name.clone(),
        };
        match self.session.attach(options).await {
            Ok(session) => {
                info!("[master] Session ready to start on {}", session.path());
                self.lifecycle = Lifecycle::Initialized;
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn fail(&mut self, err: InitError) -> InitError {
        error!("[master] Initialization failed: {}", err);
        self.lifecycle = Lifecycle::Failed;
        err
    }

    /// Apply one kernel lifecycle or comm event.
    pub fn handle_event(&mut self, event: KernelEvent) {
        if self.is_disposed() {
            return;
        }
        match event {
            KernelEvent::KernelChanged { kernel } => {
                match self.session.handle_kernel_changed(kernel) {
                    SessionTransition::KernelAttached(kernel) => {
                        // A session that never became ready registers on its
                        // first ready status instead.
                        if self.has_been_ready {
                            self.ensure_registration(&kernel);
                        } else {
                            self.channel.invalidate(CloseReason::Superseded);
                            self.bootstrap = None;
                        }
                    }
                    SessionTransition::KernelDetached => {
                        self.channel.invalidate(CloseReason::KernelGone);
                        self.bootstrap = None;
                    }
                    _ => {}
                }
            }
            KernelEvent::PathChanged { path } => self.session.handle_path_changed(path),
            KernelEvent::Status { kernel, status } => {
                match self.session.handle_status(&kernel, status) {
                    SessionTransition::Restarting(_) => {
                        self.channel.invalidate(CloseReason::Restarted);
                        self.bootstrap = None;
                    }
                    SessionTransition::Lost(_) => {
                        self.channel.invalidate(CloseReason::KernelGone);
                        self.bootstrap = None;
                    }
                    SessionTransition::KernelReady(kernel) => {
                        self.ensure_registration(&kernel);
                        self.has_been_ready = true;
                        self.session.mark_ready();
                    }
                    _ => {}
                }
            }
            KernelEvent::CommOpen {
                kernel,
                comm_id,
                target_name,
            } => {
                self.channel.on_comm_open(&kernel, &comm_id, &target_name);
            }
            KernelEvent::CommMsg {
                kernel,
                comm_id,
                data,
            } => {
                self.channel.on_comm_msg(&kernel, &comm_id, data);
            }
            KernelEvent::CommClose { kernel, comm_id } => {
                self.channel.on_comm_close(&kernel, &comm_id);
            }
        }
    }

    fn ensure_registration(&mut self, kernel: &KernelId) {
        let router = self.router.clone();
        let on_frame: FrameCallback = Arc::new(move |payload: Value| {
            router.dispatch_inbound(payload);
        });
        let on_close: CloseCallback = Arc::new(|reason: CloseReason| {
            info!("[master] Side-channel closed: {}", reason);
        });

        match self.channel.begin(kernel, on_frame, on_close) {
            RegisterStart::AlreadyLive(_) => debug!("[master] Channel already live on {}", kernel),
            RegisterStart::InFlight => debug!("[master] Registration on {} in flight", kernel),
            RegisterStart::Bootstrap(ticket) => {
                // Replacing the future drops any superseded bootstrap.
                self.bootstrap = Some(ticket.run(self.backend.clone()));
            }
        }
    }

    fn finish_registration(&mut self, generation: u64, result: Result<(), KernelError>) {
        match self.channel.complete(generation, result) {
            Ok(handle) => {
                if !*self.ready_tx.borrow() {
                    info!("[master] Side-channel ready on kernel {}", handle.kernel());
                    self.ready_tx.send_replace(true);
                }
            }
            Err(CommError::Superseded(_)) => {}
            Err(e) => warn!("[master] {}", e),
        }
    }

    // ── Actions ──────────────────────────────────────────────────────

    /// Dispatch an action against the current kernel.
    pub async fn dispatch(&mut self, action: Action) -> Result<DispatchOutcome, DispatchError> {
        if self.is_disposed() {
            return Ok(DispatchOutcome::Ignored);
        }
        self.router
            .dispatch_outbound(action, self.session.kernel())
            .await
    }

    /// Run a toolbar command's actions in order.
    pub async fn run_command(&mut self, command: ToolbarCommand) {
        let snapshot = self.model.snapshot();
        for action in command.to_actions(&self.config.client_variable, &snapshot) {
            self.dispatch_logged(action).await;
        }
    }

    /// Restart the session's kernel. Lifecycle events follow from the backend.
    pub async fn restart_kernel(&mut self) -> Result<(), KernelError> {
        let kernel = self.session.kernel().cloned().ok_or(KernelError::NotRunning)?;
        info!("[master] Restarting kernel {}", kernel);
        self.backend.restart(&kernel).await
    }

    /// Move the session onto a fresh `kernel_name` kernel. The backend's
    /// kernel-changed event drives re-registration.
    pub async fn change_kernel(&mut self, kernel_name: &str) -> Result<KernelId, KernelError> {
        let kernel = self.session.kernel().cloned().ok_or(KernelError::NotRunning)?;
        info!("[master] Changing kernel {} to {}", kernel, kernel_name);
        self.backend.change_kernel(&kernel, kernel_name).await
    }

    /// Send `data` to the kernel over the live side-channel.
    pub async fn send(&self, data: Value) -> Result<(), CommError> {
        if self.is_disposed() {
            return Err(CommError::NotLive);
        }
        self.channel.send(data).await
    }

    async fn dispatch_logged(&mut self, action: Action) {
        let name = action.name().to_string();
        match self.dispatch(action).await {
            Ok(outcome) => debug!("[master] {} -> {:?}", name, outcome),
            Err(e) => warn!("[master] Action {} failed: {}", name, e),
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Action(action) => self.dispatch_logged(action).await,
            Input::Command(command) => self.run_command(command).await,
            Input::Restart => {
                if let Err(e) = self.restart_kernel().await {
                    warn!("[master] Restart failed: {}", e);
                }
            }
            Input::ChangeKernel { kernel_name } => {
                if let Err(e) = self.change_kernel(&kernel_name).await {
                    warn!("[master] Kernel change failed: {}", e);
                }
            }
            Input::Rename { path } => self.handle_event(KernelEvent::PathChanged { path }),
            Input::Send(data) => {
                if let Err(e) = self.send(data).await {
                    warn!("[master] Side-channel send failed: {}", e);
                }
            }
        }
    }

    /// Re-publish the session notice for current subscribers.
    pub fn propagate_session(&mut self) {
        self.session.notify_kernel_changed();
        self.session.notify_path_changed();
    }

    // ── Driving ──────────────────────────────────────────────────────

    /// Finish any pending bootstrap and queued inputs. A bootstrap waits
    /// at most the configured bootstrap timeout.
    pub async fn settle(&mut self) {
        loop {
            if let Some(bootstrap) = self.bootstrap.take() {
                let (generation, result) = bootstrap.await;
                self.finish_registration(generation, result);
                continue;
            }
            match self.inputs_rx.try_recv() {
                Ok(input) => self.handle_input(input).await,
                Err(_) => break,
            }
        }
    }

    /// Handle queued inputs, leaving any pending bootstrap unawaited.
    pub async fn drain_inputs(&mut self) {
        while let Ok(input) = self.inputs_rx.try_recv() {
            self.handle_input(input).await;
        }
    }

    /// Process kernel events, inputs and bootstrap replies until the event
    /// stream ends or the component is disposed.
    pub async fn run(&mut self, events: &mut mpsc::UnboundedReceiver<KernelEvent>) {
        while !self.is_disposed() {
            tokio::select! {
                (generation, result) = next_bootstrap(&mut self.bootstrap) => {
                    self.finish_registration(generation, result);
                }
                Some(input) = self.inputs_rx.recv() => {
                    self.handle_input(input).await;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("[master] Kernel event stream closed");
                        self.settle().await;
                        break;
                    }
                },
            }
        }
    }

    /// Tear down: notify subscribers and drop them, close the channel, shut
    /// the kernel down, release the model. Later calls do nothing.
    pub async fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.lifecycle = Lifecycle::Disposed;
        info!("[master] Disposing");

        self.bus.publish(RouterEvent::Dispose);
        self.bus.clear();

        self.bootstrap = None;
        self.channel.teardown();

        if let Err(e) = self.session.shutdown().await {
            warn!("[master] Kernel shutdown failed: {}", e);
        }

        self.router.detach_model();
        self.model.dispose();
    }
}

async fn next_bootstrap(slot: &mut Option<BootstrapFuture>) -> (u64, Result<(), KernelError>) {
    match slot.as_mut() {
        Some(bootstrap) => {
            let output = bootstrap.await;
            *slot = None;
            output
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KernelStatus, NoDocuments};
    use crate::testing::{Call, RecordingBackend, RecordingDisplay};
    use serde_json::json;

    fn master(backend: &Arc<RecordingBackend>) -> Master {
        Master::new(
            RouterConfig::default(),
            backend.clone(),
            Arc::new(NoDocuments),
            RecordingDisplay::new(),
        )
    }

    #[tokio::test]
    async fn test_initialize_without_path_or_documents_fails_once() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);

        let err = master.initialize(None).await.unwrap_err();
        assert!(matches!(err, InitError::Document(DocumentError::Unavailable)));
        assert!(backend.calls().is_empty());
        assert!(!master.is_ready());

        master
            .initialize(Some("retry.ipynb".into()))
            .await
            .unwrap();
        assert_eq!(master.session().unwrap().path(), "retry.ipynb");
        assert!(matches!(
            master.initialize(None).await,
            Err(InitError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_default_path_from_config() {
        let backend = RecordingBackend::new();
        let config = RouterConfig {
            default_path: Some("FFBOLabTest.ipynb".into()),
            ..Default::default()
        };
        let mut master = Master::new(
            config,
            backend.clone(),
            Arc::new(NoDocuments),
            RecordingDisplay::new(),
        );

        master.initialize(None).await.unwrap();
        assert_eq!(backend.calls(), vec![Call::Start("FFBOLabTest.ipynb".into())]);
        assert_eq!(master.title(), "[Master] FFBOLabTest.ipynb");
    }

    #[tokio::test]
    async fn test_ready_registers_and_signals() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);
        let mut ready = master.ready();
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        let k = master.kernel().cloned().unwrap();

        master.handle_event(KernelEvent::Status {
            kernel: k.clone(),
            status: KernelStatus::Idle,
        });
        assert_eq!(master.session_status(), SessionStatus::Ready);
        master.settle().await;

        assert!(ready.wait().await);
        assert_eq!(master.registered_kernel(), Some(&k));
        assert_eq!(backend.bootstraps(), 1);

        // Busy/idle churn does not re-register.
        for status in [KernelStatus::Busy, KernelStatus::Idle, KernelStatus::Busy] {
            master.handle_event(KernelEvent::Status {
                kernel: k.clone(),
                status,
            });
        }
        master.settle().await;
        assert_eq!(backend.bootstraps(), 1);
    }

    #[tokio::test]
    async fn test_frames_reach_subscribers_after_comm_open() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        master.subscribe("nlp", move |e: &RouterEvent| {
            if e.is("NLP") {
                sink.lock().unwrap().push(e.data());
            }
        });

        master.initialize(Some("a.ipynb".into())).await.unwrap();
        let k = master.kernel().cloned().unwrap();
        master.handle_event(KernelEvent::Status {
            kernel: k.clone(),
            status: KernelStatus::Idle,
        });
        master.settle().await;

        master.handle_event(KernelEvent::CommOpen {
            kernel: k.clone(),
            comm_id: "c1".into(),
            target_name: master.config().channel_name.clone(),
        });
        let frame = json!({"widget": "NLP", "data": "12 neurons"});
        master.handle_event(KernelEvent::CommMsg {
            kernel: k,
            comm_id: "c1".into(),
            data: frame.clone(),
        });

        assert_eq!(*seen.lock().unwrap(), vec![Some(frame)]);
    }

    #[tokio::test]
    async fn test_inputs_are_queued_and_drained() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        let k = master.kernel().cloned().unwrap();

        let inputs = master.inputs();
        assert!(inputs.action(Action::model_add("n1", json!(1))));
        assert!(inputs.command(ToolbarCommand::ListInputs));
        assert!(inputs.send(Input::Restart));
        master.settle().await;

        assert_eq!(master.model_ids(), vec!["n1"]);
        assert_eq!(
            &backend.calls()[1..],
            &[
                Call::Execute(k.clone(), "_FFBOLABClient.listInputs()".into()),
                Call::Restart(k)
            ]
        );
    }

    #[tokio::test]
    async fn test_change_kernel_and_rename_inputs() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        let k = master.kernel().cloned().unwrap();
        let sessions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = sessions.clone();
        master.subscribe("session", move |e: &RouterEvent| {
            if let RouterEvent::Session(path) = e {
                sink.lock().unwrap().push(path.clone());
            }
        });

        let inputs = master.inputs();
        inputs.send(Input::ChangeKernel {
            kernel_name: "python3-flybrain".into(),
        });
        inputs.send(Input::Rename {
            path: "circuits/b.ipynb".into(),
        });
        master.settle().await;

        assert!(backend
            .calls()
            .contains(&Call::ChangeKernel(k, "python3-flybrain".into())));
        assert_eq!(*sessions.lock().unwrap(), vec!["circuits/b.ipynb"]);
        assert_eq!(master.title(), "[Master] circuits/b.ipynb");
    }

    #[tokio::test]
    async fn test_send_requires_live_channel() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        assert!(matches!(
            master.send(json!({"ping": 1})).await,
            Err(CommError::NotLive)
        ));

        let k = master.kernel().cloned().unwrap();
        master.handle_event(KernelEvent::Status {
            kernel: k.clone(),
            status: KernelStatus::Idle,
        });
        master.settle().await;
        master.handle_event(KernelEvent::CommOpen {
            kernel: k.clone(),
            comm_id: "c1".into(),
            target_name: master.config().channel_name.clone(),
        });

        master.inputs().send(Input::Send(json!({"ping": 1})));
        master.settle().await;
        assert!(backend
            .calls()
            .contains(&Call::SendComm(k, "c1".into(), json!({"ping": 1}))));
    }

    #[tokio::test]
    async fn test_drain_inputs_leaves_bootstrap_pending() {
        let backend = RecordingBackend::new();
        backend.hang_bootstrap.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut master = master(&backend);
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        let k = master.kernel().cloned().unwrap();
        master.handle_event(KernelEvent::Status {
            kernel: k,
            status: KernelStatus::Idle,
        });
        master.inputs().action(Action::model_add("n1", json!(1)));

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            master.drain_inputs().await;
            master.dispose().await;
        })
        .await
        .expect("shutdown does not wait for the bootstrap");

        assert!(master.is_disposed());
        assert_eq!(backend.bootstraps(), 0);
    }

    #[tokio::test]
    async fn test_settle_gives_up_on_unanswered_bootstrap() {
        let backend = RecordingBackend::new();
        backend.hang_bootstrap.store(true, std::sync::atomic::Ordering::SeqCst);
        let config = RouterConfig {
            bootstrap_timeout_ms: 20,
            ..Default::default()
        };
        let mut master = Master::new(
            config,
            backend.clone(),
            Arc::new(NoDocuments),
            RecordingDisplay::new(),
        );
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        let k = master.kernel().cloned().unwrap();
        master.handle_event(KernelEvent::Status {
            kernel: k,
            status: KernelStatus::Idle,
        });

        tokio::time::timeout(std::time::Duration::from_secs(2), master.settle())
            .await
            .expect("settle returns after the bootstrap timeout");

        assert_eq!(backend.bootstraps(), 1);
        assert!(!master.is_ready());
        assert_eq!(master.registration_state().name(), "unregistered");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let backend = RecordingBackend::new();
        let mut master = master(&backend);
        let disposes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = disposes.clone();
        master.subscribe("child", move |e: &RouterEvent| {
            if matches!(e, RouterEvent::Dispose) {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });
        master.initialize(Some("a.ipynb".into())).await.unwrap();
        master
            .dispatch(Action::model_add("n1", json!(1)))
            .await
            .unwrap();

        master.dispose().await;
        master.dispose().await;

        assert_eq!(disposes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(master.bus().subscriber_count(), 0);
        let shutdowns = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Shutdown(_)))
            .count();
        assert_eq!(shutdowns, 1);
        assert!(master.model_ids().is_empty());
        assert_eq!(master.registration_state().name(), "unregistered");
        assert!(matches!(
            master.initialize(None).await,
            Err(InitError::Disposed)
        ));
    }
}
