//! [`KernelBackend`] over local Jupyter kernels.
//!
//! Kernels are launched from their kernelspec with a fresh connection file.
//! Each kernel gets an iopub listener that turns status and comm traffic
//! into [`KernelEvent`]s, and a shell reader that resolves pending
//! `execute_reply` waiters.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ReplyStatus, ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::backend::{
    KernelBackend, KernelError, KernelEvent, KernelId, KernelStatus, SessionOptions,
};

const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive iopub read errors before the listener gives up.
const MAX_IOPUB_FAILURES: u32 = 16;

/// `execute_reply` status of one request: `Err` carries the reply status.
type ReplyWaiter = oneshot::Sender<Result<(), String>>;

/// Execute requests awaiting a reply on one shell connection, by msg_id.
type PendingReplies = Arc<StdMutex<HashMap<String, ReplyWaiter>>>;

fn lock_pending(pending: &PendingReplies) -> MutexGuard<'_, HashMap<String, ReplyWaiter>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop every waiter so their requests fail instead of hanging.
fn fail_pending(pending: &PendingReplies) {
    let waiters = std::mem::take(&mut *lock_pending(pending));
    if !waiters.is_empty() {
        debug!(
            "[jupyter] Failing {} execute requests without a reply",
            waiters.len()
        );
    }
}

/// Sockets, tasks and process of one launch of a kernel.
struct KernelConnections {
    session_id: String,
    shell_writer: runtimelib::DealerSendConnection,
    pending: PendingReplies,
    /// Set once the process is meant to go away, so its exit is not
    /// reported as a death.
    retiring: Arc<AtomicBool>,
    iopub_task: tokio::task::JoinHandle<()>,
    shell_reader_task: tokio::task::JoinHandle<()>,
    /// Owns the process; aborting it kills the kernel.
    exit_task: tokio::task::JoinHandle<()>,
}

impl KernelConnections {
    fn retire(&self) {
        self.retiring.store(true, Ordering::Release);
    }
}

impl Drop for KernelConnections {
    fn drop(&mut self) {
        self.retire();
        self.iopub_task.abort();
        self.shell_reader_task.abort();
        self.exit_task.abort();
        fail_pending(&self.pending);
    }
}

struct RunningKernel {
    kernelspec_name: String,
    cwd: PathBuf,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    /// `None` while a restart is relaunching, or after one failed.
    conn: Option<KernelConnections>,
}

pub struct JupyterBackend {
    events: mpsc::UnboundedSender<KernelEvent>,
    kernels: Mutex<HashMap<KernelId, RunningKernel>>,
}

impl JupyterBackend {
    /// Create a backend and the receiver for its kernel events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KernelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                kernels: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    fn emit(&self, event: KernelEvent) {
        let _ = self.events.send(event);
    }

    /// Launch a `kernelspec_name` kernel in `cwd` and track it.
    async fn spawn_kernel(&self, kernelspec_name: &str, cwd: PathBuf) -> anyhow::Result<KernelId> {
        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let kernel = KernelId::new(kernel_id.clone());

        let connection_info = new_connection_info(kernelspec_name, None).await?;

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;
        let connection_file = runtime_dir.join(format!("kernel-router-{}.json", kernel_id));
        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        info!(
            "[jupyter] Starting {} kernel {} in {:?}",
            kernelspec_name, kernel, cwd
        );
        let conn = match self
            .launch(&kernel, kernelspec_name, &connection_info, &connection_file, &cwd)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                tokio::fs::remove_file(&connection_file).await.ok();
                return Err(e);
            }
        };

        self.kernels.lock().await.insert(
            kernel.clone(),
            RunningKernel {
                kernelspec_name: kernelspec_name.to_string(),
                cwd,
                connection_info,
                connection_file,
                conn: Some(conn),
            },
        );
        info!("[jupyter] Kernel started: {}", kernel);
        Ok(kernel)
    }

    /// Spawn the kernel process and connect iopub and shell.
    async fn launch(
        &self,
        kernel: &KernelId,
        kernelspec_name: &str,
        connection_info: &ConnectionInfo,
        connection_file: &Path,
        cwd: &Path,
    ) -> anyhow::Result<KernelConnections> {
        let kernelspec = runtimelib::find_kernelspec(kernelspec_name).await?;
        let mut cmd =
            kernelspec.command(connection_file, Some(Stdio::null()), Some(Stdio::null()))?;
        cmd.current_dir(cwd);
        let mut process = cmd.kill_on_drop(true).spawn()?;

        // Small delay to let the kernel bind its sockets
        tokio::time::sleep(Duration::from_millis(500)).await;

        let session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(connection_info, "", &session_id).await?;
        let events = self.events.clone();
        let iopub_kernel = kernel.clone();
        let iopub_task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        failures = 0;
                        debug!(
                            "[jupyter] iopub: kernel={} type={}",
                            iopub_kernel, message.header.msg_type
                        );
                        let Some(event) = iopub_event(&iopub_kernel, message.content) else {
                            continue;
                        };
                        if events.send(event).is_err() {
                            debug!("[jupyter] Event receiver dropped; stopping iopub listener");
                            break;
                        }
                    }
                    Err(e) => {
                        // Comm payloads that are not JSON objects fail to
                        // parse; keep listening.
                        failures += 1;
                        warn!("[jupyter] iopub read error on {}: {}", iopub_kernel, e);
                        if failures >= MAX_IOPUB_FAILURES {
                            error!(
                                "[jupyter] Giving up on iopub for {} after {} errors",
                                iopub_kernel, failures
                            );
                            break;
                        }
                    }
                }
            }
        });

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Verify the kernel is alive
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        match tokio::time::timeout(KERNEL_INFO_TIMEOUT, shell.read()).await {
            Ok(Ok(msg)) => {
                info!("[jupyter] Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                iopub_task.abort();
                error!("[jupyter] Error reading kernel_info_reply: {}", e);
                return Err(anyhow::anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                iopub_task.abort();
                error!("[jupyter] Timeout waiting for kernel_info_reply");
                return Err(KernelError::Timeout(KERNEL_INFO_TIMEOUT).into());
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();
        let pending: PendingReplies = Arc::new(StdMutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        let JupyterMessageContent::ExecuteReply(reply) = &msg.content else {
                            debug!("[jupyter] shell reply: type={}", msg.header.msg_type);
                            continue;
                        };
                        let Some(parent) = msg.parent_header.as_ref() else {
                            continue;
                        };
                        let waiter = lock_pending(&reader_pending).remove(&parent.msg_id);
                        if let Some(waiter) = waiter {
                            let outcome = if reply.status == ReplyStatus::Ok {
                                Ok(())
                            } else {
                                Err(format!("{:?}", reply.status))
                            };
                            let _ = waiter.send(outcome);
                        }
                    }
                    Err(e) => {
                        error!("[jupyter] shell read error: {}", e);
                        fail_pending(&reader_pending);
                        break;
                    }
                }
            }
        });

        let retiring = Arc::new(AtomicBool::new(false));
        let exit_retiring = retiring.clone();
        let exit_events = self.events.clone();
        let exit_kernel = kernel.clone();
        let exit_task = tokio::spawn(async move {
            let status = process.wait().await;
            if exit_retiring.load(Ordering::Acquire) {
                return;
            }
            match status {
                Ok(status) => warn!("[jupyter] Kernel {} exited: {}", exit_kernel, status),
                Err(e) => warn!("[jupyter] Lost track of kernel {}: {}", exit_kernel, e),
            }
            let _ = exit_events.send(KernelEvent::Status {
                kernel: exit_kernel,
                status: KernelStatus::Dead,
            });
        });

        Ok(KernelConnections {
            session_id,
            shell_writer,
            pending,
            retiring,
            iopub_task,
            shell_reader_task,
            exit_task,
        })
    }

    /// Send on the kernel's shell channel. `reply` is resolved by the
    /// request's `execute_reply`.
    async fn send_shell(
        &self,
        kernel: &KernelId,
        message: JupyterMessage,
        reply: Option<ReplyWaiter>,
    ) -> Result<(), KernelError> {
        let mut kernels = self.kernels.lock().await;
        let running = kernels
            .get_mut(kernel)
            .ok_or_else(|| KernelError::UnknownKernel(kernel.clone()))?;
        let conn = running.conn.as_mut().ok_or(KernelError::NotRunning)?;

        // Register the waiter before sending so the reply cannot be missed
        let msg_id = message.header.msg_id.clone();
        if let Some(reply) = reply {
            lock_pending(&conn.pending).insert(msg_id.clone(), reply);
        }
        if let Err(e) = conn.shell_writer.send(message).await {
            lock_pending(&conn.pending).remove(&msg_id);
            return Err(KernelError::Other(e.into()));
        }
        Ok(())
    }

    async fn restart_inner(&self, kernel: &KernelId) -> Result<(), KernelError> {
        let mut kernels = self.kernels.lock().await;
        let running = kernels
            .get_mut(kernel)
            .ok_or_else(|| KernelError::UnknownKernel(kernel.clone()))?;

        self.emit(KernelEvent::Status {
            kernel: kernel.clone(),
            status: KernelStatus::Restarting,
        });

        if let Some(conn) = running.conn.take() {
            conn.retire();
            request_shutdown(&running.connection_info, &conn.session_id, true).await;
        }

        let relaunched = async {
            let connection_info = new_connection_info(
                &running.kernelspec_name,
                Some(running.connection_info.key.clone()),
            )
            .await?;
            tokio::fs::write(
                &running.connection_file,
                serde_json::to_string_pretty(&connection_info)?,
            )
            .await?;
            let conn = self
                .launch(
                    kernel,
                    &running.kernelspec_name,
                    &connection_info,
                    &running.connection_file,
                    &running.cwd,
                )
                .await?;
            anyhow::Ok((connection_info, conn))
        }
        .await;

        match relaunched {
            Ok((connection_info, conn)) => {
                running.connection_info = connection_info;
                running.conn = Some(conn);
                info!("[jupyter] Kernel {} restarted", kernel);
                self.emit(KernelEvent::Status {
                    kernel: kernel.clone(),
                    status: KernelStatus::Idle,
                });
                Ok(())
            }
            Err(e) => {
                error!("[jupyter] Restart of {} failed: {}", kernel, e);
                self.emit(KernelEvent::Status {
                    kernel: kernel.clone(),
                    status: KernelStatus::Dead,
                });
                Err(e.into())
            }
        }
    }

    /// Shut a kernel down and forget it.
    async fn stop(&self, kernel: &KernelId) -> Result<(), KernelError> {
        let running = self
            .kernels
            .lock()
            .await
            .remove(kernel)
            .ok_or_else(|| KernelError::UnknownKernel(kernel.clone()))?;

        if let Some(conn) = &running.conn {
            conn.retire();
            request_shutdown(&running.connection_info, &conn.session_id, false).await;
        }
        drop(running.conn);
        tokio::fs::remove_file(&running.connection_file).await.ok();

        info!("[jupyter] Kernel {} shut down", kernel);
        Ok(())
    }
}

#[async_trait]
impl KernelBackend for JupyterBackend {
    async fn start_session(&self, options: &SessionOptions) -> Result<KernelId, KernelError> {
        let cwd = working_dir(Path::new(&options.path));
        let kernel = self.spawn_kernel(&options.kernel_name, cwd).await?;
        self.emit(KernelEvent::Status {
            kernel: kernel.clone(),
            status: KernelStatus::Idle,
        });
        Ok(kernel)
    }

    async fn execute(&self, kernel: &KernelId, code: &str) -> Result<(), KernelError> {
        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        debug!(
            "[jupyter] execute_request on {}: msg_id={}",
            kernel, message.header.msg_id
        );
        self.send_shell(kernel, message, None).await
    }

    async fn execute_to_completion(
        &self,
        kernel: &KernelId,
        code: &str,
    ) -> Result<(), KernelError> {
        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let (tx, rx) = oneshot::channel();
        self.send_shell(kernel, message, Some(tx)).await?;

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(status)) => Err(KernelError::ExecutionFailed(status)),
            Err(_) => Err(KernelError::Other(anyhow::anyhow!(
                "Kernel connection closed before execute_reply"
            ))),
        }
    }

    async fn send_comm(
        &self,
        kernel: &KernelId,
        comm_id: &str,
        data: Value,
    ) -> Result<(), KernelError> {
        let content = JupyterMessageContent::from_type_and_content(
            "comm_msg",
            json!({ "comm_id": comm_id, "data": data }),
        )
        .map_err(|e| KernelError::Other(e.into()))?;
        let message = JupyterMessage::new(content, None);
        self.send_shell(kernel, message, None).await
    }

    async fn restart(&self, kernel: &KernelId) -> Result<(), KernelError> {
        self.restart_inner(kernel).await
    }

    async fn change_kernel(
        &self,
        from: &KernelId,
        kernel_name: &str,
    ) -> Result<KernelId, KernelError> {
        let cwd = self
            .kernels
            .lock()
            .await
            .get(from)
            .map(|running| running.cwd.clone())
            .ok_or_else(|| KernelError::UnknownKernel(from.clone()))?;

        let kernel = self.spawn_kernel(kernel_name, cwd).await?;
        info!("[jupyter] Session kernel {} replaced by {}", from, kernel);
        self.emit(KernelEvent::KernelChanged {
            kernel: Some(kernel.clone()),
        });

        if let Err(e) = self.stop(from).await {
            warn!("[jupyter] Could not shut down replaced kernel {}: {}", from, e);
        }
        self.emit(KernelEvent::Status {
            kernel: kernel.clone(),
            status: KernelStatus::Idle,
        });
        Ok(kernel)
    }

    async fn shutdown(&self, kernel: &KernelId) -> Result<(), KernelError> {
        self.stop(kernel).await?;
        self.emit(KernelEvent::KernelChanged { kernel: None });
        Ok(())
    }
}

/// Connection info on freshly reserved local ports. `key` reuses a signing key.
async fn new_connection_info(
    kernelspec_name: &str,
    key: Option<String>,
) -> anyhow::Result<ConnectionInfo> {
    let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let ports = runtimelib::peek_ports(ip, 5).await?;
    Ok(ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port: ports[0],
        control_port: ports[1],
        hb_port: ports[2],
        shell_port: ports[3],
        iopub_port: ports[4],
        signature_scheme: "hmac-sha256".to_string(),
        key: key.unwrap_or_else(|| Uuid::new_v4().to_string()),
        kernel_name: Some(kernelspec_name.to_string()),
    })
}

async fn request_shutdown(connection_info: &ConnectionInfo, session_id: &str, restart: bool) {
    match runtimelib::create_client_control_connection(connection_info, session_id).await {
        Ok(mut control) => {
            let request: JupyterMessage = ShutdownRequest { restart }.into();
            if let Err(e) = control.send(request).await {
                debug!("[jupyter] shutdown_request failed: {}", e);
            }
        }
        Err(e) => debug!("[jupyter] No control connection for shutdown: {}", e),
    }
}

/// Directory the kernel runs in: the document's parent, else the current dir.
fn working_dir(document: &Path) -> PathBuf {
    document
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(std::env::temp_dir)
}

fn kernel_status(state: &ExecutionState) -> Option<KernelStatus> {
    match state {
        ExecutionState::Starting => Some(KernelStatus::Starting),
        ExecutionState::Idle => Some(KernelStatus::Idle),
        ExecutionState::Busy => Some(KernelStatus::Busy),
        ExecutionState::Restarting => Some(KernelStatus::Restarting),
        ExecutionState::Terminating | ExecutionState::Dead => Some(KernelStatus::Dead),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Map an iopub message onto a kernel event, if it is one the router tracks.
fn iopub_event(kernel: &KernelId, content: JupyterMessageContent) -> Option<KernelEvent> {
    match content {
        JupyterMessageContent::Status(status) => {
            kernel_status(&status.execution_state).map(|status| KernelEvent::Status {
                kernel: kernel.clone(),
                status,
            })
        }
        JupyterMessageContent::CommOpen(open) => Some(KernelEvent::CommOpen {
            kernel: kernel.clone(),
            comm_id: open.comm_id.0,
            target_name: open.target_name,
        }),
        JupyterMessageContent::CommMsg(msg) => Some(KernelEvent::CommMsg {
            kernel: kernel.clone(),
            data: serde_json::to_value(&msg.data).unwrap_or_default(),
            comm_id: msg.comm_id.0,
        }),
        JupyterMessageContent::CommClose(close) => Some(KernelEvent::CommClose {
            kernel: kernel.clone(),
            comm_id: close.comm_id.0,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_mapping() {
        assert_eq!(
            kernel_status(&ExecutionState::Idle),
            Some(KernelStatus::Idle)
        );
        assert_eq!(
            kernel_status(&ExecutionState::Busy),
            Some(KernelStatus::Busy)
        );
        assert_eq!(
            kernel_status(&ExecutionState::Restarting),
            Some(KernelStatus::Restarting)
        );
        assert_eq!(
            kernel_status(&ExecutionState::Dead),
            Some(KernelStatus::Dead)
        );
        assert_eq!(
            kernel_status(&ExecutionState::Terminating),
            Some(KernelStatus::Dead)
        );
    }

    #[test]
    fn test_working_dir_uses_document_parent() {
        assert_eq!(
            working_dir(Path::new("/data/circuits/a.ipynb")),
            PathBuf::from("/data/circuits")
        );
        assert_ne!(working_dir(Path::new("a.ipynb")), PathBuf::new());
    }

    #[test]
    fn test_comm_open_maps_to_event() {
        let content = JupyterMessageContent::from_type_and_content(
            "comm_open",
            json!({"comm_id": "c1", "target_name": "FFBOLab:Dump-data", "data": {}}),
        )
        .unwrap();
        let kernel = KernelId::from("k1");
        assert_eq!(
            iopub_event(&kernel, content),
            Some(KernelEvent::CommOpen {
                kernel,
                comm_id: "c1".into(),
                target_name: "FFBOLab:Dump-data".into(),
            })
        );
    }

    #[test]
    fn test_comm_msg_maps_to_event() {
        let content = JupyterMessageContent::from_type_and_content(
            "comm_msg",
            json!({"comm_id": "c1", "data": {"widget": "NLP", "data": 3}}),
        )
        .unwrap();
        let kernel = KernelId::from("k1");
        let Some(KernelEvent::CommMsg { comm_id, data, .. }) = iopub_event(&kernel, content) else {
            panic!("expected comm_msg event");
        };
        assert_eq!(comm_id, "c1");
        assert_eq!(data, json!({"widget": "NLP", "data": 3}));
    }

    #[tokio::test]
    async fn test_failing_pending_releases_waiters() {
        let pending: PendingReplies = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        lock_pending(&pending).insert("msg-1".into(), tx);

        fail_pending(&pending);

        assert!(rx.await.is_err());
        assert!(lock_pending(&pending).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kernel_is_rejected() {
        let (backend, _events) = JupyterBackend::new();
        let err = backend
            .execute(&KernelId::from("missing"), "1")
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownKernel(_)));
        assert!(matches!(
            backend.shutdown(&KernelId::from("missing")).await,
            Err(KernelError::UnknownKernel(_))
        ));
        assert!(matches!(
            backend
                .change_kernel(&KernelId::from("missing"), "python3")
                .await,
            Err(KernelError::UnknownKernel(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_shutdown_reports_nothing() {
        let (backend, mut events) = JupyterBackend::new();
        assert!(backend.shutdown(&KernelId::from("missing")).await.is_err());
        assert!(events.try_recv().is_err());
    }
}
