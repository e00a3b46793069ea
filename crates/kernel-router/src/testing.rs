//! In-memory backend and display for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{DisplaySink, KernelBackend, KernelError, KernelId, SessionOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start(String),
    Execute(KernelId, String),
    Bootstrap(KernelId, String),
    SendComm(KernelId, String, Value),
    Restart(KernelId),
    ChangeKernel(KernelId, String),
    Shutdown(KernelId),
}

#[derive(Default)]
pub struct RecordingBackend {
    calls: StdMutex<Vec<Call>>,
    next_kernel: AtomicU64,
    pub fail_start: AtomicBool,
    pub fail_bootstrap: AtomicBool,
    /// Bootstraps never get a reply.
    pub hang_bootstrap: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn bootstraps(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Bootstrap(..)))
            .count()
    }

    fn new_kernel(&self) -> KernelId {
        let n = self.next_kernel.fetch_add(1, Ordering::SeqCst) + 1;
        KernelId::new(format!("kernel-{}", n))
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl KernelBackend for RecordingBackend {
    async fn start_session(&self, options: &SessionOptions) -> Result<KernelId, KernelError> {
        self.record(Call::Start(options.path.clone()));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(KernelError::Other(anyhow::anyhow!("kernelspec not found")));
        }
        Ok(self.new_kernel())
    }

    async fn execute(&self, kernel: &KernelId, code: &str) -> Result<(), KernelError> {
        self.record(Call::Execute(kernel.clone(), code.to_string()));
        Ok(())
    }

    async fn execute_to_completion(
        &self,
        kernel: &KernelId,
        code: &str,
    ) -> Result<(), KernelError> {
        self.record(Call::Bootstrap(kernel.clone(), code.to_string()));
        if self.hang_bootstrap.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_bootstrap.load(Ordering::SeqCst) {
            return Err(KernelError::ExecutionFailed("ModuleNotFoundError".into()));
        }
        Ok(())
    }

    async fn send_comm(
        &self,
        kernel: &KernelId,
        comm_id: &str,
        data: Value,
    ) -> Result<(), KernelError> {
        self.record(Call::SendComm(kernel.clone(), comm_id.to_string(), data));
        Ok(())
    }

    async fn restart(&self, kernel: &KernelId) -> Result<(), KernelError> {
        self.record(Call::Restart(kernel.clone()));
        Ok(())
    }

    async fn change_kernel(
        &self,
        from: &KernelId,
        kernel_name: &str,
    ) -> Result<KernelId, KernelError> {
        self.record(Call::ChangeKernel(from.clone(), kernel_name.to_string()));
        Ok(self.new_kernel())
    }

    async fn shutdown(&self, kernel: &KernelId) -> Result<(), KernelError> {
        self.record(Call::Shutdown(kernel.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDisplay {
    shown: StdMutex<Vec<Value>>,
}

impl RecordingDisplay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shown(&self) -> Vec<Value> {
        self.shown.lock().unwrap().clone()
    }
}

impl DisplaySink for RecordingDisplay {
    fn set_display(&self, content: &Value) {
        self.shown.lock().unwrap().push(content.clone());
    }
}
