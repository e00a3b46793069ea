//! Dispatch in both directions between the side-channel and subscribers.
//!
//! Inbound frames are classified by tag and either published on the bus
//! or, for editor updates, pushed to the display. Outbound actions run
//! code on the kernel, mutate the model, or get republished under a new
//! tag. Model mutations are published as `model` events and mirrored to
//! the display.

use std::sync::Arc;

use log::{debug, warn};
use router_protocol::{Action, InboundFrame, MessageKind, RouterEvent};
use serde_json::{json, Value};

use crate::backend::{DisplaySink, KernelBackend, KernelError, KernelId};
use crate::bus::SubscriberBus;
use crate::model::{Model, ModelChange};

const MODEL_OWNER: &str = "router";

/// What dispatching did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published on the bus.
    Published,
    /// Pushed to the display only.
    Displayed,
    /// Applied to the model.
    Applied,
    /// Sent to the kernel.
    Sent,
    /// Logged and dropped.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No kernel attached to the session")]
    NoKernel,
    #[error("Kernel request failed: {0}")]
    Kernel(#[from] KernelError),
}

#[derive(Clone)]
pub struct MessageRouter {
    bus: SubscriberBus<RouterEvent>,
    model: Model,
    display: Arc<dyn DisplaySink>,
    backend: Arc<dyn KernelBackend>,
}

impl MessageRouter {
    pub fn new(
        bus: SubscriberBus<RouterEvent>,
        model: Model,
        display: Arc<dyn DisplaySink>,
        backend: Arc<dyn KernelBackend>,
    ) -> Self {
        let router = Self {
            bus,
            model,
            display,
            backend,
        };
        router.watch_model();
        router
    }

    fn watch_model(&self) {
        let bus = self.bus.clone();
        let display = self.display.clone();
        self.model
            .changed()
            .subscribe(MODEL_OWNER, move |change: &ModelChange| {
                display.set_display(&Value::from(change.ids.clone()));
                bus.publish(RouterEvent::Model {
                    ids: change.ids.clone(),
                });
            });
    }

    /// Stop mirroring model changes.
    pub fn detach_model(&self) {
        self.model.changed().unsubscribe(MODEL_OWNER);
    }

    pub fn bus(&self) -> &SubscriberBus<RouterEvent> {
        &self.bus
    }

    /// Classify a frame from the side-channel and hand it on.
    pub fn dispatch_inbound(&self, payload: Value) -> DispatchOutcome {
        match InboundFrame::classify(payload) {
            InboundFrame::EditorUpdate(values) => {
                self.display.set_display(&json!({ "values": values }));
                DispatchOutcome::Displayed
            }
            InboundFrame::Unrecognized { tag, .. } => {
                warn!("[router] Frame tagged {} not recognized", tag);
                DispatchOutcome::Ignored
            }
            InboundFrame::Untagged(payload) => {
                debug!("[router] Untagged frame: {}", payload);
                DispatchOutcome::Ignored
            }
            frame => match frame.into_parts() {
                Some((kind, data)) => {
                    self.bus.publish(RouterEvent::Message { kind, data });
                    DispatchOutcome::Published
                }
                None => DispatchOutcome::Ignored,
            },
        }
    }

    /// Carry out a subscriber action against the session's current kernel.
    pub async fn dispatch_outbound(
        &self,
        action: Action,
        kernel: Option<&KernelId>,
    ) -> Result<DispatchOutcome, DispatchError> {
        match action {
            Action::Execute { code } => {
                let kernel = kernel.ok_or(DispatchError::NoKernel)?;
                self.backend.execute(kernel, &code).await?;
                Ok(DispatchOutcome::Sent)
            }
            Action::ModelAdd { rid, data } => {
                self.model.append(rid, data);
                Ok(DispatchOutcome::Applied)
            }
            Action::ModelRemove { rid } => {
                self.model.remove(&rid);
                Ok(DispatchOutcome::Applied)
            }
            Action::Forward { target, content } => {
                self.bus.publish(RouterEvent::Message {
                    kind: MessageKind::from(target.as_str()),
                    data: content,
                });
                Ok(DispatchOutcome::Published)
            }
            Action::Unrecognized { action, .. } => {
                warn!("[router] Action {} not recognized", action);
                Ok(DispatchOutcome::Ignored)
            }
            Action::Invalid { action, reason } => {
                warn!("[router] Malformed {} action: {}", action, reason);
                Ok(DispatchOutcome::Ignored)
            }
        }
    }
}
