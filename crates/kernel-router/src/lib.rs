//! kernel-router - Session-coupled side-channel router for Jupyter kernels.
//!
//! A [`Master`](master::Master) component owns one notebook session and one
//! named comm on that session's kernel. Frames the kernel sends on the comm
//! are classified and fanned out to subscribers; actions subscribers publish
//! are executed on the kernel, applied to a shared model, or republished.
//!
//! The side-channel is re-registered whenever the kernel identity changes or
//! the kernel comes back from a restart, and at most one registration is
//! live at any time.

pub mod backend;
pub mod bus;
pub mod channel;
pub mod commands;
pub mod config;
pub mod documents;
pub mod jupyter;
pub mod master;
pub mod model;
pub mod router;
pub mod session;

#[cfg(test)]
mod testing;

pub use backend::{
    DisplaySink, DocumentError, DocumentProvider, KernelBackend, KernelError, KernelEvent,
    KernelId, KernelStatus, NoDocuments, NullDisplay, SessionOptions,
};
pub use bus::{SubscriberBus, SubscriptionId};
pub use config::RouterConfig;
pub use master::{InitError, Input, InputSender, Master, ReadySignal};
pub use router_protocol::{Action, MessageKind, RouterEvent, SessionStatus};
