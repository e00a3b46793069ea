//! Shared side-channel types for kernel-router front ends.
//!
//! This crate provides the closed, typed vocabulary spoken across the
//! kernel side-channel and the subscriber bus:
//!
//! - [`MessageKind`]: the `widget` tag carried by inbound frames
//! - [`InboundFrame`]: a classified inbound payload, with fallbacks for
//!   unrecognized or untagged shapes
//! - [`Action`]: subscriber-originated requests (`execute`, `model-add`,
//!   `model-remove`, `forward`)
//! - [`RouterEvent`]: what subscribers observe, serialized as `{type, data}`
//!
//! Unknown tags and actions never fail to parse. They land in explicit
//! fallback variants so new protocol tags can appear without breaking
//! existing subscribers.

mod action;
mod event;
mod frame;
mod kind;

pub use action::Action;
pub use event::{RouterEvent, SessionStatus, DISCONNECTED};
pub use frame::{InboundFrame, TAG_KEY};
pub use kind::MessageKind;
