//! Application-level orchestration.
//!
//! This module owns the operation lifecycle (gating, start, cancel) and the multi-step
//! sequences built on the process runner. UI/CLI layers talk to it through
//! [`UiCommand`]s and receive [`crate::model::SessionEvent`]s back.

mod controller;
mod sequencer;

pub(crate) use controller::{run_controller, UiCommand};
