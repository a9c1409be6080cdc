//! The reconciliation engine: decision procedure, tick loop, and the value
//! bundle handed to the renderer.

mod reconciler;
mod values;
mod worker;

pub use reconciler::{Controller, ReconcileError};
pub use worker::ReconcileWorker;
