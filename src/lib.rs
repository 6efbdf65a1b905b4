// src/lib.rs

pub mod blockchain;
pub mod core;
pub mod reconciler;
pub mod scheduler;
pub mod storage;

pub use crate::core::domain::{ConfirmationKey, Outcome};
pub use crate::core::errors::ReconcileError;
pub use reconciler::Reconciler;
pub use scheduler::RetryScheduler;
