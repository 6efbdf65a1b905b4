pub mod config;
pub mod domain;
pub mod errors;

pub use domain::{ConfirmationKey, MultisigConfirmation, MultisigTransaction, Outcome, StoredConfirmation};
pub use errors::ReconcileError;
