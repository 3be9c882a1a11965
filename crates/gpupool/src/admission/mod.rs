//! Admission webhooks: the pool validator/defaulter pair and the pod
//! validator/defaulter pair.
//!
//! The handlers in the submodules are transport-free — they take decoded
//! admission requests and return responses — and [`server`] adapts them
//! onto the webhook HTTP surface, mapping decode failures to 400/422 and
//! policy denials to an allowed=false response carrying a 403 result.

pub mod pod;
pub mod pool;
pub mod review;
pub mod server;

use kube::Client;
use thiserror::Error;

use crate::moduleconfig::SettingsStore;

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The raw payload was not JSON at all.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Valid JSON that is not an admission review, or a review whose
    /// object cannot be decoded as the expected kind.
    #[error("unprocessable admission review: {0}")]
    Unprocessable(String),
    /// Cluster reads needed for the decision failed.
    #[error(transparent)]
    Internal(#[from] kube::Error),
}

/// Shared dependencies of all webhook handlers.
#[derive(Clone)]
pub struct Webhooks {
    pub client: Client,
    pub settings: SettingsStore,
}

impl Webhooks {
    pub fn new(client: Client, settings: SettingsStore) -> Self {
        Webhooks { client, settings }
    }
}
