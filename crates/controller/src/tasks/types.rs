use crate::membership::MembershipIndex;
use crate::store::{ObjectStore, StoreError};
use crate::tasks::config::ControllerConfig;
use crate::tasks::rate_limit::RateLimiter;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Label that places a namespace in a class and marks generated children
pub const DEFAULT_MEMBERSHIP_LABEL: &str = "namespaceclass.akuity.io/name";

/// Finalizer held on classes while `deletionPolicy: Cascade` is active
pub const NAMESPACECLASS_FINALIZER_NAME: &str = "namespaceclass.akuity.io/finalizer";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Object store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error("Missing object key")]
    MissingObjectKey,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconciliation
pub struct Context<S> {
    pub store: Arc<S>,
    pub membership: Arc<dyn MembershipIndex>,
    pub config: Arc<ControllerConfig>,
    /// Per-class retry history behind the error policy
    pub limiter: Arc<RateLimiter<String>>,
    pub shutdown: CancellationToken,
}

impl<S> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            membership: Arc::clone(&self.membership),
            config: Arc::clone(&self.config),
            limiter: Arc::clone(&self.limiter),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: ObjectStore + 'static> Context<S> {
    /// Context using label-based membership on `config.membership_label`.
    pub fn with_label_membership(store: Arc<S>, config: ControllerConfig) -> Self {
        let membership = Arc::new(crate::membership::LabelMembership::new(
            Arc::clone(&store),
            config.membership_label.clone(),
        ));
        Self {
            store,
            membership,
            limiter: Arc::new(RateLimiter::from_config(&config.queue)),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie in-flight reconciliations to `shutdown`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}
