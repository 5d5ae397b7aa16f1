use crate::crds::NamespaceClass;
use crate::store::{KindRegistry, KubeStore, MatchLabels, ObjectStore};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::controller::{self, Controller};
use kube::{Api, Client, ResourceExt};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub mod config;
pub mod namespaceclass;
pub mod rate_limit;
pub mod trigger;
pub mod types;
pub mod watch;

// Re-export commonly used items
pub use config::{ControllerConfig, DeletionPolicy};
pub use namespaceclass::{error_policy, reconcile, NamespaceClassReconciler, ReconcileOutcome};
pub use types::{Error, Result};

use trigger::{LabelTracker, TriggerMapper};
use types::Context;

/// Runtime settings for the controller: at most `workers` classes in flight.
pub fn controller_settings(config: &ControllerConfig) -> controller::Config {
    let concurrency = u16::try_from(config.workers).unwrap_or(u16::MAX);
    controller::Config::default().concurrency(concurrency)
}

/// Config file to read: an explicitly named path must exist, otherwise the
/// mounted default is used (and may itself be absent).
pub fn resolve_config_path<'a>(explicit: Option<&'a str>, default: &'a str) -> Result<&'a str> {
    match explicit {
        Some(path) if Path::new(path).exists() => Ok(path),
        Some(path) => Err(Error::ConfigError(format!(
            "config file {path} does not exist"
        ))),
        None => Ok(default),
    }
}

/// Load the mounted configuration, falling back to defaults when the file is
/// missing or unreadable. Invalid settings are an error either way.
pub fn load_controller_config(config_path: &str) -> Result<ControllerConfig> {
    debug!("Loading controller configuration from {}", config_path);

    let config = match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            debug!("Successfully loaded controller configuration");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration, using defaults: {}", e);
            ControllerConfig::default()
        }
    };

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!("Configuration validation passed");
    Ok(config)
}

/// Main entry point for the NamespaceClass controller
#[instrument(skip_all, fields(workers = config.workers, deletion_policy = %config.deletion_policy))]
pub async fn run_namespaceclass_controller(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting NamespaceClass controller");

    let registry = KindRegistry::with_defaults();
    for kind in registry.kinds() {
        debug!(
            "Registered kind {} ({}, namespaced={})",
            kind.resource.kind,
            kind.resource.api_version,
            kind.is_namespaced()
        );
    }
    let store = Arc::new(KubeStore::new(client.clone(), registry));
    let membership_label = config.membership_label.clone();
    let settings = controller_settings(&config);
    let context = Context::with_label_membership(Arc::clone(&store), config)
        .with_shutdown(shutdown.clone());

    // Startup visibility: report the classes the controller will pick up
    match store
        .list::<NamespaceClass>(None, &MatchLabels::new())
        .await
    {
        Ok(classes) => {
            info!("Controller startup: found {} NamespaceClass(es)", classes.len());
            for class in classes {
                debug!(
                    "Existing NamespaceClass: name={}, generation={}, observed={}",
                    class.name_any(),
                    class.metadata.generation.unwrap_or_default(),
                    class.observed_generation()
                );
            }
        }
        Err(e) => error!("Failed to list NamespaceClasses at startup: {}", e),
    }

    let membership = Arc::clone(&context.membership);
    let mapper = TriggerMapper::new(Arc::clone(&membership));
    let (classes, cache) = watch::class_triggers(Api::all(client.clone()));
    let namespaces = watch::labeled_triggers(
        Api::<Namespace>::all(client.clone()),
        &membership_label,
        LabelTracker::new(Arc::clone(&membership)),
    );
    let policies = watch::labeled_triggers(
        Api::<NetworkPolicy>::all(client.clone()),
        &membership_label,
        LabelTracker::new(Arc::clone(&membership)),
    );
    let accounts = watch::labeled_triggers(
        Api::<ServiceAccount>::all(client),
        &membership_label,
        LabelTracker::new(membership),
    );

    let reconciler = Arc::new(NamespaceClassReconciler::new(context));
    info!("👀 Watching NamespaceClasses, Namespaces, NetworkPolicies and ServiceAccounts");

    Controller::for_stream(classes, cache)
        .watches_stream(namespaces, mapper.router::<Namespace>())
        .watches_stream(policies, mapper.router::<NetworkPolicy>())
        .watches_stream(accounts, mapper.router::<ServiceAccount>())
        .with_config(settings)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(
            reconcile::<KubeStore>,
            error_policy::<KubeStore>,
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok((class, action)) => {
                    debug!(class = %class.name, ?action, "NamespaceClass reconciliation completed");
                }
                Err(e) => {
                    warn!(error = %e, "NamespaceClass reconciliation error");
                }
            }
        })
        .await;

    info!("NamespaceClass controller stopped");
    Ok(())
}
