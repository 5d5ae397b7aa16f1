use super::resources::{synthesize, ChildResource};
use crate::crds::NamespaceClass;
use crate::store::{ObjectStore, StoreError};
use crate::tasks::config::DeletionPolicy;
use crate::tasks::types::{Context, Error, Result, NAMESPACECLASS_FINALIZER_NAME};
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// How a reconciliation pass ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The class no longer exists
    ClassNotFound,
    /// A member namespace disappeared mid-pass; its removal triggers a new pass
    NamespaceVanished { namespace: String },
    /// The class is being deleted and its finalizer has been released
    Finalized,
    /// Every member namespace carries the desired children
    Synced { namespaces: usize },
}

enum ChildApply {
    Applied,
    NamespaceVanished,
}

pub struct NamespaceClassReconciler<S> {
    ctx: Context<S>,
}

impl<S: ObjectStore + 'static> NamespaceClassReconciler<S> {
    pub fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context<S> {
        &self.ctx
    }

    fn cascade(&self) -> bool {
        self.ctx.config.deletion_policy == DeletionPolicy::Cascade
    }

    /// Bring every member namespace of the requested class in line with its templates.
    #[instrument(skip(self), fields(class = %class_name))]
    pub async fn reconcile_class(&self, class_name: &str) -> Result<ReconcileOutcome> {
        if class_name.is_empty() {
            return Err(Error::MissingObjectKey);
        }
        debug!("Reconciling NamespaceClass");

        let Some(class) = self
            .ctx
            .store
            .get::<NamespaceClass>(None, class_name)
            .await?
        else {
            info!("NamespaceClass not found, nothing to do");
            return Ok(ReconcileOutcome::ClassNotFound);
        };

        if class.metadata.deletion_timestamp.is_some() {
            return self.finalize(class).await;
        }
        let class = self.ensure_finalizer(class).await?;

        let members = self.ctx.membership.list_members(class_name).await?;
        let labels = self.ctx.membership.owner_labels(class_name);
        debug!(members = members.len(), "Listed member namespaces");

        for namespace in &members {
            let namespace_name = namespace.name_any();
            let desired = synthesize(
                &class,
                &namespace_name,
                &self.ctx.config.children,
                &labels,
            );

            let mut applied = ChildApply::Applied;
            if let Some(policy) = desired.network_policy {
                applied = self.apply_child(policy).await?;
            }
            if matches!(applied, ChildApply::Applied) {
                if let Some(account) = desired.service_account {
                    applied = self.apply_child(account).await?;
                }
            }
            if matches!(applied, ChildApply::NamespaceVanished) {
                info!(
                    namespace = %namespace_name,
                    "Namespace disappeared during reconciliation, ending pass"
                );
                return Ok(ReconcileOutcome::NamespaceVanished {
                    namespace: namespace_name,
                });
            }
        }

        if self.cascade() {
            self.prune(&class, &members).await?;
        }

        self.patch_status(&class).await?;
        info!(namespaces = members.len(), "✅ NamespaceClass reconciled");
        Ok(ReconcileOutcome::Synced {
            namespaces: members.len(),
        })
    }

    /// Create the child if it is missing, otherwise overwrite the class-owned
    /// fields and restore the membership label.
    #[instrument(
        skip_all,
        fields(kind = %K::kind(&()), namespace = %desired.namespace().unwrap_or_default())
    )]
    async fn apply_child<K: ChildResource>(&self, desired: K) -> Result<ChildApply> {
        let namespace = desired.namespace();
        let name = desired.name_any();

        let existing = self
            .ctx
            .store
            .get::<K>(namespace.as_deref(), &name)
            .await?;
        let Some(mut existing) = existing else {
            return match self.ctx.store.create(&desired).await {
                Ok(_) => {
                    info!(%name, "Created child");
                    Ok(ChildApply::Applied)
                }
                Err(e) if e.is_not_found() => Ok(ChildApply::NamespaceVanished),
                Err(e) => Err(e.into()),
            };
        };

        let labels = existing.labels_mut();
        for (key, value) in desired.labels() {
            if labels.get(key) != Some(value) {
                debug!(%name, label = %key, "Restoring membership label");
                labels.insert(key.clone(), value.clone());
            }
        }
        desired.copy_desired_into(&mut existing);
        self.ctx.store.update(&existing).await?;
        debug!(%name, "Updated child");
        Ok(ChildApply::Applied)
    }

    /// Hold the finalizer while cascading, release it otherwise.
    async fn ensure_finalizer(&self, class: NamespaceClass) -> Result<NamespaceClass> {
        let has_finalizer = class
            .finalizers()
            .iter()
            .any(|f| f == NAMESPACECLASS_FINALIZER_NAME);
        if self.cascade() == has_finalizer {
            return Ok(class);
        }

        let mut updated = class;
        if has_finalizer {
            info!("Releasing finalizer, deletion policy is Orphan");
            updated
                .finalizers_mut()
                .retain(|f| f != NAMESPACECLASS_FINALIZER_NAME);
        } else {
            info!("Adding finalizer for cascading cleanup");
            updated
                .finalizers_mut()
                .push(NAMESPACECLASS_FINALIZER_NAME.to_string());
        }
        Ok(self.ctx.store.update(&updated).await?)
    }

    /// Clean up after a deleted class and let the deletion proceed.
    async fn finalize(&self, class: NamespaceClass) -> Result<ReconcileOutcome> {
        if !class
            .finalizers()
            .iter()
            .any(|f| f == NAMESPACECLASS_FINALIZER_NAME)
        {
            debug!("Class is terminating and holds no finalizer of ours");
            return Ok(ReconcileOutcome::Finalized);
        }

        let class_name = class.name_any();
        if self.cascade() {
            info!("🗑️ Class deleted, removing generated children");
            let names = &self.ctx.config.children;
            self.delete_children::<NetworkPolicy>(
                &class_name,
                &names.network_policy_name,
                |_| true,
            )
            .await?;
            self.delete_children::<ServiceAccount>(
                &class_name,
                &names.service_account_name,
                |_| true,
            )
            .await?;
        } else {
            info!("Class deleted, leaving generated children in place");
        }

        let mut released = class;
        released
            .finalizers_mut()
            .retain(|f| f != NAMESPACECLASS_FINALIZER_NAME);
        match self.ctx.store.update(&released).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(ReconcileOutcome::Finalized)
    }

    /// Delete children that lost their namespace membership or their template.
    async fn prune(&self, class: &NamespaceClass, members: &[Namespace]) -> Result<()> {
        let class_name = class.name_any();
        let members: BTreeSet<String> = members.iter().map(ResourceExt::name_any).collect();
        let names = &self.ctx.config.children;

        let keep_policies = class.spec.network_policy_template.is_some();
        self.delete_children::<NetworkPolicy>(&class_name, &names.network_policy_name, |ns| {
            !(keep_policies && members.contains(ns))
        })
        .await?;

        let keep_accounts = class.spec.service_account_template.is_some();
        self.delete_children::<ServiceAccount>(&class_name, &names.service_account_name, |ns| {
            !(keep_accounts && members.contains(ns))
        })
        .await?;
        Ok(())
    }

    /// Delete `name` children owned by the class in every namespace `doomed` selects.
    async fn delete_children<K: ChildResource>(
        &self,
        class_name: &str,
        name: &str,
        doomed: impl Fn(&str) -> bool + Send + Sync,
    ) -> Result<()> {
        let selector = self.ctx.membership.owned_selector(class_name);
        let children = self.ctx.store.list::<K>(None, &selector).await?;

        for child in children {
            let namespace = child.namespace().unwrap_or_default();
            if child.name_any() != name || !doomed(&namespace) {
                continue;
            }
            info!(kind = %K::kind(&()), %namespace, %name, "Deleting generated child");
            // Pinned to the listed revision: a child relabeled in between is left alone
            match self.ctx.store.delete_exact(&child).await {
                Ok(()) => {}
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Record the applied generation and the time of this pass.
    async fn patch_status(&self, class: &NamespaceClass) -> Result<()> {
        let generation = class.metadata.generation.unwrap_or_default();
        let observed = class.observed_generation().max(generation);
        let patch = json!({
            "status": {
                "observedGeneration": observed,
                "lastAppliedTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            }
        });

        match self
            .ctx
            .store
            .patch_status::<NamespaceClass>(None, &class.name_any(), &patch)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!("NamespaceClass vanished before its status could be written");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Controller entry point. Runs one pass for the class unless shutdown wins
/// the race, in which case the pass counts as failed.
pub async fn reconcile<S: ObjectStore + 'static>(
    class: Arc<NamespaceClass>,
    reconciler: Arc<NamespaceClassReconciler<S>>,
) -> Result<Action> {
    let class_name = class.name_any();
    let ctx = reconciler.context();

    let outcome = tokio::select! {
        biased;
        () = ctx.shutdown.cancelled() => Err(Error::Cancelled),
        outcome = reconciler.reconcile_class(&class_name) => outcome,
    }?;

    ctx.limiter.forget(&class_name);
    debug!(class = %class_name, ?outcome, "Reconciliation pass finished");
    Ok(Action::await_change())
}

/// Requeue a failed class after the delay the rate limiter hands out.
#[instrument(skip(class, reconciler), fields(class = %class.name_any()))]
pub fn error_policy<S: ObjectStore + 'static>(
    class: Arc<NamespaceClass>,
    error: &Error,
    reconciler: Arc<NamespaceClassReconciler<S>>,
) -> Action {
    let class_name = class.name_any();
    let limiter = &reconciler.context().limiter;
    let delay = limiter.when(&class_name);
    error!(
        error = %error,
        retries = limiter.retries(&class_name),
        ?delay,
        "NamespaceClass reconciliation failed, requeueing"
    );
    Action::requeue(delay)
}
