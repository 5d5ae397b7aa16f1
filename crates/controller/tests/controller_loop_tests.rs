//! Controller runtime wiring driven against the in-memory object store
//!
//! The kube applier runs with the same reconcile function, error policy and
//! concurrency settings as the deployed controller. Watch events are fed by
//! hand through the label tracker and trigger mapper.

use controller::store::{InjectedFailure, MemoryStore, Verb};
use controller::tasks::namespaceclass::{error_policy, reconcile, NamespaceClassReconciler};
use controller::tasks::trigger::{LabelTracker, TriggerMapper};
use controller::tasks::types::{Context, DEFAULT_MEMBERSHIP_LABEL};
use controller::tasks::{controller_settings, watch};
use controller::{
    ControllerConfig, DeletionPolicy, Error, NamespaceClass, NamespaceClassSpec, ObjectStore,
    ServiceAccountTemplate,
};
use futures::channel::mpsc;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use kube::api::ObjectMeta;
use kube::runtime::controller::{applier, trigger_with, Action, ReconcileRequest};
use kube::runtime::reflector::{self, store::Writer, ObjectRef};
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SA: &str = "admin-service-account";

/// Passes running right now, and the most seen at once
#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    reconciler: Arc<NamespaceClassReconciler<MemoryStore>>,
    classes: Writer<NamespaceClass>,
    requests: mpsc::UnboundedSender<ObjectRef<NamespaceClass>>,
    namespaces: mpsc::UnboundedSender<Event<Namespace>>,
    accounts: mpsc::UnboundedSender<Event<ServiceAccount>>,
    gauge: Arc<Gauge>,
    shutdown: CancellationToken,
    applier: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(ControllerConfig::default(), Duration::ZERO)
    }

    /// Every pass holds its worker for `hold` before reconciling.
    fn start_with(config: ControllerConfig, hold: Duration) -> Self {
        let store = Arc::new(MemoryStore::default());
        let settings = controller_settings(&config);
        let shutdown = CancellationToken::new();
        let ctx = Context::with_label_membership(Arc::clone(&store), config)
            .with_shutdown(shutdown.clone());
        let mapper = TriggerMapper::new(Arc::clone(&ctx.membership));

        let (requests, direct) = mpsc::unbounded::<ObjectRef<NamespaceClass>>();
        let (namespaces, namespace_events) = mpsc::unbounded();
        let (accounts, account_events) = mpsc::unbounded();
        let queue = stream::select_all(vec![
            direct
                .map(|class| Ok::<_, watcher::Error>(ReconcileRequest::from(class)))
                .boxed(),
            trigger_with(
                watch::track_labels(
                    namespace_events.map(Ok::<_, watcher::Error>),
                    LabelTracker::new(Arc::clone(&ctx.membership)),
                ),
                mapper.router::<Namespace>(),
            )
            .boxed(),
            trigger_with(
                watch::track_labels(
                    account_events.map(Ok::<_, watcher::Error>),
                    LabelTracker::new(Arc::clone(&ctx.membership)),
                ),
                mapper.router::<ServiceAccount>(),
            )
            .boxed(),
        ])
        .take_until(shutdown.clone().cancelled_owned());

        let (reader, mut classes) = reflector::store::<NamespaceClass>();
        classes.apply_watcher_event(&Event::Init);
        classes.apply_watcher_event(&Event::InitDone);

        let reconciler = Arc::new(NamespaceClassReconciler::new(ctx));
        let gauge = Arc::new(Gauge::default());
        let running = Arc::clone(&gauge);
        let applier = tokio::spawn(
            applier(
                move |class, reconciler| {
                    let gauge = Arc::clone(&running);
                    Box::pin(async move {
                        gauge.enter();
                        tokio::time::sleep(hold).await;
                        let result = reconcile(class, reconciler).await;
                        gauge.exit();
                        result
                    })
                },
                error_policy,
                Arc::clone(&reconciler),
                reader,
                queue,
                settings,
            )
            .for_each(|_| async {}),
        );

        Self {
            store,
            reconciler,
            classes,
            requests,
            namespaces,
            accounts,
            gauge,
            shutdown,
            applier,
        }
    }

    /// Store the class, reflect it into the cache and trigger it.
    fn add_class(&mut self, class: NamespaceClass) {
        let stored = self.store.seed(class).unwrap();
        self.classes.apply_watcher_event(&Event::Apply(stored.clone()));
        self.requests
            .unbounded_send(ObjectRef::from_obj(&stored))
            .unwrap();
    }

    fn namespace_event(&self, event: Event<Namespace>) {
        self.namespaces.unbounded_send(event).unwrap();
    }

    fn account_event(&self, event: Event<ServiceAccount>) {
        self.accounts.unbounded_send(event).unwrap();
    }

    fn account(&self, namespace: &str) -> Option<ServiceAccount> {
        self.store.fetch(Some(namespace), SA)
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.applier.await.unwrap();
    }
}

fn namespace(name: &str, class: Option<&str>) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: class.map(|class| {
                BTreeMap::from([(DEFAULT_MEMBERSHIP_LABEL.to_string(), class.to_string())])
            }),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

fn class(name: &str, automount: bool) -> NamespaceClass {
    NamespaceClass::new(
        name,
        NamespaceClassSpec {
            network_policy_template: None,
            service_account_template: Some(ServiceAccountTemplate {
                automount_service_account_token: Some(automount),
            }),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn class_event_converges_every_member() {
    let mut harness = Harness::start();
    for ns in ["team-a", "team-b", "team-c"] {
        harness.store.seed(namespace(ns, Some("web"))).unwrap();
    }
    harness.add_class(class("web", true));
    harness.settle().await;

    for ns in ["team-a", "team-b", "team-c"] {
        let account = harness.account(ns).unwrap();
        assert_eq!(account.automount_service_account_token, Some(true));
    }
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn workers_bound_parallel_passes() {
    let config = ControllerConfig {
        workers: 5,
        ..ControllerConfig::default()
    };
    let mut harness = Harness::start_with(config, Duration::from_secs(1));
    for i in 0..20 {
        let name = format!("class-{i}");
        harness
            .store
            .seed(namespace(&format!("team-{i}"), Some(&name)))
            .unwrap();
        harness.add_class(class(&name, true));
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.gauge.peak(), 5);
    for i in 0..20 {
        assert!(harness.account(&format!("team-{i}")).is_some());
    }
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn newly_labeled_namespace_is_picked_up() {
    let mut harness = Harness::start();
    harness.store.seed(namespace("team-a", None)).unwrap();
    harness.add_class(class("web", false));
    harness.settle().await;
    assert!(harness.account("team-a").is_none());

    let labeled = harness
        .store
        .mutate::<Namespace>(None, "team-a", |ns| {
            ns.labels_mut()
                .insert(DEFAULT_MEMBERSHIP_LABEL.to_string(), "web".to_string());
        })
        .unwrap();
    harness.namespace_event(Event::Apply(labeled));
    harness.settle().await;

    assert!(harness.account("team-a").is_some());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn removing_the_label_prunes_in_cascade_mode() {
    let config = ControllerConfig {
        deletion_policy: DeletionPolicy::Cascade,
        ..ControllerConfig::default()
    };
    let mut harness = Harness::start_with(config, Duration::ZERO);
    let member = harness.store.seed(namespace("team-a", Some("web"))).unwrap();
    harness.namespace_event(Event::Apply(member));
    harness.add_class(class("web", true));
    harness.settle().await;
    assert!(harness.account("team-a").is_some());

    let unlabeled = harness
        .store
        .mutate::<Namespace>(None, "team-a", |ns| {
            ns.labels_mut().remove(DEFAULT_MEMBERSHIP_LABEL);
        })
        .unwrap();
    // The label selector watch reports the namespace as gone
    harness.namespace_event(Event::Delete(unlabeled));
    harness.settle().await;

    assert!(harness.account("team-a").is_none());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let mut harness = Harness::start();
    harness.store.seed(namespace("team-a", Some("web"))).unwrap();
    harness
        .store
        .fail_next(Verb::Create, "ServiceAccount", InjectedFailure::Unavailable);
    harness
        .store
        .fail_next(Verb::Create, "ServiceAccount", InjectedFailure::Unavailable);

    harness.add_class(class("web", true));
    harness.settle().await;

    assert_eq!(harness.store.count(Verb::Create, "ServiceAccount"), 3);
    assert!(harness.account("team-a").is_some());
    let limiter = &harness.reconciler.context().limiter;
    assert_eq!(limiter.retries(&"web".to_string()), 0);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deleted_child_is_recreated() {
    let mut harness = Harness::start();
    harness.store.seed(namespace("team-a", Some("web"))).unwrap();
    harness.add_class(class("web", true));
    harness.settle().await;

    let account = harness.account("team-a").unwrap();
    harness.account_event(Event::Apply(account.clone()));
    harness
        .store
        .delete::<ServiceAccount>(Some("team-a"), &account.name_any())
        .await
        .unwrap();
    harness.account_event(Event::Delete(account));
    harness.settle().await;

    assert!(harness.account("team-a").is_some());
    harness.stop().await;
}

#[tokio::test]
async fn error_policy_backs_off_until_a_pass_succeeds() {
    let mut config = ControllerConfig::default();
    config.queue.base_delay_millis = 100;
    let store = Arc::new(MemoryStore::default());
    let web = Arc::new(store.seed(class("web", true)).unwrap());
    let reconciler = Arc::new(NamespaceClassReconciler::new(
        Context::with_label_membership(Arc::clone(&store), config),
    ));

    let delays: Vec<Action> = (0..3)
        .map(|_| error_policy(Arc::clone(&web), &Error::MissingObjectKey, Arc::clone(&reconciler)))
        .collect();
    assert_eq!(
        delays,
        vec![
            Action::requeue(Duration::from_millis(100)),
            Action::requeue(Duration::from_millis(200)),
            Action::requeue(Duration::from_millis(400)),
        ]
    );

    let action = reconcile(Arc::clone(&web), Arc::clone(&reconciler))
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(reconciler.context().limiter.retries(&"web".to_string()), 0);
    assert_eq!(
        error_policy(web, &Error::MissingObjectKey, reconciler),
        Action::requeue(Duration::from_millis(100))
    );
}

#[tokio::test]
async fn shutdown_abandons_the_pass() {
    let store = Arc::new(MemoryStore::default());
    store.seed(namespace("team-a", Some("web"))).unwrap();
    let web = Arc::new(store.seed(class("web", true)).unwrap());
    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(NamespaceClassReconciler::new(
        Context::with_label_membership(Arc::clone(&store), ControllerConfig::default())
            .with_shutdown(shutdown.clone()),
    ));

    shutdown.cancel();
    let err = reconcile(web, reconciler).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(store.write_count(), 0);
}
