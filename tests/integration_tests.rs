use podwatcher::builder;
use podwatcher::k8s_types::{apps, core, sregig};
use podwatcher::podwatcher::{selector_labels, PodWatcher, PodWatcherStatus};
use podwatcher::prelude::*;
use podwatcher::testkit::{FakeStore, Operation};

use podwatcher::serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use std::future::Future;

static PODWATCHER: &K8sType = sregig::v1alpha1::Podwatcher;
static DEPLOYMENT: &K8sType = apps::v1::Deployment;
static POD: &K8sType = core::v1::Pod;

const NAMESPACE: &str = "default";

fn run<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
        .block_on(future)
}

fn setup() -> (FakeStore, Reconciler<FakeStore>) {
    let _ = env_logger::try_init();
    let store = FakeStore::new();
    let reconciler = Reconciler::new(store.clone(), WorkloadTemplate::default());
    (store, reconciler)
}

fn reconcile(reconciler: &Reconciler<FakeStore>, name: &str) -> Result<Action, ReconcileError> {
    run(reconciler.reconcile(&ObjectId::new(NAMESPACE, name), &CancellationToken::new()))
}

fn pod(podwatcher_name: &str, pod_name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "namespace": NAMESPACE,
            "name": pod_name,
            "labels": selector_labels(podwatcher_name),
        }
    })
}

fn with_status(mut podwatcher: PodWatcher, pods: &[&str]) -> PodWatcher {
    podwatcher.status = Some(PodWatcherStatus {
        pods: pods.iter().map(|p| p.to_string()).collect(),
    });
    podwatcher
}

/// Seeds a Podwatcher along with the Deployment the operator would have created for it
fn seed_converged(store: &FakeStore, podwatcher: PodWatcher) -> PodWatcher {
    let stored = store.seed(PODWATCHER, &podwatcher);
    let podwatcher: PodWatcher = stored.deserialize().expect("failed to deserialize podwatcher");
    store.seed(
        DEPLOYMENT,
        &builder::build(&podwatcher, &WorkloadTemplate::default()),
    );
    podwatcher
}

fn replicas(store: &FakeStore, name: &str) -> Option<i64> {
    store
        .stored(DEPLOYMENT, (NAMESPACE, name))
        .and_then(|d| d.pointer("/spec/replicas").and_then(Value::as_i64))
}

fn status_pods(store: &FakeStore, name: &str) -> Option<Value> {
    store
        .stored(PODWATCHER, (NAMESPACE, name))
        .and_then(|pw| pw.pointer("/status/pods").cloned())
}

#[test]
fn new_podwatcher_gets_a_deployment_then_settles() {
    let (store, reconciler) = setup();
    store.seed(PODWATCHER, &PodWatcher::new(NAMESPACE, "web", 3));

    let action = reconcile(&reconciler, "web").expect("first reconcile failed");
    assert_eq!(Action::requeue_now(), action);

    let writes = store.writes();
    assert_eq!(1, writes.len());
    assert_eq!(Operation::Create, writes[0].operation);
    assert_eq!("Deployment", writes[0].kind);
    assert_eq!(Some(3), replicas(&store, "web"));

    let deployment = store
        .stored(DEPLOYMENT, (NAMESPACE, "web"))
        .expect("deployment was not stored");
    assert_eq!(
        json!("Podwatcher"),
        deployment["metadata"]["ownerReferences"][0]["kind"]
    );
    assert_eq!(
        json!("fake-uid-1"),
        deployment["metadata"]["ownerReferences"][0]["uid"]
    );

    // the Deployment controller starts the pods before the requeued reconcile runs
    for name in &["web-x", "web-y", "web-z"] {
        store.seed(POD, &pod("web", name));
    }
    store.clear_writes();
    let action = reconcile(&reconciler, "web").expect("second reconcile failed");
    assert_eq!(Action::Done, action);

    let writes = store.writes();
    assert_eq!(1, writes.len());
    assert_eq!(Operation::UpdateStatus, writes[0].operation);
    assert_eq!("Podwatcher", writes[0].kind);
    assert_eq!(Some(deployment), store.stored(DEPLOYMENT, (NAMESPACE, "web")));
    assert_eq!(
        Some(json!(["web-x", "web-y", "web-z"])),
        status_pods(&store, "web")
    );

    store.clear_writes();
    let action = reconcile(&reconciler, "web").expect("third reconcile failed");
    assert_eq!(Action::Done, action);
    assert!(store.writes().is_empty());
}

#[test]
fn reconcile_is_idempotent_once_converged() {
    let (store, reconciler) = setup();
    let podwatcher = with_status(PodWatcher::new(NAMESPACE, "web", 2), &["web-a", "web-b"]);
    seed_converged(&store, podwatcher);
    store.seed(POD, &pod("web", "web-b"));
    store.seed(POD, &pod("web", "web-a"));

    for _ in 0..3 {
        let action = reconcile(&reconciler, "web").expect("reconcile failed");
        assert_eq!(Action::Done, action);
    }
    assert!(store.writes().is_empty());
    assert_eq!(0, store.call_count(Operation::Create));
    assert_eq!(0, store.call_count(Operation::Update));
    assert_eq!(0, store.call_count(Operation::UpdateStatus));
}

#[test]
fn deployment_is_resized_to_match_spec() {
    let (store, reconciler) = setup();
    let podwatcher = seed_converged(&store, PodWatcher::new(NAMESPACE, "web", 2));
    let status_before = status_pods(&store, "web");

    let mut resized = podwatcher;
    resized.spec.size = 5;
    let stored = store
        .stored(PODWATCHER, (NAMESPACE, "web"))
        .expect("podwatcher was not stored");
    let mut body = serde_json::to_value(&resized).expect("failed to serialize");
    body["metadata"]["resourceVersion"] = stored["metadata"]["resourceVersion"].clone();
    run(reconciler.store().update(PODWATCHER, &body)).expect("failed to resize podwatcher");
    store.clear_writes();

    let action = reconcile(&reconciler, "web").expect("reconcile failed");
    assert_eq!(Action::Done, action);

    let writes = store.writes();
    assert_eq!(1, writes.len());
    assert_eq!(Operation::Update, writes[0].operation);
    assert_eq!("Deployment", writes[0].kind);
    assert_eq!(Some(5), replicas(&store, "web"));
    assert_eq!(status_before, status_pods(&store, "web"));
}

#[test]
fn status_follows_pod_membership() {
    let (store, reconciler) = setup();
    let podwatcher = with_status(PodWatcher::new(NAMESPACE, "web", 3), &["web-a", "web-b"]);
    seed_converged(&store, podwatcher);
    for name in &["web-c", "web-a", "web-b"] {
        store.seed(POD, &pod("web", name));
    }
    // pods of other Podwatchers and other namespaces don't count
    store.seed(POD, &pod("api", "api-a"));
    let mut elsewhere = pod("web", "web-z");
    elsewhere["metadata"]["namespace"] = json!("other");
    store.seed(POD, &elsewhere);

    let action = reconcile(&reconciler, "web").expect("reconcile failed");
    assert_eq!(Action::Done, action);

    let writes = store.writes();
    assert_eq!(1, writes.len());
    assert_eq!(Operation::UpdateStatus, writes[0].operation);
    assert_eq!(
        Some(json!(["web-a", "web-b", "web-c"])),
        status_pods(&store, "web")
    );
    assert_eq!(Some(3), replicas(&store, "web"));
}

#[test]
fn status_in_a_different_order_is_left_alone() {
    let (store, reconciler) = setup();
    let podwatcher = with_status(PodWatcher::new(NAMESPACE, "web", 2), &["web-b", "web-a"]);
    seed_converged(&store, podwatcher);
    store.seed(POD, &pod("web", "web-a"));
    store.seed(POD, &pod("web", "web-b"));

    let action = reconcile(&reconciler, "web").expect("reconcile failed");
    assert_eq!(Action::Done, action);
    assert!(store.writes().is_empty());
    assert_eq!(Some(json!(["web-b", "web-a"])), status_pods(&store, "web"));
}

#[test]
fn deleted_podwatcher_is_gone_without_writes() {
    let (store, reconciler) = setup();
    seed_converged(&store, PodWatcher::new(NAMESPACE, "web", 2));
    store.remove(PODWATCHER, (NAMESPACE, "web"));

    let action = reconcile(&reconciler, "web").expect("reconcile failed");
    assert_eq!(Action::Gone, action);
    assert!(store.writes().is_empty());
    assert_eq!(0, store.call_count(Operation::List));

    let action = reconcile(&reconciler, "never-existed").expect("reconcile failed");
    assert_eq!(Action::Gone, action);
}

#[test]
fn transient_errors_are_surfaced_and_retry_converges() {
    let (store, reconciler) = setup();
    seed_converged(&store, PodWatcher::new(NAMESPACE, "web", 1));
    store.seed(POD, &pod("web", "web-a"));
    store.fail_next(Operation::List, StoreError::transient("connection reset"));

    let result = reconcile(&reconciler, "web");
    assert_eq!(
        Err(ReconcileError::Store(StoreError::transient("connection reset"))),
        result
    );
    assert!(store.writes().is_empty());

    let action = reconcile(&reconciler, "web").expect("retry failed");
    assert_eq!(Action::Done, action);
    assert_eq!(Some(json!(["web-a"])), status_pods(&store, "web"));
}

#[test]
fn cancellation_abandons_a_pending_write() {
    let (store, reconciler) = setup();
    store.seed(PODWATCHER, &PodWatcher::new(NAMESPACE, "web", 2));
    let gate = store.hold_next(Operation::Create);
    let cancel = CancellationToken::new();
    let key = ObjectId::new(NAMESPACE, "web");

    let result = run(async {
        let cancel_when_held = async {
            gate.entered().await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(reconciler.reconcile(&key, &cancel), cancel_when_held);
        gate.release();
        result
    });
    assert_eq!(Err(ReconcileError::Cancelled), result);
    assert!(store.writes().is_empty());
    assert_eq!(None, store.stored(DEPLOYMENT, (NAMESPACE, "web")));
}

#[test]
fn built_deployment_only_depends_on_the_podwatcher() {
    let (store, _) = setup();
    let stored = store.seed(PODWATCHER, &PodWatcher::new(NAMESPACE, "web", 4));
    let podwatcher: PodWatcher = stored.deserialize().expect("failed to deserialize");
    let template = WorkloadTemplate::default();

    let first = builder::build(&podwatcher, &template);
    let second = builder::build(&podwatcher.clone(), &template);
    assert_eq!(first, second);
    assert_eq!(json!(4), first["spec"]["replicas"]);
    assert_eq!(
        json!({"app": "podwatcher", "podwatcher": "web"}),
        first["spec"]["selector"]["matchLabels"]
    );
}
