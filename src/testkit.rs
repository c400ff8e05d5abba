//! An in-memory `Store` for testing reconcile logic without an api server.
//!
//! `FakeStore` behaves like the api server where it matters to the reconciler: it assigns `uid`s
//! and `resourceVersion`s, rejects stale updates with `Conflict`, keeps `status` separate from the
//! rest of the object, and selects by labels. On top of that it can fail the next call of a given
//! operation, record every successful write, and hold a call open until the test releases it.
//!
//! ```
//! use podwatcher::k8s_types::sregig::v1alpha1::Podwatcher;
//! use podwatcher::podwatcher::PodWatcher;
//! use podwatcher::testkit::FakeStore;
//!
//! let store = FakeStore::new();
//! let stored = store.seed(Podwatcher, &PodWatcher::new("default", "web", 3));
//! assert_eq!("1", stored.resource_version());
//! assert!(store.writes().is_empty());
//! ```
use crate::k8s_types::K8sType;
use crate::podwatcher::labels_match;
use crate::resource::{self, K8sResource, ObjectId, ObjectIdRef};
use crate::store::{Store, StoreError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
}

impl Operation {
    pub fn is_write(self) -> bool {
        match self {
            Operation::Get | Operation::List => false,
            _ => true,
        }
    }
}

/// A successful write, as recorded in the journal
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub operation: Operation,
    pub kind: &'static str,
    pub id: ObjectId,
    /// the object as it was stored after the write
    pub stored: Value,
}

/// Returned from `FakeStore::hold_next`. The held call waits until `release` is called, or until
/// its future is dropped.
#[derive(Debug, Clone)]
pub struct Gate {
    entered: Arc<Notify>,
    released: Arc<Notify>,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            entered: Arc::new(Notify::new()),
            released: Arc::new(Notify::new()),
        }
    }

    /// Resolves once the held call has started
    pub async fn entered(&self) {
        self.entered.notified().await
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

type StoreKey = (&'static str, &'static str, ObjectId);

fn store_key(k8s_type: &'static K8sType, id: ObjectIdRef) -> StoreKey {
    (k8s_type.api_version, k8s_type.kind, id.to_owned())
}

#[derive(Debug, Default)]
struct FakeState {
    objects: BTreeMap<StoreKey, Value>,
    resource_version: u64,
    uid: u64,
    faults: VecDeque<(Operation, StoreError)>,
    gates: HashMap<Operation, Gate>,
    writes: Vec<Write>,
    calls: HashMap<Operation, usize>,
}

impl FakeState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("fake-uid-{}", self.uid)
    }

    fn take_fault(&mut self, operation: Operation) -> Option<StoreError> {
        let idx = self.faults.iter().position(|(op, _)| *op == operation)?;
        self.faults.remove(idx).map(|(_, err)| err)
    }

    /// Assigns the metadata that the store owns and inserts the object
    fn insert_new(&mut self, k8s_type: &'static K8sType, mut value: Value) -> Result<Value, StoreError> {
        let id = resource::object_id(&value)
            .ok_or_else(|| StoreError::transient("metadata.name is required"))?
            .to_owned();
        let key = store_key(k8s_type, id.as_id_ref());
        if self.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        let uid = self.next_uid();
        let resource_version = self.next_resource_version();
        {
            let obj = value
                .as_object_mut()
                .ok_or_else(|| StoreError::transient("resource must be a json object"))?;
            obj.insert("apiVersion".to_owned(), Value::from(k8s_type.api_version));
            obj.insert("kind".to_owned(), Value::from(k8s_type.kind));
            let meta = obj
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()));
            meta["uid"] = Value::from(uid);
            meta["resourceVersion"] = Value::from(resource_version);
        }
        self.objects.insert(key, value.clone());
        Ok(value)
    }

    /// Replaces a stored object. `merge` receives the stored object and the new body and returns
    /// what should be stored.
    fn replace(
        &mut self,
        k8s_type: &'static K8sType,
        body: &Value,
        merge: impl FnOnce(&Value, &Value) -> Value,
    ) -> Result<(ObjectId, Value), StoreError> {
        let id = resource::object_id(body)
            .ok_or_else(|| StoreError::transient("metadata.name is required"))?
            .to_owned();
        let key = store_key(k8s_type, id.as_id_ref());
        let stored = self.objects.get(&key).ok_or(StoreError::NotFound)?;

        if let Some(version) = resource::str_value(body, resource::RESOURCE_VERSION_POINTER) {
            if Some(version) != resource::str_value(stored, resource::RESOURCE_VERSION_POINTER) {
                return Err(StoreError::Conflict);
            }
        }

        let mut updated = merge(stored, body);
        let uid = stored["metadata"]["uid"].clone();
        updated["metadata"]["uid"] = uid;
        updated["metadata"]["resourceVersion"] = Value::from(self.next_resource_version());
        self.objects.insert(key, updated.clone());
        Ok((id, updated))
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeStore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStore {
    pub fn new() -> FakeStore {
        FakeStore::default()
    }

    fn lock(&self) -> MutexGuard<FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Puts an object into the store without recording a write. Unlike `create`, any `status` is
    /// kept as it is. Panics if the object can't be stored.
    pub fn seed(&self, k8s_type: &'static K8sType, object: &impl Serialize) -> K8sResource {
        let value = serde_json::to_value(object).expect("failed to serialize seed object");
        let stored = self
            .lock()
            .insert_new(k8s_type, value)
            .expect("failed to seed object");
        K8sResource::from_value(stored).expect("seeded object is invalid")
    }

    /// Removes an object without recording a write, as if it had been deleted by someone else
    pub fn remove<'a>(&self, k8s_type: &'static K8sType, id: impl Into<ObjectIdRef<'a>>) -> Option<Value> {
        let key = store_key(k8s_type, id.into());
        self.lock().objects.remove(&key)
    }

    /// Returns the stored object, without counting as a call
    pub fn stored<'a>(&self, k8s_type: &'static K8sType, id: impl Into<ObjectIdRef<'a>>) -> Option<Value> {
        let key = store_key(k8s_type, id.into());
        self.lock().objects.get(&key).cloned()
    }

    /// Makes the next call of `operation` fail with `error`, without touching the store
    pub fn fail_next(&self, operation: Operation, error: StoreError) {
        self.lock().faults.push_back((operation, error));
    }

    /// Holds the next call of `operation` open until the returned gate is released
    pub fn hold_next(&self, operation: Operation) -> Gate {
        let gate = Gate::new();
        self.lock().gates.insert(operation, gate.clone());
        gate
    }

    /// All successful writes, oldest first
    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// The number of times `operation` was called, including calls that failed
    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    async fn begin(&self, operation: Operation) -> Result<(), StoreError> {
        let gate = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            state.gates.remove(&operation)
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.released.notified().await;
        }
        match self.lock().take_fault(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, state: &mut FakeState, operation: Operation, k8s_type: &'static K8sType, id: ObjectId, stored: &Value) {
        log::debug!("FakeStore {:?} {} {}", operation, k8s_type, id);
        state.writes.push(Write {
            operation,
            kind: k8s_type.kind,
            id,
            stored: stored.clone(),
        });
    }
}

fn to_resource(value: Value) -> Result<K8sResource, StoreError> {
    K8sResource::from_value(value).map_err(StoreError::transient)
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    value
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Store for FakeStore {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'_>,
    ) -> Result<K8sResource, StoreError> {
        self.begin(Operation::Get).await?;
        let value = self
            .lock()
            .objects
            .get(&store_key(k8s_type, id))
            .cloned()
            .ok_or(StoreError::NotFound)?;
        to_resource(value)
    }

    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K8sResource>, StoreError> {
        self.begin(Operation::List).await?;
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|((api_version, kind, id), _)| {
                k8s_type.matches(api_version, kind)
                    && (namespace.is_empty() || id.namespace == namespace)
            })
            .filter(|(_, value)| labels_match(selector, &labels_of(value)))
            .map(|(_, value)| to_resource(value.clone()))
            .collect()
    }

    async fn create(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        self.begin(Operation::Create).await?;
        let mut body = resource.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.remove("status");
        }
        let mut state = self.lock();
        let stored = state.insert_new(k8s_type, body)?;
        let id = resource::object_id(&stored)
            .map(|id| id.to_owned())
            .unwrap_or_else(|| ObjectId::new("", ""));
        self.record(&mut state, Operation::Create, k8s_type, id, &stored);
        to_resource(stored)
    }

    async fn update(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        self.begin(Operation::Update).await?;
        let mut state = self.lock();
        let (id, stored) = state.replace(k8s_type, resource, |existing, body| {
            let mut updated = body.clone();
            match existing.get("status") {
                Some(status) => updated["status"] = status.clone(),
                None => {
                    if let Some(obj) = updated.as_object_mut() {
                        obj.remove("status");
                    }
                }
            }
            updated
        })?;
        self.record(&mut state, Operation::Update, k8s_type, id, &stored);
        to_resource(stored)
    }

    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        self.begin(Operation::UpdateStatus).await?;
        let mut state = self.lock();
        let (id, stored) = state.replace(k8s_type, resource, |existing, body| {
            let mut updated = existing.clone();
            updated["status"] = body.get("status").cloned().unwrap_or(Value::Null);
            updated
        })?;
        self.record(&mut state, Operation::UpdateStatus, k8s_type, id, &stored);
        to_resource(stored)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::core::v1::Pod;
    use crate::k8s_types::sregig::v1alpha1::Podwatcher;
    use crate::podwatcher::{selector_labels, PodWatcher};
    use serde_json::json;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build runtime")
            .block_on(future)
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let store = FakeStore::new();
        let seeded = store.seed(Podwatcher, &PodWatcher::new("ns", "web", 1));
        run(async {
            let mut body = seeded.clone().into_value();
            body["spec"]["size"] = json!(2);
            let updated = store.update(Podwatcher, &body).await.unwrap();
            assert_ne!(seeded.resource_version(), updated.resource_version());
            assert_eq!(seeded.uid(), updated.uid());

            let err = store.update(Podwatcher, &body).await.unwrap_err();
            assert_eq!(StoreError::Conflict, err);
        });
        assert_eq!(1, store.writes().len());
    }

    #[test]
    fn update_keeps_status_and_update_status_keeps_spec() {
        let store = FakeStore::new();
        let mut pw = PodWatcher::new("ns", "web", 1);
        pw.status = Some(crate::podwatcher::PodWatcherStatus {
            pods: vec!["a".to_owned()],
        });
        let seeded = store.seed(Podwatcher, &pw);
        run(async {
            let mut body = seeded.clone().into_value();
            body["spec"]["size"] = json!(3);
            body["status"] = json!({ "pods": [] });
            let updated = store.update(Podwatcher, &body).await.unwrap();
            assert_eq!(&json!({ "pods": ["a"] }), updated.status().unwrap());

            let mut body = updated.into_value();
            body["spec"]["size"] = json!(9);
            body["status"] = json!({ "pods": ["a", "b"] });
            let updated = store.update_status(Podwatcher, &body).await.unwrap();
            assert_eq!(&json!({ "pods": ["a", "b"] }), updated.status().unwrap());
            assert_eq!(Some(&json!(3)), updated.as_ref().pointer("/spec/size"));
        });
    }

    #[test]
    fn list_selects_by_namespace_and_labels() {
        let store = FakeStore::new();
        for (ns, name, owner) in &[("ns", "a", "web"), ("ns", "b", "other"), ("ns2", "c", "web")] {
            store.seed(
                Pod,
                &json!({
                    "metadata": { "namespace": ns, "name": name, "labels": selector_labels(owner) }
                }),
            );
        }
        let names = run(async {
            store
                .list(Pod, "ns", &selector_labels("web"))
                .await
                .unwrap()
                .iter()
                .map(|p| p.name().to_owned())
                .collect::<Vec<_>>()
        });
        assert_eq!(vec!["a".to_owned()], names);
    }

    #[test]
    fn injected_fault_fails_only_the_next_call() {
        let store = FakeStore::new();
        store.fail_next(Operation::Get, StoreError::transient("boom"));
        run(async {
            let id = ObjectIdRef::new("ns", "web");
            assert_eq!(
                StoreError::transient("boom"),
                store.get(Podwatcher, id).await.unwrap_err()
            );
            assert_eq!(StoreError::NotFound, store.get(Podwatcher, id).await.unwrap_err());
        });
        assert_eq!(2, store.call_count(Operation::Get));
    }

    #[test]
    fn create_of_existing_object_fails() {
        let store = FakeStore::new();
        let seeded = store.seed(Podwatcher, &PodWatcher::new("ns", "web", 1));
        let err = run(store.create(Podwatcher, seeded.as_ref())).unwrap_err();
        assert_eq!(StoreError::AlreadyExists, err);
        assert!(store.writes().is_empty());
    }
}
