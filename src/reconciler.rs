//! The reconcile loop for a single Podwatcher.
//!
//! Each call to `Reconciler::reconcile` reads the current state from the store and corrects at most
//! one kind of drift before returning:
//!
//! 1. If the Podwatcher is gone, there's nothing to do (`Action::Gone`). Its Deployment is garbage
//!    collected through the owner reference.
//! 2. If the Deployment doesn't exist, create it and ask to be requeued right away.
//! 3. If the Deployment's replica count doesn't match `spec.size`, fix it and stop there. The pods
//!    will change as a result, which triggers another reconcile.
//! 4. List the pods that match the selector labels, and if their names differ from `status.pods`
//!    then write the new status.
//!
//! Running it again against a converged state performs no writes at all. Errors are never retried
//! here; they're returned so that the caller can back off.
use crate::builder;
use crate::config::WorkloadTemplate;
use crate::k8s_types::apps::v1::Deployment;
use crate::k8s_types::core::v1::Pod;
use crate::k8s_types::sregig::v1alpha1::Podwatcher;
use crate::podwatcher::{same_members, PodWatcher, PodWatcherStatus};
use crate::resource::ObjectId;
use crate::store::{Store, StoreError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::future::Future;
use std::time::Duration;

/// The api server defaults `spec.replicas` to this when it's omitted
const DEFAULT_REPLICAS: i64 = 1;

/// What should happen after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until something changes
    Done,
    /// The Podwatcher no longer exists, so there's nothing to do for it ever again. Scheduled the
    /// same as `Done`.
    Gone,
    /// Reconcile the same key again after the given delay. A zero delay means right away.
    RequeueAfter(Duration),
}

impl Action {
    pub fn requeue_now() -> Action {
        Action::RequeueAfter(Duration::from_millis(0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileError {
    Store(StoreError),
    /// The Podwatcher couldn't be decoded, or its `spec.size` is negative
    InvalidResource(String),
    Cancelled,
}

impl ReconcileError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            ReconcileError::Cancelled => true,
            _ => false,
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> ReconcileError {
        match err {
            StoreError::Cancelled => ReconcileError::Cancelled,
            other => ReconcileError::Store(other),
        }
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Store(e) => write!(f, "{}", e),
            ReconcileError::InvalidResource(msg) => write!(f, "invalid Podwatcher: {}", msg),
            ReconcileError::Cancelled => f.write_str("reconcile was cancelled"),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// The single entry point that the dispatcher calls. Implementations must be safe to call
/// concurrently for different keys.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(
        &self,
        key: &ObjectId,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError>;
}

pub struct Reconciler<S: Store> {
    store: S,
    template: WorkloadTemplate,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: S, template: WorkloadTemplate) -> Reconciler<S> {
        Reconciler { store, template }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn sync(&self, key: &ObjectId, cancel: &CancellationToken) -> Result<Action, ReconcileError> {
        let id = key.as_id_ref();

        let resource = match cancellable(cancel, self.store.get(Podwatcher, id)).await {
            Ok(resource) => resource,
            Err(ReconcileError::Store(StoreError::NotFound)) => {
                log::debug!("Podwatcher {} no longer exists, nothing to do", key);
                return Ok(Action::Gone);
            }
            Err(err) => return Err(err),
        };
        let podwatcher: PodWatcher = resource
            .deserialize()
            .map_err(|e| ReconcileError::InvalidResource(e.to_string()))?;
        let size = podwatcher.desired_size();
        if size < 0 {
            return Err(ReconcileError::InvalidResource(format!(
                "spec.size must not be negative, got {}",
                size
            )));
        }

        let deployment = match cancellable(cancel, self.store.get(Deployment, id)).await {
            Ok(deployment) => deployment,
            Err(ReconcileError::Store(StoreError::NotFound)) => {
                let desired = builder::build(&podwatcher, &self.template);
                let created = cancellable(cancel, self.store.create(Deployment, &desired)).await?;
                log::info!(
                    "Created Deployment {} with {} replicas at resourceVersion: {}",
                    key,
                    size,
                    created.resource_version()
                );
                return Ok(Action::requeue_now());
            }
            Err(err) => return Err(err),
        };

        let replicas = deployment
            .as_ref()
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_REPLICAS);
        if replicas != i64::from(size) {
            let mut body = deployment.into_value();
            body["spec"]["replicas"] = Value::from(size);
            cancellable(cancel, self.store.update(Deployment, &body)).await?;
            log::info!(
                "Updated Deployment {} replicas from {} to {}",
                key,
                replicas,
                size
            );
            return Ok(Action::Done);
        }

        let selector = podwatcher.selector_labels();
        let pods = cancellable(
            cancel,
            self.store.list(Pod, podwatcher.namespace(), &selector),
        )
        .await?;
        let names = pods
            .iter()
            .map(|pod| pod.name().to_owned())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect::<Vec<String>>();

        if same_members(&names, podwatcher.observed_pods()) {
            log::debug!("Podwatcher {} is up to date with {} pods", key, names.len());
            return Ok(Action::Done);
        }

        let pod_count = names.len();
        let mut updated = podwatcher;
        updated.status = Some(PodWatcherStatus { pods: names });
        let body = serde_json::to_value(&updated)
            .map_err(|e| ReconcileError::InvalidResource(e.to_string()))?;
        cancellable(cancel, self.store.update_status(Podwatcher, &body)).await?;
        log::info!("Updated status of Podwatcher {} with {} pods", key, pod_count);
        Ok(Action::Done)
    }
}

#[async_trait]
impl<S: Store> Reconcile for Reconciler<S> {
    async fn reconcile(
        &self,
        key: &ObjectId,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let result = self.sync(key, cancel).await;
        match result.as_ref() {
            Ok(action) => log::debug!("Finished reconcile of {} with {:?}", key, action),
            Err(ReconcileError::Cancelled) => log::info!("Reconcile of {} was cancelled", key),
            Err(ReconcileError::InvalidResource(msg)) => {
                log::error!("Cannot reconcile {}: invalid Podwatcher: {}", key, msg)
            }
            Err(err) => log::warn!("Reconcile of {} failed: {}", key, err),
        }
        result
    }
}

/// Runs a store call, abandoning it if `cancel` fires first
async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        result = call => result.map_err(ReconcileError::from),
    }
}
