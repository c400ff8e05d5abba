//! The contract between the reconciler and the object store.
//!
//! The reconciler only ever talks to a `Store`, which makes it possible to run it against the real
//! api server (`runner::client::Client`) or against the in-memory `testkit::FakeStore`.
use crate::k8s_types::K8sType;
use crate::resource::{K8sResource, ObjectIdRef};

use async_trait::async_trait;
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound,
    /// a create was rejected because an object with the same id already exists
    AlreadyExists,
    /// the resourceVersion of an update was stale
    Conflict,
    /// anything else: the store was unavailable, timed out, or returned something unexpected
    Transient(String),
    /// the caller gave up waiting for the response
    Cancelled,
}

impl StoreError {
    pub fn transient(message: impl Display) -> StoreError {
        StoreError::Transient(message.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound => true,
            _ => false,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NotFound => f.write_str("resource not found"),
            StoreError::AlreadyExists => f.write_str("resource already exists"),
            StoreError::Conflict => f.write_str("resource was modified concurrently"),
            StoreError::Transient(msg) => write!(f, "store error: {}", msg),
            StoreError::Cancelled => f.write_str("request was cancelled"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Typed access to the object store. All writes take the full json of the object, including its
/// `apiVersion`, `kind` and `metadata`, and return the object as it was stored.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'_>,
    ) -> Result<K8sResource, StoreError>;

    /// Lists the objects of the given type in `namespace` that carry every one of the `selector` labels
    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K8sResource>, StoreError>;

    async fn create(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;

    /// Replaces the object. The `metadata.resourceVersion` must match the stored one. The status of
    /// the stored object is left as it is.
    async fn update(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;

    /// Replaces only the `status` of the object, through the status sub-resource
    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;
}
