//! An operator that keeps a Deployment running for every `Podwatcher` custom resource, sized by the
//! Podwatcher's `spec.size`, and publishes the names of that Deployment's pods in the Podwatcher's
//! `status.pods`.
//!
//! Changes to Podwatchers, to the Deployments they own, and to the pods of those Deployments are
//! all turned into reconcile requests for the affected Podwatcher. Reconciles of the same
//! Podwatcher never overlap, and a Podwatcher that changes while it's being reconciled gets
//! reconciled again afterwards.
//!
//! Running the operator:
//! ```no_run
//! use podwatcher::prelude::*;
//!
//! let operator_config = OperatorConfig::new("podwatcher-operator")
//!     .within_namespace("default")
//!     .worker_count(4);
//!
//! // this function will block the current thread indifinitely while the operator runs
//! let err = run_operator(operator_config);
//! panic!("operator stopped: {}", err);
//! ```
//!
//! The reconcile logic itself only depends on a `Store`, so it can be exercised without an api
//! server by using the `FakeStore` from the `testkit` module (requires the `testkit` feature).

#[macro_use]
extern crate serde_derive;

pub mod builder;
pub mod config;
pub mod error;
pub mod k8s_types;
pub mod podwatcher;
pub mod reconciler;
pub mod resource;
pub mod runner;
pub mod store;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::config::{ClientConfig, OperatorConfig, WorkloadTemplate};
    pub use crate::error::Error;
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::podwatcher::PodWatcher;
    pub use crate::reconciler::{Action, Reconcile, ReconcileError, Reconciler};
    pub use crate::resource::{K8sResource, ObjectId};
    pub use crate::runner::run_operator;
    pub use crate::store::{Store, StoreError};
}
