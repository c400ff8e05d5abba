//! The `Podwatcher` custom resource: a declaration of how many pods should be running, plus the
//! names of the pods that were running the last time the operator looked.
//!
//! ```yaml
//! apiVersion: sregig.redhat.com/v1alpha1
//! kind: Podwatcher
//! metadata:
//!   name: example
//!   namespace: default
//! spec:
//!   size: 3
//! status:
//!   pods: [example-7d9f-abcde, example-7d9f-fghij, example-7d9f-klmno]
//! ```
use crate::k8s_types::sregig::v1alpha1::Podwatcher as PODWATCHER_TYPE;
use crate::resource::{JsonObject, ObjectIdRef};

use std::collections::{BTreeMap, BTreeSet};

/// Value of the `app` label on everything the operator creates
pub const COMPONENT_NAME: &str = "podwatcher";
pub const APP_LABEL: &str = "app";
/// Label whose value is the name of the owning Podwatcher. This is the lowercased kind.
pub const OWNER_LABEL: &str = "podwatcher";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodWatcher {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodWatcherSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodWatcherStatus>,
}

/// The subset of object metadata the operator reads. Everything else is carried along untouched in
/// `other`, so that writing the object back doesn't drop fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub other: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodWatcherSpec {
    /// desired number of pods
    #[serde(default)]
    pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodWatcherStatus {
    #[serde(default)]
    pub pods: Vec<String>,
}

impl PodWatcher {
    /// Creates a new Podwatcher that has not yet been stored
    pub fn new(namespace: &str, name: &str, size: i32) -> PodWatcher {
        PodWatcher {
            api_version: PODWATCHER_TYPE.api_version.to_owned(),
            kind: PODWATCHER_TYPE.kind.to_owned(),
            metadata: ObjectMeta {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                ..Default::default()
            },
            spec: PodWatcherSpec { size },
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_str()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_str()
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_str()
    }

    pub fn id(&self) -> ObjectIdRef {
        ObjectIdRef::new(self.namespace(), self.name())
    }

    pub fn desired_size(&self) -> i32 {
        self.spec.size
    }

    /// The pod names from the last published status, empty if no status was ever written
    pub fn observed_pods(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.pods.as_slice())
            .unwrap_or(&[])
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        selector_labels(self.name())
    }
}

/// The labels that join a Podwatcher's Deployment to its pods. These end up in the Deployment's
/// selector, which the api server treats as immutable, so they must only ever depend on the name.
pub fn selector_labels(podwatcher_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_owned(), COMPONENT_NAME.to_owned());
    labels.insert(OWNER_LABEL.to_owned(), podwatcher_name.to_owned());
    labels
}

/// Formats labels as an equality-based selector string, for example `app=podwatcher,podwatcher=web`
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Returns true if every one of the selector labels is present on `labels` with the same value
pub fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
}

/// Compares two lists of pod names as sets. Neither order nor duplicates matter.
pub fn same_members<A: AsRef<str>, B: AsRef<str>>(left: &[A], right: &[B]) -> bool {
    let left = left.iter().map(AsRef::as_ref).collect::<BTreeSet<&str>>();
    let right = right.iter().map(AsRef::as_ref).collect::<BTreeSet<&str>>();
    left == right
}
