//! The handful of Kubernetes types that the podwatcher operator talks to.
//!
//! A `K8sType` carries just enough information to build api server urls for a resource and to
//! recognize it in watch events. They are all declared as statics so that `&'static K8sType` can be
//! passed around freely:
//!
//! ```
//! use podwatcher::k8s_types::{self, K8sType};
//!
//! let deployment: &K8sType = k8s_types::apps::v1::Deployment;
//! assert_eq!("apps", deployment.group());
//! assert_eq!("v1", deployment.version());
//! ```
use std::fmt::{self, Display};
use std::hash::{self, Hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    /// Splits the apiVersion into its group and version. Core types have an empty group.
    pub fn as_group_and_version(&self) -> (&'static str, &'static str) {
        let api_version = self.api_version;
        match api_version.find('/') {
            Some(slash_idx) => (&api_version[..slash_idx], &api_version[(slash_idx + 1)..]),
            None => ("", api_version),
        }
    }

    pub fn group(&self) -> &'static str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &'static str {
        self.as_group_and_version().1
    }

    /// Returns true if the given apiVersion and kind (as they appear on a resource) identify this type
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        self.api_version == api_version && self.kind == kind
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

pub mod core {
    pub mod v1 {
        k8s_type!(Pod, "v1", "Pod", "pods");
    }
}

pub mod apps {
    pub mod v1 {
        k8s_type!(Deployment, "apps/v1", "Deployment", "deployments");
    }
}

pub mod sregig {
    pub mod v1alpha1 {
        k8s_type!(
            Podwatcher,
            "sregig.redhat.com/v1alpha1",
            "Podwatcher",
            "podwatchers"
        );
    }
}
