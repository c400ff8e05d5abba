//! Builds the Deployment that backs a Podwatcher.
//!
//! The output is a pure function of the Podwatcher's name, namespace, uid and size plus the
//! configured `WorkloadTemplate`. Building twice from equal inputs always produces equal json.
use crate::config::WorkloadTemplate;
use crate::k8s_types::apps::v1::Deployment;
use crate::podwatcher::PodWatcher;

use serde_json::{json, Value};

/// Returns the full definition of the Deployment for `desired`, ready to be passed to `Store::create`
pub fn build(desired: &PodWatcher, template: &WorkloadTemplate) -> Value {
    let labels = desired.selector_labels();

    json!({
        "apiVersion": Deployment.api_version,
        "kind": Deployment.kind,
        "metadata": {
            "namespace": desired.namespace(),
            "name": desired.name(),
            "labels": labels,
            "ownerReferences": [owner_reference(desired)],
        },
        "spec": {
            "replicas": desired.desired_size(),
            "selector": {
                "matchLabels": labels,
            },
            "template": {
                "metadata": {
                    "labels": labels,
                },
                "spec": {
                    "containers": [{
                        "name": template.container_name,
                        "image": template.image,
                        "command": template.command,
                        "ports": [{
                            "name": template.port_name,
                            "containerPort": template.container_port,
                        }],
                    }],
                },
            },
        },
    })
}

/// A controller reference, so that deleting the Podwatcher cascades to the Deployment
fn owner_reference(owner: &PodWatcher) -> Value {
    json!({
        "apiVersion": owner.api_version,
        "kind": owner.kind,
        "name": owner.name(),
        "uid": owner.uid(),
        "controller": true,
        "blockOwnerDeletion": true,
    })
}
