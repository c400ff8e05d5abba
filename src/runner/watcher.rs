//! Watches the api server and turns every change into a reconcile request for the Podwatcher that
//! it affects.
//!
//! Each watcher lists its type once to find out about everything that already exists, then
//! watches from the resourceVersion of that list. If the resourceVersion expires (410 Gone) the
//! watcher starts over with a new list. Any other error is retried after a short delay.
use crate::k8s_types::{apps, core, sregig, K8sType};
use crate::podwatcher::{APP_LABEL, COMPONENT_NAME, OWNER_LABEL};
use crate::resource::{InvalidResourceError, K8sResource, ObjectId};
use crate::runner::client::{with_type_meta, ApiError, Client, Error as ClientError, ObjectList, WatchEvent};
use crate::runner::dispatcher::{DispatcherHandle, DispatcherStopped};
use crate::runner::metrics::{Metrics, WatcherMetrics};

use anyhow::Context;
use serde_json::Value;
use tokio::task::JoinHandle;

use std::fmt::{self, Display};
use std::time::Duration;

const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Returns the id of the Podwatcher that should be reconciled when `resource` changes
pub fn podwatcher_key(k8s_type: &K8sType, resource: &K8sResource) -> Option<ObjectId> {
    let namespace = resource.namespace().unwrap_or("");
    if k8s_type == sregig::v1alpha1::Podwatcher {
        Some(resource.get_object_id().to_owned())
    } else if k8s_type == apps::v1::Deployment {
        resource
            .controller_name(sregig::v1alpha1::Podwatcher.kind)
            .map(|name| ObjectId::new(namespace, name))
    } else if k8s_type == core::v1::Pod {
        resource
            .get_label_value(OWNER_LABEL)
            .map(|name| ObjectId::new(namespace, name))
    } else {
        None
    }
}

/// Spawns a watcher for `k8s_type` that runs until the dispatcher stops
pub fn start_watcher(
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    client: Client,
    dispatcher: DispatcherHandle,
    metrics: &Metrics,
) -> JoinHandle<anyhow::Result<()>> {
    // Deployments and Pods are only interesting if they belong to a Podwatcher
    let label_selector = if k8s_type == sregig::v1alpha1::Podwatcher {
        None
    } else {
        Some(format!("{}={}", APP_LABEL, COMPONENT_NAME))
    };
    let watcher = Watcher {
        metrics: metrics.watcher_metrics(k8s_type),
        client,
        k8s_type,
        dispatcher,
        label_selector,
        namespace,
    };
    tokio::spawn(watcher.run())
}

#[derive(Debug)]
enum WatcherErr {
    SendErr,
    ClientErr(ClientError),
    ResourceVersionExpired,
    InvalidResource(InvalidResourceError),
    Api(ApiError),
}

impl Display for WatcherErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WatcherErr::SendErr => f.write_str("Dispatcher has stopped"),
            WatcherErr::ClientErr(err) => write!(f, "Client Error: {}", err),
            WatcherErr::ResourceVersionExpired => {
                f.write_str("Resource Version has expired, watcher is out of sync")
            }
            WatcherErr::InvalidResource(e) => {
                write!(f, "Invalid resource returned from api server: {}", e)
            }
            WatcherErr::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl std::error::Error for WatcherErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherErr::ClientErr(err) => Some(err),
            WatcherErr::InvalidResource(e) => Some(e),
            WatcherErr::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl WatcherErr {
    fn is_resource_version_expired(&self) -> bool {
        match self {
            WatcherErr::ResourceVersionExpired => true,
            _ => false,
        }
    }

    fn is_send_err(&self) -> bool {
        match self {
            WatcherErr::SendErr => true,
            _ => false,
        }
    }
}

impl From<ApiError> for WatcherErr {
    fn from(err: ApiError) -> WatcherErr {
        if err.code == 410 {
            WatcherErr::ResourceVersionExpired
        } else {
            WatcherErr::Api(err)
        }
    }
}

impl From<InvalidResourceError> for WatcherErr {
    fn from(err: InvalidResourceError) -> WatcherErr {
        WatcherErr::InvalidResource(err)
    }
}

impl From<ClientError> for WatcherErr {
    fn from(err: ClientError) -> WatcherErr {
        if err.is_expired() {
            WatcherErr::ResourceVersionExpired
        } else {
            WatcherErr::ClientErr(err)
        }
    }
}

impl From<DispatcherStopped> for WatcherErr {
    fn from(_: DispatcherStopped) -> WatcherErr {
        WatcherErr::SendErr
    }
}

struct Watcher {
    metrics: WatcherMetrics,
    client: Client,
    k8s_type: &'static K8sType,
    dispatcher: DispatcherHandle,
    label_selector: Option<String>,
    namespace: Option<String>,
}

impl Watcher {
    async fn run(mut self) -> anyhow::Result<()> {
        let dispatcher = self.dispatcher.clone();
        let k8s_type = self.k8s_type;
        tokio::select! {
            _ = dispatcher.stopped() => {
                log::info!("Stopping watcher for {}", k8s_type);
                Ok(())
            }
            result = self.watch_forever() => {
                result.with_context(|| format!("watcher for {} stopped", k8s_type))
            }
        }
    }

    async fn watch_forever(&mut self) -> Result<(), WatcherErr> {
        log::debug!(
            "Starting watcher for resources of type: {} with selector: {:?}",
            self.k8s_type,
            self.label_selector
        );
        loop {
            let result = match self.seed().await {
                Ok(resource_version) => self.run_inner(resource_version).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if !self.handle_error(&err).await {
                    return Err(err);
                }
            }
        }
    }

    /// Returns true if the watcher should start over
    async fn handle_error(&mut self, error: &WatcherErr) -> bool {
        if error.is_send_err() {
            return false;
        }
        if error.is_resource_version_expired() {
            log::warn!("ResourceVersion is too old for type: {}, relisting", self.k8s_type);
        } else {
            log::error!("Error in watcher for type: {}, err: {}", self.k8s_type, error);
            self.metrics.error();
            tokio::time::sleep(ERROR_RETRY_DELAY).await;
        }
        true
    }

    async fn run_inner(&mut self, mut resource_version: String) -> Result<(), WatcherErr> {
        loop {
            self.metrics.request_started();
            let result = self.do_watch(&resource_version).await;
            log::debug!(
                "Watch of {} ended with result: {:?}",
                self.k8s_type,
                result
            );
            if let Some(vers) = result? {
                resource_version = vers;
            }
        }
    }

    async fn do_watch(&mut self, resource_version: &str) -> Result<Option<String>, WatcherErr> {
        log::debug!(
            "Starting watch of: {} with resourceVersion: {}",
            self.k8s_type,
            resource_version
        );

        let mut lines = self
            .client
            .watch(
                self.k8s_type,
                self.namespace.as_deref(),
                Some(resource_version),
                self.label_selector.as_deref(),
            )
            .await?;

        let mut new_version: Option<String> = None;
        while let Some(result) = lines.next().await {
            self.metrics.event_received();
            let event = result?;
            let event_version = self.handle_event(event).await?;
            new_version = Some(event_version);
        }
        Ok(new_version)
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Result<String, WatcherErr> {
        // a deleted Podwatcher is reconciled like any other change, and the dispatcher cleans up
        // after it once the reconcile finds it gone
        let object = match event {
            WatchEvent::Added(res) | WatchEvent::Modified(res) | WatchEvent::Deleted(res) => res,
            WatchEvent::Error(err) => {
                log::warn!("Got apiError for watch on: {}, err: {}", self.k8s_type, err);
                return Err(err.into());
            }
        };
        let resource = K8sResource::from_value(object)?;
        self.send_trigger(&resource).await?;
        Ok(resource.resource_version().to_owned())
    }

    async fn send_trigger(&self, resource: &K8sResource) -> Result<(), WatcherErr> {
        match podwatcher_key(self.k8s_type, resource) {
            Some(key) => {
                log::trace!(
                    "Change to {} {} triggers reconcile of {}",
                    self.k8s_type,
                    resource.get_object_id(),
                    key
                );
                self.dispatcher.trigger(key).await?;
            }
            None => {
                log::trace!(
                    "Ignoring {} {} which doesn't belong to a Podwatcher",
                    self.k8s_type,
                    resource.get_object_id()
                );
            }
        }
        Ok(())
    }

    async fn seed(&mut self) -> Result<String, WatcherErr> {
        log::info!(
            "Listing resources of type: {} with selector: {:?}",
            self.k8s_type,
            self.label_selector
        );
        self.metrics.request_started();
        let list = self
            .client
            .list_all(
                self.k8s_type,
                self.namespace.as_deref(),
                self.label_selector.as_deref(),
            )
            .await?;
        let ObjectList { metadata, items } = list;
        let resource_version = metadata
            .resource_version
            .ok_or_else(|| InvalidResourceError {
                message: "list result from api server is missing metadata.resourceVersion",
                value: Value::Null,
            })?;

        for object in items {
            self.metrics.event_received();
            let resource = K8sResource::from_value(with_type_meta(self.k8s_type, object))?;
            self.send_trigger(&resource).await?;
        }
        Ok(resource_version)
    }
}
