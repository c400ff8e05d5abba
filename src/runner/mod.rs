//! Everything needed to run the operator against a real cluster: the http client, the watchers that
//! turn api server events into reconcile requests, the dispatcher that runs the reconciles, and the
//! metrics server.
pub mod client;
pub mod dispatcher;
pub mod metrics;
mod server;
pub mod watcher;

pub use self::client::Client;
pub use self::dispatcher::{Dispatcher, DispatcherHandle};
pub use self::metrics::Metrics;

use crate::config::{ClientConfig, OperatorConfig};
use crate::error::{Error, UnexpectedShutdownError};
use crate::k8s_types::{apps, core, sregig, K8sType};
use crate::reconciler::Reconciler;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::runtime::Runtime;

use std::sync::Arc;
use std::time::Duration;

/// The types that are watched for changes, in the order the watchers are started
fn watched_types() -> [&'static K8sType; 3] {
    [
        sregig::v1alpha1::Podwatcher,
        apps::v1::Deployment,
        core::v1::Pod,
    ]
}

/// A handle to a potentially running operator, which allows for shutting it down
pub struct OperatorHandle {
    dispatcher: DispatcherHandle,
}

impl std::ops::Drop for OperatorHandle {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

impl OperatorHandle {
    /// Stops the watchers and cancels any reconciles that are in flight
    pub fn shutdown_now(self) {
        self.dispatcher.shutdown();
    }

    pub fn is_active(&self) -> bool {
        !self.dispatcher.is_shutdown()
    }
}

/// Starts the operator and blocks the current thread indefinitely until the operator shuts down due to an error.
/// The client configuration is loaded from the pod's service account if it's available, or else from the
/// kubeconfig file.
pub fn run_operator(config: OperatorConfig) -> Error {
    let client_config = {
        let user_agent = config.operator_name.as_str();
        let result = ClientConfig::from_service_account(user_agent).or_else(|_| {
            log::debug!("Failed to load ClientConfig from service account, so trying to load from kubeconfig");
            ClientConfig::from_kubeconfig(user_agent)
        });
        match result {
            Ok(conf) => conf,
            Err(err) => return err.into(),
        }
    };
    run_operator_with_client_config(config, client_config)
}

/// Starts the operator and blocks the current thread indefinitely until the operator shuts down due to an error.
pub fn run_operator_with_client_config(config: OperatorConfig, client_config: ClientConfig) -> Error {
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => return err.into(),
    };
    let client = match Client::new(client_config, metrics.client_metrics()) {
        Ok(c) => c,
        Err(err) => return err.into(),
    };
    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    runtime.block_on(async move {
        let (dispatcher, handle) = create_dispatcher(&config, client.clone(), metrics.clone());
        run_with_client(config, client, metrics, dispatcher, handle).await;
    });
    log::warn!("Operator stopped, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    // the operator never stops under normal circumstances
    UnexpectedShutdownError.into()
}

/// Starts the operator asynchronously using the provided runtime. This function will return immediately with a
/// handle that can be used to shutdown the operator at a later point. Will return an error if it fails to create
/// the http client due to invalid configuration.
pub fn start_operator_with_runtime(
    runtime: &Runtime,
    config: OperatorConfig,
    client_config: ClientConfig,
) -> Result<OperatorHandle, Error> {
    let metrics = Metrics::new()?;
    let client = Client::new(client_config, metrics.client_metrics())?;
    let (dispatcher, handle) = create_dispatcher(&config, client.clone(), metrics.clone());
    let operator_handle = OperatorHandle {
        dispatcher: handle.clone(),
    };
    runtime.spawn(async move {
        run_with_client(config, client, metrics, dispatcher, handle).await;
    });
    Ok(operator_handle)
}

fn create_dispatcher(
    config: &OperatorConfig,
    client: Client,
    metrics: Metrics,
) -> (Dispatcher<Reconciler<Client>>, DispatcherHandle) {
    let reconciler = Arc::new(Reconciler::new(client, config.workload.clone()));
    Dispatcher::new(reconciler, config, metrics)
}

async fn run_with_client(
    config: OperatorConfig,
    client: Client,
    metrics: Metrics,
    dispatcher: Dispatcher<Reconciler<Client>>,
    handle: DispatcherHandle,
) {
    log::debug!("Starting operator with configuration: {:?}", config);

    let watchers = watched_types()
        .iter()
        .map(|&k8s_type| {
            watcher::start_watcher(
                k8s_type,
                config.namespace.clone(),
                client.clone(),
                handle.clone(),
                &metrics,
            )
        })
        .collect::<Vec<_>>();

    if config.expose_metrics || config.expose_health {
        tokio::spawn(server::start(
            config.server_port,
            metrics.clone(),
            config.expose_metrics,
            config.expose_health,
            handle.shutdown_token(),
        ));
    }

    dispatcher.run().await;

    for watcher in watchers {
        match watcher.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("{:#}", err),
            Err(err) => log::error!("Watcher task failed: {}", err),
        }
    }
    log::info!("Operator stopped");
}

/// Exponential backoff with no time limit, whose interval never grows past a maximum
#[derive(Debug)]
pub(crate) struct CappedBackoff(ExponentialBackoff);

impl CappedBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> CappedBackoff {
        let mut exp = ExponentialBackoff {
            initial_interval: initial,
            max_interval: max.max(initial),
            max_elapsed_time: None,
            ..Default::default()
        };
        exp.reset();
        CappedBackoff(exp)
    }
}

impl Backoff for CappedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let CappedBackoff(exp) = self;
        exp.next_backoff()
    }

    fn reset(&mut self) {
        let CappedBackoff(exp) = self;
        exp.reset()
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    let mut millis = duration.as_secs().saturating_mul(1000);
    let nanos = u64::from(duration.subsec_nanos());
    if nanos >= 1_000_000 {
        millis = millis.saturating_add(nanos / 1_000_000)
    }
    millis
}
