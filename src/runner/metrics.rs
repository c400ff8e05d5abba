use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

use std::fmt::{self, Debug};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    total_watch_events_received: IntCounter,
    reconcile_count_by_podwatcher: IntCounterVec,
    reconcile_errors_by_podwatcher: IntCounterVec,
    requeue_count: IntCounter,
    reconciles_in_flight: IntGauge,
    watcher_requests_by_type: IntCounterVec,
    watcher_errors_by_type: IntCounterVec,
    watch_events_by_type: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn id_labels<'a>(id: &ObjectIdRef<'a>) -> [&'a str; 2] {
    [id.namespace, id.name]
}

// 5ms, 10ms, 20ms ... ~10s
const REQUEST_TIME_BUCKETS: usize = 12;

const NAMESPACE_AND_NAME: &[&str] = &["namespace", "name"];
const API_VERSION_AND_KIND: &[&str] = &["apiVersion", "kind"];

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, REQUEST_TIME_BUCKETS)?);
        let api_server_request_times = Histogram::with_opts(request_time_opts)?;
        registry.register(Box::new(api_server_request_times.clone()))?;

        let watch_events_opts = Opts::new(
            "events_received",
            "total number of events processed by the operator, including from watches and initial lists",
        );
        let total_watch_events_received = IntCounter::with_opts(watch_events_opts)?;
        registry.register(Box::new(total_watch_events_received.clone()))?;

        let reconcile_count_opts = Opts::new(
            "reconcile_counts",
            "the number of times each Podwatcher has been reconciled",
        );
        let reconcile_count_by_podwatcher =
            IntCounterVec::new(reconcile_count_opts, NAMESPACE_AND_NAME)?;
        registry.register(Box::new(reconcile_count_by_podwatcher.clone()))?;

        let reconcile_error_opts = Opts::new(
            "reconcile_errors",
            "the number of failed reconciles by Podwatcher",
        );
        let reconcile_errors_by_podwatcher =
            IntCounterVec::new(reconcile_error_opts, NAMESPACE_AND_NAME)?;
        registry.register(Box::new(reconcile_errors_by_podwatcher.clone()))?;

        let requeue_opts = Opts::new(
            "requeues",
            "number of reconciles that were scheduled again, either after an error or on request",
        );
        let requeue_count = IntCounter::with_opts(requeue_opts)?;
        registry.register(Box::new(requeue_count.clone()))?;

        let in_flight_opts = Opts::new("reconciles_in_flight", "number of reconciles running right now");
        let reconciles_in_flight = IntGauge::with_opts(in_flight_opts)?;
        registry.register(Box::new(reconciles_in_flight.clone()))?;

        let watcher_request_opts =
            Opts::new("watcher_requests", "number of requests from watchers");
        let watcher_requests_by_type =
            IntCounterVec::new(watcher_request_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watcher_requests_by_type.clone()))?;

        let watcher_error_opts = Opts::new("watcher_errors", "number of errors from watchers");
        let watcher_errors_by_type = IntCounterVec::new(watcher_error_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watcher_errors_by_type.clone()))?;

        let watcher_event_opts =
            Opts::new("watch_events", "number of watch events received by watchers");
        let watch_events_by_type = IntCounterVec::new(watcher_event_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watch_events_by_type.clone()))?;

        Ok(Metrics {
            registry,
            api_server_request_times,
            total_watch_events_received,
            reconcile_count_by_podwatcher,
            reconcile_errors_by_podwatcher,
            requeue_count,
            reconciles_in_flight,
            watcher_requests_by_type,
            watcher_errors_by_type,
            watch_events_by_type,
        })
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn watcher_metrics(&self, k8s_type: &K8sType) -> WatcherMetrics {
        let labels = &[k8s_type.api_version, k8s_type.kind];
        WatcherMetrics {
            watcher_requests: self.watcher_requests_by_type.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_type.with_label_values(labels),
            watch_events: self.watch_events_by_type.with_label_values(labels),
            total_watch_events: self.total_watch_events_received.clone(),
        }
    }

    /// Drops the per-Podwatcher series, so that deleted Podwatchers don't live on in the metrics
    pub fn podwatcher_deleted(&self, id: &ObjectIdRef<'_>) {
        let labels = id_labels(id);
        let _ = self.reconcile_count_by_podwatcher.remove_label_values(&labels);
        let _ = self.reconcile_errors_by_podwatcher.remove_label_values(&labels);
    }

    pub fn reconcile_started(&self, id: &ObjectIdRef<'_>) {
        self.reconcile_count_by_podwatcher
            .with_label_values(&id_labels(id))
            .inc();
        self.reconciles_in_flight.inc();
    }

    pub fn reconcile_finished(&self) {
        self.reconciles_in_flight.dec();
    }

    pub fn reconcile_error(&self, id: &ObjectIdRef<'_>) {
        self.reconcile_errors_by_podwatcher
            .with_label_values(&id_labels(id))
            .inc();
    }

    pub fn requeue_scheduled(&self) {
        self.requeue_count.inc();
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Clone)]
pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

pub struct WatcherMetrics {
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
    total_watch_events: IntCounter,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
        self.total_watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}
