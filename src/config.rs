mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use crate::podwatcher::COMPONENT_NAME;

use std::fmt::{self, Debug};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// The container that runs in every pod of a managed Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTemplate {
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub port_name: String,
    pub container_port: u16,
}

impl Default for WorkloadTemplate {
    fn default() -> WorkloadTemplate {
        WorkloadTemplate {
            container_name: COMPONENT_NAME.to_owned(),
            image: format!("{}:latest", COMPONENT_NAME),
            command: ["podwatcher", "-m=64", "-o", "modern", "-v"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            port_name: COMPONENT_NAME.to_owned(),
            container_port: 11211,
        }
    }
}

/// Configuration for running the operator. Create one with `OperatorConfig::new` and then
/// customize it with the builder functions:
///
/// ```
/// use podwatcher::config::OperatorConfig;
///
/// let config = OperatorConfig::new("podwatcher-operator")
///     .within_namespace("team-a")
///     .worker_count(8)
///     .expose_health(false);
/// assert_eq!(Some("team-a".to_owned()), config.namespace);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// used as the user agent for api requests
    pub operator_name: String,
    /// only watch resources in this namespace. All namespaces are watched if this is `None`
    pub namespace: Option<String>,
    /// maximum number of reconciles that may run at the same time
    pub worker_count: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
    pub workload: WorkloadTemplate,
}

impl OperatorConfig {
    pub fn new(operator_name: impl Into<String>) -> OperatorConfig {
        OperatorConfig {
            operator_name: operator_name.into(),
            namespace: None,
            worker_count: DEFAULT_WORKER_COUNT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
            workload: WorkloadTemplate::default(),
        }
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the maximum number of concurrent reconciles. Values of 0 are treated as 1.
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    /// Sets the first delay after a failed reconcile, and the cap for the exponential backoff
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose_metrics: bool) -> Self {
        self.expose_metrics = expose_metrics;
        self
    }

    pub fn expose_health(mut self, expose_health: bool) -> Self {
        self.expose_health = expose_health;
        self
    }

    pub fn with_workload(mut self, workload: WorkloadTemplate) -> Self {
        self.workload = workload;
        self
    }
}

/// Certificate authority used to verify the api server
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// base64 encoded PEM, as found in kubeconfig `certificate-authority-data`
    Contents(String),
    File(String),
}

#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// the full value of the `Authorization` header, for example `Bearer <token>`
    Header(String),
    /// base64 encoded client certificate and key
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
}

impl Credentials {
    pub fn bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password).as_bytes());
        Credentials::Header(format!("Basic {}", encoded))
    }

    pub fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

// keep tokens and keys out of the logs
impl Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::Header(_) => f.write_str("Header(<redacted>)"),
            Credentials::Pem { .. } => f.write_str("Pem(<redacted>)"),
            Credentials::PemPath {
                certificate_path,
                private_key_path,
            } => f
                .debug_struct("PemPath")
                .field("certificate_path", certificate_path)
                .field("private_key_path", private_key_path)
                .finish(),
        }
    }
}

/// Everything needed to talk to the api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Loads the configuration from the service account that's mounted into every pod. This is what
    /// you want when the operator runs inside the cluster.
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let mut token_file = File::open(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let mut service_account_token = String::new();
        token_file.read_to_string(&mut service_account_token)?;

        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            credentials: Credentials::bearer_token(&service_account_token),
            ca_data,
            user_agent: user_agent.into(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        })
    }

    /// Loads the configuration from `$KUBECONFIG`, or `~/.kube/config` if that isn't set
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_workload_matches_podwatcher_image() {
        let workload = WorkloadTemplate::default();
        assert_eq!("podwatcher:latest", workload.image);
        assert_eq!(11211, workload.container_port);
        assert_eq!("podwatcher", workload.command[0]);
    }

    #[test]
    fn builder_functions_clamp_values() {
        let config = OperatorConfig::new("test")
            .worker_count(0)
            .backoff(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(1, config.worker_count);
        assert_eq!(Duration::from_secs(2), config.max_backoff);
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let creds = Credentials::bearer_token("super-secret\n");
        assert_eq!(Some("Bearer super-secret"), creds.header_value());
        assert!(!format!("{:?}", creds).contains("super-secret"));

        let basic = Credentials::basic("admin", "hunter2");
        assert_eq!(Some("Basic YWRtaW46aHVudGVyMg=="), basic.header_value());
    }
}
