//! Just enough of the kubeconfig format to connect to the cluster of the current context.
use super::{CAData, ClientConfig, Credentials};

use serde::de::DeserializeOwned;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    /// Neither `$KUBECONFIG` nor a home directory is available
    NoHomeDir,
    /// The file parsed, but it doesn't describe a usable context
    Invalid(String),
    /// The user of the current context has no credentials we know how to use
    MissingCredentials,
    /// The credential plugin of the current user failed
    Exec(String),
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KubeConfigError::Io(e) => write!(f, "failed to read kubeconfig: {}", e),
            KubeConfigError::Format(e) => write!(f, "failed to parse kubeconfig: {}", e),
            KubeConfigError::NoHomeDir => {
                f.write_str("KUBECONFIG is not set and there is no home directory to look in")
            }
            KubeConfigError::Invalid(msg) => write!(f, "invalid kubeconfig: {}", msg),
            KubeConfigError::MissingCredentials => {
                f.write_str("the user of the current context has no supported credentials")
            }
            KubeConfigError::Exec(msg) => write!(f, "credential plugin failed: {}", msg),
        }
    }
}

impl std::error::Error for KubeConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KubeConfigError::Io(e) => Some(e),
            KubeConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

/// `$KUBECONFIG` if it's set, otherwise `~/.kube/config`
fn default_path() -> Result<PathBuf, KubeConfigError> {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or(KubeConfigError::NoHomeDir)
}

pub fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    load_kubeconfig(user_agent, default_path()?)
}

/// Loads the file at `path` and creates a `ClientConfig` for its current context
pub fn load_kubeconfig(
    user_agent: String,
    path: impl AsRef<Path>,
) -> Result<ClientConfig, KubeConfigError> {
    let path = path.as_ref();
    log::debug!("Loading kubeconfig from '{}'", path.display());
    let kubeconfig = KubeConfig::load_file(path)?;
    // relative paths in the file are relative to the file itself
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    kubeconfig.client_config(user_agent, dir)
}

/// A kubeconfig file that's been loaded into memory
#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    current_context: String,
    #[serde(default)]
    clusters: Vec<Named<Cluster>>,
    #[serde(default)]
    users: Vec<Named<User>>,
    #[serde(default)]
    contexts: Vec<Named<Context>>,
}

impl KubeConfig {
    pub fn load_file(path: &Path) -> Result<KubeConfig, KubeConfigError> {
        parse_yaml(File::open(path)?)
    }

    /// Creates a `ClientConfig` for the current context. Relative file paths in the kubeconfig are
    /// resolved against `dir`.
    pub fn client_config(
        &self,
        user_agent: String,
        dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = lookup(&self.contexts, "context", &self.current_context)?;
        let cluster = lookup(&self.clusters, "cluster", &context.cluster)?;
        let user = lookup(&self.users, "user", &context.user)?;
        log::debug!(
            "Using context '{}' with cluster '{}' and user '{}'",
            self.current_context,
            context.cluster,
            context.user
        );

        Ok(ClientConfig {
            user_agent,
            credentials: user.credentials()?,
            impersonate: user.impersonate.clone(),
            impersonate_groups: user.impersonate_groups.clone(),
            api_server_endpoint: cluster.server.clone(),
            ca_data: cluster.ca_data(dir),
            verify_ssl_certs: !cluster.insecure_skip_tls_verify,
        })
    }
}

fn parse_yaml<T: DeserializeOwned>(reader: impl io::Read) -> Result<T, KubeConfigError> {
    serde_yaml::from_reader(reader).map_err(KubeConfigError::from)
}

fn lookup<'a, T>(
    entries: &'a [Named<T>],
    kind: &str,
    name: &str,
) -> Result<&'a T, KubeConfigError> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| &entry.value)
        .ok_or_else(|| {
            KubeConfigError::Invalid(format!("there is no {} named '{}'", kind, name))
        })
}

/// The clusters, users, and contexts are all lists of `{name, <kind>: {...}}`
#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "user", alias = "context")]
    value: T,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Context {
    cluster: String,
    user: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

impl Cluster {
    /// Inline data wins over a file
    fn ca_data(&self, dir: &Path) -> Option<CAData> {
        if let Some(data) = self.certificate_authority_data.as_ref() {
            return Some(CAData::Contents(data.clone()));
        }
        self.certificate_authority
            .as_ref()
            .map(|path| CAData::File(dir.join(path).to_string_lossy().into_owned()))
    }
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct User {
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    exec: Option<ExecPlugin>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    #[serde(rename = "as")]
    impersonate: Option<String>,
    #[serde(rename = "as-groups", default)]
    impersonate_groups: Vec<String>,
}

impl User {
    /// The first kind of credentials that's configured, checked in the order of the fields
    fn credentials(&self) -> Result<Credentials, KubeConfigError> {
        if let Some(token) = self.token.as_ref() {
            return Ok(Credentials::bearer_token(token));
        }
        if let Some(username) = self.username.as_ref() {
            let password = required(&self.password, "password", "username")?;
            return Ok(Credentials::basic(username, password));
        }
        if let Some(exec) = self.exec.as_ref() {
            return exec.run().map(|token| Credentials::bearer_token(&token));
        }
        if let Some(certificate_path) = self.client_certificate.as_ref() {
            let key_path = required(&self.client_key, "client-key", "client-certificate")?;
            return Ok(Credentials::PemPath {
                certificate_path: certificate_path.clone(),
                private_key_path: key_path.to_owned(),
            });
        }
        if let Some(certificate) = self.client_certificate_data.as_ref() {
            let key = required(
                &self.client_key_data,
                "client-key-data",
                "client-certificate-data",
            )?;
            return Ok(Credentials::Pem {
                certificate_base64: certificate.clone(),
                private_key_base64: key.to_owned(),
            });
        }
        Err(KubeConfigError::MissingCredentials)
    }
}

fn required<'a>(
    field: &'a Option<String>,
    name: &str,
    needed_by: &str,
) -> Result<&'a str, KubeConfigError> {
    field.as_deref().ok_or_else(|| {
        KubeConfigError::Invalid(format!("'{}' is set but '{}' is missing", needed_by, name))
    })
}

/// A credential plugin that prints an `ExecCredential` with a bearer token
#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ExecPlugin {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<EnvVar>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Deserialize, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: String,
    expiration_timestamp: Option<String>,
}

impl ExecPlugin {
    fn run(&self) -> Result<String, KubeConfigError> {
        log::debug!("Running credential plugin '{}'", self.command);
        let output = Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|var| (&var.name, &var.value)))
            .output()?;
        if !output.status.success() {
            return Err(KubeConfigError::Exec(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let credential: ExecCredential =
            serde_yaml::from_slice(&output.stdout).map_err(|err| {
                KubeConfigError::Exec(format!(
                    "'{}' printed an invalid ExecCredential: {}",
                    self.command, err
                ))
            })?;
        log::info!(
            "Got a token from '{}' that expires at: {:?}",
            self.command,
            credential.status.expiration_timestamp
        );
        Ok(credential.status.token)
    }
}
