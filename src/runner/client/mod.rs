//! Http client for the Kubernetes api server, and the `Store` implementation that the reconciler
//! uses in production.
mod request;
mod stream;

pub use self::stream::{ApiError, LineDeserializer, Lines, ListMeta, ObjectList, WatchEvent};

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::{K8sResource, ObjectIdRef};
use crate::runner::metrics::ClientMetrics;
use crate::podwatcher::selector_string;
use crate::store::{Store, StoreError};

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

/// Everything that can go wrong talking to the api server
#[derive(Debug)]
pub enum Error {
    /// The connection failed, or the body couldn't be read
    Transport(hyper::Error),
    /// A body that isn't the json we expected
    Decode(serde_json::Error),
    /// The api server answered with a non-success status
    Status(StatusCode),
    Request(http::Error),
    InvalidUrl(String),
}

impl Error {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// The resource version a watch or list started from is too old to be served
    pub fn is_expired(&self) -> bool {
        self.status() == Some(StatusCode::GONE)
    }

    /// Maps the error onto the store contract. A 409 means different things for creates and
    /// updates, so the caller says what it should become.
    fn into_store_error(self, on_conflict: StoreError) -> StoreError {
        match self.status() {
            Some(status) if status == StatusCode::NOT_FOUND => StoreError::NotFound,
            Some(status) if status == StatusCode::CONFLICT => on_conflict,
            _ => StoreError::transient(self),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "request to api server failed: {}", e),
            Error::Decode(e) => write!(f, "unexpected response body: {}", e),
            Error::Status(status) => write!(f, "api server responded with {}", status),
            Error::Request(e) => write!(f, "invalid request: {}", e),
            Error::InvalidUrl(url) => write!(f, "invalid api server url: {}", url),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Request(e) => Some(e),
            Error::Status(_) | Error::InvalidUrl(_) => None,
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Transport(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Decode(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(mut config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // prefer http2, negotiated with alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        match config.ca_data.take() {
            Some(CAData::Contents(encoded)) => {
                let pem = decode_base64(&encoded, "certificate-authority-data")?;
                let cert_store = ssl.cert_store_mut();
                for cert in X509::stack_from_pem(pem.as_slice())? {
                    cert_store.add_cert(cert)?;
                }
            }
            Some(CAData::File(path)) => ssl.set_ca_file(path.as_str())?,
            None => {}
        }

        let client_identity = match &config.credentials {
            Credentials::PemPath {
                certificate_path,
                private_key_path,
            } => Some((read_file(certificate_path)?, read_file(private_key_path)?)),
            Credentials::Pem {
                certificate_base64,
                private_key_base64,
            } => Some((
                decode_base64(certificate_base64, "client-certificate-data")?,
                decode_base64(private_key_base64, "client-key-data")?,
            )),
            Credentials::Header(_) => None,
        };
        if let Some((cert_pem, key_pem)) = client_identity {
            let cert = X509::from_pem(cert_pem.as_slice())?;
            let pkey = PKey::private_key_from_pem(key_pem.as_slice())?;
            ssl.set_certificate(&cert)?;
            ssl.set_private_key(&pkey)?;
            ssl.check_private_key()?;
        }

        if config.verify_ssl_certs {
            ssl.set_verify(SslVerifyMode::PEER);
        } else {
            log::warn!("TLS certificate verification is disabled, connections to the api server are insecure");
            ssl.set_verify(SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let inner = ClientInner {
            http_client: HyperClient::builder().build(https),
            config,
            metrics,
        };
        Ok(Client(Arc::new(inner)))
    }

    /// Lists every matching object, along with the resourceVersion to start a watch from
    pub async fn list_all(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, label_selector, namespace)?;
        self.send_json(req).await
    }

    /// Starts a watch. Events are deserialized as they arrive, until the api server ends the
    /// response.
    pub async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<LineDeserializer<WatchEvent>, Error> {
        let req = request::watch_request(
            &self.0.config,
            k8s_type,
            resource_version,
            label_selector,
            None,
            namespace,
        )?;
        let response = self.send(req).await?;
        match response.status() {
            status if status.is_success() => {
                Ok(LineDeserializer::new(Lines::from_body(response.into_body())))
            }
            status => Err(Error::Status(status)),
        }
    }

    /// Sends a request whose whole response body is a single json document
    async fn send_json<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let description = format!("{} {}", req.method(), req.uri());
        let response = self.send(req).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            log::debug!(
                "{} failed with status: {}, body: {}",
                description,
                status,
                String::from_utf8_lossy(&body)
            );
            return Err(Error::Status(status));
        }
        log::trace!("{} returned body: {}", description, String::from_utf8_lossy(&body));
        serde_json::from_slice(&body).map_err(Error::from)
    }

    /// Sends the request and waits for the response headers, recording the time it took
    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let description = format!("{} {}", req.method(), req.uri());
        let start_time = Instant::now();
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();

        let response = result.map_err(|err| {
            log::error!("Failed to send {}: {}", description, err);
            Error::from(err)
        })?;
        log::debug!(
            "{} responded with {} in {}ms",
            description,
            response.status().as_u16(),
            start_time.elapsed().as_millis()
        );
        Ok(response)
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, io::Error> {
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    Ok(contents)
}

fn decode_base64(encoded: &str, field: &str) -> Result<Vec<u8>, io::Error> {
    base64::decode(encoded).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid base64 content of {}: {}", field, err),
        )
    })
}

/// Fills in the `apiVersion` and `kind` that the api server leaves off of list items
pub(crate) fn with_type_meta(k8s_type: &K8sType, mut item: Value) -> Value {
    if let Some(obj) = item.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::from(k8s_type.api_version));
        obj.entry("kind")
            .or_insert_with(|| Value::from(k8s_type.kind));
    }
    item
}

fn into_resource(value: Value) -> Result<K8sResource, StoreError> {
    K8sResource::from_value(value).map_err(StoreError::transient)
}

fn id_of(resource: &Value) -> Result<ObjectIdRef, StoreError> {
    crate::resource::object_id(resource)
        .ok_or_else(|| StoreError::transient("resource is missing metadata.name"))
}

#[async_trait]
impl Store for Client {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'_>,
    ) -> Result<K8sResource, StoreError> {
        let req = request::get_request(&self.0.config, k8s_type, &id);
        self.request_object(req, StoreError::Conflict).await
    }

    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K8sResource>, StoreError> {
        let namespace = Some(namespace).filter(|ns| !ns.is_empty());
        let selector = selector_string(selector);
        let list = self
            .list_all(k8s_type, namespace, Some(selector.as_str()))
            .await
            .map_err(|e| e.into_store_error(StoreError::Conflict))?;
        list.items
            .into_iter()
            .map(|item| into_resource(with_type_meta(k8s_type, item)))
            .collect()
    }

    async fn create(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let req = request::create_request(&self.0.config, k8s_type, resource);
        self.request_object(req, StoreError::AlreadyExists).await
    }

    async fn update(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let req = request::replace_request(&self.0.config, k8s_type, &id_of(resource)?, resource);
        self.request_object(req, StoreError::Conflict).await
    }

    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let id = id_of(resource)?;
        let req = request::update_status_request(&self.0.config, k8s_type, &id, resource);
        self.request_object(req, StoreError::Conflict).await
    }
}

impl Client {
    /// Sends a request that returns a single object. `on_conflict` is what a 409 means for it.
    async fn request_object(
        &self,
        req: Result<Request<Body>, Error>,
        on_conflict: StoreError,
    ) -> Result<K8sResource, StoreError> {
        let result = match req {
            Ok(req) => self.send_json(req).await,
            Err(err) => Err(err),
        };
        result
            .map_err(|e| e.into_store_error(on_conflict))
            .and_then(into_resource)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_codes_map_onto_store_errors() {
        let not_found = Error::Status(StatusCode::NOT_FOUND);
        assert_eq!(StoreError::NotFound, not_found.into_store_error(StoreError::Conflict));

        let conflict = Error::Status(StatusCode::CONFLICT);
        assert_eq!(
            StoreError::AlreadyExists,
            conflict.into_store_error(StoreError::AlreadyExists)
        );

        let unavailable = Error::Status(StatusCode::SERVICE_UNAVAILABLE);
        match unavailable.into_store_error(StoreError::Conflict) {
            StoreError::Transient(msg) => assert!(msg.contains("503")),
            other => panic!("expected transient error, got: {:?}", other),
        }
    }

    #[test]
    fn only_a_410_means_the_resource_version_expired() {
        assert!(Error::Status(StatusCode::GONE).is_expired());
        assert!(!Error::Status(StatusCode::NOT_FOUND).is_expired());
        assert!(!Error::InvalidUrl("nope".to_owned()).is_expired());
    }

    #[test]
    fn list_items_get_type_meta() {
        let item = serde_json::json!({
            "metadata": { "namespace": "ns", "name": "web-abc", "uid": "u", "resourceVersion": "1" }
        });
        let item = with_type_meta(crate::k8s_types::core::v1::Pod, item);
        let resource = into_resource(item).unwrap();
        assert_eq!("v1", resource.api_version());
        assert_eq!("Pod", resource.kind());
    }
}
