use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";

pub fn get_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    make_req(url, Method::GET, client_config)
        .body(Body::empty())
        .map_err(Into::into)
}

pub fn create_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, get_namespace(resource), None)?;
    let as_vec = serde_json::to_vec(resource)?;
    make_req(url, Method::POST, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))
        .map_err(Into::into)
}

pub fn replace_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    let as_vec = serde_json::to_vec(resource)?;
    make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))
        .map_err(Into::into)
}

/// A PUT to the status sub-resource. The body is the whole object, but only its status is applied.
pub fn update_status_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    url.path_segments_mut()
        .map_err(|_| Error::InvalidUrl(client_config.api_server_endpoint.clone()))?
        .push("status");
    let as_vec = serde_json::to_vec(resource)?;
    make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))
        .map_err(Into::into)
}

pub fn watch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource_version: Option<&str>,
    label_selector: Option<&str>,
    timeout_seconds: Option<u32>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(selector) = label_selector {
            query.append_pair("labelSelector", selector);
        }
        if let Some(timeout) = timeout_seconds {
            let as_str = format!("{}", timeout);
            query.append_pair("timeoutSeconds", &as_str);
        }
    }

    make_req(url, Method::GET, client_config)
        .body(Body::empty())
        .map_err(Into::into)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    label_selector: Option<&str>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    if let Some(selector) = label_selector {
        url.query_pairs_mut().append_pair("labelSelector", selector);
    }
    make_req(url, Method::GET, client_config)
        .body(Body::empty())
        .map_err(Into::into)
}

fn make_req(url: Url, method: Method, client_config: &ClientConfig) -> http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(String::from(url))
        .header(header::USER_AGENT, client_config.user_agent.as_str());
    if let Some(auth) = client_config.credentials.header_value() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = client_config.impersonate.as_ref() {
        builder = builder.header(IMPERSONATE_USER, user.as_str());
    }
    for group in client_config.impersonate_groups.iter() {
        builder = builder.header(IMPERSONATE_GROUP, group.as_str());
    }
    builder
}

fn get_namespace(resource: &Value) -> Option<&str> {
    resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<Url, Error> {
    let endpoint = client_config.api_server_endpoint.as_str();
    let mut url = Url::parse(endpoint).map_err(|e| Error::InvalidUrl(format!("{}: {}", endpoint, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidUrl(endpoint.to_owned()))?;
        segments.pop_if_empty();

        let (group, version) = k8s_type.as_group_and_version();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(version);
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
    }
    Ok(url)
}
