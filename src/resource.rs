mod object_id;

pub use self::object_id::{ObjectId, ObjectIdRef};

use serde::de::DeserializeOwned;
use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

pub static API_VERSION_POINTER: &str = "/apiVersion";
pub static KIND_POINTER: &str = "/kind";
pub static NAMESPACE_POINTER: &str = "/metadata/namespace";
pub static NAME_POINTER: &str = "/metadata/name";
pub static UID_POINTER: &str = "/metadata/uid";
pub static RESOURCE_VERSION_POINTER: &str = "/metadata/resourceVersion";

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// A resource as it exists in the store: raw json that is guaranteed to have the metadata that
/// the store assigns (`name`, `uid`, `resourceVersion`) along with `apiVersion` and `kind`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        if let Err(message) = K8sResource::validate(&value) {
            Err(InvalidResourceError { message, value })
        } else {
            Ok(K8sResource(value))
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Deserializes the resource as the given type
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    pub fn resource_version(&self) -> &str {
        self.str_value(RESOURCE_VERSION_POINTER).unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.str_value(UID_POINTER).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_value(NAME_POINTER).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value(NAMESPACE_POINTER)
    }

    pub fn api_version(&self) -> &str {
        self.str_value(API_VERSION_POINTER).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.str_value(KIND_POINTER).unwrap_or_default()
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.pointer("/status")
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    /// Returns the name of the owner that is marked as the controller of this resource, but only if
    /// that owner has the given kind.
    pub fn controller_name(&self, owner_kind: &str) -> Option<&str> {
        let refs = self.0.pointer("/metadata/ownerReferences")?.as_array()?;
        refs.iter()
            .filter(|r| r.get("controller").and_then(Value::as_bool) == Some(true))
            .find(|r| r.get("kind").and_then(Value::as_str) == Some(owner_kind))
            .and_then(|r| r.get("name"))
            .and_then(Value::as_str)
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        let ns = self.namespace().unwrap_or("");
        ObjectIdRef::new(ns, self.name())
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        str_value(&self.0, pointer)
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        str_value(value, RESOURCE_VERSION_POINTER).ok_or("missing metadata.resourceVersion")?;
        str_value(value, NAME_POINTER).ok_or("missing metadata.name")?;
        str_value(value, UID_POINTER).ok_or("missing metadata.uid")?;
        str_value(value, API_VERSION_POINTER).ok_or("missing apiVersion")?;
        str_value(value, KIND_POINTER).ok_or("missing kind")?;
        Ok(())
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(resource: K8sResource) -> Value {
        resource.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn str_value<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

/// Returns the id of a json resource that may not have been stored yet
pub fn object_id(json: &Value) -> Option<ObjectIdRef> {
    let namespace = str_value(json, NAMESPACE_POINTER).unwrap_or("");
    str_value(json, NAME_POINTER).map(|name| ObjectIdRef::new(namespace, name))
}
