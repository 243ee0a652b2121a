use crate::error::StoreError;
use serde_derive::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::watch;
use tracing::debug;

/// Value held by a store path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(v) => Some(*v as f64),
            PropertyValue::Number(v) => Some(*v),
            PropertyValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(v) => Some(*v),
            PropertyValue::Number(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Number(v) => write!(f, "{v}"),
            PropertyValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Integer(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    Writeable,
}

struct Property {
    value: watch::Sender<PropertyValue>,
    access: Access,
    external_writes: u64,
}

/// Process-wide path → value store shared by the poller and external writers.
///
/// Cloning is cheap; all clones see the same paths. Writes are last-value-wins
/// and are pushed to every subscriber of the path.
#[derive(Clone, Default)]
pub struct PropertyStore {
    properties: Arc<Mutex<HashMap<String, Property>>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Property>> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a path with its initial value. Paths are never removed.
    pub fn add_path(
        &self,
        path: &str,
        initial: impl Into<PropertyValue>,
        access: Access,
    ) -> Result<(), StoreError> {
        let mut properties = self.lock();
        if properties.contains_key(path) {
            return Err(StoreError::DuplicatePath(path.to_string()));
        }
        let (value, _) = watch::channel(initial.into());
        properties.insert(
            path.to_string(),
            Property {
                value,
                access,
                external_writes: 0,
            },
        );
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<PropertyValue> {
        self.lock().get(path).map(|p| p.value.borrow().clone())
    }

    /// Internal write from the bridge itself. Ignores the access mode.
    pub fn set(&self, path: &str, value: impl Into<PropertyValue>) -> Result<(), StoreError> {
        let properties = self.lock();
        let property = properties
            .get(path)
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
        property.value.send_replace(value.into());
        Ok(())
    }

    /// Write initiated by an external consumer. Accepted as-is on writeable paths;
    /// the next successful poll overwrites it.
    pub fn write_external(
        &self,
        path: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), StoreError> {
        let value = value.into();
        let mut properties = self.lock();
        let property = properties
            .get_mut(path)
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
        if property.access == Access::ReadOnly {
            return Err(StoreError::ReadOnly(path.to_string()));
        }
        debug!("someone else updated {path} to {value}");
        property.external_writes += 1;
        property.value.send_replace(value);
        Ok(())
    }

    /// Receiver that observes every later write to `path`.
    pub fn subscribe(&self, path: &str) -> Result<watch::Receiver<PropertyValue>, StoreError> {
        self.lock()
            .get(path)
            .map(|p| p.value.subscribe())
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))
    }

    pub fn access(&self, path: &str) -> Option<Access> {
        self.lock().get(path).map(|p| p.access)
    }

    pub fn external_writes(&self, path: &str) -> Option<u64> {
        self.lock().get(path).map(|p| p.external_writes)
    }

    /// All paths with their current values, sorted by path.
    pub fn snapshot(&self) -> Vec<(String, PropertyValue)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(path, p)| (path.clone(), p.value.borrow().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// The snapshot as a JSON object of path → value.
    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        let entries: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|(path, value)| Ok((path, serde_json::to_value(value)?)))
            .collect::<serde_json::Result<_>>()?;
        serde_json::to_string(&entries)
    }
}
