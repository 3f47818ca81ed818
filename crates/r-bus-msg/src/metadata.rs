//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Retained key-value store emulated over pub/sub.
//!
//! Writers publish JSON under `<self>/metadata/<path>` with the retain flag;
//! readers open a [`RemoteView`] per remote instance and receive the
//! retained snapshot followed by incremental changes.
use std::collections::BTreeMap;

use bytes::Bytes;
use r_bus_types::{decode_json, encode_json};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{Client, Subscription};
use crate::transport::BusMessage;
use crate::{topic, BusError, Result};

/// Writer for the own instance's metadata namespace.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    client: Client,
}

impl MetadataStore {
    /// Store publishing through `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Publish `value` as retained JSON at `path`.
    pub fn set<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<()> {
        let payload = encode_json(value)?;
        self.client.publish(
            &topic::metadata(self.client.instance_name(), path),
            payload,
            true,
        )
    }

    /// Remove the retained entry at `path`.
    pub fn clear(&self, path: &str) -> Result<()> {
        self.client.publish(
            &topic::metadata(self.client.instance_name(), path),
            Bytes::new(),
            true,
        )
    }
}

/// Change observed on a remote view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    /// Path written or updated.
    Set {
        /// Metadata path.
        path: String,
        /// New value.
        value: Value,
    },
    /// Path removed.
    Clear {
        /// Metadata path.
        path: String,
    },
}

/// Snapshot of a remote instance's metadata namespace.
#[derive(Debug)]
pub struct RemoteView {
    instance: String,
    subscription: Option<Subscription>,
    snapshot: BTreeMap<String, Value>,
}

impl RemoteView {
    /// Subscribe to `<instance>/metadata/#`; the retained snapshot is applied
    /// before this returns.
    pub async fn open(client: &Client, instance: &str) -> Result<Self> {
        let subscription = client.subscribe(&topic::metadata_pattern(instance)).await?;
        let mut view = Self {
            instance: instance.to_owned(),
            subscription: Some(subscription),
            snapshot: BTreeMap::new(),
        };
        while let Some(message) = view.subscription.as_mut().and_then(Subscription::try_recv) {
            view.apply(message);
        }
        debug!(instance, paths = view.snapshot.len(), "remote view opened");
        Ok(view)
    }

    /// Remote instance name.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Wait for the next change and apply it to the snapshot. `None` once
    /// the view is closed.
    pub async fn next_change(&mut self) -> Option<ViewChange> {
        loop {
            let message = self.subscription.as_mut()?.recv().await?;
            if let Some(change) = self.apply(message) {
                return Some(change);
            }
        }
    }

    /// Known paths, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.snapshot.keys().map(String::as_str)
    }

    /// Value at `path`.
    pub fn get_value(&self, path: &str) -> Result<&Value> {
        self.find_value(path).ok_or_else(|| BusError::UnknownPath {
            instance: self.instance.clone(),
            path: path.to_owned(),
        })
    }

    /// Value at `path`, if present.
    pub fn find_value(&self, path: &str) -> Option<&Value> {
        self.snapshot.get(path)
    }

    /// Value at `path` deserialized into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get_value(path)?.clone())?)
    }

    /// Unsubscribe. Further calls to [`RemoteView::next_change`] return `None`.
    pub fn close(&mut self) {
        self.subscription = None;
    }

    fn apply(&mut self, message: BusMessage) -> Option<ViewChange> {
        let path = topic::metadata_path(&self.instance, &message.topic)?.to_owned();
        if message.is_tombstone() {
            self.snapshot.remove(&path)?;
            return Some(ViewChange::Clear { path });
        }
        let value: Value = match decode_json(&message.payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(instance = %self.instance, path = %path, error = %err, "skipping undecodable metadata");
                return None;
            }
        };
        if self.snapshot.get(&path) == Some(&value) {
            return None;
        }
        self.snapshot.insert(path.clone(), value.clone());
        Some(ViewChange::Set { path, value })
    }
}
