//! Sources of the pollable device list

use std::sync::Arc;

use async_trait::async_trait;

use crate::Device;
use crate::storage::StorageBackend;

/// Restricts which devices a registry read returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Skip devices whose `active` flag is cleared
    pub active_only: bool,

    /// Only devices of this group
    pub group: Option<String>,
}

impl DeviceFilter {
    /// Active devices of every group
    pub fn active() -> Self {
        Self {
            active_only: true,
            group: None,
        }
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    pub fn matches(&self, device: &Device) -> bool {
        if self.active_only && !device.active {
            return false;
        }

        match &self.group {
            Some(group) => device.group.as_deref() == Some(group.as_str()),
            None => true,
        }
    }
}

/// Supplies devices in ascending id order
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn devices(&self, filter: &DeviceFilter) -> anyhow::Result<Vec<Device>>;
}

/// Fixed device list, typically straight from the configuration file
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    devices: Vec<Device>,
}

impl StaticRegistry {
    pub fn new(mut devices: Vec<Device>) -> Self {
        devices.sort_by_key(|device| device.id);
        Self { devices }
    }
}

#[async_trait]
impl DeviceRegistry for StaticRegistry {
    async fn devices(&self, filter: &DeviceFilter) -> anyhow::Result<Vec<Device>> {
        Ok(self
            .devices
            .iter()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect())
    }
}

/// Devices table of the persistent store
#[derive(Clone)]
pub struct StoreRegistry {
    store: Arc<dyn StorageBackend>,
}

impl StoreRegistry {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeviceRegistry for StoreRegistry {
    async fn devices(&self, filter: &DeviceFilter) -> anyhow::Result<Vec<Device>> {
        Ok(self.store.list_devices(filter).await?)
    }
}
