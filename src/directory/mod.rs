// Device and room metadata, loaded once per pipeline instance

use crate::config::DirectoryConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Device metadata copied onto metrics records
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Room metadata copied onto metrics records
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RoomInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_group: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// External device/room catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;
    async fn list_rooms(&self) -> Result<Vec<RoomInfo>>;
}

#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    devices: Vec<DeviceInfo>,
    #[serde(default)]
    rooms: Vec<RoomInfo>,
}

/// Catalog read from a JSON document `{ "devices": [...], "rooms": [...] }`.
///
/// The file is read and parsed once, on the first listing.
pub struct FileCatalog {
    path: PathBuf,
    document: OnceCell<CatalogDocument>,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: OnceCell::new(),
        }
    }

    async fn document(&self) -> Result<&CatalogDocument> {
        self.document
            .get_or_try_init(|| async {
                let contents = tokio::fs::read_to_string(&self.path)
                    .await
                    .with_context(|| format!("Failed to read catalog {}", self.path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse catalog {}", self.path.display()))
            })
            .await
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.document().await?.devices.clone())
    }

    async fn list_rooms(&self) -> Result<Vec<RoomInfo>> {
        Ok(self.document().await?.rooms.clone())
    }
}

/// Read-only lookup tables built from a [`Catalog`].
#[derive(Clone, Debug, Default)]
pub struct Directory {
    devices: HashMap<String, DeviceInfo>,
    rooms: HashMap<String, RoomInfo>,
}

impl Directory {
    /// Pull every device and room out of the catalog.
    pub async fn load(catalog: &dyn Catalog) -> Result<Self> {
        let devices = catalog
            .list_devices()
            .await
            .context("Couldn't list devices")?;
        let rooms = catalog.list_rooms().await.context("Couldn't list rooms")?;

        let directory = Self::from_parts(devices, rooms);
        info!(
            devices = directory.devices.len(),
            rooms = directory.rooms.len(),
            "Loaded device directory"
        );
        Ok(directory)
    }

    /// Build the directory a pipeline runs with.
    ///
    /// An unset catalog gives an empty directory. A configured catalog that
    /// cannot be loaded is an error, so no job runs without its metadata.
    pub async fn from_config(config: &DirectoryConfig) -> Result<Self> {
        let Some(path) = &config.catalog_file else {
            warn!("No device catalog configured, every record will fail enrichment");
            return Ok(Self::default());
        };

        Self::load(&FileCatalog::new(path))
            .await
            .context("Couldn't initialize display-state caterpillar")
    }

    pub fn from_parts(devices: Vec<DeviceInfo>, rooms: Vec<RoomInfo>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            rooms: rooms.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn device(&self, id: &str) -> Option<&DeviceInfo> {
        self.devices.get(id)
    }

    pub fn room(&self, id: &str) -> Option<&RoomInfo> {
        self.rooms.get(id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
