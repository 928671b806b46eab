use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;
use tracker_relay_protocol::DeviceId;

use crate::device::DeviceState;

/// Device table plus the session→device ownership map used to remove a
/// subscriber on connection close without scanning every `DeviceState`
/// (invariant I2: a session subscribes to at most one device at a time).
pub struct Registry {
    devices: DashMap<DeviceId, Arc<DeviceState>>,
    session_owner: DashMap<usize, DeviceId>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            session_owner: DashMap::new(),
        }
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.devices.contains_key(&device_id)
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Arc<DeviceState>> {
        self.devices.get(&device_id).map(|entry| entry.clone())
    }

    pub fn insert(&self, device_id: DeviceId, state: Arc<DeviceState>) {
        self.devices.insert(device_id, state);
    }

    pub fn insert_if_absent(&self, device_id: DeviceId) -> Arc<DeviceState> {
        self.devices
            .entry(device_id)
            .or_insert_with(DeviceState::new)
            .clone()
    }

    pub fn record_subscription(&self, session_id: usize, device_id: DeviceId) {
        self.session_owner.insert(session_id, device_id);
    }

    /// Removes the session from whatever `DeviceState` owns it, if any.
    pub fn remove_subscription(&self, session_id: usize) {
        if let Some((_, device_id)) = self.session_owner.remove(&session_id) {
            if let Some(device) = self.get(device_id) {
                device.remove_subscriber(session_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates an empty marker file named by `device_id`'s canonical UUID form
/// in `storage_dir`. The file is opened and closed within this call on
/// every path, including the error path.
pub async fn create_marker_file(storage_dir: &Path, device_id: DeviceId) -> std::io::Result<()> {
    let path = storage_dir.join(device_id.to_uuid_string());
    tokio::fs::File::create(path).await?;
    Ok(())
}

/// Scans `storage_dir` for marker files (filenames that parse as a
/// canonical UUID) and registers an empty `DeviceState` for each. This is
/// the startup half of registry invariant I1.
pub async fn scan_marker_files(storage_dir: &Path, registry: &Registry) -> std::io::Result<usize> {
    let mut read_dir = tokio::fs::read_dir(storage_dir).await?;
    let mut found = 0usize;
    while let Some(entry) = read_dir.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(device_id) = DeviceId::from_uuid_string(name) {
            registry.insert_if_absent(device_id);
            found += 1;
        } else if !name.starts_with("tracking") {
            warn!(file = name, "ignoring unrecognized file in storage directory");
        }
    }
    Ok(found)
}
