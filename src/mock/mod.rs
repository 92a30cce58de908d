//! In-memory volume service.
//!
//! Stands in for a real storage backend behind the interception layer: it
//! implements both the downstream [`VolumeHandler`] and the
//! [`IdempotencyProvider`] oracle over one shared store, so the layer's
//! decisions and the service's effects observe the same state.
//!
//! Publication state is encoded as volume attributes: a controller publish
//! on node `N` sets `N/dev`, a node publish at `T` sets `N/T`.

use crate::{
    csi::{
        CreateVolumeRequest, GetCapacityRequest, GetNodeIdRequest, ListVolumesRequest,
        ListVolumesResult, PublishInfo, Reply, Request, Response, VolumeErrorCode, VolumeInfo,
    },
    error::SvcError,
    provider::{IdempotencyProvider, VolumeHandler},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

/// Attribute under which a volume's caller-chosen name is recorded.
pub const NAME_KEY: &str = "name";
/// Device path reported for controller-published volumes.
pub const MOCK_DEVICE: &str = "/dev/mock";

const GIB: u64 = 1024 * 1024 * 1024;
/// Default capacity for volumes created without a capacity range.
pub const DEFAULT_CAPACITY: u64 = 100 * GIB;
/// Capacity reported by GetCapacity.
pub const TOTAL_CAPACITY: u64 = 100 * 1024 * GIB;

/// In-memory volume service and state oracle.
#[derive(Debug)]
pub struct MockVolumeService {
    node_id: String,
    /// Attributes stamped onto every created volume.
    base_attributes: HashMap<String, String>,
    next_id: AtomicU64,
    vols: RwLock<Vec<VolumeInfo>>,
}

impl MockVolumeService {
    /// A new, empty service serving node `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            base_attributes: HashMap::new(),
            next_id: AtomicU64::new(1),
            vols: RwLock::new(Vec::new()),
        }
    }

    /// Stamp `attributes` onto every volume the service creates. Request
    /// parameters override them key by key.
    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.base_attributes = attributes;
        self
    }

    /// The node this service publishes volumes on.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Snapshot of a volume's current info.
    pub fn volume(&self, id: &str) -> Option<VolumeInfo> {
        self.vols.read().iter().find(|v| v.id == id).cloned()
    }

    /// Drop a volume from the store without going through DeleteVolume.
    /// Lets tests move the backend underneath the interception layer.
    pub fn remove_volume(&self, id: &str) {
        self.vols.write().retain(|v| v.id != id);
    }

    /// Attribute key marking a controller publication on `node_id`.
    fn dev_path_key(node_id: &str) -> String {
        format!("{node_id}/dev")
    }

    /// Attribute key marking a node publication at `target_path`.
    fn mnt_path_key(&self, target_path: &str) -> String {
        format!("{}/{}", self.node_id, target_path)
    }

    fn create_volume(&self, request: CreateVolumeRequest) -> Response {
        // Without a capacity range fall back to the default size; a range
        // takes the required bytes, then the limit bytes, whichever is set
        // last.
        let mut capacity = DEFAULT_CAPACITY;
        if let Some(range) = request.capacity_range {
            if range.required_bytes > 0 {
                capacity = range.required_bytes;
            }
            if range.limit_bytes > 0 {
                capacity = range.limit_bytes;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let mut attributes = self.base_attributes.clone();
        attributes.extend(request.parameters);
        attributes.insert(NAME_KEY.to_string(), request.name);

        let volume = VolumeInfo {
            id,
            capacity_bytes: capacity,
            attributes,
        };
        debug!(volume.id = %volume.id, "mock volume created");
        self.vols.write().push(volume.clone());
        Response::CreateVolume(Reply::Result(volume))
    }

    fn delete_volume(&self, volume_id: &str) -> Response {
        self.vols.write().retain(|v| v.id != volume_id);
        Response::DeleteVolume(Reply::Result(()))
    }

    fn controller_publish_volume(&self, volume_id: &str, node_id: &str) -> Response {
        let key = Self::dev_path_key(node_id);
        let mut vols = self.vols.write();
        match vols.iter_mut().find(|v| v.id == volume_id) {
            Some(volume) => {
                volume
                    .attributes
                    .insert(key, MOCK_DEVICE.to_string());
                Response::ControllerPublishVolume(Reply::Result(PublishInfo::from([(
                    "device".to_string(),
                    MOCK_DEVICE.to_string(),
                )])))
            }
            None => Response::controller_publish_volume_error(
                VolumeErrorCode::GeneralError,
                format!("volume '{volume_id}' not found"),
            ),
        }
    }

    fn controller_unpublish_volume(&self, volume_id: &str, node_id: &str) -> Response {
        let key = Self::dev_path_key(node_id);
        let mut vols = self.vols.write();
        if let Some(volume) = vols.iter_mut().find(|v| v.id == volume_id) {
            volume.attributes.remove(&key);
        }
        Response::ControllerUnpublishVolume(Reply::Result(()))
    }

    fn node_publish_volume(
        &self,
        volume_id: &str,
        publish_info: &PublishInfo,
        target_path: &str,
    ) -> Response {
        let Some(device) = publish_info.get("device") else {
            return Response::node_publish_volume_error(
                VolumeErrorCode::MissingRequiredField,
                "publish volume info 'device' key required",
            );
        };

        let key = self.mnt_path_key(target_path);
        let mut vols = self.vols.write();
        match vols.iter_mut().find(|v| v.id == volume_id) {
            Some(volume) => {
                volume.attributes.insert(key, device.clone());
                Response::NodePublishVolume(Reply::Result(()))
            }
            None => Response::node_publish_volume_error(
                VolumeErrorCode::GeneralError,
                format!("volume '{volume_id}' not found"),
            ),
        }
    }

    fn node_unpublish_volume(&self, volume_id: &str, target_path: &str) -> Response {
        let key = self.mnt_path_key(target_path);
        let mut vols = self.vols.write();
        if let Some(volume) = vols.iter_mut().find(|v| v.id == volume_id) {
            volume.attributes.remove(&key);
        }
        Response::NodeUnpublishVolume(Reply::Result(()))
    }

    fn list_volumes(&self, request: &ListVolumesRequest) -> Response {
        // Work on a snapshot so the store is not read-locked while the page
        // is assembled.
        let vols = self.vols.read().clone();
        let total = vols.len() as u32;

        let starting_token = match request.starting_token.as_str() {
            "" => 0,
            token => match token.parse::<u32>() {
                Ok(index) => index,
                Err(_) => {
                    return Response::list_volumes_error(
                        VolumeErrorCode::GeneralError,
                        format!("startingToken={token} is not a number"),
                    )
                }
            },
        };
        if starting_token > total {
            return Response::list_volumes_error(
                VolumeErrorCode::GeneralError,
                format!("startingToken={starting_token} > len(vols)={total}"),
            );
        }

        let remaining = total - starting_token;
        let max_entries = match request.max_entries {
            0 => remaining,
            n => n.min(remaining),
        };

        let entries: Vec<VolumeInfo> = vols
            .into_iter()
            .skip(starting_token as usize)
            .take(max_entries as usize)
            .collect();

        let end = starting_token + entries.len() as u32;
        let next_token = match end < total {
            true => end.to_string(),
            false => String::new(),
        };

        Response::ListVolumes(Reply::Result(ListVolumesResult {
            entries,
            next_token,
        }))
    }
}

#[async_trait]
impl VolumeHandler for MockVolumeService {
    async fn handle(&self, request: Request) -> Result<Response, SvcError> {
        Ok(match request {
            Request::CreateVolume(request) => self.create_volume(request),
            Request::DeleteVolume(request) => self.delete_volume(&request.volume_id),
            Request::ControllerPublishVolume(request) => {
                self.controller_publish_volume(&request.volume_id, &request.node_id)
            }
            Request::ControllerUnpublishVolume(request) => {
                self.controller_unpublish_volume(&request.volume_id, &request.node_id)
            }
            Request::NodePublishVolume(request) => self.node_publish_volume(
                &request.volume_id,
                &request.publish_volume_info,
                &request.target_path,
            ),
            Request::NodeUnpublishVolume(request) => {
                self.node_unpublish_volume(&request.volume_id, &request.target_path)
            }
            Request::ListVolumes(request) => self.list_volumes(&request),
            Request::GetCapacity(GetCapacityRequest {}) => {
                Response::GetCapacity(Reply::Result(TOTAL_CAPACITY))
            }
            Request::GetNodeId(GetNodeIdRequest {}) => {
                Response::GetNodeId(Reply::Result(self.node_id.clone()))
            }
        })
    }
}

#[async_trait]
impl IdempotencyProvider for MockVolumeService {
    async fn get_volume_id(&self, name: &str) -> Result<Option<String>, SvcError> {
        Ok(self
            .vols
            .read()
            .iter()
            .find(|v| v.attributes.get(NAME_KEY).map(String::as_str) == Some(name))
            .map(|v| v.id.clone()))
    }

    async fn get_volume_info(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Option<VolumeInfo>, SvcError> {
        let vols = self.vols.read();
        let found = match (id.is_empty(), name.is_empty()) {
            (false, _) => vols.iter().find(|v| v.id == id),
            (true, false) => vols
                .iter()
                .find(|v| v.attributes.get(NAME_KEY).map(String::as_str) == Some(name)),
            (true, true) => None,
        };
        Ok(found.cloned())
    }

    async fn is_controller_published(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<Option<PublishInfo>, SvcError> {
        let key = Self::dev_path_key(node_id);
        Ok(self
            .vols
            .read()
            .iter()
            .find(|v| v.id == volume_id)
            .and_then(|v| v.attributes.get(&key))
            .map(|device| PublishInfo::from([("device".to_string(), device.clone())])))
    }

    async fn is_node_published(
        &self,
        volume_id: &str,
        publish_info: Option<&PublishInfo>,
        target_path: &str,
    ) -> Result<bool, SvcError> {
        let key = self.mnt_path_key(target_path);
        let vols = self.vols.read();
        let Some(device) = vols
            .iter()
            .find(|v| v.id == volume_id)
            .and_then(|v| v.attributes.get(&key))
        else {
            return Ok(false);
        };
        // When the caller presents the controller binding, the mount only
        // counts as published if it is the same device.
        Ok(match publish_info.and_then(|info| info.get("device")) {
            Some(expected) => expected == device,
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::CapacityRange;

    fn create_request(name: &str) -> Request {
        Request::CreateVolume(CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: None,
            parameters: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_default_capacity() {
        let service = MockVolumeService::new("node-a");
        let first = service.handle(create_request("alpha")).await.unwrap();
        let second = service.handle(create_request("bravo")).await.unwrap();

        let Response::CreateVolume(Reply::Result(first)) = first else {
            panic!("expected a create result");
        };
        let Response::CreateVolume(Reply::Result(second)) = second else {
            panic!("expected a create result");
        };
        assert_eq!(first.id, "1");
        assert_eq!(second.id, "2");
        assert_eq!(first.capacity_bytes, DEFAULT_CAPACITY);
        assert_eq!(first.attributes[NAME_KEY], "alpha");
    }

    #[tokio::test]
    async fn base_attributes_are_stamped_onto_created_volumes() {
        let service = MockVolumeService::new("node-a")
            .with_attributes(HashMap::from([("tier".to_string(), "gold".to_string())]));
        let response = service.handle(create_request("alpha")).await.unwrap();
        let Response::CreateVolume(Reply::Result(volume)) = response else {
            panic!("expected a create result");
        };
        assert_eq!(volume.attributes["tier"], "gold");
        assert_eq!(volume.attributes[NAME_KEY], "alpha");
    }

    #[tokio::test]
    async fn capacity_range_overrides_the_default() {
        let service = MockVolumeService::new("node-a");
        let response = service
            .handle(Request::CreateVolume(CreateVolumeRequest {
                name: "alpha".to_string(),
                capacity_range: Some(CapacityRange {
                    required_bytes: GIB,
                    limit_bytes: 2 * GIB,
                }),
                parameters: HashMap::new(),
            }))
            .await
            .unwrap();
        let Response::CreateVolume(Reply::Result(volume)) = response else {
            panic!("expected a create result");
        };
        assert_eq!(volume.capacity_bytes, 2 * GIB);
    }

    #[tokio::test]
    async fn publication_round_trip_is_observable_through_the_oracle() {
        let service = MockVolumeService::new("node-a");
        service.handle(create_request("alpha")).await.unwrap();

        assert_eq!(service.is_controller_published("1", "node-a").await.unwrap(), None);

        let response = service.controller_publish_volume("1", "node-a");
        let Response::ControllerPublishVolume(Reply::Result(info)) = response else {
            panic!("expected a publish result");
        };
        assert_eq!(info["device"], MOCK_DEVICE);
        assert!(service
            .is_controller_published("1", "node-a")
            .await
            .unwrap()
            .is_some());

        service.node_publish_volume("1", &info, "/mnt/alpha");
        assert!(service
            .is_node_published("1", Some(&info), "/mnt/alpha")
            .await
            .unwrap());

        service.node_unpublish_volume("1", "/mnt/alpha");
        assert!(!service.is_node_published("1", None, "/mnt/alpha").await.unwrap());
    }

    #[tokio::test]
    async fn list_volumes_paginates() {
        let service = MockVolumeService::new("node-a");
        for name in ["a", "b", "c"] {
            service.handle(create_request(name)).await.unwrap();
        }

        let response = service.list_volumes(&ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        });
        let Response::ListVolumes(Reply::Result(page)) = response else {
            panic!("expected a list result");
        };
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_token, "2");

        let response = service.list_volumes(&ListVolumesRequest {
            max_entries: 2,
            starting_token: page.next_token,
        });
        let Response::ListVolumes(Reply::Result(page)) = response else {
            panic!("expected a list result");
        };
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].id, "3");
        assert!(page.next_token.is_empty());
    }

    #[tokio::test]
    async fn list_volumes_rejects_bad_tokens() {
        let service = MockVolumeService::new("node-a");
        let response = service.list_volumes(&ListVolumesRequest {
            max_entries: 0,
            starting_token: "not-a-number".to_string(),
        });
        assert_eq!(
            response.embedded_error().map(|e| e.code),
            Some(VolumeErrorCode::GeneralError)
        );

        let response = service.list_volumes(&ListVolumesRequest {
            max_entries: 0,
            starting_token: "7".to_string(),
        });
        assert_eq!(
            response.embedded_error().map(|e| e.code),
            Some(VolumeErrorCode::GeneralError)
        );
    }

    #[tokio::test]
    async fn name_lookups_resolve_ids() {
        let service = MockVolumeService::new("node-a");
        service.handle(create_request("alpha")).await.unwrap();

        assert_eq!(service.get_volume_id("alpha").await.unwrap(), Some("1".to_string()));
        assert_eq!(service.get_volume_id("missing").await.unwrap(), None);

        let by_name = service.get_volume_info("", "alpha").await.unwrap();
        assert_eq!(by_name.map(|v| v.id), Some("1".to_string()));
        assert!(service.get_volume_info("", "").await.unwrap().is_none());
    }
}
