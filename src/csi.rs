//! Message types for the volume RPC surface.
//!
//! The request set is closed: the dispatcher matches on the [`Request`] enum
//! and routes the covered variants through their decision procedures, while
//! every other variant is forwarded to the downstream service untouched.
//! Replies share the [`Reply`] envelope so that an error produced by the
//! interception layer is indistinguishable in shape from one produced by the
//! service itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fully qualified method names, used to key the method-in-error marks.
pub mod method {
    pub const CREATE_VOLUME: &str = "/csi.Controller/CreateVolume";
    pub const DELETE_VOLUME: &str = "/csi.Controller/DeleteVolume";
    pub const CONTROLLER_PUBLISH_VOLUME: &str = "/csi.Controller/ControllerPublishVolume";
    pub const CONTROLLER_UNPUBLISH_VOLUME: &str = "/csi.Controller/ControllerUnpublishVolume";
    pub const NODE_PUBLISH_VOLUME: &str = "/csi.Node/NodePublishVolume";
    pub const NODE_UNPUBLISH_VOLUME: &str = "/csi.Node/NodeUnpublishVolume";
    pub const LIST_VOLUMES: &str = "/csi.Controller/ListVolumes";
    pub const GET_CAPACITY: &str = "/csi.Controller/GetCapacity";
    pub const GET_NODE_ID: &str = "/csi.Node/GetNodeID";
}

/// Binding of a published volume, as a set of opaque key/value pairs.
pub type PublishInfo = HashMap<String, String>;

/// Information about a provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Server-assigned volume id.
    pub id: String,
    /// Provisioned capacity, in bytes.
    pub capacity_bytes: u64,
    /// Backend-specific attributes, including the caller-chosen name.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Error codes carried by reply-embedded errors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeErrorCode {
    Undefined,
    /// A conflicting operation holds the volume; try again later.
    OperationPendingForVolume,
    VolumeDoesNotExist,
    MissingRequiredField,
    GeneralError,
}

/// An error embedded inside a reply, returned over a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeError {
    pub code: VolumeErrorCode,
    pub description: String,
}

impl VolumeError {
    pub fn new(code: VolumeErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Reply envelope shared by every RPC: either the operation's result or an
/// embedded error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply<T> {
    Result(T),
    Error(VolumeError),
}

impl<T> Reply<T> {
    /// The embedded error, if this reply carries one.
    pub fn error(&self) -> Option<&VolumeError> {
        match self {
            Reply::Result(_) => None,
            Reply::Error(error) => Some(error),
        }
    }

    /// The result payload, if the operation succeeded.
    pub fn result(&self) -> Option<&T> {
        match self {
            Reply::Result(result) => Some(result),
            Reply::Error(_) => None,
        }
    }
}

/// Requested capacity bounds for a new volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    /// Minimum acceptable capacity in bytes; zero means unconstrained.
    #[serde(default)]
    pub required_bytes: u64,
    /// Maximum acceptable capacity in bytes; zero means unconstrained.
    #[serde(default)]
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-chosen volume name; the key for serial access until the volume
    /// has an id.
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    /// Node the volume is to be made available on.
    pub node_id: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    /// Binding returned by the controller publish step.
    #[serde(default)]
    pub publish_volume_info: PublishInfo,
    /// Mount target on the serving node.
    pub target_path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Maximum entries per page; zero means no limit.
    #[serde(default)]
    pub max_entries: u32,
    /// Opaque continuation token from a previous reply.
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetCapacityRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetNodeIdRequest {}

/// One page of volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListVolumesResult {
    pub entries: Vec<VolumeInfo>,
    /// Continuation token; empty when this is the last page.
    pub next_token: String,
}

/// The volume RPC request set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    ListVolumes(ListVolumesRequest),
    GetCapacity(GetCapacityRequest),
    GetNodeId(GetNodeIdRequest),
}

impl Request {
    /// The fully qualified method name served by this request.
    pub fn full_method(&self) -> &'static str {
        match self {
            Request::CreateVolume(_) => method::CREATE_VOLUME,
            Request::DeleteVolume(_) => method::DELETE_VOLUME,
            Request::ControllerPublishVolume(_) => method::CONTROLLER_PUBLISH_VOLUME,
            Request::ControllerUnpublishVolume(_) => method::CONTROLLER_UNPUBLISH_VOLUME,
            Request::NodePublishVolume(_) => method::NODE_PUBLISH_VOLUME,
            Request::NodeUnpublishVolume(_) => method::NODE_UNPUBLISH_VOLUME,
            Request::ListVolumes(_) => method::LIST_VOLUMES,
            Request::GetCapacity(_) => method::GET_CAPACITY,
            Request::GetNodeId(_) => method::GET_NODE_ID,
        }
    }
}

/// The volume RPC reply set, one variant per request variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    CreateVolume(Reply<VolumeInfo>),
    DeleteVolume(Reply<()>),
    ControllerPublishVolume(Reply<PublishInfo>),
    ControllerUnpublishVolume(Reply<()>),
    NodePublishVolume(Reply<()>),
    NodeUnpublishVolume(Reply<()>),
    ListVolumes(Reply<ListVolumesResult>),
    GetCapacity(Reply<u64>),
    GetNodeId(Reply<String>),
}

impl Response {
    /// The embedded error, if the reply carries one.
    pub fn embedded_error(&self) -> Option<&VolumeError> {
        match self {
            Response::CreateVolume(reply) => reply.error(),
            Response::DeleteVolume(reply) => reply.error(),
            Response::ControllerPublishVolume(reply) => reply.error(),
            Response::ControllerUnpublishVolume(reply) => reply.error(),
            Response::NodePublishVolume(reply) => reply.error(),
            Response::NodeUnpublishVolume(reply) => reply.error(),
            Response::ListVolumes(reply) => reply.error(),
            Response::GetCapacity(reply) => reply.error(),
            Response::GetNodeId(reply) => reply.error(),
        }
    }

    /// Error-variant CreateVolume reply.
    pub fn create_volume_error(code: VolumeErrorCode, description: impl Into<String>) -> Self {
        Response::CreateVolume(Reply::Error(VolumeError::new(code, description)))
    }

    /// Error-variant DeleteVolume reply.
    pub fn delete_volume_error(code: VolumeErrorCode, description: impl Into<String>) -> Self {
        Response::DeleteVolume(Reply::Error(VolumeError::new(code, description)))
    }

    /// Error-variant ControllerPublishVolume reply.
    pub fn controller_publish_volume_error(
        code: VolumeErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Response::ControllerPublishVolume(Reply::Error(VolumeError::new(code, description)))
    }

    /// Error-variant ControllerUnpublishVolume reply.
    pub fn controller_unpublish_volume_error(
        code: VolumeErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Response::ControllerUnpublishVolume(Reply::Error(VolumeError::new(code, description)))
    }

    /// Error-variant NodePublishVolume reply.
    pub fn node_publish_volume_error(
        code: VolumeErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Response::NodePublishVolume(Reply::Error(VolumeError::new(code, description)))
    }

    /// Error-variant NodeUnpublishVolume reply.
    pub fn node_unpublish_volume_error(
        code: VolumeErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Response::NodeUnpublishVolume(Reply::Error(VolumeError::new(code, description)))
    }

    /// Error-variant ListVolumes reply.
    pub fn list_volumes_error(code: VolumeErrorCode, description: impl Into<String>) -> Self {
        Response::ListVolumes(Reply::Error(VolumeError::new(code, description)))
    }
}
