//! Boundaries of the interception layer: the state oracle it consults and
//! the downstream service it delegates to.

use crate::{
    csi::{PublishInfo, Request, Response, VolumeInfo},
    error::SvcError,
};
use async_trait::async_trait;
use std::sync::Arc;

/// State oracle consulted by the interception layer to decide whether an
/// operation's end state has already been reached.
///
/// Implementations answer from the storage backend's observable state and
/// are side-effect free as far as the layer is concerned. Queries may
/// perform I/O; they are called with the volume's serial-access lock held.
#[async_trait]
pub trait IdempotencyProvider: Send + Sync {
    /// Resolve a volume name to its id, `None` if no such volume exists.
    async fn get_volume_id(&self, name: &str) -> Result<Option<String>, SvcError>;

    /// Look up a volume by id or by name; whichever argument is non-empty is
    /// the lookup key. `None` means the volume does not exist.
    async fn get_volume_info(&self, id: &str, name: &str)
        -> Result<Option<VolumeInfo>, SvcError>;

    /// The publication binding of the volume on the given node, `None` when
    /// the volume is not controller-published there.
    async fn is_controller_published(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<Option<PublishInfo>, SvcError>;

    /// Whether the volume is published (mounted) at `target_path` on the
    /// serving node. `publish_info`, when present, is the binding the caller
    /// obtained from the controller publish step.
    async fn is_node_published(
        &self,
        volume_id: &str,
        publish_info: Option<&PublishInfo>,
        target_path: &str,
    ) -> Result<bool, SvcError>;
}

/// The downstream volume service: the handler a request reaches when the
/// interception layer decides not to short-circuit it.
#[async_trait]
pub trait VolumeHandler: Send + Sync {
    /// Serve a single volume RPC.
    async fn handle(&self, request: Request) -> Result<Response, SvcError>;
}

#[async_trait]
impl<T: IdempotencyProvider + ?Sized> IdempotencyProvider for Arc<T> {
    async fn get_volume_id(&self, name: &str) -> Result<Option<String>, SvcError> {
        (**self).get_volume_id(name).await
    }

    async fn get_volume_info(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Option<VolumeInfo>, SvcError> {
        (**self).get_volume_info(id, name).await
    }

    async fn is_controller_published(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<Option<PublishInfo>, SvcError> {
        (**self).is_controller_published(volume_id, node_id).await
    }

    async fn is_node_published(
        &self,
        volume_id: &str,
        publish_info: Option<&PublishInfo>,
        target_path: &str,
    ) -> Result<bool, SvcError> {
        (**self)
            .is_node_published(volume_id, publish_info, target_path)
            .await
    }
}

#[async_trait]
impl<T: VolumeHandler + ?Sized> VolumeHandler for Arc<T> {
    async fn handle(&self, request: Request) -> Result<Response, SvcError> {
        (**self).handle(request).await
    }
}
