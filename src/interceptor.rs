//! Serial access and idempotency for the volume RPC set.
//!
//! The layer sits in front of a volume service and guarantees that at most
//! one in-flight operation holds a given volume, and that repeating a
//! request whose end state has already been reached is answered from the
//! state oracle instead of reaching the service again. Concurrent callers
//! for the same volume are not queued: once the bounded wait for the
//! volume's lock expires they receive an `OPERATION_PENDING_FOR_VOLUME`
//! reply and are expected to retry.

use crate::{
    config::IdempotencyOptions,
    csi::{
        method, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest,
        CreateVolumeRequest, DeleteVolumeRequest, NodePublishVolumeRequest,
        NodeUnpublishVolumeRequest, Reply, Request, Response, VolumeErrorCode,
    },
    error::SvcError,
    locks::{VolumeLock, VolumeLocks},
    provider::{IdempotencyProvider, VolumeHandler},
    trylock::TryMutexGuard,
};
use tracing::{debug, info, warn};

/// Idempotent, serial-access interception layer over a volume service.
///
/// Six RPCs are covered: CreateVolume, DeleteVolume, ControllerPublishVolume,
/// ControllerUnpublishVolume, NodePublishVolume and NodeUnpublishVolume.
/// Anything else is forwarded to the downstream handler untouched.
pub struct IdempotencyLayer<P> {
    provider: P,
    opts: IdempotencyOptions,
    /// Serial-access records keyed by volume id.
    id_locks: VolumeLocks,
    /// Serial-access records keyed by volume name, used by CreateVolume
    /// until the name resolves to an id.
    name_locks: VolumeLocks,
}

impl<P: IdempotencyProvider> IdempotencyLayer<P> {
    /// A new interception layer answering idempotency questions through
    /// `provider`.
    pub fn new(provider: P, opts: IdempotencyOptions) -> Self {
        Self {
            provider,
            opts,
            id_locks: VolumeLocks::default(),
            name_locks: VolumeLocks::default(),
        }
    }

    /// Serve one request: covered variants run through their decision
    /// procedure, everything else goes straight to `next`.
    pub async fn handle<H: VolumeHandler + ?Sized>(
        &self,
        request: Request,
        next: &H,
    ) -> Result<Response, SvcError> {
        match request {
            Request::CreateVolume(request) => self.create_volume(request, next).await,
            Request::DeleteVolume(request) => self.delete_volume(request, next).await,
            Request::ControllerPublishVolume(request) => {
                self.controller_publish_volume(request, next).await
            }
            Request::ControllerUnpublishVolume(request) => {
                self.controller_unpublish_volume(request, next).await
            }
            Request::NodePublishVolume(request) => {
                self.node_publish_volume(request, next).await
            }
            Request::NodeUnpublishVolume(request) => {
                self.node_unpublish_volume(request, next).await
            }
            other => next.handle(other).await,
        }
    }

    /// Existence precheck shared by the id-keyed procedures; only active
    /// when the layer is configured to require volumes.
    async fn volume_missing(&self, volume_id: &str) -> Result<bool, SvcError> {
        if !self.opts.require_volume() {
            return Ok(false);
        }
        Ok(self
            .provider
            .get_volume_info(volume_id, "")
            .await?
            .is_none())
    }

    async fn controller_publish_volume<H: VolumeHandler + ?Sized>(
        &self,
        request: ControllerPublishVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        let lock = self.id_locks.get_or_create(&request.volume_id);
        let Some(guard) = lock.try_lock(self.opts.acquisition_timeout()).await else {
            debug!(volume.id = %request.volume_id, "controller publish pending");
            return Ok(Response::controller_publish_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = async {
            if lock.method_in_error(method::CONTROLLER_PUBLISH_VOLUME) {
                return next.handle(Request::ControllerPublishVolume(request)).await;
            }
            if self.volume_missing(&request.volume_id).await? {
                return Ok(Response::controller_publish_volume_error(
                    VolumeErrorCode::VolumeDoesNotExist,
                    "",
                ));
            }
            let published = self
                .provider
                .is_controller_published(&request.volume_id, &request.node_id)
                .await?;
            if let Some(publish_info) = published {
                info!(volume.id = %request.volume_id, node.id = %request.node_id, "idempotent controller publish");
                return Ok(Response::ControllerPublishVolume(Reply::Result(
                    publish_info,
                )));
            }
            next.handle(Request::ControllerPublishVolume(request)).await
        }
        .await;

        settle(
            &lock,
            guard,
            method::CONTROLLER_PUBLISH_VOLUME,
            &outcome,
            false,
        );
        outcome
    }

    async fn controller_unpublish_volume<H: VolumeHandler + ?Sized>(
        &self,
        request: ControllerUnpublishVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        let lock = self.id_locks.get_or_create(&request.volume_id);
        let Some(guard) = lock.try_lock(self.opts.acquisition_timeout()).await else {
            debug!(volume.id = %request.volume_id, "controller unpublish pending");
            return Ok(Response::controller_unpublish_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = async {
            if lock.method_in_error(method::CONTROLLER_UNPUBLISH_VOLUME) {
                return next
                    .handle(Request::ControllerUnpublishVolume(request))
                    .await;
            }
            if self.volume_missing(&request.volume_id).await? {
                return Ok(Response::controller_unpublish_volume_error(
                    VolumeErrorCode::VolumeDoesNotExist,
                    "",
                ));
            }
            let published = self
                .provider
                .is_controller_published(&request.volume_id, &request.node_id)
                .await?;
            if published.is_none() {
                info!(volume.id = %request.volume_id, node.id = %request.node_id, "idempotent controller unpublish");
                return Ok(Response::ControllerUnpublishVolume(Reply::Result(())));
            }
            next.handle(Request::ControllerUnpublishVolume(request))
                .await
        }
        .await;

        settle(
            &lock,
            guard,
            method::CONTROLLER_UNPUBLISH_VOLUME,
            &outcome,
            false,
        );
        outcome
    }

    async fn delete_volume<H: VolumeHandler + ?Sized>(
        &self,
        request: DeleteVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        let lock = self.id_locks.get_or_create(&request.volume_id);
        let Some(guard) = lock.try_lock(self.opts.acquisition_timeout()).await else {
            debug!(volume.id = %request.volume_id, "delete pending");
            return Ok(Response::delete_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = async {
            if lock.method_in_error(method::DELETE_VOLUME) {
                return next.handle(Request::DeleteVolume(request)).await;
            }
            // One lookup feeds both the existence precheck and the
            // idempotency decision.
            let exists = self
                .provider
                .get_volume_info(&request.volume_id, "")
                .await?
                .is_some();
            if !exists {
                if self.opts.require_volume() {
                    return Ok(Response::delete_volume_error(
                        VolumeErrorCode::VolumeDoesNotExist,
                        "",
                    ));
                }
                info!(volume.id = %request.volume_id, "idempotent delete");
                return Ok(Response::DeleteVolume(Reply::Result(())));
            }
            next.handle(Request::DeleteVolume(request)).await
        }
        .await;

        settle(&lock, guard, method::DELETE_VOLUME, &outcome, false);
        outcome
    }

    async fn node_publish_volume<H: VolumeHandler + ?Sized>(
        &self,
        request: NodePublishVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        let lock = self.id_locks.get_or_create(&request.volume_id);
        let Some(guard) = lock.try_lock(self.opts.acquisition_timeout()).await else {
            debug!(volume.id = %request.volume_id, "node publish pending");
            return Ok(Response::node_publish_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = async {
            if lock.method_in_error(method::NODE_PUBLISH_VOLUME) {
                return next.handle(Request::NodePublishVolume(request)).await;
            }
            if self.volume_missing(&request.volume_id).await? {
                return Ok(Response::node_publish_volume_error(
                    VolumeErrorCode::VolumeDoesNotExist,
                    "",
                ));
            }
            let published = self
                .provider
                .is_node_published(
                    &request.volume_id,
                    Some(&request.publish_volume_info),
                    &request.target_path,
                )
                .await?;
            if published {
                info!(volume.id = %request.volume_id, "idempotent node publish");
                return Ok(Response::NodePublishVolume(Reply::Result(())));
            }
            next.handle(Request::NodePublishVolume(request)).await
        }
        .await;

        settle(&lock, guard, method::NODE_PUBLISH_VOLUME, &outcome, false);
        outcome
    }

    async fn node_unpublish_volume<H: VolumeHandler + ?Sized>(
        &self,
        request: NodeUnpublishVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        let lock = self.id_locks.get_or_create(&request.volume_id);
        let Some(guard) = lock.try_lock(self.opts.acquisition_timeout()).await else {
            debug!(volume.id = %request.volume_id, "node unpublish pending");
            return Ok(Response::node_unpublish_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = async {
            if lock.method_in_error(method::NODE_UNPUBLISH_VOLUME) {
                return next.handle(Request::NodeUnpublishVolume(request)).await;
            }
            if self.volume_missing(&request.volume_id).await? {
                return Ok(Response::node_unpublish_volume_error(
                    VolumeErrorCode::VolumeDoesNotExist,
                    "",
                ));
            }
            let published = self
                .provider
                .is_node_published(&request.volume_id, None, &request.target_path)
                .await?;
            if !published {
                info!(volume.id = %request.volume_id, "idempotent node unpublish");
                return Ok(Response::NodeUnpublishVolume(Reply::Result(())));
            }
            next.handle(Request::NodeUnpublishVolume(request)).await
        }
        .await;

        settle(&lock, guard, method::NODE_UNPUBLISH_VOLUME, &outcome, false);
        outcome
    }

    /// CreateVolume is keyed by name until the volume resolves to an id,
    /// then additionally by id, always in that order.
    async fn create_volume<H: VolumeHandler + ?Sized>(
        &self,
        request: CreateVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        let name_lock = self.name_locks.get_or_create(&request.name);
        let Some(name_guard) = name_lock.try_lock(self.opts.acquisition_timeout()).await
        else {
            debug!(volume.name = %request.name, "create pending on name");
            return Ok(Response::create_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = self.create_volume_named(&name_lock, request, next).await;
        settle(
            &name_lock,
            name_guard,
            method::CREATE_VOLUME,
            &outcome,
            true,
        );
        outcome
    }

    /// Runs with the name lock held.
    async fn create_volume_named<H: VolumeHandler + ?Sized>(
        &self,
        name_lock: &VolumeLock,
        request: CreateVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        if name_lock.method_in_error(method::CREATE_VOLUME) {
            warn!(volume.name = %request.name, "create in error for name, bypassing idempotency");
            return next.handle(Request::CreateVolume(request)).await;
        }

        // No volume under this name yet: allocating an id is the creator's
        // job, hand over.
        let Some(existing) = self.provider.get_volume_info("", &request.name).await? else {
            debug!(volume.name = %request.name, "creating volume");
            return next.handle(Request::CreateVolume(request)).await;
        };

        // The name resolves to a live volume; take its id lock as well so
        // the decision below is serialized against the id-keyed RPCs.
        let id_lock = self.id_locks.get_or_create(&existing.id);
        let Some(id_guard) = id_lock.try_lock(self.opts.acquisition_timeout()).await else {
            debug!(volume.id = %existing.id, "create pending on id");
            return Ok(Response::create_volume_error(
                VolumeErrorCode::OperationPendingForVolume,
                "",
            ));
        };

        let outcome = self
            .create_volume_identified(&id_lock, existing.id, request, next)
            .await;
        settle(&id_lock, id_guard, method::CREATE_VOLUME, &outcome, true);
        outcome
    }

    /// Runs with both the name lock and the id lock held; the id lock is
    /// released first.
    async fn create_volume_identified<H: VolumeHandler + ?Sized>(
        &self,
        id_lock: &VolumeLock,
        volume_id: String,
        request: CreateVolumeRequest,
        next: &H,
    ) -> Result<Response, SvcError> {
        if id_lock.method_in_error(method::CREATE_VOLUME) {
            warn!(volume.id = %volume_id, "create in error for id, bypassing idempotency");
            return next.handle(Request::CreateVolume(request)).await;
        }

        // The volume may have been destroyed between resolving the name and
        // winning the id lock; only a live volume makes the create a no-op.
        let Some(info) = self.provider.get_volume_info(&volume_id, "").await? else {
            debug!(volume.name = %request.name, "volume went away during lock handoff, creating");
            return next.handle(Request::CreateVolume(request)).await;
        };

        info!(volume.id = %info.id, volume.name = %request.name, "idempotent create");
        Ok(Response::CreateVolume(Reply::Result(info)))
    }
}

/// Post-completion hook shared by every procedure: classify the outcome,
/// update the method-in-error mark, then release the serial-access lock.
/// The guard is dropped last so the mark is never mutated unlocked.
///
/// A transport error or an embedded-error reply marks the method in error;
/// anything else clears the mark. CreateVolume exempts the embedded
/// pending-operation error: it is caused by lock contention, not by a
/// storage fault, and must not poison the key.
fn settle(
    lock: &VolumeLock,
    guard: TryMutexGuard,
    full_method: &'static str,
    outcome: &Result<Response, SvcError>,
    exempt_pending: bool,
) {
    let failed = match outcome {
        Err(_) => true,
        Ok(response) => match response.embedded_error() {
            Some(error) => {
                !(exempt_pending && error.code == VolumeErrorCode::OperationPendingForVolume)
            }
            None => false,
        },
    };
    lock.record_outcome(full_method, failed);
    drop(guard);
}
