//! Persistent store contract and its backends.
//!
//! Handlers and the scheduler only talk to [`Store`]. Ids are assigned by the
//! store on insert. Multi-row writes go through [`Store::commit`], which
//! applies a whole batch atomically; the scheduler commits one batch per
//! phase.

mod memory;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_common::models::{NewAlert, NewBuild, NewDeployment, NewImage, NewUser, RequestDraft};
use dockyard_common::{
    Alert, AuditEntry, AuditRecord, Build, BuildStatus, Deployment, DeploymentStatus, Error,
    Image, ImageRequest, Result, Role, User,
};
use tracing::{info, warn};

/// Number of audit records kept by the stores
pub const AUDIT_RETENTION: usize = 10_000;

/// A row write inside a [`Store::commit`] batch.
///
/// When `expected` is set the write only lands if the stored row still has
/// that status (for requests: that `updated_at` stamp); otherwise it is
/// skipped and reported as not applied.
#[derive(Debug, Clone)]
pub enum Change {
    Build {
        row: Build,
        expected: Option<BuildStatus>,
        /// Inserted only if the build write is applied; its id becomes the
        /// build's `image_id`
        image: Option<NewImage>,
    },
    Deployment {
        row: Deployment,
        expected: Option<DeploymentStatus>,
        /// Inserted only if the deployment write is applied
        alert: Option<NewAlert>,
    },
    Request {
        row: ImageRequest,
        expected: Option<DateTime<Utc>>,
    },
    User(User),
}

impl Change {
    pub fn build(row: Build, expected: BuildStatus) -> Self {
        Change::Build {
            row,
            expected: Some(expected),
            image: None,
        }
    }

    pub fn successful_build(row: Build, expected: BuildStatus, image: NewImage) -> Self {
        Change::Build {
            row,
            expected: Some(expected),
            image: Some(image),
        }
    }

    /// Write `row` unless the stored request changed since `read_at`
    pub fn request(row: ImageRequest, read_at: DateTime<Utc>) -> Self {
        Change::Request {
            row,
            expected: Some(read_at),
        }
    }

    pub fn deployment(row: Deployment, expected: DeploymentStatus) -> Self {
        Change::Deployment {
            row,
            expected: Some(expected),
            alert: None,
        }
    }

    pub fn failed_deployment(row: Deployment, expected: DeploymentStatus, alert: NewAlert) -> Self {
        Change::Deployment {
            row,
            expected: Some(expected),
            alert: Some(alert),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Conflict` if the username is taken
    async fn insert_user(&self, user: NewUser) -> Result<User>;
    async fn get_user(&self, id: i64) -> Result<Option<User>>;
    async fn find_user(&self, username: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;

    async fn insert_request(&self, draft: RequestDraft, created_by: i64) -> Result<ImageRequest>;
    async fn get_request(&self, id: i64) -> Result<Option<ImageRequest>>;
    /// Newest first
    async fn list_requests(&self) -> Result<Vec<ImageRequest>>;

    async fn insert_build(&self, build: NewBuild) -> Result<Build>;
    async fn get_build(&self, id: i64) -> Result<Option<Build>>;
    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> Result<Vec<Build>>;

    async fn insert_image(&self, image: NewImage) -> Result<Image>;
    async fn get_image(&self, id: i64) -> Result<Option<Image>>;

    async fn insert_deployment(&self, deployment: NewDeployment) -> Result<Deployment>;
    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>>;
    /// Newest first
    async fn list_deployments(&self) -> Result<Vec<Deployment>>;
    async fn deployments_with_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>>;
    async fn delete_deployment(&self, id: i64) -> Result<bool>;

    async fn list_alerts(&self) -> Result<Vec<Alert>>;

    /// Apply a batch atomically. Returns, per change, whether it was applied.
    async fn commit(&self, changes: Vec<Change>) -> Result<Vec<bool>>;

    async fn write_audit(&self, entry: AuditEntry) -> Result<()>;
    /// Newest first
    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>>;
}

/// Fire-and-forget audit write
pub async fn audit(store: &dyn Store, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(e) = store.write_audit(entry).await {
        warn!("Failed to write audit event {}: {}", action, e);
    }
}

/// Create the bootstrap admin if it does not exist yet
pub async fn ensure_root_user(store: &dyn Store, username: &str) -> Result<User> {
    if let Some(user) = store.find_user(username).await? {
        return Ok(user);
    }

    let user = store
        .insert_user(NewUser {
            username: username.to_string(),
            role: Role::Admin,
        })
        .await?;
    info!("Created bootstrap admin user: {}", username);
    Ok(user)
}

/// Resolve the image and originating request of a deployment
pub async fn deployment_origin(
    store: &dyn Store,
    deployment: &Deployment,
) -> Result<(Image, ImageRequest)> {
    let image = store
        .get_image(deployment.image_id)
        .await?
        .ok_or_else(|| Error::not_found("image", deployment.image_id))?;
    let request = store
        .get_request(image.request_id)
        .await?
        .ok_or_else(|| Error::not_found("image request", image.request_id))?;
    Ok((image, request))
}
