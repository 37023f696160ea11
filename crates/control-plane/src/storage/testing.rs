//! Store double that wraps [`MemoryStore`] and injects faults

use async_trait::async_trait;
use dockyard_common::models::{NewBuild, NewDeployment, NewImage, NewUser, RequestDraft};
use dockyard_common::{
    Alert, AuditEntry, AuditRecord, Build, BuildStatus, Deployment, DeploymentStatus, Error,
    Image, ImageRequest, Result, User,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Change, MemoryStore, Store};

/// Consume one unit of a fault budget
fn take(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    failing_commits: AtomicUsize,
    failing_build_reads: AtomicUsize,
    panicking_build_reads: AtomicUsize,
    /// Committed right before the next `commit`, as if by a concurrent writer
    interleaved: Mutex<Vec<Change>>,
    /// Returned by the next running-deployment query besides the stored rows
    stale_running: Mutex<Vec<Deployment>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn fail_build_reads(&self, count: usize) {
        self.failing_build_reads.store(count, Ordering::SeqCst);
    }

    pub fn panic_on_build_reads(&self, count: usize) {
        self.panicking_build_reads.store(count, Ordering::SeqCst);
    }

    pub fn interleave(&self, change: Change) {
        self.interleaved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(change);
    }

    pub fn report_stale_running(&self, deployment: Deployment) {
        self.stale_running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(deployment);
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        self.inner.insert_user(user).await
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        self.inner.find_user(username).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.inner.list_users().await
    }

    async fn insert_request(&self, draft: RequestDraft, created_by: i64) -> Result<ImageRequest> {
        self.inner.insert_request(draft, created_by).await
    }

    async fn get_request(&self, id: i64) -> Result<Option<ImageRequest>> {
        self.inner.get_request(id).await
    }

    async fn list_requests(&self) -> Result<Vec<ImageRequest>> {
        self.inner.list_requests().await
    }

    async fn insert_build(&self, build: NewBuild) -> Result<Build> {
        self.inner.insert_build(build).await
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>> {
        self.inner.get_build(id).await
    }

    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> Result<Vec<Build>> {
        if take(&self.panicking_build_reads) {
            panic!("build index corrupted");
        }
        if take(&self.failing_build_reads) {
            return Err(Error::store("build index unavailable"));
        }
        self.inner.builds_with_status(statuses).await
    }

    async fn insert_image(&self, image: NewImage) -> Result<Image> {
        self.inner.insert_image(image).await
    }

    async fn get_image(&self, id: i64) -> Result<Option<Image>> {
        self.inner.get_image(id).await
    }

    async fn insert_deployment(&self, deployment: NewDeployment) -> Result<Deployment> {
        self.inner.insert_deployment(deployment).await
    }

    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        self.inner.get_deployment(id).await
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        self.inner.list_deployments().await
    }

    async fn deployments_with_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>> {
        let mut rows = self.inner.deployments_with_status(status).await?;
        if status == DeploymentStatus::Running {
            let mut stale = self.stale_running.lock().unwrap_or_else(|e| e.into_inner());
            rows.append(&mut stale);
        }
        Ok(rows)
    }

    async fn delete_deployment(&self, id: i64) -> Result<bool> {
        self.inner.delete_deployment(id).await
    }

    async fn list_alerts(&self) -> Result<Vec<Alert>> {
        self.inner.list_alerts().await
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<Vec<bool>> {
        let interleaved: Vec<Change> = self
            .interleaved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if !interleaved.is_empty() {
            self.inner.commit(interleaved).await?;
        }
        if take(&self.failing_commits) {
            return Err(Error::store("transient"));
        }
        self.inner.commit(changes).await
    }

    async fn write_audit(&self, entry: AuditEntry) -> Result<()> {
        self.inner.write_audit(entry).await
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.inner.recent_audit(limit).await
    }
}
