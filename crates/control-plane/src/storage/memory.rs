//! In-process store backed by ordered maps under one async mutex

use async_trait::async_trait;
use chrono::Utc;
use dockyard_common::models::{NewBuild, NewDeployment, NewImage, NewUser, RequestDraft};
use dockyard_common::{
    Alert, AuditEntry, AuditRecord, Build, BuildStatus, Deployment, DeploymentStatus, Error,
    Image, ImageRequest, Result, User,
};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Change, Store, AUDIT_RETENTION};

#[derive(Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    requests: BTreeMap<i64, ImageRequest>,
    builds: BTreeMap<i64, Build>,
    images: BTreeMap<i64, Image>,
    deployments: BTreeMap<i64, Deployment>,
    alerts: BTreeMap<i64, Alert>,
    audit: VecDeque<AuditRecord>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn apply(&mut self, change: Change) -> bool {
        match change {
            Change::Build {
                mut row,
                expected,
                image,
            } => {
                if let Some(expected) = expected {
                    match self.builds.get(&row.id) {
                        Some(current) if current.status == expected => {}
                        _ => return false,
                    }
                }
                if let Some(image) = image {
                    let id = self.next_id();
                    self.images.insert(id, image.with_id(id));
                    row.image_id = Some(id);
                }
                self.builds.insert(row.id, row);
                true
            }
            Change::Deployment {
                row,
                expected,
                alert,
            } => {
                if let Some(expected) = expected {
                    match self.deployments.get(&row.id) {
                        Some(current) if current.status == expected => {}
                        _ => return false,
                    }
                }
                self.deployments.insert(row.id, row);
                if let Some(alert) = alert {
                    let id = self.next_id();
                    self.alerts.insert(id, alert.with_id(id));
                }
                true
            }
            Change::Request { row, expected } => {
                if let Some(expected) = expected {
                    match self.requests.get(&row.id) {
                        Some(current) if current.updated_at == expected => {}
                        _ => return false,
                    }
                }
                self.requests.insert(row.id, row);
                true
            }
            Change::User(row) => {
                self.users.insert(row.id, row);
                true
            }
        }
    }
}

/// Store kept entirely in memory; contents are lost on restart
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn image_count(&self) -> usize {
        self.tables.lock().await.images.len()
    }
}

fn newest_first<T: Clone>(rows: &BTreeMap<i64, T>) -> Vec<T> {
    rows.values().rev().cloned().collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables.lock().await;
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(Error::Conflict(format!(
                "username {} already exists",
                user.username
            )));
        }
        let id = tables.next_id();
        let row = user.with_id(id);
        tables.users.insert(id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.tables.lock().await.users.values().cloned().collect())
    }

    async fn insert_request(&self, draft: RequestDraft, created_by: i64) -> Result<ImageRequest> {
        let mut tables = self.tables.lock().await;
        let id = tables.next_id();
        let row = draft.into_request(id, created_by);
        tables.requests.insert(id, row.clone());
        Ok(row)
    }

    async fn get_request(&self, id: i64) -> Result<Option<ImageRequest>> {
        Ok(self.tables.lock().await.requests.get(&id).cloned())
    }

    async fn list_requests(&self) -> Result<Vec<ImageRequest>> {
        Ok(newest_first(&self.tables.lock().await.requests))
    }

    async fn insert_build(&self, build: NewBuild) -> Result<Build> {
        let mut tables = self.tables.lock().await;
        let id = tables.next_id();
        let row = build.with_id(id);
        tables.builds.insert(id, row.clone());
        Ok(row)
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>> {
        Ok(self.tables.lock().await.builds.get(&id).cloned())
    }

    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> Result<Vec<Build>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .builds
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    async fn insert_image(&self, image: NewImage) -> Result<Image> {
        let mut tables = self.tables.lock().await;
        let id = tables.next_id();
        let row = image.with_id(id);
        tables.images.insert(id, row.clone());
        Ok(row)
    }

    async fn get_image(&self, id: i64) -> Result<Option<Image>> {
        Ok(self.tables.lock().await.images.get(&id).cloned())
    }

    async fn insert_deployment(&self, deployment: NewDeployment) -> Result<Deployment> {
        let mut tables = self.tables.lock().await;
        let id = tables.next_id();
        let row = deployment.with_id(id);
        tables.deployments.insert(id, row.clone());
        Ok(row)
    }

    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        Ok(self.tables.lock().await.deployments.get(&id).cloned())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(newest_first(&self.tables.lock().await.deployments))
    }

    async fn deployments_with_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .deployments
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect())
    }

    async fn delete_deployment(&self, id: i64) -> Result<bool> {
        Ok(self.tables.lock().await.deployments.remove(&id).is_some())
    }

    async fn list_alerts(&self) -> Result<Vec<Alert>> {
        Ok(newest_first(&self.tables.lock().await.alerts))
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<Vec<bool>> {
        let mut tables = self.tables.lock().await;
        let applied: Vec<bool> = changes.into_iter().map(|c| tables.apply(c)).collect();
        debug!(
            "Committed batch: {} of {} changes applied",
            applied.iter().filter(|a| **a).count(),
            applied.len()
        );
        Ok(applied)
    }

    async fn write_audit(&self, entry: AuditEntry) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.audit.push_front(AuditRecord {
            entry,
            created_at: Utc::now(),
        });
        tables.audit.truncate(AUDIT_RETENTION);
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.audit.iter().take(limit).cloned().collect())
    }
}
