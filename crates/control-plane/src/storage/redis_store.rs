//! Redis store
//!
//! Data model:
//! - {kind}:{id} → JSON row
//! - {kind}:all → Set of ids
//! - {kind}:status:{status} → Set of ids (builds, deployments, requests)
//! - {kind}:next_id → id counter
//! - user:by_name:{username} → user id
//! - audit:log → List of JSON audit records, newest first

use async_trait::async_trait;
use chrono::Utc;
use dockyard_common::models::{
    NewAlert, NewBuild, NewDeployment, NewImage, NewUser, RequestDraft,
};
use dockyard_common::{
    Alert, AuditEntry, AuditRecord, Build, BuildStatus, Deployment, DeploymentStatus, Error,
    Image, ImageRequest, Result, User,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{Change, Store, AUDIT_RETENTION};

const AUDIT_KEY: &str = "audit:log";

/// Applies a batch of row writes in one atomic script run.
///
/// Each op may carry a `guard` field name and its `expected` value: the write
/// is skipped unless the stored row holds that value. An op may carry a
/// dependent `extra` row that is written only when the op itself is applied.
const COMMIT_SCRIPT: &str = r#"
local ops = cjson.decode(ARGV[1])
local applied = {}
local function put(op)
  local current = redis.call('GET', op.key)
  local previous = nil
  if current then
    previous = cjson.decode(current)
  end
  if op.guard and (previous == nil or previous[op.guard] ~= op.expected) then
    return 0
  end
  if op.index and previous and previous.status then
    redis.call('SREM', op.index .. previous.status, op.id)
  end
  redis.call('SET', op.key, op.row)
  redis.call('SADD', op.all, op.id)
  if op.index and op.status then
    redis.call('SADD', op.index .. op.status, op.id)
  end
  return 1
end
for i, op in ipairs(ops) do
  local result = put(op)
  if result == 1 and op.extra then
    put(op.extra)
  end
  applied[i] = result
end
return applied
"#;

/// Row types persisted as JSON documents
trait Record: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const INDEXED: bool = false;

    fn id(&self) -> i64;

    fn status(&self) -> Option<&'static str> {
        None
    }
}

impl Record for User {
    const KIND: &'static str = "user";

    fn id(&self) -> i64 {
        self.id
    }
}

impl Record for ImageRequest {
    const KIND: &'static str = "request";
    const INDEXED: bool = true;

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
}

impl Record for Build {
    const KIND: &'static str = "build";
    const INDEXED: bool = true;

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
}

impl Record for Image {
    const KIND: &'static str = "image";

    fn id(&self) -> i64 {
        self.id
    }
}

impl Record for Deployment {
    const KIND: &'static str = "deployment";
    const INDEXED: bool = true;

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
}

impl Record for Alert {
    const KIND: &'static str = "alert";

    fn id(&self) -> i64 {
        self.id
    }
}

fn row_key(kind: &str, id: i64) -> String {
    format!("{}:{}", kind, id)
}

fn all_key(kind: &str) -> String {
    format!("{}:all", kind)
}

fn status_prefix(kind: &str) -> String {
    format!("{}:status:", kind)
}

fn next_id_key(kind: &str) -> String {
    format!("{}:next_id", kind)
}

/// One write as understood by the commit script
#[derive(Serialize)]
struct ScriptOp {
    key: String,
    all: String,
    id: i64,
    row: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guard: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<Box<ScriptOp>>,
}

impl ScriptOp {
    fn put<R: Record>(row: &R) -> Result<Self> {
        Ok(Self {
            key: row_key(R::KIND, row.id()),
            all: all_key(R::KIND),
            id: row.id(),
            row: serde_json::to_string(row)?,
            index: R::INDEXED.then(|| status_prefix(R::KIND)),
            status: row.status(),
            guard: None,
            expected: None,
            extra: None,
        })
    }

    /// Only apply while the stored row's `field` serializes to `expected`
    fn guarded<T: Serialize>(mut self, field: &'static str, expected: Option<T>) -> Result<Self> {
        if let Some(expected) = expected {
            self.guard = Some(field);
            self.expected = Some(serde_json::to_value(expected)?);
        }
        Ok(self)
    }
}

/// Store backed by Redis
pub struct RedisStore {
    conn: ConnectionManager,
    commit_script: Script,
}

impl RedisStore {
    /// Create a new store instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(Error::store)?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(Error::store)?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            commit_script: Script::new(COMMIT_SCRIPT),
        })
    }

    async fn allocate_id(&self, kind: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(next_id_key(kind), 1).await.map_err(Error::store)
    }

    async fn run_script(&self, ops: Vec<ScriptOp>) -> Result<Vec<bool>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let payload = serde_json::to_string(&ops)?;
        let mut conn = self.conn.clone();
        let applied: Vec<i64> = self
            .commit_script
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::store)?;
        Ok(applied.into_iter().map(|a| a == 1).collect())
    }

    async fn insert<R: Record + Send + Sync>(&self, row: R) -> Result<R> {
        self.run_script(vec![ScriptOp::put(&row)?]).await?;
        debug!("Inserted {} {}", R::KIND, row.id());
        Ok(row)
    }

    async fn get<R: Record>(&self, id: i64) -> Result<Option<R>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(row_key(R::KIND, id))
            .await
            .map_err(Error::store)?;

        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn load_set<R: Record>(&self, set_key: String) -> Result<Vec<R>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<i64> = conn.smembers(&set_key).await.map_err(Error::store)?;
        ids.sort_unstable();

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.get::<R>(id).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn load_all<R: Record>(&self) -> Result<Vec<R>> {
        self.load_set(all_key(R::KIND)).await
    }

    async fn load_status<R: Record>(&self, status: &str) -> Result<Vec<R>> {
        self.load_set(format!("{}{}", status_prefix(R::KIND), status))
            .await
    }

    async fn change_to_op(&self, change: Change) -> Result<ScriptOp> {
        match change {
            Change::Build {
                mut row,
                expected,
                image,
            } => {
                let image = match image {
                    Some(image) => Some(self.build_image(image).await?),
                    None => None,
                };
                if let Some(image) = &image {
                    row.image_id = Some(image.id);
                }
                let mut op = ScriptOp::put(&row)?.guarded("status", expected)?;
                if let Some(image) = image {
                    op.extra = Some(Box::new(ScriptOp::put(&image)?));
                }
                Ok(op)
            }
            Change::Deployment {
                row,
                expected,
                alert,
            } => {
                let mut op = ScriptOp::put(&row)?.guarded("status", expected)?;
                if let Some(alert) = alert {
                    let alert = self.build_alert(alert).await?;
                    op.extra = Some(Box::new(ScriptOp::put(&alert)?));
                }
                Ok(op)
            }
            Change::Request { row, expected } => {
                ScriptOp::put(&row)?.guarded("updated_at", expected)
            }
            Change::User(row) => ScriptOp::put(&row),
        }
    }

    async fn build_alert(&self, alert: NewAlert) -> Result<Alert> {
        let id = self.allocate_id(Alert::KIND).await?;
        Ok(alert.with_id(id))
    }

    async fn build_image(&self, image: NewImage) -> Result<Image> {
        let id = self.allocate_id(Image::KIND).await?;
        Ok(image.with_id(id))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let id = self.allocate_id(User::KIND).await?;
        let name_key = format!("user:by_name:{}", user.username);

        let mut conn = self.conn.clone();
        let claimed: bool = conn.set_nx(&name_key, id).await.map_err(Error::store)?;
        if !claimed {
            return Err(Error::Conflict(format!(
                "username {} already exists",
                user.username
            )));
        }

        self.insert(user.with_id(id)).await
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.get(id).await
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let mut conn = self.conn.clone();
        let id: Option<i64> = conn
            .get(format!("user:by_name:{}", username))
            .await
            .map_err(Error::store)?;

        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.load_all().await
    }

    async fn insert_request(&self, draft: RequestDraft, created_by: i64) -> Result<ImageRequest> {
        let id = self.allocate_id(ImageRequest::KIND).await?;
        self.insert(draft.into_request(id, created_by)).await
    }

    async fn get_request(&self, id: i64) -> Result<Option<ImageRequest>> {
        self.get(id).await
    }

    async fn list_requests(&self) -> Result<Vec<ImageRequest>> {
        let mut rows: Vec<ImageRequest> = self.load_all().await?;
        rows.reverse();
        Ok(rows)
    }

    async fn insert_build(&self, build: NewBuild) -> Result<Build> {
        let id = self.allocate_id(Build::KIND).await?;
        self.insert(build.with_id(id)).await
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>> {
        self.get(id).await
    }

    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> Result<Vec<Build>> {
        let mut rows = Vec::new();
        for status in statuses {
            rows.extend(self.load_status::<Build>(status.as_str()).await?);
        }
        rows.sort_by_key(|b| b.id);
        Ok(rows)
    }

    async fn insert_image(&self, image: NewImage) -> Result<Image> {
        let id = self.allocate_id(Image::KIND).await?;
        self.insert(image.with_id(id)).await
    }

    async fn get_image(&self, id: i64) -> Result<Option<Image>> {
        self.get(id).await
    }

    async fn insert_deployment(&self, deployment: NewDeployment) -> Result<Deployment> {
        let id = self.allocate_id(Deployment::KIND).await?;
        self.insert(deployment.with_id(id)).await
    }

    async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        self.get(id).await
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let mut rows: Vec<Deployment> = self.load_all().await?;
        rows.reverse();
        Ok(rows)
    }

    async fn deployments_with_status(&self, status: DeploymentStatus) -> Result<Vec<Deployment>> {
        self.load_status(status.as_str()).await
    }

    async fn delete_deployment(&self, id: i64) -> Result<bool> {
        let Some(deployment) = self.get::<Deployment>(id).await? else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let status_key = format!(
            "{}{}",
            status_prefix(Deployment::KIND),
            deployment.status.as_str()
        );
        let _: () = redis::pipe()
            .atomic()
            .del(row_key(Deployment::KIND, id))
            .srem(all_key(Deployment::KIND), id)
            .srem(status_key, id)
            .query_async(&mut conn)
            .await
            .map_err(Error::store)?;

        info!("Deleted deployment {}", id);
        Ok(true)
    }

    async fn list_alerts(&self) -> Result<Vec<Alert>> {
        let mut rows: Vec<Alert> = self.load_all().await?;
        rows.reverse();
        Ok(rows)
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<Vec<bool>> {
        let mut ops = Vec::with_capacity(changes.len());
        for change in changes {
            ops.push(self.change_to_op(change).await?);
        }
        let applied = self.run_script(ops).await?;
        debug!(
            "Committed batch: {} of {} changes applied",
            applied.iter().filter(|a| **a).count(),
            applied.len()
        );
        Ok(applied)
    }

    async fn write_audit(&self, entry: AuditEntry) -> Result<()> {
        let record = AuditRecord {
            entry,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lpush(AUDIT_KEY, json)
            .ltrim(AUDIT_KEY, 0, AUDIT_RETENTION as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(Error::store)?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let rows: Vec<String> = conn
            .lrange(AUDIT_KEY, 0, limit as isize - 1)
            .await
            .map_err(Error::store)?;

        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(Error::from))
            .collect()
    }
}
