//! Image request lifecycle and build queueing

use dockyard_common::access::{can_edit_request, can_view_request, filter_visible, require_role};
use dockyard_common::models::{NewBuild, RequestDraft};
use dockyard_common::{
    Build, Collaborators, Error, ImageRequest, RequestStatus, Result, Role, UpdateMode, User,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::storage::{Change, Store};

pub const BUILD_REQUESTED_LOG: &str = "[ui] Build requested by operator";

/// Raw create/edit payload, validated into a [`RequestDraft`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestForm {
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub repo_branch: Option<String>,
    #[serde(default)]
    pub update_mode: Option<String>,
    #[serde(default)]
    pub target_commit: Option<String>,
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub run_commands: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub version_tag: Option<String>,
    /// Username of the owning developer
    #[serde(default)]
    pub owner: Option<String>,
    /// Comma-separated usernames
    #[serde(default)]
    pub collaborators: Option<String>,
}

fn field(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl RequestForm {
    /// Check the form and resolve its owner. All problems are reported at once.
    pub async fn validate(&self, store: &dyn Store) -> Result<RequestDraft> {
        let mut errors = Vec::new();

        let image_name = field(&self.image_name);
        let repo_url = field(&self.repo_url);
        let base_image = field(&self.base_image);
        let version_tag = field(&self.version_tag);
        let target_commit = field(&self.target_commit);
        for (name, value) in [
            ("image_name", &image_name),
            ("repo_url", &repo_url),
            ("base_image", &base_image),
            ("version_tag", &version_tag),
        ] {
            if value.is_none() {
                errors.push(format!("{} is required", name));
            }
        }

        let update_mode = match field(&self.update_mode) {
            None => Some(UpdateMode::Static),
            Some(raw) => match raw.parse::<UpdateMode>() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    errors.push(e.to_string());
                    None
                }
            },
        };
        if update_mode == Some(UpdateMode::Static) && target_commit.is_none() {
            errors.push("target_commit is required in static mode".to_string());
        }

        let owner = match field(&self.owner) {
            None => {
                errors.push("owner is required".to_string());
                None
            }
            Some(username) => match store.find_user(&username).await? {
                Some(user) if user.role == Role::Developer => Some(user),
                _ => {
                    errors.push(format!("owner {} must be an existing developer", username));
                    None
                }
            },
        };

        match (image_name, repo_url, base_image, version_tag, update_mode, owner) {
            (
                Some(image_name),
                Some(repo_url),
                Some(base_image),
                Some(version_tag),
                Some(update_mode),
                Some(owner),
            ) if errors.is_empty() => Ok(RequestDraft {
                image_name,
                repo_url,
                repo_branch: field(&self.repo_branch).unwrap_or_else(|| "main".to_string()),
                update_mode,
                target_commit,
                base_image,
                run_commands: field(&self.run_commands),
                entrypoint: field(&self.entrypoint),
                version_tag,
                owner_id: owner.id,
                collaborators: self
                    .collaborators
                    .as_deref()
                    .map(Collaborators::parse)
                    .unwrap_or_default(),
            }),
            _ => Err(Error::validation(errors.join("; "))),
        }
    }
}

/// Developers draft new requests
pub async fn create_request(store: &dyn Store, user: &User, form: &RequestForm) -> Result<ImageRequest> {
    require_role(user, &[Role::Developer])?;
    let draft = form.validate(store).await?;
    let request = store.insert_request(draft, user.id).await?;
    info!(
        "Image request {} ({}) drafted by {}",
        request.id,
        request.image_tag(),
        user.username
    );
    Ok(request)
}

/// Requests visible to `user`, newest first, optionally narrowed to one status
pub async fn list_requests(
    store: &dyn Store,
    user: &User,
    status: Option<RequestStatus>,
) -> Result<Vec<ImageRequest>> {
    let rows = store
        .list_requests()
        .await?
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();
    Ok(filter_visible(rows, user))
}

async fn load(store: &dyn Store, id: i64) -> Result<ImageRequest> {
    store
        .get_request(id)
        .await?
        .ok_or_else(|| Error::not_found("image request", id))
}

pub async fn view_request(store: &dyn Store, user: &User, id: i64) -> Result<ImageRequest> {
    let request = load(store, id).await?;
    if !can_view_request(user, &request) {
        return Err(Error::forbidden(format!("image request {} is not visible", id)));
    }
    Ok(request)
}

pub async fn edit_request(
    store: &dyn Store,
    user: &User,
    id: i64,
    form: &RequestForm,
) -> Result<ImageRequest> {
    let mut request = load(store, id).await?;
    if !can_edit_request(user, &request) {
        return Err(Error::forbidden(format!("image request {} is not editable", id)));
    }

    let read_at = request.updated_at;
    form.validate(store).await?.apply_to(&mut request);
    save(store, &request, read_at).await?;
    info!("Image request {} edited by {}", id, user.username);
    Ok(request)
}

/// Hand a draft over to the operators
pub async fn submit_request(store: &dyn Store, user: &User, id: i64) -> Result<ImageRequest> {
    require_role(user, &[Role::Developer])?;
    let request = view_request(store, user, id).await?;
    if request.status != RequestStatus::Draft {
        return Err(Error::Conflict(format!(
            "only draft requests can be submitted, request {} is {}",
            id,
            request.status.as_str()
        )));
    }
    set_status(store, request, RequestStatus::Submitted).await
}

/// Operators and admins may move a request to any status
pub async fn change_status(
    store: &dyn Store,
    user: &User,
    id: i64,
    status: RequestStatus,
) -> Result<ImageRequest> {
    require_role(user, &[Role::Operator, Role::Admin])?;
    let request = load(store, id).await?;
    let updated = set_status(store, request, status).await?;
    info!(
        "Image request {} set to {} by {}",
        id,
        status.as_str(),
        user.username
    );
    Ok(updated)
}

async fn set_status(
    store: &dyn Store,
    mut request: ImageRequest,
    status: RequestStatus,
) -> Result<ImageRequest> {
    let read_at = request.updated_at;
    request.status = status;
    request.updated_at = Utc::now();
    save(store, &request, read_at).await?;
    Ok(request)
}

/// Write back a request read at `read_at`; concurrent changes win
async fn save(store: &dyn Store, request: &ImageRequest, read_at: DateTime<Utc>) -> Result<()> {
    let applied = store
        .commit(vec![Change::request(request.clone(), read_at)])
        .await?;
    if applied.first().copied().unwrap_or(false) {
        Ok(())
    } else {
        Err(Error::Conflict(format!(
            "image request {} was modified concurrently, reload and retry",
            request.id
        )))
    }
}

/// Queue a build of an existing request (operators and admins)
pub async fn queue_build(store: &dyn Store, user: &User, request_id: i64) -> Result<Build> {
    require_role(user, &[Role::Operator, Role::Admin])?;
    let request = load(store, request_id).await?;

    let build = store
        .insert_build(NewBuild {
            request_id: request.id,
            built_by: user.id,
            initial_log: BUILD_REQUESTED_LOG.to_string(),
        })
        .await?;
    info!(
        "Build {} of {} queued by {}",
        build.id,
        request.image_tag(),
        user.username
    );
    Ok(build)
}

/// A build whose request the actor may see
pub async fn view_build(store: &dyn Store, user: &User, id: i64) -> Result<Build> {
    let build = store
        .get_build(id)
        .await?
        .ok_or_else(|| Error::not_found("build", id))?;
    if let Some(request) = store.get_request(build.request_id).await? {
        if !can_view_request(user, &request) {
            return Err(Error::forbidden(format!("build {} is not visible", id)));
        }
    }
    Ok(build)
}
