//! Actor-driven deployment operations
//!
//! Every operation checks existence first, then authorization, then the
//! requested state transition.

use dockyard_common::access::{can_manage_deployment, can_view_request, require_role};
use dockyard_common::models::NewDeployment;
use dockyard_common::{
    AuditEntry, Deployment, DeploymentStatus, Error, Image, ImageRequest, Result, Role, User,
};
use std::fmt;
use tracing::info;

use crate::storage::{audit, deployment_origin, Change, Store};
use crate::telemetry::TelemetryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentAction {
    Start,
    Stop,
    Restart,
    Delete,
}

impl DeploymentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentAction::Start => "start",
            DeploymentAction::Stop => "stop",
            DeploymentAction::Restart => "restart",
            DeploymentAction::Delete => "delete",
        }
    }

    fn audit_details(&self, id: i64) -> String {
        match self {
            DeploymentAction::Start => format!("Deployment {} start requested", id),
            DeploymentAction::Stop => format!("Deployment {} stopped", id),
            DeploymentAction::Restart => format!("Deployment {} restart requested", id),
            DeploymentAction::Delete => format!("Deployment {} deleted", id),
        }
    }
}

impl fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment joined with its image and originating request
#[derive(Debug, Clone)]
pub struct DeploymentView {
    pub deployment: Deployment,
    pub image: Image,
    pub request: ImageRequest,
}

impl DeploymentView {
    pub fn can_control(&self, user: &User) -> bool {
        can_manage_deployment(user, &self.deployment, self.request.owner_id)
    }
}

async fn load(store: &dyn Store, id: i64) -> Result<DeploymentView> {
    let deployment = store
        .get_deployment(id)
        .await?
        .ok_or_else(|| Error::not_found("deployment", id))?;
    let (image, request) = deployment_origin(store, &deployment).await?;
    Ok(DeploymentView {
        deployment,
        image,
        request,
    })
}

/// Load a deployment the actor may see
pub async fn visible_deployment(store: &dyn Store, user: &User, id: i64) -> Result<DeploymentView> {
    let view = load(store, id).await?;
    if !can_view_request(user, &view.request) {
        return Err(Error::forbidden(format!("deployment {} is not visible", id)));
    }
    Ok(view)
}

/// Every deployment the actor may see, newest first.
///
/// Deployments whose image or request no longer exists are left out.
pub async fn visible_deployments(store: &dyn Store, user: &User) -> Result<Vec<DeploymentView>> {
    let mut views = Vec::new();
    for deployment in store.list_deployments().await? {
        let (image, request) = match deployment_origin(store, &deployment).await {
            Ok(origin) => origin,
            Err(Error::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        if can_view_request(user, &request) {
            views.push(DeploymentView {
                deployment,
                image,
                request,
            });
        }
    }
    Ok(views)
}

/// Optional fields of a new deployment; the rest default
#[derive(Debug, Clone, Default)]
pub struct DeploymentSpec {
    pub name: Option<String>,
    pub environment: Option<String>,
    pub replicas: Option<u32>,
    pub ports: Option<String>,
}

/// Create a `deploying` deployment of an existing image (operator or admin)
pub async fn create_deployment(
    store: &dyn Store,
    user: &User,
    image_id: i64,
    spec: DeploymentSpec,
) -> Result<Deployment> {
    require_role(user, &[Role::Operator, Role::Admin])?;
    let image = store
        .get_image(image_id)
        .await?
        .ok_or_else(|| Error::not_found("image", image_id))?;

    let replicas = spec.replicas.unwrap_or(1);
    if replicas == 0 {
        return Err(Error::validation("replicas must be at least 1"));
    }

    let deployment = store
        .insert_deployment(NewDeployment {
            image_id: image.id,
            name: non_blank(spec.name).unwrap_or_else(|| format!("deploy-{}-{}", image.id, user.id)),
            environment: non_blank(spec.environment).unwrap_or_else(|| "dev".to_string()),
            replicas,
            ports: non_blank(spec.ports),
        })
        .await?;

    info!(
        "Deployment {} ({}) of {} created by {}",
        deployment.id, deployment.name, image.image_tag, user.username
    );
    Ok(deployment)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Start, stop, restart or delete a deployment on behalf of `user`.
///
/// Returns the updated deployment, or `None` once deleted.
pub async fn perform(
    store: &dyn Store,
    telemetry: &TelemetryStore,
    user: &User,
    id: i64,
    action: DeploymentAction,
) -> Result<Option<Deployment>> {
    let view = load(store, id).await?;
    if !view.can_control(user) {
        return Err(Error::forbidden(format!(
            "{} may not {} deployment {}",
            user.username, action, id
        )));
    }

    let mut deployment = view.deployment;
    let current = deployment.status;

    let result = match action {
        DeploymentAction::Delete => {
            if !store.delete_deployment(id).await? {
                return Err(Error::not_found("deployment", id));
            }
            telemetry.forget(id);
            None
        }
        DeploymentAction::Start | DeploymentAction::Restart => {
            if !current.can_transition_to(DeploymentStatus::Deploying) {
                return Err(illegal(action, id, current));
            }
            deployment.enter_deploying();
            Some(save(store, deployment, current).await?)
        }
        DeploymentAction::Stop => {
            if !current.can_transition_to(DeploymentStatus::Stopped) {
                return Err(illegal(action, id, current));
            }
            deployment.stop(user.role.is_privileged());
            Some(save(store, deployment, current).await?)
        }
    };

    info!("Deployment {} {} by {}", id, action, user.username);
    audit(
        store,
        AuditEntry::new(
            Some(user.id),
            format!("deployment_{}", action),
            Some(id),
            action.audit_details(id),
        ),
    )
    .await;

    Ok(result)
}

fn illegal(action: DeploymentAction, id: i64, status: DeploymentStatus) -> Error {
    Error::Conflict(format!(
        "cannot {} deployment {} while {}",
        action, id, status
    ))
}

async fn save(
    store: &dyn Store,
    deployment: Deployment,
    expected: DeploymentStatus,
) -> Result<Deployment> {
    let id = deployment.id;
    let applied = store
        .commit(vec![Change::deployment(deployment.clone(), expected)])
        .await?;
    if applied.first().copied().unwrap_or(false) {
        Ok(deployment)
    } else {
        Err(Error::Conflict(format!(
            "deployment {} changed concurrently, retry",
            id
        )))
    }
}
