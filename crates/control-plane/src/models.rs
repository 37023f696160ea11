//! Request and response bodies of the HTTP API

use dockyard_common::{Build, BuildStatus, Deployment, MetricPoint, Role};
use serde::{Deserialize, Serialize};

use crate::control::{DeploymentSpec, DeploymentView};

/// Lines returned by the deployment log endpoints unless a limit is given
pub const DEFAULT_LOG_LIMIT: usize = 200;

pub const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Admin user creation
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub role: Role,
}

/// Operator status change of an image request
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestListQuery {
    pub status: Option<String>,
}

/// Deployment creation from an image; every field is optional
#[derive(Debug, Default, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: Option<String>,
    pub environment: Option<String>,
    pub replicas: Option<u32>,
    pub ports: Option<String>,
}

impl From<CreateDeploymentRequest> for DeploymentSpec {
    fn from(req: CreateDeploymentRequest) -> Self {
        DeploymentSpec {
            name: req.name,
            environment: req.environment,
            replicas: req.replicas,
            ports: req.ports,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Build log as shown by the log viewer
#[derive(Debug, Serialize)]
pub struct BuildLogResponse {
    pub id: i64,
    pub status: BuildStatus,
    pub log: String,
}

impl From<Build> for BuildLogResponse {
    fn from(build: Build) -> Self {
        Self {
            id: build.id,
            status: build.status,
            log: build.build_log,
        }
    }
}

/// Deployment row enriched with its image and the actor's control right
#[derive(Debug, Serialize)]
pub struct DeploymentSummary {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub image_tag: String,
    pub image_name: String,
    pub can_control: bool,
}

impl DeploymentSummary {
    pub fn new(view: DeploymentView, can_control: bool) -> Self {
        Self {
            image_tag: view.image.image_tag,
            image_name: view.request.image_name,
            deployment: view.deployment,
            can_control,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentDetail {
    #[serde(flatten)]
    pub summary: DeploymentSummary,
    pub recent_logs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub deployment_id: i64,
    pub lines: Vec<String>,
}

/// Chart-ready metric series
#[derive(Debug, Default, Serialize)]
pub struct MetricsResponse {
    /// `HH:MM:SS` sample times
    pub labels: Vec<String>,
    pub cpu: Vec<f64>,
    pub ram: Vec<f64>,
}

impl From<Vec<MetricPoint>> for MetricsResponse {
    fn from(points: Vec<MetricPoint>) -> Self {
        let mut response = MetricsResponse::default();
        for point in points {
            response
                .labels
                .push(point.timestamp.format("%H:%M:%S").to_string());
            response.cpu.push(point.cpu);
            response.ram.push(point.ram);
        }
        response
    }
}
