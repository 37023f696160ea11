//! Persistent entities of the control plane and their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Closed set of user roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Developer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Developer => "developer",
        }
    }

    /// Admins and operators share full control over builds and deployments.
    pub fn is_privileged(&self) -> bool {
        match self {
            Role::Admin | Role::Operator => true,
            Role::Developer => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "developer" => Ok(Role::Developer),
            other => Err(Error::validation(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub role: Role,
}

impl NewUser {
    pub fn with_id(self, id: i64) -> User {
        User {
            id,
            username: self.username,
            role: self.role,
            active: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Pinned to `target_commit`
    Static,
    /// Follows the branch; matching deployments react to commit hooks
    Continuous,
}

impl FromStr for UpdateMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(UpdateMode::Static),
            "continuous" => Ok(UpdateMode::Continuous),
            other => Err(Error::validation(format!("unknown update mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    Submitted,
    InReview,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Submitted => "submitted",
            RequestStatus::InReview => "in_review",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RequestStatus::Draft),
            "submitted" => Ok(RequestStatus::Submitted),
            "in_review" => Ok(RequestStatus::InReview),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(Error::validation(format!("unknown request status: {}", other))),
        }
    }
}

/// Usernames allowed to collaborate on an image request.
///
/// Parsed once from the comma-separated form; entries are trimmed, empty
/// entries dropped, and comparison is case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collaborators(BTreeSet<String>);

impl Collaborators {
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(',')
                .map(str::trim)
                .filter(|login| !login.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn contains(&self, username: &str) -> bool {
        self.0.contains(username)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(","))
    }
}

impl<S: Into<String>> FromIterator<S> for Collaborators {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A developer's declarative request to build an image from a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub id: i64,
    pub image_name: String,
    pub repo_url: String,
    pub repo_branch: String,
    pub update_mode: UpdateMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_commit: Option<String>,
    pub base_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_commands: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    pub version_tag: String,
    pub owner_id: i64,
    pub created_by: i64,
    #[serde(default)]
    pub collaborators: Collaborators,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRequest {
    /// Tag of every image built from this request
    pub fn image_tag(&self) -> String {
        Image::tag_for(&self.image_name, &self.version_tag)
    }

    /// Whether a commit on `repo_url@branch` should affect deployments of this request
    pub fn follows(&self, repo_url: &str, branch: &str) -> bool {
        self.update_mode == UpdateMode::Continuous
            && self.repo_url == repo_url
            && self.repo_branch == branch
    }
}

/// Editable part of an image request, shared by create and edit
#[derive(Debug, Clone)]
pub struct RequestDraft {
    pub image_name: String,
    pub repo_url: String,
    pub repo_branch: String,
    pub update_mode: UpdateMode,
    pub target_commit: Option<String>,
    pub base_image: String,
    pub run_commands: Option<String>,
    pub entrypoint: Option<String>,
    pub version_tag: String,
    pub owner_id: i64,
    pub collaborators: Collaborators,
}

impl RequestDraft {
    pub fn into_request(self, id: i64, created_by: i64) -> ImageRequest {
        let now = Utc::now();
        ImageRequest {
            id,
            image_name: self.image_name,
            repo_url: self.repo_url,
            repo_branch: self.repo_branch,
            update_mode: self.update_mode,
            target_commit: self.target_commit,
            base_image: self.base_image,
            run_commands: self.run_commands,
            entrypoint: self.entrypoint,
            version_tag: self.version_tag,
            owner_id: self.owner_id,
            created_by,
            collaborators: self.collaborators,
            status: RequestStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the editable fields of an existing request
    pub fn apply_to(self, request: &mut ImageRequest) {
        request.image_name = self.image_name;
        request.repo_url = self.repo_url;
        request.repo_branch = self.repo_branch;
        request.update_mode = self.update_mode;
        request.target_commit = self.target_commit;
        request.base_image = self.base_image;
        request.run_commands = self.run_commands;
        request.entrypoint = self.entrypoint;
        request.version_tag = self.version_tag;
        request.owner_id = self.owner_id;
        request.collaborators = self.collaborators;
        request.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Building => "building",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to materialize an image request into an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub request_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<i64>,
    pub status: BuildStatus,
    pub build_log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub built_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// Append one line to the build log
    pub fn log(&mut self, line: &str) {
        self.build_log.push_str(line);
        self.build_log.push('\n');
    }

    pub fn mark_building(&mut self) {
        self.status = BuildStatus::Building;
        self.updated_at = Utc::now();
    }

    /// The store sets `image_id` when it commits the image alongside
    pub fn mark_success(&mut self) {
        self.status = BuildStatus::Success;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = BuildStatus::Failed;
        self.error_message = Some(error.into());
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct NewBuild {
    pub request_id: i64,
    pub built_by: i64,
    pub initial_log: String,
}

impl NewBuild {
    pub fn with_id(self, id: i64) -> Build {
        let now = Utc::now();
        let mut build = Build {
            id,
            request_id: self.request_id,
            image_id: None,
            status: BuildStatus::Queued,
            build_log: String::new(),
            error_message: None,
            built_by: self.built_by,
            created_at: now,
            updated_at: now,
        };
        if !self.initial_log.is_empty() {
            build.log(&self.initial_log);
        }
        build
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub request_id: i64,
    pub name: String,
    pub version: String,
    pub image_tag: String,
    pub created_at: DateTime<Utc>,
}

impl Image {
    pub fn tag_for(name: &str, version: &str) -> String {
        format!("{}:{}", name, version)
    }
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub request_id: i64,
    pub name: String,
    pub version: String,
}

impl NewImage {
    /// Image materialized from a request's current name and version tag
    pub fn from_request(request: &ImageRequest) -> Self {
        Self {
            request_id: request.id,
            name: request.image_name.clone(),
            version: request.version_tag.clone(),
        }
    }

    pub fn with_id(self, id: i64) -> Image {
        let image_tag = Image::tag_for(&self.name, &self.version);
        Image {
            id,
            request_id: self.request_id,
            name: self.name,
            version: self.version,
            image_tag,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    Running,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// Transitions reachable through the scheduler or explicit actor actions.
    ///
    /// Commit-hook redeploys bypass this table and may move any deployment
    /// straight to `deploying`.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Deploying, Running)
                | (Deploying, Failed)
                | (Running, Stopped)
                | (Stopped, Deploying)
                | (Failed, Deploying)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running (or not) instance of an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub image_id: i64,
    pub name: String,
    pub environment: String,
    pub status: DeploymentStatus,
    pub replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    pub stopped_by_operator: bool,
    pub needs_restart: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Re-enter `deploying`, releasing any operator hold and pending restart.
    pub fn enter_deploying(&mut self) {
        self.status = DeploymentStatus::Deploying;
        self.stopped_by_operator = false;
        self.needs_restart = false;
        self.updated_at = Utc::now();
    }

    /// Stop the deployment. Only a privileged stop places the operator hold.
    pub fn stop(&mut self, by_operator: bool) {
        self.status = DeploymentStatus::Stopped;
        if by_operator {
            self.stopped_by_operator = true;
        }
        self.updated_at = Utc::now();
    }

    pub fn resolve(&mut self, status: DeploymentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn mark_needs_restart(&mut self) {
        self.needs_restart = true;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub image_id: i64,
    pub name: String,
    pub environment: String,
    pub replicas: u32,
    pub ports: Option<String>,
}

impl NewDeployment {
    pub fn with_id(self, id: i64) -> Deployment {
        let now = Utc::now();
        Deployment {
            id,
            image_id: self.image_id,
            name: self.name,
            environment: self.environment,
            status: DeploymentStatus::Deploying,
            replicas: self.replicas,
            ports: self.ports,
            stopped_by_operator: false,
            needs_restart: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_type: String,
    pub target_id: i64,
    pub message: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: String,
    pub target_id: i64,
    pub message: String,
}

impl NewAlert {
    pub fn with_id(self, id: i64) -> Alert {
        Alert {
            id,
            alert_type: self.alert_type,
            target_id: self.target_id,
            message: self.message,
            resolved: false,
            created_at: Utc::now(),
        }
    }
}

/// Audit event as handed to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<i64>,
    pub details: String,
}

impl AuditEntry {
    pub fn new(
        user_id: Option<i64>,
        action: impl Into<String>,
        target_id: Option<i64>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            action: action.into(),
            target_id,
            details: details.into(),
        }
    }
}

/// Audit event as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub created_at: DateTime<Utc>,
}

/// One runtime sample; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu: f64,
    pub ram: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborators_parse_trims_and_drops_empty() {
        let collaborators = Collaborators::parse(" alice, bob ,,  ,Carol");

        assert!(collaborators.contains("alice"));
        assert!(collaborators.contains("bob"));
        assert!(collaborators.contains("Carol"));
        assert!(!collaborators.contains("carol"));
        assert_eq!(collaborators.to_string(), "Carol,alice,bob");
    }

    #[test]
    fn test_collaborators_serialize_as_list() {
        let collaborators = Collaborators::parse("bob,alice");
        let json = serde_json::to_value(&collaborators).unwrap();
        assert_eq!(json, serde_json::json!(["alice", "bob"]));
    }

    #[test]
    fn test_terminal_build_statuses() {
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
    }

    #[test]
    fn test_deployment_transitions() {
        use DeploymentStatus::*;
        assert!(Deploying.can_transition_to(Running));
        assert!(Deploying.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Deploying));
        assert!(!Running.can_transition_to(Deploying));
        assert!(!Stopped.can_transition_to(Running));
    }

    #[test]
    fn test_enter_deploying_clears_flags() {
        let mut deployment = NewDeployment {
            image_id: 1,
            name: "web".to_string(),
            environment: "dev".to_string(),
            replicas: 1,
            ports: None,
        }
        .with_id(7);

        deployment.stop(true);
        deployment.mark_needs_restart();
        assert!(deployment.stopped_by_operator);

        deployment.enter_deploying();
        assert_eq!(deployment.status, DeploymentStatus::Deploying);
        assert!(!deployment.stopped_by_operator);
        assert!(!deployment.needs_restart);
    }

    #[test]
    fn test_developer_stop_keeps_operator_flag_clear() {
        let mut deployment = NewDeployment {
            image_id: 1,
            name: "web".to_string(),
            environment: "dev".to_string(),
            replicas: 1,
            ports: None,
        }
        .with_id(7);

        deployment.stop(false);
        assert_eq!(deployment.status, DeploymentStatus::Stopped);
        assert!(!deployment.stopped_by_operator);
    }

    #[test]
    fn test_image_tag_format() {
        let image = NewImage {
            request_id: 3,
            name: "api".to_string(),
            version: "1.2.0".to_string(),
        }
        .with_id(1);
        assert_eq!(image.image_tag, "api:1.2.0");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("operator".parse::<Role>().unwrap(), Role::Operator);
        assert!("root".parse::<Role>().is_err());
    }
}
