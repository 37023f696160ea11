//! Shared data contracts for the Dockyard control plane.
//!
//! - `models`: persistent entities and their state machines
//! - `access`: role/ownership/collaborator authorization predicates
//! - `error`: error taxonomy shared by storage, scheduler and handlers

pub mod access;
pub mod error;
pub mod models;

pub use error::{Error, Result};
pub use models::{
    Alert, AuditEntry, AuditRecord, Build, BuildStatus, Collaborators, Deployment,
    DeploymentStatus, Image, ImageRequest, MetricPoint, NewAlert, NewBuild, NewDeployment,
    NewImage, NewUser, RequestDraft, RequestStatus, Role, UpdateMode, User,
};
