//! Commit hook: redeploy continuous deployments when their branch moves

use chrono::Utc;
use dockyard_common::{AuditEntry, Error, ImageRequest, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::storage::{audit, Change, Store};
use crate::telemetry::TelemetryStore;

/// Payload posted by the source host; every field is required
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitEvent {
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub matched_deployments: usize,
    pub restarted: usize,
    pub marked_for_restart: usize,
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::validation(format!(
            "repo_url, branch, commit required (missing {})",
            field
        ))),
    }
}

/// Apply a commit to every deployment tracing back to a continuous request
/// on the same repository and branch.
///
/// Deployments held by an operator stop are only marked for restart; the
/// rest go straight back to `deploying`.
pub async fn handle_commit(
    store: &dyn Store,
    telemetry: &TelemetryStore,
    event: &CommitEvent,
) -> Result<HookOutcome> {
    let repo_url = required(&event.repo_url, "repo_url")?;
    let branch = required(&event.branch, "branch")?;
    let sha = required(&event.commit, "commit")?;

    info!("Commit {} received for {}@{}", sha, repo_url, branch);

    let mut followers: HashMap<i64, bool> = HashMap::new();
    let mut changes = Vec::new();
    let mut marked = Vec::new();

    for mut deployment in store.list_deployments().await? {
        let follows = match followers.get(&deployment.image_id) {
            Some(follows) => *follows,
            None => {
                let follows = origin_request(store, deployment.image_id)
                    .await?
                    .is_some_and(|r| r.follows(repo_url, branch));
                followers.insert(deployment.image_id, follows);
                follows
            }
        };
        if !follows {
            continue;
        }

        let current = deployment.status;
        let held = deployment.stopped_by_operator;
        if held {
            deployment.mark_needs_restart();
        } else {
            deployment.enter_deploying();
        }
        marked.push((deployment.id, held));
        changes.push(Change::deployment(deployment, current));
    }

    let matched = changes.len();
    let applied = if changes.is_empty() {
        Vec::new()
    } else {
        store.commit(changes).await?
    };

    let mut outcome = HookOutcome {
        matched_deployments: matched,
        ..HookOutcome::default()
    };
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%S");
    for ((deployment_id, held), applied) in marked.into_iter().zip(applied) {
        if !applied {
            debug!("Deployment {} changed under the hook, skipped", deployment_id);
            continue;
        }
        let reaction = if held {
            outcome.marked_for_restart += 1;
            "marked for restart"
        } else {
            outcome.restarted += 1;
            "auto-restart triggered"
        };
        telemetry.append_log(
            deployment_id,
            format!(
                "{} [INFO] Commit {} received for {}@{}, {}",
                now, sha, repo_url, branch, reaction
            ),
        );
    }

    audit(
        store,
        AuditEntry::new(
            None,
            "commit_hook_received",
            None,
            format!(
                "Commit {} for {}@{}, deployments={}",
                sha, repo_url, branch, matched
            ),
        ),
    )
    .await;
    if outcome.restarted + outcome.marked_for_restart > 0 {
        audit(
            store,
            AuditEntry::new(
                None,
                "deployments_restarted",
                None,
                format!(
                    "Auto-restarted={}, marked={}",
                    outcome.restarted, outcome.marked_for_restart
                ),
            ),
        )
        .await;
    }

    Ok(outcome)
}

async fn origin_request(store: &dyn Store, image_id: i64) -> Result<Option<ImageRequest>> {
    match store.get_image(image_id).await? {
        Some(image) => store.get_request(image.request_id).await,
        None => Ok(None),
    }
}
