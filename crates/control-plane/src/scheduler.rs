//! Lifecycle scheduler - advances builds and deployments every tick
//!
//! One tick runs three phases in order: builds, deployments, runtime
//! telemetry. Each phase commits on its own, so a failing phase never rolls
//! back the others.

use chrono::Utc;
use dockyard_common::models::{NewAlert, NewImage};
use dockyard_common::{
    AuditEntry, Build, BuildStatus, Deployment, DeploymentStatus, Error, MetricPoint, Result,
};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::random::RandomSource;
use crate::storage::{audit, Change, Store};
use crate::telemetry::TelemetryStore;

pub const BUILD_CONCLUDE_PROBABILITY: f64 = 0.3;
pub const BUILD_SUCCESS_PROBABILITY: f64 = 0.85;
pub const DEPLOYMENT_RESOLVE_PROBABILITY: f64 = 0.4;
pub const DEPLOYMENT_SUCCESS_PROBABILITY: f64 = 0.85;

/// Largest per-tick cpu/ram move, in percentage points
pub const METRIC_STEP: f64 = 5.0;

pub const BUILD_FAILURE_MESSAGE: &str = "Simulated build failure";
pub const DEPLOYMENT_FAILURE_MESSAGE: &str = "Deployment failed during startup (simulated)";

const BUILD_PROGRESS: &[&str] = &[
    "Cloning repository...",
    "Checking out commit...",
    "Running Docker build step...",
    "Installing dependencies...",
    "Optimizing layers...",
    "Pushing image to registry (simulated)...",
];

const LOG_LEVEL_WEIGHTS: [u32; 3] = [80, 15, 5];

const RUNTIME_MESSAGES: [(&str, &[&str]); 3] = [
    (
        "INFO",
        &["Handling request", "Background job executed", "Health check OK"],
    ),
    ("WARN", &["Slow response detected", "Retrying external call"]),
    (
        "ERROR",
        &["Unhandled exception in worker", "Database connection timeout"],
    ),
];

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between tick starts
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// What a single tick changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub builds_advanced: usize,
    pub deployments_resolved: usize,
    pub deployments_sampled: usize,
}

/// Periodic driver of the build and deployment state machines
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    telemetry: Arc<TelemetryStore>,
    random: Box<dyn RandomSource>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        telemetry: Arc<TelemetryStore>,
        random: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            config,
            store,
            telemetry,
            random,
        }
    }

    /// Tick until `shutdown` turns true or its sender is dropped.
    ///
    /// The signal is only observed between ticks; a tick in progress always
    /// runs to completion. Tick failures and panics are logged and never end
    /// the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started (tick every {} ms)",
            self.config.tick_interval.as_millis()
        );

        let mut ticks = tokio::time::interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticks.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(report)) => debug!("Tick finished: {:?}", report),
                Ok(Err(e)) => error!("Scheduler tick failed: {}", e),
                Err(_) => error!("Scheduler tick panicked"),
            }
        }

        info!("Scheduler stopped");
    }

    /// Run the three phases once
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut failure: Option<Error> = None;

        match self.process_builds().await {
            Ok(n) => report.builds_advanced = n,
            Err(e) => failure = Some(phase_failure("build", e)),
        }
        match self.process_deployments().await {
            Ok(n) => report.deployments_resolved = n,
            Err(e) => failure = failure.or(Some(phase_failure("deployment", e))),
        }
        match self.generate_runtime().await {
            Ok(n) => report.deployments_sampled = n,
            Err(e) => failure = failure.or(Some(phase_failure("runtime", e))),
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// queued -> building -> success/failed, growing the build log meanwhile
    async fn process_builds(&mut self) -> Result<usize> {
        let rows = self
            .store
            .builds_with_status(&[BuildStatus::Queued, BuildStatus::Building])
            .await?;

        let mut changes = Vec::with_capacity(rows.len());
        // (build id, built_by, audited transition) per change
        let mut pending = Vec::with_capacity(rows.len());

        for mut build in rows {
            let before = build.status;
            if before.is_terminal() {
                continue;
            }
            let (id, built_by) = (build.id, build.built_by);

            if before == BuildStatus::Queued {
                build.log("[engine] Build queued, starting...");
                build.mark_building();
                pending.push((id, built_by, Some(BuildEvent::Started)));
                changes.push(Change::build(build, before));
                continue;
            }

            for _ in 0..self.random.between(1, 3) {
                let step = self.pick(BUILD_PROGRESS);
                build.log(&format!("[engine] {}", step));
            }
            if !self.random.chance(BUILD_CONCLUDE_PROBABILITY) {
                pending.push((id, built_by, None));
                changes.push(Change::build(build, before));
                continue;
            }

            let change = if self.random.chance(BUILD_SUCCESS_PROBABILITY) {
                self.finish_build(build, before).await?
            } else {
                fail_build(&mut build, BUILD_FAILURE_MESSAGE);
                Change::build(build, before)
            };
            let event = match &change {
                Change::Build { image: Some(_), .. } => BuildEvent::Succeeded,
                _ => BuildEvent::Failed,
            };
            pending.push((id, built_by, Some(event)));
            changes.push(change);
        }

        if changes.is_empty() {
            return Ok(0);
        }

        let applied = self.store.commit(changes).await?;

        let mut advanced = 0;
        for ((id, built_by, event), applied) in pending.into_iter().zip(applied) {
            if !applied {
                debug!("Build {} changed under the scheduler, skipped", id);
                continue;
            }
            advanced += 1;

            let Some(event) = event else {
                continue;
            };
            let details = match event {
                BuildEvent::Started => format!("Build {} started by simulation engine", id),
                BuildEvent::Succeeded => {
                    let image_id = self.committed_image(id).await;
                    format!(
                        "Build {} finished successfully (image_id={})",
                        id,
                        image_id.map_or_else(|| "?".to_string(), |i| i.to_string())
                    )
                }
                BuildEvent::Failed => format!("Build {} failed", id),
            };
            audit(
                self.store.as_ref(),
                AuditEntry::new(Some(built_by), event.action(), Some(id), details),
            )
            .await;
        }

        Ok(advanced)
    }

    /// Success change for a build; the image is inserted by the same commit.
    /// A build whose request is gone fails instead.
    async fn finish_build(&self, mut build: Build, before: BuildStatus) -> Result<Change> {
        let Some(request) = self.store.get_request(build.request_id).await? else {
            warn!(
                "Build {} lost its image request {}",
                build.id, build.request_id
            );
            let message = format!("Image request {} no longer exists", build.request_id);
            fail_build(&mut build, &message);
            return Ok(Change::build(build, before));
        };

        build.log("[engine] Build SUCCESS");
        build.mark_success();
        Ok(Change::successful_build(
            build,
            before,
            NewImage::from_request(&request),
        ))
    }

    /// Image id the store assigned to a committed successful build
    async fn committed_image(&self, build_id: i64) -> Option<i64> {
        match self.store.get_build(build_id).await {
            Ok(Some(build)) => {
                if let Some(image_id) = build.image_id {
                    info!("Build {} produced image {}", build_id, image_id);
                }
                build.image_id
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to reload build {}: {}", build_id, e);
                None
            }
        }
    }

    /// deploying -> running/failed; failures raise an alert
    async fn process_deployments(&mut self) -> Result<usize> {
        let rows = self
            .store
            .deployments_with_status(DeploymentStatus::Deploying)
            .await?;

        let mut changes = Vec::new();
        let mut events = Vec::new();

        for mut deployment in rows {
            if !self.random.chance(DEPLOYMENT_RESOLVE_PROBABILITY) {
                continue;
            }

            if self.random.chance(DEPLOYMENT_SUCCESS_PROBABILITY) {
                deployment.resolve(DeploymentStatus::Running);
                events.push(AuditEntry::new(
                    None,
                    "deployment_running",
                    Some(deployment.id),
                    "Deployment is now running",
                ));
                changes.push(Change::deployment(deployment, DeploymentStatus::Deploying));
            } else {
                deployment.resolve(DeploymentStatus::Failed);
                events.push(AuditEntry::new(
                    None,
                    "deployment_failed",
                    Some(deployment.id),
                    DEPLOYMENT_FAILURE_MESSAGE,
                ));
                let alert = NewAlert {
                    alert_type: "deployment".to_string(),
                    target_id: deployment.id,
                    message: DEPLOYMENT_FAILURE_MESSAGE.to_string(),
                };
                changes.push(Change::failed_deployment(
                    deployment,
                    DeploymentStatus::Deploying,
                    alert,
                ));
            }
        }

        if changes.is_empty() {
            return Ok(0);
        }

        let applied = self.store.commit(changes).await?;
        let mut resolved = 0;
        for (event, applied) in events.into_iter().zip(applied) {
            if applied {
                resolved += 1;
                audit(self.store.as_ref(), event).await;
            }
        }

        Ok(resolved)
    }

    /// Synthetic logs and metrics for running deployments
    async fn generate_runtime(&mut self) -> Result<usize> {
        self.sweep_telemetry().await?;

        let rows = self
            .store
            .deployments_with_status(DeploymentStatus::Running)
            .await?;

        let mut sampled = 0;
        for deployment in rows {
            // deleted or stopped since the query
            match self.store.get_deployment(deployment.id).await? {
                Some(current) if current.status == DeploymentStatus::Running => {}
                _ => continue,
            }

            let Some(image) = self.store.get_image(deployment.image_id).await? else {
                debug!(
                    "Deployment {} has no image {}, skipping",
                    deployment.id, deployment.image_id
                );
                continue;
            };

            for _ in 0..self.random.between(1, 3) {
                let line = self.runtime_line(&deployment, &image.image_tag);
                self.telemetry.append_log(deployment.id, line);
            }
            self.advance_metrics(deployment.id);
            sampled += 1;
        }

        Ok(sampled)
    }

    /// Drop buffers of deployments that no longer exist
    async fn sweep_telemetry(&self) -> Result<()> {
        let tracked = self.telemetry.deployment_ids();
        if tracked.is_empty() {
            return Ok(());
        }

        let live: HashSet<i64> = self
            .store
            .list_deployments()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        for id in tracked.into_iter().filter(|id| !live.contains(id)) {
            debug!("Dropping telemetry of deleted deployment {}", id);
            self.telemetry.forget(id);
        }
        Ok(())
    }

    fn runtime_line(&mut self, deployment: &Deployment, image_tag: &str) -> String {
        let level = self.random.weighted(&LOG_LEVEL_WEIGHTS);
        let (level, messages) = RUNTIME_MESSAGES[level.min(RUNTIME_MESSAGES.len() - 1)];
        let message = self.pick(messages);

        format!(
            "{} [{}] {} ({}) - {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S"),
            level,
            deployment.name,
            image_tag,
            message
        )
    }

    /// One step of the bounded cpu/ram random walk
    fn advance_metrics(&mut self, deployment_id: i64) {
        let (cpu, ram) = self.telemetry.metric_seed(deployment_id);
        let cpu = (cpu + self.random.uniform(-METRIC_STEP, METRIC_STEP)).clamp(0.0, 100.0);
        let ram = (ram + self.random.uniform(-METRIC_STEP, METRIC_STEP)).clamp(0.0, 100.0);

        self.telemetry.update_metric_seed(deployment_id, cpu, ram);
        self.telemetry.append_metric(
            deployment_id,
            MetricPoint {
                timestamp: Utc::now(),
                cpu,
                ram,
            },
        );
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        let index = self.random.between(0, items.len().saturating_sub(1));
        items[index.min(items.len() - 1)]
    }
}

/// Build transitions that leave an audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildEvent {
    Started,
    Succeeded,
    Failed,
}

impl BuildEvent {
    fn action(&self) -> &'static str {
        match self {
            BuildEvent::Started => "build_start",
            BuildEvent::Succeeded | BuildEvent::Failed => "build_finish",
        }
    }
}

fn fail_build(build: &mut Build, message: &str) {
    build.log("[engine] Build FAILED");
    build.mark_failed(message);
}

fn phase_failure(phase: &'static str, e: Error) -> Error {
    error!("Scheduler {} phase failed: {}", phase, e);
    Error::Tick {
        phase,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::ScriptedRandom;
    use crate::storage::testing::FaultyStore;
    use dockyard_common::models::{NewBuild, NewDeployment, RequestDraft};
    use dockyard_common::{Collaborators, ImageRequest, UpdateMode};

    struct Harness {
        store: Arc<FaultyStore>,
        telemetry: Arc<TelemetryStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(FaultyStore::new()),
                telemetry: Arc::new(TelemetryStore::new()),
            }
        }

        fn scheduler(&self, random: ScriptedRandom) -> Scheduler {
            Scheduler::new(
                SchedulerConfig::default(),
                self.store.clone(),
                self.telemetry.clone(),
                Box::new(random),
            )
        }

        async fn request(&self) -> ImageRequest {
            let draft = RequestDraft {
                image_name: "api".to_string(),
                repo_url: "https://x/y".to_string(),
                repo_branch: "main".to_string(),
                update_mode: UpdateMode::Continuous,
                target_commit: None,
                base_image: "debian:12".to_string(),
                run_commands: None,
                entrypoint: None,
                version_tag: "2.1".to_string(),
                owner_id: 1,
                collaborators: Collaborators::default(),
            };
            self.store.insert_request(draft, 1).await.unwrap()
        }

        async fn build(&self, request_id: i64, status: BuildStatus) -> Build {
            let mut build = self
                .store
                .insert_build(NewBuild {
                    request_id,
                    built_by: 1,
                    initial_log: "[ui] Build requested by operator".to_string(),
                })
                .await
                .unwrap();
            if status != BuildStatus::Queued {
                build.status = status;
                self.store
                    .commit(vec![Change::Build {
                        row: build.clone(),
                        expected: None,
                        image: None,
                    }])
                    .await
                    .unwrap();
            }
            build
        }

        async fn deployment(&self, status: DeploymentStatus) -> Deployment {
            let request = self.request().await;
            let image = self
                .store
                .insert_image(NewImage::from_request(&request))
                .await
                .unwrap();
            let mut deployment = self
                .store
                .insert_deployment(NewDeployment {
                    image_id: image.id,
                    name: "api-prod".to_string(),
                    environment: "prod".to_string(),
                    replicas: 2,
                    ports: Some("8080".to_string()),
                })
                .await
                .unwrap();
            if status != DeploymentStatus::Deploying {
                deployment.status = status;
                self.store
                    .commit(vec![Change::Deployment {
                        row: deployment.clone(),
                        expected: None,
                        alert: None,
                    }])
                    .await
                    .unwrap();
            }
            deployment
        }

        async fn reload_build(&self, id: i64) -> Build {
            self.store.get_build(id).await.unwrap().unwrap()
        }

        async fn reload_deployment(&self, id: i64) -> Deployment {
            self.store.get_deployment(id).await.unwrap().unwrap()
        }

        async fn actions(&self) -> Vec<String> {
            self.store
                .recent_audit(100)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.entry.action)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_queued_build_starts() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Queued).await;

        let report = h.scheduler(ScriptedRandom::new(false)).tick().await.unwrap();

        let build = h.reload_build(build.id).await;
        assert_eq!(report.builds_advanced, 1);
        assert_eq!(build.status, BuildStatus::Building);
        assert!(build.build_log.ends_with("[engine] Build queued, starting...\n"));
        assert_eq!(h.actions().await, vec!["build_start"]);
    }

    #[tokio::test]
    async fn test_building_success_creates_tagged_image() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Building).await;

        // concludes, succeeds
        let random = ScriptedRandom::new(false)
            .with_chances([true, true])
            .with_count(2);
        h.scheduler(random).tick().await.unwrap();

        let build = h.reload_build(build.id).await;
        assert_eq!(build.status, BuildStatus::Success);
        let image_id = build.image_id.expect("successful build has an image");
        let image = h.store.get_image(image_id).await.unwrap().unwrap();
        assert_eq!(image.image_tag, "api:2.1");
        assert_eq!(image.image_tag, request.image_tag());
        assert!(build.build_log.contains("[engine] Build SUCCESS"));
        assert_eq!(h.actions().await, vec!["build_finish"]);
    }

    #[tokio::test]
    async fn test_building_failure() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Building).await;

        // concludes, fails
        let random = ScriptedRandom::new(false).with_chances([true, false]);
        h.scheduler(random).tick().await.unwrap();

        let build = h.reload_build(build.id).await;
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error_message.as_deref(), Some(BUILD_FAILURE_MESSAGE));
        assert!(build.image_id.is_none());
        assert!(build.build_log.contains("[engine] Build FAILED"));
    }

    #[tokio::test]
    async fn test_building_without_conclusion_only_logs() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Building).await;
        let before_lines = build.build_log.lines().count();

        let random = ScriptedRandom::new(false).with_count(3);
        h.scheduler(random).tick().await.unwrap();

        let build = h.reload_build(build.id).await;
        assert_eq!(build.status, BuildStatus::Building);
        assert_eq!(build.build_log.lines().count(), before_lines + 3);
        assert!(h.actions().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_builds_untouched() {
        let h = Harness::new();
        let request = h.request().await;
        let done = h.build(request.id, BuildStatus::Success).await;
        let failed = h.build(request.id, BuildStatus::Failed).await;

        let mut scheduler = h.scheduler(ScriptedRandom::new(true));
        for _ in 0..5 {
            scheduler.tick().await.unwrap();
        }

        assert_eq!(h.reload_build(done.id).await, done);
        assert_eq!(h.reload_build(failed.id).await, failed);
    }

    #[tokio::test]
    async fn test_build_runs_to_terminal_state() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Queued).await;

        let mut scheduler = h.scheduler(ScriptedRandom::new(true));
        scheduler.tick().await.unwrap();
        assert_eq!(h.reload_build(build.id).await.status, BuildStatus::Building);
        scheduler.tick().await.unwrap();
        assert_eq!(h.reload_build(build.id).await.status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn test_deployment_resolves_running() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Deploying).await;

        let random = ScriptedRandom::new(false).with_chances([true, true]);
        let report = h.scheduler(random).tick().await.unwrap();

        assert_eq!(report.deployments_resolved, 1);
        let deployment = h.reload_deployment(deployment.id).await;
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert!(h.store.list_alerts().await.unwrap().is_empty());
        assert_eq!(h.actions().await, vec!["deployment_running"]);
    }

    #[tokio::test]
    async fn test_deployment_failure_raises_alert() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Deploying).await;

        let random = ScriptedRandom::new(false).with_chances([true, false]);
        h.scheduler(random).tick().await.unwrap();

        let reloaded = h.reload_deployment(deployment.id).await;
        assert_eq!(reloaded.status, DeploymentStatus::Failed);

        let alerts = h.store.list_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].target_id, deployment.id);
        assert!(!alerts[0].resolved);
        assert_eq!(h.actions().await, vec!["deployment_failed"]);
    }

    #[tokio::test]
    async fn test_unresolved_deployment_untouched() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Deploying).await;

        h.scheduler(ScriptedRandom::new(false)).tick().await.unwrap();

        assert_eq!(h.reload_deployment(deployment.id).await, deployment);
    }

    #[tokio::test]
    async fn test_runtime_telemetry_for_running_deployment() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Running).await;

        let random = ScriptedRandom::new(false)
            .with_count(2)
            .with_offset(3.0)
            .with_pick(1);
        h.scheduler(random).tick().await.unwrap();

        let lines = h.telemetry.snapshot_logs(deployment.id);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[WARN] api-prod (api:2.1) - "));

        let metrics = h.telemetry.metrics(deployment.id);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].cpu, 53.0);
        assert_eq!(metrics[0].ram, 53.0);
        assert_eq!(h.telemetry.metric_seed(deployment.id), (53.0, 53.0));
    }

    #[tokio::test]
    async fn test_metrics_stay_in_bounds() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Running).await;

        let mut scheduler = h.scheduler(ScriptedRandom::new(false).with_offset(5.0));
        for _ in 0..30 {
            scheduler.tick().await.unwrap();
        }
        let last = *h.telemetry.metrics(deployment.id).last().unwrap();
        assert_eq!(last.cpu, 100.0);

        let mut scheduler = h.scheduler(ScriptedRandom::new(false).with_offset(-5.0));
        for _ in 0..40 {
            scheduler.tick().await.unwrap();
        }
        for point in h.telemetry.metrics(deployment.id) {
            assert!((0.0..=100.0).contains(&point.cpu));
            assert!((0.0..=100.0).contains(&point.ram));
        }
        let last = *h.telemetry.metrics(deployment.id).last().unwrap();
        assert_eq!(last.cpu, 0.0);
    }

    #[tokio::test]
    async fn test_seeded_walk_stays_in_bounds() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Running).await;

        let mut scheduler = Scheduler::new(
            SchedulerConfig::default(),
            h.store.clone(),
            h.telemetry.clone(),
            Box::new(crate::random::StdRandom::new(Some(9))),
        );
        for _ in 0..500 {
            scheduler.tick().await.unwrap();
        }

        let metrics = h.telemetry.metrics(deployment.id);
        assert_eq!(metrics.len(), 500);
        assert!(metrics
            .iter()
            .all(|p| (0.0..=100.0).contains(&p.cpu) && (0.0..=100.0).contains(&p.ram)));
        assert!(h.telemetry.snapshot_logs(deployment.id).len() <= 1000);
    }

    #[tokio::test]
    async fn test_stopped_deployment_gets_no_telemetry() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Stopped).await;

        h.scheduler(ScriptedRandom::new(true)).tick().await.unwrap();

        assert_eq!(
            h.reload_deployment(deployment.id).await.status,
            DeploymentStatus::Stopped
        );
        assert!(h.telemetry.snapshot_logs(deployment.id).is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Queued).await;

        let (tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            SchedulerConfig {
                tick_interval: Duration::from_millis(10),
            },
            h.store.clone(),
            h.telemetry.clone(),
            Box::new(ScriptedRandom::new(false)),
        );
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert_eq!(h.reload_build(build.id).await.status, BuildStatus::Building);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_orphan_image() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Building).await;
        let mut scheduler = h.scheduler(ScriptedRandom::new(true));

        h.store.fail_commits(1);
        let err = scheduler.tick().await.unwrap_err();
        assert!(matches!(err, Error::Tick { phase: "build", .. }));
        assert_eq!(h.reload_build(build.id).await.status, BuildStatus::Building);
        assert_eq!(h.store.inner.image_count().await, 0);

        scheduler.tick().await.unwrap();
        let build = h.reload_build(build.id).await;
        assert_eq!(build.status, BuildStatus::Success);
        assert_eq!(h.store.inner.image_count().await, 1);
        let image_id = build.image_id.expect("successful build has an image");
        assert!(h.store.get_image(image_id).await.unwrap().is_some());
        assert_eq!(h.actions().await, vec!["build_finish"]);
    }

    #[tokio::test]
    async fn test_build_changed_mid_tick_is_skipped() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Building).await;

        // another writer fails the build before the phase commits
        let mut failed = build.clone();
        failed.mark_failed("cancelled");
        h.store.interleave(Change::Build {
            row: failed.clone(),
            expected: None,
            image: None,
        });

        let report = h.scheduler(ScriptedRandom::new(true)).tick().await.unwrap();

        assert_eq!(report.builds_advanced, 0);
        assert_eq!(h.reload_build(build.id).await, failed);
        assert_eq!(h.store.inner.image_count().await, 0);
        assert!(h.actions().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_phase_leaves_other_phases_committed() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Queued).await;
        let deploying = h.deployment(DeploymentStatus::Deploying).await;
        let running = h.deployment(DeploymentStatus::Running).await;

        h.store.fail_build_reads(1);
        let err = h
            .scheduler(ScriptedRandom::new(true))
            .tick()
            .await
            .unwrap_err();

        match err {
            Error::Tick { phase, message } => {
                assert_eq!(phase, "build");
                assert!(message.contains("build index unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.reload_build(build.id).await.status, BuildStatus::Queued);
        assert_eq!(
            h.reload_deployment(deploying.id).await.status,
            DeploymentStatus::Running
        );
        assert_eq!(h.actions().await, vec!["deployment_running"]);
        assert!(!h.telemetry.snapshot_logs(running.id).is_empty());
        assert_eq!(h.telemetry.metrics(running.id).len(), 1);
    }

    #[tokio::test]
    async fn test_run_survives_failed_and_panicking_ticks() {
        let h = Harness::new();
        let request = h.request().await;
        let build = h.build(request.id, BuildStatus::Queued).await;

        h.store.panic_on_build_reads(1);
        h.store.fail_build_reads(2);

        let (tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            SchedulerConfig {
                tick_interval: Duration::from_millis(10),
            },
            h.store.clone(),
            h.telemetry.clone(),
            Box::new(ScriptedRandom::new(false)),
        );
        let handle = tokio::spawn(scheduler.run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.reload_build(build.id).await.status != BuildStatus::Building {
            assert!(
                tokio::time::Instant::now() < deadline,
                "scheduler stopped ticking"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_deleted_deployment_gets_no_telemetry() {
        let h = Harness::new();
        let deployment = h.deployment(DeploymentStatus::Running).await;

        // the running query still reports a row deleted right after it
        assert!(h.store.delete_deployment(deployment.id).await.unwrap());
        h.store.report_stale_running(deployment.clone());
        h.telemetry.append_log(999, "left behind");

        let report = h.scheduler(ScriptedRandom::new(true)).tick().await.unwrap();

        assert_eq!(report.deployments_sampled, 0);
        assert!(h.telemetry.snapshot_logs(deployment.id).is_empty());
        assert!(h.telemetry.metrics(deployment.id).is_empty());
        assert!(h.telemetry.deployment_ids().is_empty());
    }
}
