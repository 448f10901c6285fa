//! Provisioning of container images onto parent hosts.
//!
//! One job makes one attempt at getting an image onto a parent host through
//! the parent's provider. Attempts are counted on the host record and the
//! host is terminated once the retry budget is spent. The job id encodes the
//! attempt number. A job always consumes the attempt it was created at, so a
//! redelivered job replays its build without the store counting it twice.

use async_trait::async_trait;
use fleetd_core::cloud::as_container_manager;
use fleetd_core::host::{Host, SYSTEM_USER};
use fleetd_core::job::{Job, JobBase, JobType};
use fleetd_core::{Environment, Error, HostId, JobContext, Result, ResultExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const BUILDING_CONTAINER_IMAGE_JOB_NAME: &str = "building-container-image";

/// Build attempts a parent host gets before it is terminated.
pub const CONTAINER_BUILD_RETRIES: u32 = 5;

const JOB_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BuildArgs {
    parent_id: HostId,
    image_url: String,
    #[serde(default)]
    provider: String,
    /// The parent's build-attempt counter when the job was created.
    #[serde(default)]
    attempt: u32,
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The parent or the environment could not be resolved.
    Unresolved,
    /// The retry budget was spent and the parent was terminated.
    RetriesExhausted,
    /// The image was already on the parent; no provider call was made.
    AlreadyBuilt,
    Built,
    Failed,
}

impl BuildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildOutcome::Unresolved => "unresolved",
            BuildOutcome::RetriesExhausted => "retries_exhausted",
            BuildOutcome::AlreadyBuilt => "already_built",
            BuildOutcome::Built => "built",
            BuildOutcome::Failed => "failed",
        }
    }
}

/// Makes one attempt at building `image_url` on a parent host.
pub struct BuildingContainerImageJob {
    base: JobBase,
    args: BuildArgs,

    // Caches; not persisted.
    parent: Option<Host>,
    env: Option<Arc<Environment>>,
    outcome: Option<BuildOutcome>,
}

impl BuildingContainerImageJob {
    /// An empty job for the registry to load a record into.
    pub(crate) fn empty() -> Self {
        Self {
            base: JobBase::new(JobType::new(BUILDING_CONTAINER_IMAGE_JOB_NAME, JOB_VERSION)),
            args: BuildArgs {
                parent_id: HostId::new(""),
                image_url: String::new(),
                provider: String::new(),
                attempt: 0,
            },
            parent: None,
            env: None,
            outcome: None,
        }
    }

    /// A job for the next build attempt of `image_url` on `host`.
    pub fn new(
        env: Arc<Environment>,
        host: Host,
        image_url: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        let mut job = Self::empty();
        job.args = BuildArgs {
            parent_id: host.id.clone(),
            image_url: image_url.into(),
            provider: provider.into(),
            attempt: host.container_build_attempt,
        };
        job.base.set_id(format!(
            "{}.{}.attempt-{}.{}",
            BUILDING_CONTAINER_IMAGE_JOB_NAME, job.args.parent_id, job.args.attempt, job.args.image_url
        ));
        job.parent = Some(host);
        job.env = Some(env);
        job
    }

    pub fn parent_id(&self) -> &HostId {
        &self.args.parent_id
    }

    pub fn image_url(&self) -> &str {
        &self.args.image_url
    }

    pub fn provider(&self) -> &str {
        &self.args.provider
    }

    pub fn attempt(&self) -> u32 {
        self.args.attempt
    }

    /// Outcome of the last execution in this process.
    pub fn outcome(&self) -> Option<BuildOutcome> {
        self.outcome
    }

    fn resolve_environment(&mut self, ctx: &JobContext) -> Result<Arc<Environment>> {
        if let Some(env) = &self.env {
            return Ok(env.clone());
        }
        let env = ctx.environment()?;
        self.env = Some(env.clone());
        Ok(env)
    }

    async fn resolve_parent(&mut self, env: &Environment) -> Result<Host> {
        if let Some(parent) = self.parent.take() {
            return Ok(parent);
        }
        env.hosts()
            .find_by_id(&self.args.parent_id)
            .await
            .with_context(|| format!("loading parent host {}", self.args.parent_id))
    }

    async fn execute(&mut self, ctx: &JobContext) -> BuildOutcome {
        let env = match self.resolve_environment(ctx) {
            Ok(env) => env,
            Err(err) => {
                self.base.add_error(err);
                return BuildOutcome::Unresolved;
            }
        };
        let mut parent = match self.resolve_parent(&env).await {
            Ok(parent) => parent,
            Err(err) => {
                self.base.add_error(err);
                return BuildOutcome::Unresolved;
            }
        };

        let outcome = self.attempt_on(ctx, &env, &mut parent).await;
        self.parent = Some(parent);
        outcome
    }

    async fn attempt_on(
        &mut self,
        ctx: &JobContext,
        env: &Environment,
        parent: &mut Host,
    ) -> BuildOutcome {
        let counted = parent.container_build_attempt > self.args.attempt;
        if counted && parent.has_container_image(&self.args.image_url) {
            return BuildOutcome::AlreadyBuilt;
        }

        if parent.container_build_attempt >= CONTAINER_BUILD_RETRIES {
            self.base.add_error(Error::RetriesExhausted(format!(
                "image '{}' failed to build on parent {} after {} attempts",
                self.args.image_url, parent.id, CONTAINER_BUILD_RETRIES
            )));
            if let Err(err) = parent.set_terminated(env.hosts(), SYSTEM_USER).await {
                self.base
                    .add_error(err.context(format!("terminating parent {}", parent.id)));
            }
            return BuildOutcome::RetriesExhausted;
        }

        if parent.has_container_image(&self.args.image_url) {
            self.consume_attempt(env, parent).await;
            return BuildOutcome::AlreadyBuilt;
        }

        if counted {
            // A redelivery, or another image queued at the same counter value.
            debug!(
                host_id = %parent.id,
                job_id = %self.base.id(),
                current_attempt = parent.container_build_attempt,
                "Build attempt already counted, building without a new attempt"
            );
        }

        let provider = self.args.provider.clone();
        let image_url = self.args.image_url.clone();
        let build = build_image(ctx, env, parent, &provider, &image_url);
        let outcome = match AssertUnwindSafe(build).catch_unwind().await {
            Ok(Ok(())) => self.record_image(env, parent).await,
            Ok(Err(err)) => {
                self.base.add_error(err);
                BuildOutcome::Failed
            }
            Err(panic) => {
                self.base.add_error(Error::Internal(format!(
                    "container build panicked: {}",
                    panic_message(&*panic)
                )));
                BuildOutcome::Failed
            }
        };

        // Runs whatever happened above, including cancellation.
        self.consume_attempt(env, parent).await;
        outcome
    }

    async fn record_image(&mut self, env: &Environment, parent: &mut Host) -> BuildOutcome {
        parent.add_container_image(self.args.image_url.clone());
        match parent.upsert(env.hosts()).await {
            Ok(()) => BuildOutcome::Built,
            Err(err) => {
                self.base
                    .add_error(err.context(format!("recording image on parent {}", parent.id)));
                BuildOutcome::Failed
            }
        }
    }

    async fn consume_attempt(&mut self, env: &Environment, parent: &mut Host) {
        match parent
            .consume_container_build_attempt(env.hosts(), self.args.attempt)
            .await
        {
            Ok(()) => debug!(
                host_id = %parent.id,
                job_id = %self.base.id(),
                distro = %parent.distro,
                current_attempt = parent.container_build_attempt,
                "Container build attempt recorded"
            ),
            Err(err) => {
                warn!(
                    host_id = %parent.id,
                    job_id = %self.base.id(),
                    distro = %parent.distro,
                    current_attempt = parent.container_build_attempt,
                    error = %err,
                    "Failed to record container build attempt"
                );
                self.base.add_error(
                    err.context(format!("recording build attempt on parent {}", parent.id)),
                );
            }
        }
    }

    fn report(&self, outcome: BuildOutcome) {
        let (distro, current_attempt) = match &self.parent {
            Some(parent) => (parent.distro.as_str(), parent.container_build_attempt),
            None => ("", self.args.attempt),
        };

        match self.base.error() {
            Ok(()) => info!(
                host_id = %self.args.parent_id,
                job_id = %self.base.id(),
                distro = %distro,
                image = %self.args.image_url,
                current_attempt,
                outcome = outcome.as_str(),
                "Container image job finished"
            ),
            Err(err) => error!(
                host_id = %self.args.parent_id,
                job_id = %self.base.id(),
                distro = %distro,
                image = %self.args.image_url,
                current_attempt,
                outcome = outcome.as_str(),
                error = %err,
                "Container image job failed"
            ),
        }
    }
}

async fn build_image(
    ctx: &JobContext,
    env: &Environment,
    parent: &Host,
    provider: &str,
    image_url: &str,
) -> Result<()> {
    let settings = env.settings();
    let manager = ctx
        .run(env.clouds().get_manager(provider, &settings))
        .await
        .with_context(|| format!("getting manager for provider '{provider}'"))?;
    let containers = as_container_manager(manager.as_ref())?;

    ctx.run(containers.build_container_image(ctx, parent, image_url))
        .await
        .with_context(|| format!("building image '{image_url}' on parent {}", parent.id))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[async_trait]
impl Job for BuildingContainerImageJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut JobBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &JobContext) {
        let outcome = self.execute(ctx).await;
        self.base.mark_complete();
        self.outcome = Some(outcome);
        self.report(outcome);
    }

    fn body(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.args)?)
    }

    fn load_body(&mut self, body: serde_json::Value) -> Result<()> {
        self.args = serde_json::from_value(body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_cloud::{CloudManagers, MockManager, StaticManager};
    use fleetd_core::cloud::{CloudManager, ContainerManager};
    use fleetd_core::host::{HostStatus, HostStore};
    use fleetd_core::registry::JobRegistry;
    use fleetd_core::settings::Settings;
    use fleetd_db::MemoryHostStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryHostStore>,
        mock: Arc<MockManager>,
        env: Arc<Environment>,
    }

    fn fixture(hosts: impl IntoIterator<Item = Host>) -> Fixture {
        let store = Arc::new(MemoryHostStore::with_hosts(hosts));
        let mock = Arc::new(MockManager::new("docker"));
        let clouds = CloudManagers::new()
            .with_manager("docker", mock.clone())
            .with_manager("static", Arc::new(StaticManager::new("static")));
        let env = Arc::new(Environment::new(
            Arc::new(Settings::default()),
            store.clone(),
            Arc::new(clouds),
        ));
        Fixture { store, mock, env }
    }

    fn parent(attempt: u32) -> Host {
        Host::new("h1", "ubuntu-docker", "docker")
            .with_status(HostStatus::Provisioning)
            .with_container_build_attempt(attempt)
    }

    impl Fixture {
        async fn host(&self) -> Host {
            self.store.find_by_id(&HostId::new("h1")).await.unwrap()
        }

        async fn job(&self, image_url: &str) -> BuildingContainerImageJob {
            BuildingContainerImageJob::new(self.env.clone(), self.host().await, image_url, "docker")
        }
    }

    #[test]
    fn test_id_encodes_attempt() {
        let f = fixture([]);
        let job = BuildingContainerImageJob::new(f.env.clone(), parent(3), "ubuntu:latest", "docker");
        assert_eq!(
            job.id().as_str(),
            "building-container-image.h1.attempt-3.ubuntu:latest"
        );
        assert_eq!(job.attempt(), 3);
        assert_eq!(job.dependency(), &fleetd_core::job::Dependency::Always);
    }

    #[tokio::test]
    async fn test_successful_build_adds_image_and_increments() {
        let f = fixture([parent(0)]);
        let mut job = f.job("ubuntu:latest").await;

        job.run(&JobContext::default()).await;

        assert!(job.is_complete());
        assert!(job.error().is_ok());
        assert_eq!(job.outcome(), Some(BuildOutcome::Built));
        let host = f.host().await;
        assert!(host.has_container_image("ubuntu:latest"));
        assert_eq!(host.container_build_attempt, 1);
        assert_eq!(host.status, HostStatus::Provisioning);
        assert_eq!(f.mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_at_attempt_four() {
        let f = fixture([parent(4)]);
        f.mock.set_fail_builds(true);
        let mut job = f.job("ubuntu:latest").await;

        job.run(&JobContext::default()).await;

        assert!(job.is_complete());
        assert_eq!(job.status().errors.len(), 1);
        assert!(matches!(
            job.status().errors.errors()[0].root_cause(),
            Error::Provider(_)
        ));
        let host = f.host().await;
        assert_eq!(host.container_build_attempt, 5);
        assert!(!host.has_container_image("ubuntu:latest"));
        assert_eq!(host.status, HostStatus::Provisioning);

        // The next dispatch spends no provider call and terminates the parent.
        let mut next = f.job("ubuntu:latest").await;
        assert_eq!(next.attempt(), 5);
        next.run(&JobContext::default()).await;

        assert!(next.is_complete());
        assert_eq!(next.outcome(), Some(BuildOutcome::RetriesExhausted));
        assert!(matches!(
            next.status().errors.errors()[0],
            Error::RetriesExhausted(_)
        ));
        assert_eq!(f.mock.calls(), 1);
        let host = f.host().await;
        assert_eq!(host.status, HostStatus::Terminated);
        assert_eq!(host.terminated_by.as_deref(), Some(SYSTEM_USER));
        assert_eq!(host.container_build_attempt, 5);
    }

    #[tokio::test]
    async fn test_budget_spent_after_five_failures() {
        let f = fixture([parent(0)]);
        f.mock.set_fail_builds(true);

        for attempt in 0..CONTAINER_BUILD_RETRIES {
            let mut job = f.job("ubuntu:latest").await;
            job.run(&JobContext::default()).await;
            assert_eq!(job.outcome(), Some(BuildOutcome::Failed));
            assert_eq!(f.host().await.container_build_attempt, attempt + 1);
        }
        assert_eq!(f.mock.calls(), 5);

        let mut job = f.job("ubuntu:latest").await;
        job.run(&JobContext::default()).await;
        assert_eq!(f.mock.calls(), 5);
        assert_eq!(f.host().await.status, HostStatus::Terminated);
    }

    #[tokio::test]
    async fn test_redelivery_replays_without_double_count() {
        let f = fixture([parent(2)]);
        f.mock.set_fail_builds(true);

        let mut registry = JobRegistry::new();
        crate::register_all(&mut registry).unwrap();
        let record = f.job("ubuntu:latest").await.to_record().unwrap();

        let ctx = JobContext::default().with_environment(f.env.clone());
        let mut first = registry.rebuild(&record).unwrap();
        first.run(&ctx).await;
        assert_eq!(f.host().await.container_build_attempt, 3);

        let mut second = registry.rebuild(&record).unwrap();
        second.run(&ctx).await;

        assert!(second.is_complete());
        assert!(matches!(
            second.status().errors.errors()[0].root_cause(),
            Error::Provider(_)
        ));
        assert_eq!(f.host().await.container_build_attempt, 3);
        assert_eq!(f.mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_redelivery_after_success_is_a_no_op() {
        let f = fixture([parent(0)]);
        let mut registry = JobRegistry::new();
        crate::register_all(&mut registry).unwrap();
        let record = f.job("ubuntu:latest").await.to_record().unwrap();
        let ctx = JobContext::default().with_environment(f.env.clone());

        registry.rebuild(&record).unwrap().run(&ctx).await;
        let mut again = registry.rebuild(&record).unwrap();
        again.run(&ctx).await;

        assert!(again.error().is_ok());
        assert_eq!(f.mock.calls(), 1);
        assert_eq!(f.host().await.container_build_attempt, 1);
    }

    #[tokio::test]
    async fn test_images_queued_at_same_counter_are_all_built() {
        let f = fixture([parent(0)]);
        let mut ubuntu = f.job("ubuntu:latest").await;
        let mut alpine = f.job("alpine:3").await;
        assert_eq!(ubuntu.attempt(), alpine.attempt());
        ubuntu.parent = None;
        alpine.parent = None;

        ubuntu.run(&JobContext::default()).await;
        alpine.run(&JobContext::default()).await;

        assert_eq!(ubuntu.outcome(), Some(BuildOutcome::Built));
        assert_eq!(alpine.outcome(), Some(BuildOutcome::Built));
        assert!(alpine.error().is_ok());
        assert_eq!(f.mock.calls(), 2);
        let host = f.host().await;
        assert!(host.has_container_image("ubuntu:latest"));
        assert!(host.has_container_image("alpine:3"));
        assert_eq!(host.container_build_attempt, 1);
    }

    #[tokio::test]
    async fn test_replay_after_crash_before_increment() {
        let f = fixture([parent(1)]);
        let mut job = f.job("ubuntu:latest").await;

        // The image was recorded but the worker died before counting the attempt.
        let mut host = f.host().await;
        host.add_container_image("ubuntu:latest");
        f.store.upsert(&host).await.unwrap();

        job.parent = None;
        job.run(&JobContext::default()).await;

        assert_eq!(job.outcome(), Some(BuildOutcome::AlreadyBuilt));
        assert_eq!(f.mock.calls(), 0);
        assert_eq!(f.host().await.container_build_attempt, 2);
    }

    #[tokio::test]
    async fn test_missing_parent_exits_without_increment() {
        let f = fixture([]);
        let mut job = BuildingContainerImageJob::new(f.env.clone(), parent(0), "ubuntu:latest", "docker");
        job.parent = None;

        job.run(&JobContext::default()).await;

        assert!(job.is_complete());
        assert_eq!(job.outcome(), Some(BuildOutcome::Unresolved));
        assert!(job.status().errors.errors()[0].is_not_found());
        assert_eq!(f.mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_environment_is_recorded() {
        let f = fixture([parent(0)]);
        let record = f.job("ubuntu:latest").await.to_record().unwrap();

        let mut registry = JobRegistry::new();
        crate::register_all(&mut registry).unwrap();
        let mut job = registry.rebuild(&record).unwrap();
        job.run(&JobContext::default()).await;

        assert!(job.is_complete());
        assert!(matches!(
            job.status().errors.errors()[0],
            Error::Configuration(_)
        ));
        assert_eq!(f.host().await.container_build_attempt, 0);
    }

    #[tokio::test]
    async fn test_unsupported_provider_still_consumes_attempt() {
        let f = fixture([parent(0)]);
        let host = f.host().await;
        let mut job = BuildingContainerImageJob::new(f.env.clone(), host, "ubuntu:latest", "static");

        job.run(&JobContext::default()).await;

        assert_eq!(job.outcome(), Some(BuildOutcome::Failed));
        assert!(matches!(
            job.status().errors.errors()[0].root_cause(),
            Error::Unsupported(_)
        ));
        assert_eq!(f.host().await.container_build_attempt, 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_configuration_error() {
        let f = fixture([parent(0)]);
        let host = f.host().await;
        let mut job = BuildingContainerImageJob::new(f.env.clone(), host, "ubuntu:latest", "gce");

        job.run(&JobContext::default()).await;

        assert!(matches!(
            job.status().errors.errors()[0].root_cause(),
            Error::Configuration(_)
        ));
        assert_eq!(f.host().await.container_build_attempt, 1);
    }

    #[tokio::test]
    async fn test_cancellation_still_counts_attempt() {
        let store = Arc::new(MemoryHostStore::with_hosts([parent(0)]));
        let mock = Arc::new(MockManager::new("docker").with_delay(Duration::from_secs(3600)));
        let env = Arc::new(Environment::new(
            Arc::new(Settings::default()),
            store.clone(),
            Arc::new(CloudManagers::new().with_manager("docker", mock.clone())),
        ));
        let host = store.find_by_id(&HostId::new("h1")).await.unwrap();
        let mut job = BuildingContainerImageJob::new(env, host, "ubuntu:latest", "docker");

        let ctx = JobContext::default();
        let child = ctx.child();
        let handle = tokio::spawn(async move {
            job.run(&child).await;
            job
        });
        while mock.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ctx.cancel();
        let job = handle.await.unwrap();

        assert!(job.is_complete());
        assert!(matches!(
            job.status().errors.errors()[0].root_cause(),
            Error::Cancelled
        ));
        let host = store.find_by_id(&HostId::new("h1")).await.unwrap();
        assert_eq!(host.container_build_attempt, 1);
        assert!(!host.has_container_image("ubuntu:latest"));
    }

    struct Exploding;

    impl CloudManager for Exploding {
        fn provider(&self) -> &str {
            "exploding"
        }

        fn container_manager(&self) -> Option<&dyn ContainerManager> {
            Some(self)
        }
    }

    #[async_trait]
    impl ContainerManager for Exploding {
        async fn build_container_image(
            &self,
            _ctx: &JobContext,
            _parent: &Host,
            _image_url: &str,
        ) -> Result<()> {
            panic!("driver bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_driver_still_counts_attempt() {
        let store = Arc::new(MemoryHostStore::with_hosts([parent(0)]));
        let env = Arc::new(Environment::new(
            Arc::new(Settings::default()),
            store.clone(),
            Arc::new(CloudManagers::new().with_manager("exploding", Arc::new(Exploding))),
        ));
        let host = store.find_by_id(&HostId::new("h1")).await.unwrap();
        let mut job = BuildingContainerImageJob::new(env, host, "ubuntu:latest", "exploding");

        job.run(&JobContext::default()).await;

        assert!(job.is_complete());
        let err = job.error().unwrap_err();
        assert!(err.to_string().contains("driver bug"));
        assert_eq!(
            store.find_by_id(&HostId::new("h1")).await.unwrap().container_build_attempt,
            1
        );
    }

    #[tokio::test]
    async fn test_counter_never_decreases() {
        let f = fixture([parent(0)]);
        let mut last = 0;
        for fail in [true, false, true, true, false, true, false] {
            f.mock.set_fail_builds(fail);
            let mut job = f.job("ubuntu:latest").await;
            job.run(&JobContext::default()).await;
            let current = f.host().await.container_build_attempt;
            assert!(current >= last);
            last = current;
        }
    }

    #[test]
    fn test_body_round_trip_through_registry() {
        let f = fixture([]);
        let job = BuildingContainerImageJob::new(f.env.clone(), parent(2), "alpine:3", "docker");
        let record = job.to_record().unwrap();

        let mut registry = JobRegistry::new();
        crate::register_all(&mut registry).unwrap();
        let rebuilt = registry.rebuild(&record).unwrap();

        assert_eq!(rebuilt.id(), job.id());
        assert_eq!(rebuilt.to_record().unwrap().body, record.body);
    }
}
