//! Service lifecycle.
//!
//! Long-running parts of the scheduler process are services built from a
//! compile-time registry of constructor functions. The configured services
//! start in order; shutdown destroys them in reverse order. If a service
//! fails to start, the ones already started are destroyed before the error
//! is returned.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::error::{SchedError, SchedResult};
use crate::housekeeping::{builtin_tasks, HousekeepingPool};
use crate::recovery::RecoveryCoordinator;
use crate::scheduler::ReplicationScheduler;

/// A started service.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Stop the service and release what it holds.
    async fn destroy(&self) -> SchedResult<()>;
}

/// What services are built from.
#[derive(Clone)]
pub struct ServiceDeps {
    pub scheduler: ReplicationScheduler,
    pub config: SchedulerConfig,
}

/// Constructor of a service.
pub type ServiceConstructor =
    for<'a> fn(&'a ServiceDeps) -> BoxFuture<'a, SchedResult<Box<dyn Service>>>;

/// Mapping from service identifier to constructor.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    constructors: Vec<(&'static str, ServiceConstructor)>,
}

impl ServiceRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the `housekeeping`, `recovery` and `triggers` services.
    pub fn builtin() -> Self {
        Self::empty()
            .register(HousekeepingService::NAME, HousekeepingService::start)
            .register(RecoveryService::NAME, RecoveryService::start)
            .register(TriggerService::NAME, TriggerService::start)
    }

    /// Add or replace a constructor.
    pub fn register(mut self, name: &'static str, constructor: ServiceConstructor) -> Self {
        self.constructors.retain(|(n, _)| *n != name);
        self.constructors.push((name, constructor));
        self
    }

    pub fn get(&self, name: &str) -> Option<ServiceConstructor> {
        self.constructors
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.iter().map(|(n, _)| *n).collect()
    }
}

/// Builds the configured services.
pub struct ServiceManager;

impl ServiceManager {
    /// Start the services named in `names`, in order.
    ///
    /// Every name is resolved before anything starts.
    pub async fn start(
        registry: &ServiceRegistry,
        names: &[String],
        deps: &ServiceDeps,
    ) -> SchedResult<ServiceContext> {
        let constructors = names
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .map(|c| (name.as_str(), c))
                    .ok_or_else(|| SchedError::UnknownService(name.clone()))
            })
            .collect::<SchedResult<Vec<_>>>()?;

        let mut context = ServiceContext {
            services: Vec::with_capacity(constructors.len()),
        };
        for (name, constructor) in constructors {
            match constructor(deps).await {
                Ok(service) => {
                    info!(service = name, "Service started");
                    context.services.push(service);
                }
                Err(e) => {
                    error!(service = name, "Service failed to start: {}", e);
                    if let Err(unwind) = context.shutdown().await {
                        error!("Failed to stop services after start failure: {}", unwind);
                    }
                    return Err(e);
                }
            }
        }
        Ok(context)
    }
}

/// The running services of a process.
pub struct ServiceContext {
    services: Vec<Box<dyn Service>>,
}

impl ServiceContext {
    /// Names of the running services in start order.
    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Destroy all services in reverse start order.
    ///
    /// Every service is destroyed even if an earlier one fails; the first
    /// failure is returned.
    pub async fn shutdown(&mut self) -> SchedResult<()> {
        let mut first_error = None;
        while let Some(service) = self.services.pop() {
            match service.destroy().await {
                Ok(()) => info!(service = service.name(), "Service stopped"),
                Err(e) => {
                    error!(service = service.name(), "Service failed to stop: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Runs the built-in housekeeping tasks on a fixed-size pool.
struct HousekeepingService {
    pool: HousekeepingPool,
}

impl HousekeepingService {
    const NAME: &'static str = "housekeeping";

    fn start(deps: &ServiceDeps) -> BoxFuture<'_, SchedResult<Box<dyn Service>>> {
        async move {
            let settings = &deps.config.housekeeping;
            let env = deps.scheduler.environment();
            let pool = HousekeepingPool::new(env.store.clone(), env.clock, settings.threads);
            for task in builtin_tasks(settings) {
                pool.schedule_with_fixed_delay(task, Duration::ZERO, settings.interval());
            }
            Ok(Box::new(HousekeepingService { pool }) as Box<dyn Service>)
        }
        .boxed()
    }
}

#[async_trait]
impl Service for HousekeepingService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn destroy(&self) -> SchedResult<()> {
        self.pool.shutdown().await;
        Ok(())
    }
}

/// Resumes instances left `RUNNING` by a previous process.
struct RecoveryService;

impl RecoveryService {
    const NAME: &'static str = "recovery";

    fn start(deps: &ServiceDeps) -> BoxFuture<'_, SchedResult<Box<dyn Service>>> {
        async move {
            let resumed = RecoveryCoordinator::new(deps.scheduler.clone())
                .recover_all()
                .await?;
            if !resumed.is_empty() {
                info!(count = resumed.len(), "Interrupted instances resumed");
            }
            Ok(Box::new(RecoveryService) as Box<dyn Service>)
        }
        .boxed()
    }
}

#[async_trait]
impl Service for RecoveryService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn destroy(&self) -> SchedResult<()> {
        Ok(())
    }
}

/// Timer triggers for every stored policy.
struct TriggerService {
    scheduler: ReplicationScheduler,
    policies: Vec<String>,
}

impl TriggerService {
    const NAME: &'static str = "triggers";

    fn start(deps: &ServiceDeps) -> BoxFuture<'_, SchedResult<Box<dyn Service>>> {
        async move {
            let mut policies = Vec::new();
            for policy in deps.scheduler.store().list_policies().await? {
                deps.scheduler.schedule_policy(&policy.name).await?;
                policies.push(policy.name);
            }
            Ok(Box::new(TriggerService {
                scheduler: deps.scheduler.clone(),
                policies,
            }) as Box<dyn Service>)
        }
        .boxed()
    }
}

#[async_trait]
impl Service for TriggerService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn destroy(&self) -> SchedResult<()> {
        for policy in &self.policies {
            self.scheduler.unschedule_policy(policy).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use ferry_engine::sim::SimulatedEngine;
    use ferry_engine::FsRegistry;

    use crate::execution::JobEnvironment;
    use crate::persistence::SqliteStore;

    static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn event(e: String) {
        EVENTS.lock().unwrap().push(e);
    }

    struct Recording(&'static str);

    #[async_trait]
    impl Service for Recording {
        fn name(&self) -> &str {
            self.0
        }

        async fn destroy(&self) -> SchedResult<()> {
            event(format!("destroy {}", self.0));
            Ok(())
        }
    }

    fn first(_: &ServiceDeps) -> BoxFuture<'_, SchedResult<Box<dyn Service>>> {
        async {
            event("start first".into());
            Ok(Box::new(Recording("first")) as Box<dyn Service>)
        }
        .boxed()
    }

    fn second(_: &ServiceDeps) -> BoxFuture<'_, SchedResult<Box<dyn Service>>> {
        async {
            event("start second".into());
            Ok(Box::new(Recording("second")) as Box<dyn Service>)
        }
        .boxed()
    }

    fn broken(_: &ServiceDeps) -> BoxFuture<'_, SchedResult<Box<dyn Service>>> {
        async { Err(SchedError::ConfigError("broken service".into())) }.boxed()
    }

    fn deps() -> ServiceDeps {
        let env = JobEnvironment::new(
            Arc::new(SimulatedEngine::new()),
            Arc::new(FsRegistry::new()),
            Arc::new(SqliteStore::in_memory().unwrap()),
        );
        ServiceDeps {
            scheduler: ReplicationScheduler::new(env),
            config: SchedulerConfig::default(),
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_builtin_registry() {
        let registry = ServiceRegistry::builtin();
        assert_eq!(registry.names(), vec!["housekeeping", "recovery", "triggers"]);
        assert!(registry.get("metrics").is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_order_and_unwind() {
        let registry = ServiceRegistry::empty()
            .register("first", first)
            .register("second", second)
            .register("broken", broken);
        let deps = deps();

        let mut context = ServiceManager::start(&registry, &names(&["first", "second"]), &deps)
            .await
            .unwrap();
        assert_eq!(context.names(), vec!["first", "second"]);
        context.shutdown().await.unwrap();
        assert!(context.names().is_empty());

        let err = ServiceManager::start(&registry, &names(&["first", "broken", "second"]), &deps)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedError::ConfigError(_)));

        let err = ServiceManager::start(&registry, &names(&["first", "nope"]), &deps)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedError::UnknownService(n) if n == "nope"));

        assert_eq!(
            *EVENTS.lock().unwrap(),
            vec![
                "start first",
                "start second",
                "destroy second",
                "destroy first",
                "start first",
                "destroy first",
            ]
        );
    }

    #[tokio::test]
    async fn test_builtin_services_start_and_stop() {
        let deps = deps();
        let mut context =
            ServiceManager::start(&ServiceRegistry::builtin(), &deps.config.services, &deps)
                .await
                .unwrap();
        assert_eq!(context.names(), vec!["housekeeping", "recovery", "triggers"]);
        context.shutdown().await.unwrap();
    }
}
