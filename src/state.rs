use std::sync::Arc;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::db::pool::DbPool;
use crate::jobs::{EventBus, JobRunner};
use crate::runtime::ContainerRuntime;
use crate::tenant::orchestrator::Orchestrator;

pub struct AppState {
    pub config: PlatformConfig,
    pub db: Arc<DbPool>,
    pub orchestrator: Arc<Orchestrator>,
    pub jobs: JobRunner,
}

pub type SharedState = Arc<AppState>;

pub fn build_state(
    config: PlatformConfig,
    db: Arc<DbPool>,
    runtime: Arc<dyn ContainerRuntime>,
) -> SharedState {
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), runtime, db.clone()));
    let events = Arc::new(EventBus::new(64));
    let jobs = JobRunner::new(
        Duration::from_secs(config.provision_timeout_secs),
        events,
    );
    Arc::new(AppState {
        config,
        db,
        orchestrator,
        jobs,
    })
}
