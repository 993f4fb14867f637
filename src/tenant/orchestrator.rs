use std::sync::Arc;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::db::pool::DbPool;
use crate::error::ProvisionError;
use crate::runtime::{ContainerRuntime, ContainerSpec, Fault};

use super::installer::PayloadInstaller;
use super::plan::{self, Plan};
use super::readiness;
use super::record::{ContainerBinding, ContainerStatus, Tenant, TenantState};
use super::{allocator, store};

/// Result of a successful provision, reported in the completion event.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub container_name: Option<String>,
    pub container_port: Option<u16>,
    pub access_url: String,
}

/// Drives tenant lifecycle transitions against the container runtime and the
/// tenant store. All methods are synchronous and run on blocking job threads;
/// each one reads the record fresh, acts, and persists the outcome.
pub struct Orchestrator {
    cfg: PlatformConfig,
    rt: Arc<dyn ContainerRuntime>,
    db: Arc<DbPool>,
}

impl Orchestrator {
    pub fn new(cfg: PlatformConfig, rt: Arc<dyn ContainerRuntime>, db: Arc<DbPool>) -> Self {
        Self { cfg, rt, db }
    }

    fn load_tenant(&self, tenant_id: &str) -> Result<Tenant, ProvisionError> {
        self.db
            .read(|conn| store::get(conn, tenant_id))
            .map_err(ProvisionError::Internal)?
            .ok_or_else(|| ProvisionError::NotFound(format!("tenant {}", tenant_id)))
    }

    fn load_plan(&self, name: &str) -> Result<Plan, ProvisionError> {
        self.db
            .read(|conn| plan::get(conn, name))
            .map_err(ProvisionError::Internal)?
            .ok_or_else(|| ProvisionError::Validation(format!("unknown plan '{}'", name)))
    }

    /// Provision a tenant end to end. On failure the container side effects
    /// are rolled back and the record carries the error.
    pub fn provision(&self, tenant_id: &str) -> Result<ProvisionOutcome, ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        let plan = self.load_plan(&tenant.plan)?;

        self.db
            .write(|conn| {
                store::set_lifecycle(
                    conn,
                    tenant_id,
                    TenantState::Provisioning,
                    ContainerStatus::Provisioning,
                    None,
                )
            })
            .map_err(ProvisionError::Internal)?;

        let result = if plan.dedicated_container {
            self.provision_dedicated(&tenant, &plan)
        } else {
            self.provision_shared(&tenant, &plan)
        };

        if let Err(err) = &result {
            let message = crate::error::truncate_message(&err.to_string());
            tracing::error!("provisioning of {} failed: {}", tenant.subdomain, message);
            self.rollback_container(&tenant.subdomain);
            self.db
                .write(|conn| store::clear_binding(conn, tenant_id, Some(&message)))
                .map_err(ProvisionError::Internal)?;
        }
        result
    }

    /// Shared-backend placement: same lifecycle, no container stages. The
    /// site lands on the platform backend and container_status stays
    /// not_created.
    fn provision_shared(
        &self,
        tenant: &Tenant,
        plan: &Plan,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let backend = self.cfg.backend_container.clone();
        let site = self.cfg.site_fqdn(&tenant.subdomain);
        let access_url = format!("http://{}", site);

        self.install_site(&backend, tenant, plan, &site)?;

        self.db
            .write(|conn| store::activate_shared(conn, &tenant.id, &access_url))
            .map_err(ProvisionError::Internal)?;

        Ok(ProvisionOutcome {
            container_name: None,
            container_port: None,
            access_url,
        })
    }

    fn provision_dedicated(
        &self,
        tenant: &Tenant,
        plan: &Plan,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let subdomain = &tenant.subdomain;
        let site = self.cfg.site_fqdn(subdomain);

        // Engine port view is best-effort; the create-time conflict retry
        // covers a stale or missing snapshot.
        let runtime_ports = match self.rt.host_ports() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("could not list engine ports, relying on records: {}", e);
                Vec::new()
            }
        };
        let port = self.db.write(|conn| {
            Ok(allocator::allocate_port(
                conn,
                &runtime_ports,
                self.cfg.port_range,
                &self.cfg.reserved_ports,
                Some(&tenant.id),
            ))
        });
        let mut port = port.map_err(ProvisionError::Internal)??;

        // A container with this tenant's name left over from an earlier
        // attempt is stale state, not a conflict with another tenant.
        if self.rt.inspect(subdomain)?.is_some() {
            tracing::info!("removing stale container {}", subdomain);
            let _ = self.rt.stop_container(subdomain);
            self.rt.remove_container(subdomain)?;
        }

        if !self.rt.image_exists(&self.cfg.tenant_image)? {
            return Err(ProvisionError::ImageMissing(self.cfg.tenant_image.clone()));
        }

        let admin_password = tenant
            .admin_password
            .clone()
            .unwrap_or_else(|| self.cfg.default_admin_password.clone());
        let mut spec = self.container_spec(subdomain, &site, port, &admin_password);

        let container_id = self.create_with_retry(&mut spec, &tenant.id)?;
        port = spec.host_port;

        if let Err(fault) = self.rt.start_container(subdomain) {
            // A dropped connection can leave the container started anyway.
            if !(fault.is_communication() && self.container_running(subdomain)) {
                return Err(fault.into());
            }
            tracing::warn!(
                "start of {} reported {}, but container is running; continuing",
                subdomain,
                fault
            );
        }

        let ready = readiness::await_ready(
            self.rt.as_ref(),
            subdomain,
            &self.cfg.exec_user,
            Duration::from_secs(self.cfg.readiness_timeout_secs),
            Duration::from_secs(self.cfg.readiness_poll_secs),
        );
        if !ready {
            tracing::warn!(
                "container {} not ready after {}s, proceeding anyway",
                subdomain,
                self.cfg.readiness_timeout_secs
            );
        }

        self.install_site(subdomain, tenant, plan, &site)?;

        let binding = ContainerBinding::new(subdomain, container_id, port);
        let access_url = format!("http://{}:{}", site, port);
        self.db
            .write(|conn| store::bind_active(conn, &tenant.id, &binding, &access_url))
            .map_err(ProvisionError::Internal)?;

        tracing::info!("tenant {} active at {}", subdomain, access_url);
        Ok(ProvisionOutcome {
            container_name: Some(binding.container_name),
            container_port: Some(port),
            access_url,
        })
    }

    /// Site-level work shared by both placements: payload app, site creation,
    /// app registration, plan perks.
    fn install_site(
        &self,
        container: &str,
        tenant: &Tenant,
        plan: &Plan,
        site: &str,
    ) -> Result<(), ProvisionError> {
        let installer = PayloadInstaller::new(self.rt.as_ref(), &self.cfg);
        let admin_password = tenant
            .admin_password
            .clone()
            .unwrap_or_else(|| self.cfg.default_admin_password.clone());
        let db_name = self.cfg.site_db_name(&tenant.subdomain);

        installer.ensure_payload(container)?;
        installer.create_site(container, site, &db_name, &admin_password)?;

        // The site exists at this point; a failed app install leaves a
        // usable-but-bare site, which is a warning, not a lost tenant.
        if let Err(e) = installer.register_site(container, site) {
            tracing::warn!("payload app not installed on {}: {}", site, e);
        }
        installer.configure_modules(container, site, &plan.modules_to_install());
        for app in plan.optional_apps() {
            installer.install_optional_app(container, site, app);
        }
        Ok(())
    }

    /// Create the container, absorbing one recoverable fault: a port bind
    /// conflict re-allocates and retries, a name conflict clears the name and
    /// retries, a communication fault is reconciled against the engine's
    /// actual state.
    fn create_with_retry(
        &self,
        spec: &mut ContainerSpec,
        tenant_id: &str,
    ) -> Result<String, ProvisionError> {
        let fault = match self.rt.create_container(spec) {
            Ok(id) => return Ok(id),
            Err(f) => f,
        };

        match fault {
            Fault::PortInUse(msg) => {
                tracing::warn!("port {} rejected by engine: {}", spec.host_port, msg);
                let taken = spec.host_port;
                let port = self.db.write(|conn| {
                    let mut runtime_ports = self.rt.host_ports().unwrap_or_default();
                    runtime_ports.push(taken);
                    Ok(allocator::allocate_port(
                        conn,
                        &runtime_ports,
                        self.cfg.port_range,
                        &self.cfg.reserved_ports,
                        Some(tenant_id),
                    ))
                });
                spec.host_port = port.map_err(ProvisionError::Internal)??;
                Ok(self.rt.create_container(spec)?)
            }
            Fault::Conflict(msg) => {
                tracing::warn!("name conflict for {}: {}", spec.name, msg);
                self.rt.remove_container(&spec.name)?;
                Ok(self.rt.create_container(spec)?)
            }
            Fault::Communication(msg) => {
                // The engine may have completed the create before the
                // transport dropped. Trust its actual state over the error.
                match self.rt.inspect(&spec.name)? {
                    Some(state) => {
                        tracing::warn!(
                            "create of {} reported '{}' but container exists; reconciled",
                            spec.name,
                            msg
                        );
                        Ok(state.id)
                    }
                    None => Err(ProvisionError::Communication(msg)),
                }
            }
            other => Err(other.into()),
        }
    }

    fn container_spec(
        &self,
        name: &str,
        site: &str,
        port: u16,
        admin_password: &str,
    ) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: self.cfg.tenant_image.clone(),
            network: self.cfg.docker_network.clone(),
            host_port: port,
            container_port: 8000,
            env: vec![
                ("SITE_NAME".into(), site.to_string()),
                ("ADMIN_PASSWORD".into(), admin_password.to_string()),
                ("DB_HOST".into(), self.cfg.db_host.clone()),
                ("DB_PORT".into(), self.cfg.db_port.to_string()),
                ("DB_NAME".into(), self.cfg.site_db_name(name)),
                (
                    "MYSQL_ROOT_PASSWORD".into(),
                    self.cfg.db_root_password.clone(),
                ),
                ("REDIS_CACHE".into(), self.cfg.redis_cache.clone()),
                ("REDIS_QUEUE".into(), self.cfg.redis_queue.clone()),
            ],
        }
    }

    fn container_running(&self, name: &str) -> bool {
        matches!(self.rt.inspect(name), Ok(Some(state)) if state.running)
    }

    /// Best-effort removal of a tenant's container and volumes. Used on
    /// rollback and teardown; absence of any piece is fine.
    fn rollback_container(&self, subdomain: &str) {
        if let Ok(Some(_)) = self.rt.inspect(subdomain) {
            let _ = self.rt.stop_container(subdomain);
            if let Err(e) = self.rt.remove_container(subdomain) {
                tracing::warn!("rollback: failed to remove container {}: {}", subdomain, e);
            }
        }
        if let Err(e) = self.rt.remove_volumes(subdomain) {
            tracing::warn!("rollback: failed to remove volumes for {}: {}", subdomain, e);
        }
    }

    /// Tear down a tenant's container side and delete the record. Cleanup is
    /// best-effort and never blocks deletion: a container the engine refuses
    /// to remove is logged and left behind rather than pinning the record.
    pub fn deprovision(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        self.teardown(&tenant);
        self.db
            .write(|conn| store::delete(conn, tenant_id))
            .map_err(ProvisionError::Internal)?;
        tracing::info!("tenant {} deleted", tenant.subdomain);
        Ok(())
    }

    /// Recreate = teardown + fresh provision under one job.
    pub fn recreate(&self, tenant_id: &str) -> Result<ProvisionOutcome, ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        self.teardown(&tenant);
        self.db
            .write(|conn| store::clear_binding(conn, tenant_id, None))
            .map_err(ProvisionError::Internal)?;
        self.provision(tenant_id)
    }

    /// Best-effort removal of everything the tenant holds on the engine.
    ///
    /// The container is looked up by name (always the subdomain) with the
    /// stored id as fallback, not by the record's container fields alone: a
    /// previous failed cleanup may have cleared those while the container
    /// survived on the engine.
    fn teardown(&self, tenant: &Tenant) {
        let dedicated = self
            .db
            .read(|conn| plan::get(conn, &tenant.plan))
            .ok()
            .flatten()
            .map(|p| p.dedicated_container)
            // Unknown plan: assume dedicated, the cleanup is harmless when
            // no container exists.
            .unwrap_or(true);

        if dedicated {
            let name = &tenant.subdomain;
            let found = match self.rt.inspect(name) {
                Ok(found) => found.is_some(),
                Err(e) => {
                    tracing::warn!("teardown: inspect of {} failed: {}", name, e);
                    false
                }
            };
            // By-name miss with a stored id: the engine may still know the
            // container under its id (e.g. renamed out of band).
            let target = if found {
                Some(name.clone())
            } else {
                tenant.container_id.clone().filter(|id| {
                    matches!(self.rt.inspect(id), Ok(Some(_)))
                })
            };

            if let Some(target) = target {
                let _ = self.rt.stop_container(&target);
                if let Err(e) = self.rt.remove_container(&target) {
                    tracing::warn!(
                        "teardown: failed to remove container {}, leaving it behind: {}",
                        target,
                        e
                    );
                }
            }
            if let Err(e) = self.rt.remove_volumes(name) {
                tracing::warn!("teardown: failed to remove volumes for {}: {}", name, e);
            }
        } else {
            // Shared placement: drop the site from the backend, best-effort.
            let site = self.cfg.site_fqdn(&tenant.subdomain);
            let installer_cmd = format!(
                "cd {} && . env/bin/activate && bench drop-site {} \
                 --mariadb-root-password '{}' --force",
                self.cfg.bench_dir, site, self.cfg.db_root_password
            );
            match self.rt.exec(
                &self.cfg.backend_container,
                &self.cfg.exec_user,
                300,
                &installer_cmd,
            ) {
                Ok(out) if !out.ok() => {
                    tracing::warn!("drop-site {} failed: {}", site, out.output)
                }
                Err(e) => tracing::warn!("drop-site {} failed: {}", site, e),
                _ => {}
            }
        }
    }

    pub fn start(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        let name = tenant
            .container_name
            .as_deref()
            .ok_or_else(|| ProvisionError::Validation("tenant has no container".into()))?;
        self.rt.start_container(name)?;
        self.db
            .write(|conn| {
                store::set_lifecycle(
                    conn,
                    tenant_id,
                    TenantState::Active,
                    ContainerStatus::Running,
                    None,
                )
            })
            .map_err(ProvisionError::Internal)?;
        Ok(())
    }

    pub fn stop(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        let name = tenant
            .container_name
            .as_deref()
            .ok_or_else(|| ProvisionError::Validation("tenant has no container".into()))?;
        self.rt.stop_container(name)?;
        self.db
            .write(|conn| {
                store::set_lifecycle(
                    conn,
                    tenant_id,
                    TenantState::Suspended,
                    ContainerStatus::Stopped,
                    None,
                )
            })
            .map_err(ProvisionError::Internal)?;
        Ok(())
    }

    pub fn restart(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        let name = tenant
            .container_name
            .as_deref()
            .ok_or_else(|| ProvisionError::Validation("tenant has no container".into()))?;
        self.rt.restart_container(name)?;
        self.db
            .write(|conn| {
                store::set_lifecycle(
                    conn,
                    tenant_id,
                    TenantState::Active,
                    ContainerStatus::Running,
                    None,
                )
            })
            .map_err(ProvisionError::Internal)?;
        Ok(())
    }

    /// Reconcile the stored container identity with the engine's view and
    /// return the refreshed record: id, published port and run status are all
    /// re-derived from a live inspect. A container that vanished out of band
    /// clears the binding back to draft.
    pub fn sync_status(&self, tenant_id: &str) -> Result<Tenant, ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        if let Some(name) = tenant.container_name.clone() {
            match self.rt.inspect(&name)? {
                Some(state) => {
                    let status = if state.running {
                        ContainerStatus::Running
                    } else {
                        ContainerStatus::Stopped
                    };
                    // Port lookup is best-effort; a stopped container reports
                    // no bindings, so keep the stored port then.
                    let port = match self.rt.published_port(&name) {
                        Ok(Some(p)) => Some(p),
                        Ok(None) => tenant.container_port,
                        Err(e) => {
                            tracing::warn!("port lookup for {} failed: {}", name, e);
                            tenant.container_port
                        }
                    };
                    self.db
                        .write(|conn| {
                            store::refresh_binding(conn, tenant_id, &state.id, port, status)
                        })
                        .map_err(ProvisionError::Internal)?;
                }
                None => {
                    tracing::warn!("container {} gone, clearing binding", name);
                    self.db
                        .write(|conn| store::clear_binding(conn, tenant_id, None))
                        .map_err(ProvisionError::Internal)?;
                }
            }
        }
        self.load_tenant(tenant_id)
    }

    /// Tail of the tenant container's logs.
    pub fn logs(&self, tenant_id: &str, tail: u32) -> Result<String, ProvisionError> {
        let tenant = self.load_tenant(tenant_id)?;
        let name = tenant
            .container_name
            .as_deref()
            .ok_or_else(|| ProvisionError::Validation("tenant has no container".into()))?;
        Ok(self.rt.logs(name, tail)?)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use crate::runtime::{ContainerState, ExecOutput};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        // name -> (id, running)
        containers: HashMap<String, (String, bool)>,
        create_faults: Vec<Fault>,
        created: u32,
    }

    /// Scripted engine: containers live in a map, create can be made to fail
    /// with a queued fault, exec always answers.
    struct FakeRuntime {
        state: Mutex<FakeState>,
        image_present: bool,
        // Communication faults still create the container (engine finished
        // the work, the response was lost).
        faults_apply_side_effect: bool,
        // Simulates an engine that refuses to remove containers.
        remove_fails: bool,
        engine_ports: Vec<u16>,
        published: Mutex<HashMap<String, u16>>,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                state: Mutex::new(FakeState::default()),
                image_present: true,
                faults_apply_side_effect: false,
                remove_fails: false,
                engine_ports: vec![],
                published: Mutex::new(HashMap::new()),
            }
        }

        fn with_create_faults(mut self, faults: Vec<Fault>) -> Self {
            self.state.get_mut().unwrap().create_faults = faults;
            self
        }

        fn insert_container(&self, name: &str, running: bool) {
            let mut s = self.state.lock().unwrap();
            let id = format!("id-{}", name);
            s.containers.insert(name.to_string(), (id, running));
        }

        fn set_published(&self, name: &str, port: u16) {
            self.published
                .lock()
                .unwrap()
                .insert(name.to_string(), port);
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn ping(&self) -> bool {
            true
        }
        fn image_exists(&self, _: &str) -> Result<bool, Fault> {
            Ok(self.image_present)
        }
        fn create_container(&self, spec: &ContainerSpec) -> Result<String, Fault> {
            let mut s = self.state.lock().unwrap();
            if !s.create_faults.is_empty() {
                let fault = s.create_faults.remove(0);
                if self.faults_apply_side_effect && fault.is_communication() {
                    let id = format!("id-{}", spec.name);
                    s.containers.insert(spec.name.clone(), (id, false));
                }
                return Err(fault);
            }
            s.created += 1;
            let id = format!("id-{}-{}", spec.name, s.created);
            s.containers.insert(spec.name.clone(), (id.clone(), false));
            Ok(id)
        }
        fn start_container(&self, name: &str) -> Result<(), Fault> {
            let mut s = self.state.lock().unwrap();
            match s.containers.get_mut(name) {
                Some(entry) => {
                    entry.1 = true;
                    Ok(())
                }
                None => Err(Fault::NotFound(format!("no such container: {}", name))),
            }
        }
        fn stop_container(&self, name: &str) -> Result<(), Fault> {
            let mut s = self.state.lock().unwrap();
            match s.containers.get_mut(name) {
                Some(entry) => {
                    entry.1 = false;
                    Ok(())
                }
                None => Err(Fault::NotFound(format!("no such container: {}", name))),
            }
        }
        fn restart_container(&self, name: &str) -> Result<(), Fault> {
            self.start_container(name)
        }
        fn remove_container(&self, name: &str) -> Result<(), Fault> {
            if self.remove_fails {
                return Err(Fault::Other("device or resource busy".into()));
            }
            self.state.lock().unwrap().containers.remove(name);
            Ok(())
        }
        fn inspect(&self, name: &str) -> Result<Option<ContainerState>, Fault> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .containers
                .get(name)
                .map(|(id, running)| ContainerState {
                    id: id.clone(),
                    running: *running,
                }))
        }
        fn published_port(&self, name: &str) -> Result<Option<u16>, Fault> {
            Ok(self.published.lock().unwrap().get(name).copied())
        }
        fn host_ports(&self) -> Result<Vec<u16>, Fault> {
            Ok(self.engine_ports.clone())
        }
        fn exec(&self, _: &str, _: &str, _: u64, script: &str) -> Result<ExecOutput, Fault> {
            // Existence checks fail so install paths run; everything else
            // succeeds.
            if script.starts_with("test -d") || script.contains("list-apps") {
                return Ok(ExecOutput {
                    code: 1,
                    output: String::new(),
                });
            }
            Ok(ExecOutput {
                code: 0,
                output: "ready".into(),
            })
        }
        fn copy(&self, _: &str, _: &str) -> Result<(), Fault> {
            Ok(())
        }
        fn remove_volumes(&self, _: &str) -> Result<(), Fault> {
            Ok(())
        }
        fn logs(&self, _: &str, _: u32) -> Result<String, Fault> {
            Ok(String::new())
        }
    }

    fn test_config() -> PlatformConfig {
        let mut cfg: PlatformConfig = toml::from_str("").unwrap();
        cfg.readiness_timeout_secs = 1;
        cfg.readiness_poll_secs = 1;
        cfg
    }

    fn setup(rt: FakeRuntime) -> (Orchestrator, Arc<DbPool>, std::path::PathBuf) {
        setup_with(Arc::new(rt))
    }

    fn setup_with(rt: Arc<FakeRuntime>) -> (Orchestrator, Arc<DbPool>, std::path::PathBuf) {
        let mut path = std::env::temp_dir();
        path.push(format!("tenantd-orch-test-{}.db", uuid::Uuid::new_v4()));
        let db = Arc::new(DbPool::open(path.to_str().unwrap(), 1).unwrap());
        run_migrations(&db).unwrap();
        db.write(|conn| plan::seed_defaults(conn)).unwrap();
        let orch = Orchestrator::new(test_config(), rt, db.clone());
        (orch, db, path)
    }

    fn insert_tenant(db: &DbPool, id: &str, subdomain: &str, plan_name: &str) {
        db.write(|conn| store::insert_draft(conn, id, subdomain, plan_name, "pw123"))
            .unwrap();
    }

    #[test]
    fn provision_happy_path_binds_container_identity() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");

        let outcome = orch.provision("t1").unwrap();
        assert_eq!(outcome.container_name.as_deref(), Some("acme"));
        assert_eq!(outcome.container_port, Some(8001));
        assert_eq!(outcome.access_url, "http://acme.saas.local:8001");

        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Active);
        assert_eq!(t.container_status, ContainerStatus::Running);
        assert_eq!(t.container_name.as_deref(), Some("acme"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_image_fails_fast_and_rolls_back() {
        let mut rt = FakeRuntime::new();
        rt.image_present = false;
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");

        let err = orch.provision("t1").unwrap_err();
        assert!(matches!(err, ProvisionError::ImageMissing(_)));

        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Error);
        assert_eq!(t.container_status, ContainerStatus::NotCreated);
        assert!(t.container_id.is_none());
        assert!(t.last_error.unwrap().contains("image"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn communication_fault_with_live_container_reconciles_to_active() {
        let mut rt = FakeRuntime::new()
            .with_create_faults(vec![Fault::Communication("unexpected EOF".into())]);
        rt.faults_apply_side_effect = true;
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");

        let outcome = orch.provision("t1").unwrap();
        assert_eq!(outcome.container_name.as_deref(), Some("acme"));

        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Active);
        assert_eq!(t.container_status, ContainerStatus::Running);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn communication_fault_with_no_container_fails() {
        let rt = FakeRuntime::new()
            .with_create_faults(vec![Fault::Communication("unexpected EOF".into())]);
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");

        let err = orch.provision("t1").unwrap_err();
        assert!(matches!(err, ProvisionError::Communication(_)));

        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Error);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn port_conflict_retries_with_next_port() {
        let rt = FakeRuntime::new()
            .with_create_faults(vec![Fault::PortInUse("8001 already allocated".into())]);
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");

        let outcome = orch.provision("t1").unwrap();
        assert_eq!(outcome.container_port, Some(8002));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn name_conflict_removes_and_retries() {
        let rt = FakeRuntime::new()
            .with_create_faults(vec![Fault::Conflict("name already in use".into())]);
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");

        let outcome = orch.provision("t1").unwrap();
        assert_eq!(outcome.container_name.as_deref(), Some("acme"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shared_plan_skips_container_stages() {
        let (orch, db, path) = setup(FakeRuntime::new());
        db.write(|conn| {
            let mut p = plan::get(conn, "starter")?.unwrap();
            p.dedicated_container = false;
            plan::upsert(conn, &p)
        })
        .unwrap();
        insert_tenant(&db, "t1", "acme", "starter");

        let outcome = orch.provision("t1").unwrap();
        assert!(outcome.container_name.is_none());
        assert!(outcome.container_port.is_none());
        assert_eq!(outcome.access_url, "http://acme.saas.local");

        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Active);
        assert_eq!(t.container_status, ContainerStatus::NotCreated);
        assert!(t.container_id.is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deprovision_succeeds_when_container_removed_out_of_band() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();

        // Simulate out-of-band removal.
        orch.rt.remove_container("acme").unwrap();

        orch.deprovision("t1").unwrap();
        assert!(db.read(|conn| store::get(conn, "t1")).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stale_container_is_replaced_on_provision() {
        let rt = FakeRuntime::new();
        rt.insert_container("acme", true);
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");

        let outcome = orch.provision("t1").unwrap();
        // A fresh container was created (id carries the create counter).
        assert_eq!(outcome.container_name.as_deref(), Some("acme"));
        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert!(t.container_id.unwrap().starts_with("id-acme-"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deprovision_deletes_record_even_when_engine_refuses_removal() {
        let mut rt = FakeRuntime::new();
        rt.remove_fails = true;
        rt.insert_container("acme", true);
        let (orch, db, path) = setup(rt);
        insert_tenant(&db, "t1", "acme", "starter");
        db.write(|conn| {
            store::bind_active(
                conn,
                "t1",
                &ContainerBinding::new("acme", "id-acme".into(), 8001),
                "http://acme.saas.local:8001",
            )
        })
        .unwrap();

        // Removal failure is logged, not propagated; the record goes away.
        orch.deprovision("t1").unwrap();
        assert!(db.read(|conn| store::get(conn, "t1")).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deprovision_finds_container_by_name_after_cleared_binding() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();

        // A failed earlier cleanup leaves the record without container
        // fields while the container survives on the engine.
        db.write(|conn| store::clear_binding(conn, "t1", Some("removal failed")))
            .unwrap();
        assert!(orch.rt.inspect("acme").unwrap().is_some());

        orch.deprovision("t1").unwrap();
        assert!(db.read(|conn| store::get(conn, "t1")).unwrap().is_none());
        // The container was located by its name and actually removed.
        assert!(orch.rt.inspect("acme").unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sync_refreshes_id_and_port_from_engine() {
        let rt = Arc::new(FakeRuntime::new());
        let (orch, db, path) = setup_with(rt.clone());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();

        // Engine-side recreate: new container id, new published port.
        rt.remove_container("acme").unwrap();
        rt.insert_container("acme", true);
        rt.set_published("acme", 8099);

        let t = orch.sync_status("t1").unwrap();
        assert_eq!(t.container_id.as_deref(), Some("id-acme"));
        assert_eq!(t.container_port, Some(8099));
        assert_eq!(t.container_status, ContainerStatus::Running);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sync_clears_binding_for_vanished_container() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();
        orch.rt.remove_container("acme").unwrap();

        let t = orch.sync_status("t1").unwrap();
        assert_eq!(t.state, TenantState::Draft);
        assert_eq!(t.container_status, ContainerStatus::NotCreated);
        assert!(t.container_name.is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sync_reports_stopped_container() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();
        orch.rt.stop_container("acme").unwrap();

        let t = orch.sync_status("t1").unwrap();
        assert_eq!(t.container_status, ContainerStatus::Stopped);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stop_and_start_flip_lifecycle() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();

        orch.stop("t1").unwrap();
        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Suspended);
        assert_eq!(t.container_status, ContainerStatus::Stopped);

        orch.start("t1").unwrap();
        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Active);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn start_without_container_is_a_hard_error() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        let err = orch.start("t1").unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recreate_reuses_subdomain_and_reaches_active() {
        let (orch, db, path) = setup(FakeRuntime::new());
        insert_tenant(&db, "t1", "acme", "starter");
        orch.provision("t1").unwrap();

        let outcome = orch.recreate("t1").unwrap();
        assert_eq!(outcome.container_name.as_deref(), Some("acme"));
        let t = db.read(|conn| store::get(conn, "t1")).unwrap().unwrap();
        assert_eq!(t.state, TenantState::Active);
        let _ = std::fs::remove_file(&path);
    }
}
