use crate::config::PlatformConfig;
use crate::error::ProvisionError;
use crate::runtime::ContainerRuntime;

/// Installs the payload application and creates tenant sites inside a
/// container, via in-container shell commands.
pub struct PayloadInstaller<'a> {
    rt: &'a dyn ContainerRuntime,
    cfg: &'a PlatformConfig,
}

const CHECK_TIMEOUT: u64 = 30;
const COPY_TIMEOUT: u64 = 120;
const SITE_TIMEOUT: u64 = 300;
const INSTALL_TIMEOUT: u64 = 300;
const RETRY_BACKOFF_SECS: u64 = 5;

impl<'a> PayloadInstaller<'a> {
    pub fn new(rt: &'a dyn ContainerRuntime, cfg: &'a PlatformConfig) -> Self {
        Self { rt, cfg }
    }

    fn bench(&self, script: &str) -> String {
        format!(
            "cd {} && . env/bin/activate && {}",
            self.cfg.bench_dir, script
        )
    }

    fn exec(&self, container: &str, timeout: u64, script: &str) -> Result<crate::runtime::ExecOutput, ProvisionError> {
        Ok(self.rt.exec(container, &self.cfg.exec_user, timeout, script)?)
    }

    /// Make the payload app present and registered in the container's bench.
    /// Idempotent: a container that already has the app is left alone.
    pub fn ensure_payload(&self, container: &str) -> Result<(), ProvisionError> {
        let app = &self.cfg.payload_app;
        let app_dir = format!("{}/apps/{}", self.cfg.bench_dir, app);

        let check = self.exec(container, CHECK_TIMEOUT, &format!("test -d {}", app_dir))?;
        if !check.ok() {
            self.copy_payload_into(container, &app_dir)?;
        }

        // Root owns files docker cp drops in; hand them to the bench user.
        let chown = format!("chown -R {0}:{0} {1}", self.cfg.exec_user, app_dir);
        let out = self.rt.exec(container, "root", COPY_TIMEOUT, &chown)?;
        if !out.ok() {
            tracing::warn!("chown of payload app failed: {}", out.output);
        }

        // apps.txt registration, append only if absent.
        let apps_txt = format!("{}/sites/apps.txt", self.cfg.bench_dir);
        let register = format!(
            "grep -qx '{app}' {apps_txt} || echo '{app}' >> {apps_txt}",
            app = app,
            apps_txt = apps_txt
        );
        let out = self.exec(container, CHECK_TIMEOUT, &register)?;
        if !out.ok() {
            return Err(ProvisionError::Install(format!(
                "failed to register {} in apps.txt: {}",
                app, out.output
            )));
        }

        // Python package install, skipped when pip already knows the app.
        let pip = self.bench(&format!(
            "pip show {app} > /dev/null 2>&1 || pip install -q -e apps/{app}",
            app = app
        ));
        let out = self.exec(container, INSTALL_TIMEOUT, &pip)?;
        if !out.ok() {
            return Err(ProvisionError::Install(format!(
                "pip install of {} failed: {}",
                app, out.output
            )));
        }
        Ok(())
    }

    /// Copy the payload app from the shared backend container, falling back to
    /// the host checkout when the backend copy fails.
    fn copy_payload_into(&self, container: &str, app_dir: &str) -> Result<(), ProvisionError> {
        let staging = format!("/tmp/tenantd-payload-{}", uuid::Uuid::new_v4());
        let backend_src = format!("{}:{}", self.cfg.backend_container, app_dir);

        let from_backend = self
            .rt
            .copy(&backend_src, &staging)
            .and_then(|_| self.rt.copy(&staging, &format!("{}:{}", container, app_dir)));

        let result = match from_backend {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    "payload copy from backend failed ({}), trying host fallback {}",
                    e,
                    self.cfg.payload_fallback_dir
                );
                self.rt
                    .copy(
                        &self.cfg.payload_fallback_dir,
                        &format!("{}:{}", container, app_dir),
                    )
                    .map_err(|e| {
                        ProvisionError::Install(format!("payload copy failed: {}", e))
                    })
            }
        };
        let _ = std::fs::remove_dir_all(&staging);
        result
    }

    /// Create the tenant's site if it doesn't exist yet.
    pub fn create_site(
        &self,
        container: &str,
        site: &str,
        db_name: &str,
        admin_password: &str,
    ) -> Result<(), ProvisionError> {
        let site_dir = format!("{}/sites/{}", self.cfg.bench_dir, site);
        let check = self.exec(container, CHECK_TIMEOUT, &format!("test -d {}", site_dir))?;
        if check.ok() {
            tracing::info!("site {} already exists, skipping create", site);
            return Ok(());
        }

        let cmd = self.bench(&format!(
            "bench new-site {site} --mariadb-root-password '{root_pw}' \
             --admin-password '{admin_pw}' --db-name {db} --no-mariadb-socket",
            site = site,
            root_pw = self.cfg.db_root_password,
            admin_pw = admin_password,
            db = db_name,
        ));
        let out = self.exec(container, SITE_TIMEOUT, &cmd)?;
        if !out.ok() {
            return Err(ProvisionError::Install(format!(
                "site creation for {} failed: {}",
                site, out.output
            )));
        }
        Ok(())
    }

    /// Install the payload app into a site, with one retry. Skips when the
    /// site already lists the app.
    pub fn register_site(&self, container: &str, site: &str) -> Result<(), ProvisionError> {
        self.install_app_with_retry(container, site, &self.cfg.payload_app)
    }

    /// Best-effort extra app install (plan perks). Failure is a warning.
    pub fn install_optional_app(&self, container: &str, site: &str, app: &str) {
        if let Err(e) = self.install_app_with_retry(container, site, app) {
            tracing::warn!("optional app {} not installed on {}: {}", app, site, e);
        }
    }

    /// Record the plan's module set in site config. Advisory data the payload
    /// app reads at login; failure does not fail the provision.
    pub fn configure_modules(&self, container: &str, site: &str, modules: &[String]) {
        let json = serde_json::to_string(modules).unwrap_or_else(|_| "[]".to_string());
        let cmd = self.bench(&format!(
            "bench --site {} set-config active_modules '{}'",
            site, json
        ));
        match self.exec(container, CHECK_TIMEOUT, &cmd) {
            Ok(out) if out.ok() => {}
            Ok(out) => tracing::warn!("module config for {} failed: {}", site, out.output),
            Err(e) => tracing::warn!("module config for {} failed: {}", site, e),
        }
    }

    fn install_app_with_retry(
        &self,
        container: &str,
        site: &str,
        app: &str,
    ) -> Result<(), ProvisionError> {
        let listed = self.bench(&format!(
            "bench --site {} list-apps | grep -qx '{}'",
            site, app
        ));
        if self.exec(container, CHECK_TIMEOUT, &listed)?.ok() {
            return Ok(());
        }

        let cmd = self.bench(&format!("bench --site {} install-app {}", site, app));
        let first = self.exec(container, INSTALL_TIMEOUT, &cmd)?;
        if first.ok() {
            return Ok(());
        }

        tracing::warn!(
            "install-app {} on {} failed, retrying: {}",
            app,
            site,
            first.output
        );
        std::thread::sleep(std::time::Duration::from_secs(RETRY_BACKOFF_SECS));

        let second = self.exec(container, INSTALL_TIMEOUT, &cmd)?;
        if second.ok() {
            return Ok(());
        }
        Err(ProvisionError::Install(format!(
            "install-app {} on {} failed twice: {}",
            app, site, second.output
        )))
    }
}
