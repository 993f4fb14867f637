use serde::Deserialize;
use std::path::PathBuf;

/// Platform configuration, loaded once at startup.
///
/// Everything the orchestrator needs is carried explicitly here — there is no
/// ambient/global configuration access anywhere else in the codebase.
#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,

    /// Domain suffix used to build tenant site FQDNs (`{subdomain}.{base_domain}`).
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// Name of the shared backend container (payload copy source, shared-plan host).
    #[serde(default = "default_backend_container")]
    pub backend_container: String,
    /// Image used for dedicated tenant containers. Must be present locally;
    /// provisioning fails fast if it is missing.
    #[serde(default = "default_tenant_image")]
    pub tenant_image: String,
    /// Preferred docker network name fragment for discovery, and the name used
    /// when a network has to be created.
    #[serde(default = "default_network")]
    pub docker_network: String,

    /// MariaDB host tenant containers connect to.
    #[serde(default = "default_db_host")]
    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    /// Redis endpoints injected into tenant containers.
    #[serde(default = "default_redis_cache")]
    pub redis_cache: String,
    #[serde(default = "default_redis_queue")]
    pub redis_queue: String,

    /// Root credential handed to `bench new-site` and tenant containers.
    #[serde(default = "default_db_root_password")]
    pub db_root_password: String,
    /// Fallback admin password when a tenant record has none stored.
    #[serde(default = "default_admin_password")]
    pub default_admin_password: String,

    /// Name of the payload app installed into every tenant site.
    #[serde(default = "default_payload_app")]
    pub payload_app: String,
    /// Bench working directory inside tenant/backend containers.
    #[serde(default = "default_bench_dir")]
    pub bench_dir: String,
    /// Host-side fallback path for the payload when the backend copy fails.
    #[serde(default = "default_payload_fallback")]
    pub payload_fallback_dir: String,
    /// Unix user for in-container command execution.
    #[serde(default = "default_exec_user")]
    pub exec_user: String,

    /// Candidate host port range for tenant containers, scanned ascending.
    #[serde(default = "default_port_range")]
    pub port_range: [u16; 2],
    /// Ports never handed out (platform backend, websocket port).
    #[serde(default = "default_reserved_ports")]
    pub reserved_ports: Vec<u16>,

    /// Hard bound on a provisioning job, in seconds.
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,
    /// Bound on the readiness probe loop, in seconds.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    /// Interval between readiness probes, in seconds.
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7070
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/tenantd.db")
}
fn default_base_domain() -> String {
    "saas.local".into()
}
fn default_backend_container() -> String {
    "saas-backend".into()
}
fn default_tenant_image() -> String {
    "saas-backend:tenant".into()
}
fn default_network() -> String {
    "saas-network".into()
}
fn default_db_host() -> String {
    "mariadb".into()
}
fn default_db_port() -> u16 {
    3306
}
fn default_redis_cache() -> String {
    "redis://redis-cache:6379".into()
}
fn default_redis_queue() -> String {
    "redis://redis-queue:6379".into()
}
fn default_db_root_password() -> String {
    "root".into()
}
fn default_admin_password() -> String {
    "admin".into()
}
fn default_payload_app() -> String {
    "saas_core".into()
}
fn default_bench_dir() -> String {
    "/home/frappe/bench-repo".into()
}
fn default_payload_fallback() -> String {
    "/home/frappe/bench-repo/apps/saas_core".into()
}
fn default_exec_user() -> String {
    "frappe".into()
}
fn default_port_range() -> [u16; 2] {
    [8001, 8999]
}
fn default_reserved_ports() -> Vec<u16> {
    vec![8000, 9000]
}
fn default_provision_timeout() -> u64 {
    600
}
fn default_readiness_timeout() -> u64 {
    120
}
fn default_readiness_poll() -> u64 {
    2
}

impl PlatformConfig {
    /// Fully-qualified site name for a tenant.
    pub fn site_fqdn(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.base_domain)
    }

    /// Logical database name for a tenant site.
    pub fn site_db_name(&self, subdomain: &str) -> String {
        format!("tenant_{}", subdomain)
    }
}

/// Load config from a TOML file with env var overrides.
pub fn load(path: &str) -> anyhow::Result<PlatformConfig> {
    let content = if std::path::Path::new(path).exists() {
        std::fs::read_to_string(path)?
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path);
        String::new()
    };

    let mut config: PlatformConfig = toml::from_str(&content)?;

    if let Ok(v) = std::env::var("TENANTD_HOST") {
        config.host = v;
    }
    if let Ok(v) = std::env::var("TENANTD_PORT") {
        config.port = v.parse()?;
    }
    if let Ok(v) = std::env::var("TENANTD_DB_PATH") {
        config.database_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("TENANTD_BASE_DOMAIN") {
        config.base_domain = v;
    }
    if let Ok(v) = std::env::var("BACKEND_CONTAINER_NAME") {
        config.backend_container = v;
    }
    if let Ok(v) = std::env::var("TENANTD_CORE_IMAGE") {
        config.tenant_image = v;
    }
    if let Ok(v) = std::env::var("DB_HOST") {
        config.db_host = v;
    }
    if let Ok(v) = std::env::var("DB_PORT") {
        config.db_port = v.parse()?;
    }
    if let Ok(v) = std::env::var("MYSQL_ROOT_PASSWORD") {
        config.db_root_password = v;
    }
    if let Ok(v) = std::env::var("ADMIN_PASSWORD") {
        config.default_admin_password = v;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_on_empty_toml() {
        let cfg: PlatformConfig = toml::from_str("").expect("empty toml should parse");
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 7070);
        assert_eq!(cfg.port_range, [8001, 8999]);
        assert_eq!(cfg.reserved_ports, vec![8000, 9000]);
        assert_eq!(cfg.tenant_image, "saas-backend:tenant");
        assert_eq!(cfg.base_domain, "saas.local");
        assert_eq!(cfg.provision_timeout_secs, 600);
    }

    #[test]
    fn partial_toml_overrides_only_set_fields() {
        let toml_str = r#"
host = "0.0.0.0"
base_domain = "example.com"
port_range = [9001, 9099]
"#;
        let cfg: PlatformConfig = toml::from_str(toml_str).expect("valid toml");
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.base_domain, "example.com");
        assert_eq!(cfg.port_range, [9001, 9099]);
        // defaults preserved for unset fields
        assert_eq!(cfg.backend_container, "saas-backend");
        assert_eq!(cfg.payload_app, "saas_core");
    }

    #[test]
    fn site_names_derive_from_subdomain() {
        let cfg: PlatformConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.site_fqdn("acme"), "acme.saas.local");
        assert_eq!(cfg.site_db_name("acme"), "tenant_acme");
    }
}
