use rand::RngExt as _;
use serde::Serialize;

use crate::error::ProvisionError;

/// Tenant lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Draft,
    Provisioning,
    Active,
    Suspended,
    Error,
}

impl TenantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantState::Draft => "draft",
            TenantState::Provisioning => "provisioning",
            TenantState::Active => "active",
            TenantState::Suspended => "suspended",
            TenantState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "provisioning" => TenantState::Provisioning,
            "active" => TenantState::Active,
            "suspended" => TenantState::Suspended,
            "error" => TenantState::Error,
            _ => TenantState::Draft,
        }
    }
}

/// Observed status of a tenant's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    NotCreated,
    Provisioning,
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::NotCreated => "not_created",
            ContainerStatus::Provisioning => "provisioning",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "provisioning" => ContainerStatus::Provisioning,
            "running" => ContainerStatus::Running,
            "stopped" => ContainerStatus::Stopped,
            _ => ContainerStatus::NotCreated,
        }
    }
}

/// A tenant row as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    pub subdomain: String,
    pub plan: String,
    pub state: TenantState,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub container_port: Option<u16>,
    pub container_status: ContainerStatus,
    pub access_url: Option<String>,
    #[serde(skip)]
    pub admin_password: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
}

/// Container identity bound to an active tenant. The only way to build one is
/// [`ContainerBinding::new`], which derives the container name from the
/// subdomain, so a record can never carry a name that differs from it.
#[derive(Debug, Clone)]
pub struct ContainerBinding {
    pub container_name: String,
    pub container_id: String,
    pub port: u16,
}

impl ContainerBinding {
    pub fn new(subdomain: &str, container_id: String, port: u16) -> Self {
        Self {
            container_name: subdomain.to_string(),
            container_id,
            port,
        }
    }
}

/// Normalize and validate a requested subdomain: lowercase, keep only
/// `[a-z0-9-]`, reject empty results.
pub fn normalize_subdomain(input: &str) -> Result<String, ProvisionError> {
    let normalized: String = input
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    if normalized.is_empty() {
        return Err(ProvisionError::Validation(format!(
            "subdomain '{}' contains no usable characters",
            input
        )));
    }
    Ok(normalized)
}

const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()";

/// Random site admin password. Generated once per tenant and persisted before
/// any side effect, so retries reuse the same credential.
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..PASSWORD_CHARSET.len());
            PASSWORD_CHARSET[idx] as char
        })
        .collect()
}
