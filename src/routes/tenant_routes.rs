use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::SharedState;
use crate::tenant::orchestrator::Orchestrator;
use crate::tenant::record::{generate_password, normalize_subdomain, Tenant};
use crate::tenant::{plan, store};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateTenant {
    pub subdomain: String,
    pub plan: String,
}

#[derive(Serialize)]
pub struct JobAccepted {
    pub id: String,
    pub subdomain: String,
    pub state: String,
    pub message: String,
}

/// Caller identity for event attribution, from the `x-caller` header.
/// Unattributed requests run as "system".
fn caller(headers: &HeaderMap) -> String {
    headers
        .get("x-caller")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("system")
        .to_string()
}

/// Marks the record failed when a job dies without persisting its own error
/// (timeout or panic).
fn failure_marker(
    state: &SharedState,
    tenant_id: &str,
) -> impl FnOnce(&str) + Send + 'static {
    let db = state.db.clone();
    let id = tenant_id.to_string();
    move |message: &str| {
        if let Err(e) = db.write(|conn| store::clear_binding(conn, &id, Some(message))) {
            tracing::error!("failed to mark tenant {} as failed: {:?}", id, e);
        }
    }
}

async fn run_blocking<T, F>(job: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, crate::error::ProvisionError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("task failed: {}", e)))?
        .map_err(AppError::from)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /tenants
pub async fn list_tenants(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Tenant>>, AppError> {
    let tenants = state.db.read(store::list)?;
    Ok(Json(tenants))
}

/// POST /tenants
///
/// Validates, persists the draft record, then hands the container work to a
/// background job. The response acknowledges the draft; completion arrives as
/// an event.
pub async fn create_tenant(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateTenant>,
) -> Result<Json<JobAccepted>, AppError> {
    let subdomain = normalize_subdomain(&req.subdomain)?;

    let plan_name = req.plan.clone();
    let selected = state
        .db
        .read(move |conn| plan::get(conn, &plan_name))?
        .ok_or_else(|| AppError::BadRequest(format!("unknown plan '{}'", req.plan)))?;
    if !selected.active {
        return Err(AppError::BadRequest(format!(
            "plan '{}' is not active",
            selected.technical_name
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let admin_password = generate_password(12);

    // Draft row first: the tenant is visible before any engine call is made.
    {
        let (id, subdomain, plan_name) = (id.clone(), subdomain.clone(), req.plan.clone());
        state.db.write(move |conn| {
            if store::subdomain_taken(conn, &subdomain)? {
                anyhow::bail!("subdomain '{}' is already taken", subdomain);
            }
            store::insert_draft(conn, &id, &subdomain, &plan_name, &admin_password)
        })
    }
    .map_err(|e| AppError::Conflict(e.to_string()))?;

    enqueue(&state, &id, &caller(&headers), "provision", {
        let orch = state.orchestrator.clone();
        let id = id.clone();
        move || orch.provision(&id).map(Some)
    });

    Ok(Json(JobAccepted {
        id,
        subdomain,
        state: "draft".into(),
        message: "provisioning started".into(),
    }))
}

/// GET /tenants/{id}
pub async fn get_tenant(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    let tenant = {
        let id = id.clone();
        state.db.read(move |conn| store::get(conn, &id))?
    };
    tenant
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("tenant {}", id)))
}

/// DELETE /tenants/{id}
pub async fn delete_tenant(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobAccepted>, AppError> {
    let tenant = load(&state, &id).await?;

    enqueue(&state, &id, &caller(&headers), "deprovision", {
        let orch = state.orchestrator.clone();
        let id = id.clone();
        move || orch.deprovision(&id).map(|_| None)
    });

    Ok(Json(JobAccepted {
        id,
        subdomain: tenant.subdomain,
        state: tenant.state.as_str().into(),
        message: "deprovisioning started".into(),
    }))
}

/// POST /tenants/{id}/recreate
pub async fn recreate_tenant(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobAccepted>, AppError> {
    let tenant = load(&state, &id).await?;

    enqueue(&state, &id, &caller(&headers), "recreate", {
        let orch = state.orchestrator.clone();
        let id = id.clone();
        move || orch.recreate(&id).map(Some)
    });

    Ok(Json(JobAccepted {
        id,
        subdomain: tenant.subdomain,
        state: tenant.state.as_str().into(),
        message: "recreate started".into(),
    }))
}

/// POST /tenants/{id}/start
pub async fn start_tenant(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    lifecycle(&state, &id, Orchestrator::start).await
}

/// POST /tenants/{id}/stop
pub async fn stop_tenant(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    lifecycle(&state, &id, Orchestrator::stop).await
}

/// POST /tenants/{id}/restart
pub async fn restart_tenant(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    lifecycle(&state, &id, Orchestrator::restart).await
}

/// POST /tenants/{id}/sync
/// Reconciles the stored container status with the engine's view.
pub async fn sync_tenant(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    let orch = state.orchestrator.clone();
    let tenant_id = id.clone();
    let tenant = run_blocking(move || orch.sync_status(&tenant_id)).await?;
    Ok(Json(tenant))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
}

/// GET /tenants/{id}/logs
pub async fn tenant_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<LogsQuery>,
) -> Result<String, AppError> {
    let orch = state.orchestrator.clone();
    let tail = query.tail.unwrap_or(100);
    run_blocking(move || orch.logs(&id, tail)).await
}

/// GET /tenants/{id}/status
/// The stored view, no engine round trip.
pub async fn tenant_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = load(&state, &id).await?;
    Ok(Json(serde_json::json!({
        "id": tenant.id,
        "state": tenant.state,
        "container_status": tenant.container_status,
        "container_name": tenant.container_name,
        "container_port": tenant.container_port,
        "access_url": tenant.access_url,
        "last_error": tenant.last_error,
    })))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load(state: &SharedState, id: &str) -> Result<Tenant, AppError> {
    let lookup = id.to_string();
    state
        .db
        .read(move |conn| store::get(conn, &lookup))?
        .ok_or_else(|| AppError::NotFound(format!("tenant {}", id)))
}

async fn lifecycle(
    state: &SharedState,
    id: &str,
    op: fn(&Orchestrator, &str) -> Result<(), crate::error::ProvisionError>,
) -> Result<Json<Tenant>, AppError> {
    let orch = state.orchestrator.clone();
    let tenant_id = id.to_string();
    run_blocking(move || op(orch.as_ref(), &tenant_id)).await?;
    Ok(Json(load(state, id).await?))
}

fn enqueue<J>(state: &SharedState, id: &str, user: &str, action: &'static str, job: J)
where
    J: FnOnce() -> Result<Option<crate::tenant::orchestrator::ProvisionOutcome>, crate::error::ProvisionError>
        + Send
        + 'static,
{
    state.jobs.submit(
        id.to_string(),
        user.to_string(),
        action,
        job,
        failure_marker(state, id),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_defaults_to_system() {
        let headers = HeaderMap::new();
        assert_eq!(caller(&headers), "system");

        let mut headers = HeaderMap::new();
        headers.insert("x-caller", "alice".parse().unwrap());
        assert_eq!(caller(&headers), "alice");
    }
}
