use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::AppError;
use crate::state::SharedState;
use crate::tenant::plan::{self, Plan};

/// GET /plans
pub async fn list_plans(State(state): State<SharedState>) -> Result<Json<Vec<Plan>>, AppError> {
    let plans = state.db.read(plan::list)?;
    Ok(Json(plans))
}

/// GET /plans/{name}
pub async fn get_plan(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<Plan>, AppError> {
    let lookup = name.clone();
    state
        .db
        .read(move |conn| plan::get(conn, &lookup))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("plan {}", name)))
}

/// POST /plans
/// Creates or updates a plan; the technical name is the identity.
pub async fn upsert_plan(
    State(state): State<SharedState>,
    Json(req): Json<Plan>,
) -> Result<Json<Plan>, AppError> {
    if req.technical_name.trim().is_empty() {
        return Err(AppError::BadRequest("technical_name is required".into()));
    }
    let stored = req.clone();
    state.db.write(move |conn| plan::upsert(conn, &stored))?;
    Ok(Json(req))
}

/// DELETE /plans/{name}
/// Refused while any tenant references the plan.
pub async fn delete_plan(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let target = name.clone();
    let deleted = state.db.write(move |conn| {
        if plan::in_use(conn, &target)? {
            anyhow::bail!("plan '{}' is in use by existing tenants", target);
        }
        plan::delete(conn, &target)
    });

    match deleted {
        Ok(true) => Ok(Json(serde_json::json!({ "deleted": name }))),
        Ok(false) => Err(AppError::NotFound(format!("plan {}", name))),
        Err(e) if e.to_string().contains("in use") => Err(AppError::Conflict(e.to_string())),
        Err(e) => Err(AppError::Internal(e)),
    }
}
