use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Subscription plan. `dedicated_container` decides whether provisioning
/// creates a per-tenant container or places the site on the shared backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub technical_name: String,
    pub display_name: String,
    #[serde(default = "default_max_users")]
    pub max_users: u32,
    #[serde(default = "default_max_storage")]
    pub max_storage_gb: u32,
    #[serde(default = "default_max_companies")]
    pub max_companies: u32,
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_dedicated")]
    pub dedicated_container: bool,
    /// Comma-separated module list installed on top of the base set.
    #[serde(default)]
    pub modules: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_max_users() -> u32 {
    5
}
fn default_max_storage() -> u32 {
    5
}
fn default_max_companies() -> u32 {
    1
}
fn default_trial_days() -> u32 {
    14
}
fn default_cpu_limit() -> f64 {
    1.0
}
fn default_memory_mb() -> u32 {
    1024
}
fn default_dedicated() -> bool {
    true
}
fn default_active() -> bool {
    true
}

const BASE_MODULES: &[&str] = &["base", "web", "mail", "contacts"];

impl Plan {
    /// Modules installed into every site of this plan: the base set plus the
    /// plan's own list, deduplicated, order preserved.
    pub fn modules_to_install(&self) -> Vec<String> {
        let mut out: Vec<String> = BASE_MODULES.iter().map(|m| m.to_string()).collect();
        for m in self.modules.split(',') {
            let m = m.trim();
            if !m.is_empty() && !out.iter().any(|x| x == m) {
                out.push(m.to_string());
            }
        }
        out
    }

    /// Extra apps installed best-effort for this plan. Failures downgrade to
    /// warnings rather than failing the provision.
    pub fn optional_apps(&self) -> Vec<&'static str> {
        if self.technical_name == "enterprise" {
            vec!["payments"]
        } else {
            vec![]
        }
    }
}

fn row_to_plan(row: &rusqlite::Row) -> rusqlite::Result<Plan> {
    Ok(Plan {
        technical_name: row.get("technical_name")?,
        display_name: row.get("display_name")?,
        max_users: row.get::<_, i64>("max_users")? as u32,
        max_storage_gb: row.get::<_, i64>("max_storage_gb")? as u32,
        max_companies: row.get::<_, i64>("max_companies")? as u32,
        trial_days: row.get::<_, i64>("trial_days")? as u32,
        cpu_limit: row.get("cpu_limit")?,
        memory_mb: row.get::<_, i64>("memory_mb")? as u32,
        dedicated_container: row.get::<_, i64>("dedicated_container")? != 0,
        modules: row.get("modules")?,
        active: row.get::<_, i64>("active")? != 0,
    })
}

const PLAN_COLUMNS: &str = "technical_name, display_name, max_users, max_storage_gb, \
     max_companies, trial_days, cpu_limit, memory_mb, dedicated_container, modules, active";

pub fn get(conn: &Connection, technical_name: &str) -> anyhow::Result<Option<Plan>> {
    let plan = conn
        .query_row(
            &format!(
                "SELECT {} FROM plans WHERE technical_name = ?1",
                PLAN_COLUMNS
            ),
            [technical_name],
            row_to_plan,
        )
        .optional()?;
    Ok(plan)
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<Plan>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM plans ORDER BY technical_name",
        PLAN_COLUMNS
    ))?;
    let plans = stmt
        .query_map([], row_to_plan)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(plans)
}

pub fn upsert(conn: &Connection, plan: &Plan) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO plans (technical_name, display_name, max_users, max_storage_gb,
             max_companies, trial_days, cpu_limit, memory_mb, dedicated_container, modules, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(technical_name) DO UPDATE SET
             display_name = excluded.display_name,
             max_users = excluded.max_users,
             max_storage_gb = excluded.max_storage_gb,
             max_companies = excluded.max_companies,
             trial_days = excluded.trial_days,
             cpu_limit = excluded.cpu_limit,
             memory_mb = excluded.memory_mb,
             dedicated_container = excluded.dedicated_container,
             modules = excluded.modules,
             active = excluded.active",
        params![
            plan.technical_name,
            plan.display_name,
            plan.max_users as i64,
            plan.max_storage_gb as i64,
            plan.max_companies as i64,
            plan.trial_days as i64,
            plan.cpu_limit,
            plan.memory_mb as i64,
            plan.dedicated_container as i64,
            plan.modules,
            plan.active as i64,
        ],
    )?;
    Ok(())
}

/// Is any tenant on this plan? Plans in use cannot be deleted.
pub fn in_use(conn: &Connection, technical_name: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tenants WHERE plan = ?1",
        [technical_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn delete(conn: &Connection, technical_name: &str) -> anyhow::Result<bool> {
    let n = conn.execute(
        "DELETE FROM plans WHERE technical_name = ?1",
        [technical_name],
    )?;
    Ok(n > 0)
}

/// Seed the stock plans if they are absent. Runs at bootstrap; never
/// overwrites operator edits to an existing plan.
pub fn seed_defaults(conn: &Connection) -> anyhow::Result<()> {
    let defaults = [
        Plan {
            technical_name: "starter".into(),
            display_name: "Starter".into(),
            max_users: 5,
            max_storage_gb: 5,
            max_companies: 1,
            trial_days: 14,
            cpu_limit: 0.5,
            memory_mb: 1024,
            dedicated_container: true,
            modules: "".into(),
            active: true,
        },
        Plan {
            technical_name: "professional".into(),
            display_name: "Professional".into(),
            max_users: 25,
            max_storage_gb: 25,
            max_companies: 3,
            trial_days: 14,
            cpu_limit: 1.0,
            memory_mb: 2048,
            dedicated_container: true,
            modules: "projects,hr".into(),
            active: true,
        },
        Plan {
            technical_name: "enterprise".into(),
            display_name: "Enterprise".into(),
            max_users: 100,
            max_storage_gb: 100,
            max_companies: 10,
            trial_days: 30,
            cpu_limit: 2.0,
            memory_mb: 4096,
            dedicated_container: true,
            modules: "projects,hr,manufacturing".into(),
            active: true,
        },
    ];

    for plan in &defaults {
        if get(conn, &plan.technical_name)?.is_none() {
            upsert(conn, plan)?;
            tracing::info!("seeded plan: {}", plan.technical_name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{pool::DbPool, run_migrations};

    fn test_pool() -> (DbPool, std::path::PathBuf) {
        let mut path = std::env::temp_dir();
        path.push(format!("tenantd-plan-test-{}.db", uuid::Uuid::new_v4()));
        let pool = DbPool::open(path.to_str().unwrap(), 1).unwrap();
        run_migrations(&pool).unwrap();
        (pool, path)
    }

    #[test]
    fn seed_is_idempotent_and_preserves_edits() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            seed_defaults(conn)?;
            let mut starter = get(conn, "starter")?.unwrap();
            starter.max_users = 99;
            upsert(conn, &starter)?;

            seed_defaults(conn)?;
            assert_eq!(get(conn, "starter")?.unwrap().max_users, 99);
            assert_eq!(list(conn)?.len(), 3);
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn modules_merge_base_and_plan_lists() {
        let plan = Plan {
            technical_name: "professional".into(),
            display_name: "Professional".into(),
            max_users: 25,
            max_storage_gb: 25,
            max_companies: 3,
            trial_days: 14,
            cpu_limit: 1.0,
            memory_mb: 2048,
            dedicated_container: true,
            modules: "projects, hr, web".into(),
            active: true,
        };
        let mods = plan.modules_to_install();
        assert_eq!(mods, ["base", "web", "mail", "contacts", "projects", "hr"]);
    }

    #[test]
    fn enterprise_gets_optional_payments_app() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            seed_defaults(conn)?;
            assert_eq!(get(conn, "enterprise")?.unwrap().optional_apps(), ["payments"]);
            assert!(get(conn, "starter")?.unwrap().optional_apps().is_empty());
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn plan_in_use_blocks_delete() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            seed_defaults(conn)?;
            crate::tenant::store::insert_draft(conn, "t1", "acme", "starter", "pw")?;
            assert!(in_use(conn, "starter")?);
            assert!(!in_use(conn, "enterprise")?);
            assert!(delete(conn, "enterprise")?);
            assert!(!delete(conn, "enterprise")?);
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
