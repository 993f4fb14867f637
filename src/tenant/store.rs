//! SQL access for tenant records.
//!
//! Free functions over a borrowed connection; callers pick read or write
//! through the pool. Lifecycle writes always bump `updated_at`.

use rusqlite::{params, Connection, OptionalExtension};

use super::record::{ContainerBinding, ContainerStatus, Tenant, TenantState};

fn row_to_tenant(row: &rusqlite::Row) -> rusqlite::Result<Tenant> {
    let state: String = row.get("state")?;
    let container_status: String = row.get("container_status")?;
    Ok(Tenant {
        id: row.get("id")?,
        subdomain: row.get("subdomain")?,
        plan: row.get("plan")?,
        state: TenantState::parse(&state),
        container_id: row.get("container_id")?,
        container_name: row.get("container_name")?,
        container_port: row.get::<_, Option<i64>>("container_port")?.map(|p| p as u16),
        container_status: ContainerStatus::parse(&container_status),
        access_url: row.get("access_url")?,
        admin_password: row.get("admin_password")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
    })
}

const TENANT_COLUMNS: &str = "id, subdomain, plan, state, container_id, container_name, \
     container_port, container_status, access_url, admin_password, last_error, created_at";

/// Persist a new tenant in draft state. This runs before any container work so
/// a crash mid-provision always leaves a visible record.
pub fn insert_draft(
    conn: &Connection,
    id: &str,
    subdomain: &str,
    plan: &str,
    admin_password: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO tenants (id, subdomain, plan, state, container_status, admin_password)
         VALUES (?1, ?2, ?3, 'draft', 'not_created', ?4)",
        params![id, subdomain, plan, admin_password],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> anyhow::Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            &format!("SELECT {} FROM tenants WHERE id = ?1", TENANT_COLUMNS),
            [id],
            row_to_tenant,
        )
        .optional()?;
    Ok(tenant)
}

pub fn get_by_subdomain(conn: &Connection, subdomain: &str) -> anyhow::Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            &format!(
                "SELECT {} FROM tenants WHERE subdomain = ?1",
                TENANT_COLUMNS
            ),
            [subdomain],
            row_to_tenant,
        )
        .optional()?;
    Ok(tenant)
}

pub fn subdomain_taken(conn: &Connection, subdomain: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tenants WHERE subdomain = ?1",
        [subdomain],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<Tenant>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tenants ORDER BY created_at DESC",
        TENANT_COLUMNS
    ))?;
    let tenants = stmt
        .query_map([], row_to_tenant)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tenants)
}

/// Host ports already assigned to tenants, optionally excluding one tenant
/// (its own port doesn't conflict with a re-provision of itself).
pub fn used_ports(conn: &Connection, excluding_tenant: Option<&str>) -> anyhow::Result<Vec<u16>> {
    let mut stmt = conn.prepare(
        "SELECT container_port FROM tenants
         WHERE container_port IS NOT NULL AND (?1 IS NULL OR id != ?1)",
    )?;
    let ports = stmt
        .query_map(params![excluding_tenant], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|p| p as u16)
        .collect();
    Ok(ports)
}

/// Update lifecycle state and container status, recording the failure message
/// when there is one.
pub fn set_lifecycle(
    conn: &Connection,
    id: &str,
    state: TenantState,
    status: ContainerStatus,
    error: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE tenants SET state = ?2, container_status = ?3, last_error = ?4,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?1",
        params![id, state.as_str(), status.as_str(), error],
    )?;
    Ok(())
}

/// Bind container identity and flip the tenant active in one statement, so a
/// reader never observes an active tenant with partial container fields.
pub fn bind_active(
    conn: &Connection,
    id: &str,
    binding: &ContainerBinding,
    access_url: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE tenants SET container_id = ?2, container_name = ?3, container_port = ?4,
         container_status = 'running', state = 'active', access_url = ?5, last_error = NULL,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?1",
        params![
            id,
            binding.container_id,
            binding.container_name,
            binding.port as i64,
            access_url
        ],
    )?;
    Ok(())
}

/// Clear container fields and return the record to draft. Used after rollback
/// and after deprovision; idempotent on an already-clear record.
pub fn clear_binding(conn: &Connection, id: &str, error: Option<&str>) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE tenants SET container_id = NULL, container_name = NULL, container_port = NULL,
         container_status = 'not_created', state = ?2, access_url = NULL, last_error = ?3,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?1",
        params![
            id,
            if error.is_some() {
                TenantState::Error.as_str()
            } else {
                TenantState::Draft.as_str()
            },
            error
        ],
    )?;
    Ok(())
}

/// Activate a tenant hosted on the shared backend. No container identity is
/// bound; container_status stays not_created.
pub fn activate_shared(conn: &Connection, id: &str, access_url: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE tenants SET state = 'active', container_status = 'not_created',
         access_url = ?2, last_error = NULL,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?1",
        params![id, access_url],
    )?;
    Ok(())
}

/// Persist the engine's observed view of a container: id, published port and
/// run status (sync path). The container name is left alone, it is fixed by
/// the subdomain.
pub fn refresh_binding(
    conn: &Connection,
    id: &str,
    container_id: &str,
    port: Option<u16>,
    status: ContainerStatus,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE tenants SET container_id = ?2, container_port = ?3, container_status = ?4,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?1",
        params![id, container_id, port.map(|p| p as i64), status.as_str()],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<()> {
    conn.execute("DELETE FROM tenants WHERE id = ?1", [id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{pool::DbPool, run_migrations};

    fn test_pool() -> (DbPool, std::path::PathBuf) {
        let mut path = std::env::temp_dir();
        path.push(format!("tenantd-store-test-{}.db", uuid::Uuid::new_v4()));
        let pool = DbPool::open(path.to_str().unwrap(), 1).unwrap();
        run_migrations(&pool).unwrap();
        (pool, path)
    }

    #[test]
    fn draft_insert_is_visible_before_any_container_work() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            insert_draft(conn, "t1", "acme", "starter", "pw")?;
            let t = get(conn, "t1")?.unwrap();
            assert_eq!(t.state, TenantState::Draft);
            assert_eq!(t.container_status, ContainerStatus::NotCreated);
            assert!(t.container_id.is_none());
            assert!(subdomain_taken(conn, "acme")?);
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn duplicate_subdomain_rejected_by_schema() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            insert_draft(conn, "t1", "acme", "starter", "pw")?;
            assert!(insert_draft(conn, "t2", "acme", "starter", "pw").is_err());
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bind_active_sets_all_fields_atomically() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            insert_draft(conn, "t1", "acme", "starter", "pw")?;
            let b = ContainerBinding::new("acme", "cid123".into(), 8003);
            bind_active(conn, "t1", &b, "http://acme.saas.local:8003")?;
            let t = get(conn, "t1")?.unwrap();
            assert_eq!(t.state, TenantState::Active);
            assert_eq!(t.container_status, ContainerStatus::Running);
            assert_eq!(t.container_name.as_deref(), Some("acme"));
            assert_eq!(t.container_port, Some(8003));
            assert_eq!(t.access_url.as_deref(), Some("http://acme.saas.local:8003"));
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn clear_binding_resets_and_is_idempotent() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            insert_draft(conn, "t1", "acme", "starter", "pw")?;
            let b = ContainerBinding::new("acme", "cid123".into(), 8003);
            bind_active(conn, "t1", &b, "http://acme.saas.local:8003")?;

            clear_binding(conn, "t1", None)?;
            clear_binding(conn, "t1", None)?;
            let t = get(conn, "t1")?.unwrap();
            assert_eq!(t.state, TenantState::Draft);
            assert_eq!(t.container_status, ContainerStatus::NotCreated);
            assert!(t.container_id.is_none());
            assert!(t.container_port.is_none());
            assert!(t.access_url.is_none());
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn clear_binding_with_error_marks_record_failed() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            insert_draft(conn, "t1", "acme", "starter", "pw")?;
            clear_binding(conn, "t1", Some("image missing"))?;
            let t = get(conn, "t1")?.unwrap();
            assert_eq!(t.state, TenantState::Error);
            assert_eq!(t.last_error.as_deref(), Some("image missing"));
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn used_ports_excludes_requested_tenant() {
        let (pool, path) = test_pool();
        pool.write(|conn| {
            insert_draft(conn, "t1", "acme", "starter", "pw")?;
            insert_draft(conn, "t2", "globex", "starter", "pw")?;
            bind_active(
                conn,
                "t1",
                &ContainerBinding::new("acme", "c1".into(), 8001),
                "u1",
            )?;
            bind_active(
                conn,
                "t2",
                &ContainerBinding::new("globex", "c2".into(), 8002),
                "u2",
            )?;

            let all = used_ports(conn, None)?;
            assert!(all.contains(&8001) && all.contains(&8002));

            let without_t1 = used_ports(conn, Some("t1"))?;
            assert!(!without_t1.contains(&8001));
            assert!(without_t1.contains(&8002));
            Ok(())
        })
        .unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
