use rusqlite::Connection;

use crate::error::ProvisionError;

use super::store;

/// Pick the lowest free host port in `range`.
///
/// A port is taken if a tenant record holds it, if the runtime reports a
/// container bound to it, or if it is reserved. The runtime view is passed in
/// by the caller; a caller that could not reach the engine passes an empty
/// slice and relies on the create-time conflict retry instead.
pub fn allocate_port(
    conn: &Connection,
    runtime_ports: &[u16],
    range: [u16; 2],
    reserved: &[u16],
    excluding_tenant: Option<&str>,
) -> Result<u16, ProvisionError> {
    let db_ports = store::used_ports(conn, excluding_tenant)
        .map_err(ProvisionError::Internal)?;

    for port in range[0]..=range[1] {
        if reserved.contains(&port) || db_ports.contains(&port) || runtime_ports.contains(&port) {
            continue;
        }
        return Ok(port);
    }
    Err(ProvisionError::ResourceExhausted(format!(
        "no free port in {}-{}",
        range[0], range[1]
    )))
}
