//! Replication slot management.
//!
//! Creates, inspects and drops logical replication slots. Creation and removal
//! go through walsender commands; the existence check is a parameterized query
//! on a regular connection.

use std::collections::BTreeMap;

use tokio_postgres::Client;
use tracing::{debug, info};

use super::connection::ReplicationConnection;
use crate::error::UNDEFINED_OBJECT;
use crate::lsn::Lsn;
use crate::{Error, Result};

/// PostgreSQL's NAMEDATALEN - 1.
const MAX_SLOT_NAME_LEN: usize = 63;

/// Slot names may contain lower case letters, digits and underscores only.
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SLOT_NAME_LEN {
        return Err(Error::Config(format!(
            "Replication slot name '{}' must be 1 to {} characters long",
            name, MAX_SLOT_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::Config(format!(
            "Replication slot name '{}' may only contain lower case letters, numbers and underscores",
            name
        )));
    }
    Ok(())
}

pub fn validate_plugin_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "Output plugin name '{}' may only contain letters, numbers and underscores",
            name
        )));
    }
    Ok(())
}

pub fn create_slot_command(slot_name: &str, plugin: &str) -> String {
    format!("CREATE_REPLICATION_SLOT {} LOGICAL {}", slot_name, plugin)
}

pub fn drop_slot_command(slot_name: &str) -> String {
    format!("DROP_REPLICATION_SLOT {}", slot_name)
}

/// Builds START_REPLICATION, rendering plugin options as `"name" 'value'`.
pub fn start_replication_command(
    slot_name: &str,
    start: Lsn,
    plugin_options: &BTreeMap<String, String>,
) -> String {
    let mut command = format!("START_REPLICATION SLOT {} LOGICAL {}", slot_name, start);

    if !plugin_options.is_empty() {
        let options = plugin_options
            .iter()
            .map(|(name, value)| format!("{} {}", quote_ident(name), quote_literal(value)))
            .collect::<Vec<_>>()
            .join(", ");
        command.push_str(" (");
        command.push_str(&options);
        command.push(')');
    }

    command
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Check if a replication slot exists.
pub async fn slot_exists(client: &Client, slot_name: &str) -> Result<bool> {
    let count: i64 = client
        .query_one(
            "SELECT count(*) FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
        .map_err(Error::from_client)?
        .get(0);

    debug!(slot = %slot_name, count, "Checked replication slot");
    Ok(count > 0)
}

/// Create a logical replication slot and return its consistent point.
pub async fn create_slot(
    connection: &mut ReplicationConnection,
    slot_name: &str,
    plugin: &str,
) -> Result<Lsn> {
    validate_slot_name(slot_name)?;
    validate_plugin_name(plugin)?;

    info!(slot = %slot_name, plugin = %plugin, "Creating logical replication slot");

    let rows = connection
        .simple_query(&create_slot_command(slot_name, plugin))
        .await
        .map_err(|e| classify_create_error(slot_name, e))?;

    let row = rows.first().ok_or_else(|| {
        Error::Protocol(
            "Create replication failed. Expected a start LSN, but the server returned no rows"
                .to_string(),
        )
    })?;
    let position = row
        .get("consistent_point")
        .or_else(|| row.get_index(1))
        .ok_or_else(|| {
            Error::Protocol("Create replication returned no consistent point".to_string())
        })?;
    let lsn = position.parse::<Lsn>().map_err(Error::protocol)?;

    info!(slot = %slot_name, lsn = %lsn, "Logical replication slot created");
    Ok(lsn)
}

/// Drop a replication slot.
pub async fn drop_slot(connection: &mut ReplicationConnection, slot_name: &str) -> Result<()> {
    validate_slot_name(slot_name)?;

    info!(slot = %slot_name, "Dropping logical replication slot");

    connection
        .simple_query(&drop_slot_command(slot_name))
        .await
        .map_err(|e| classify_drop_error(slot_name, e))?;

    info!(slot = %slot_name, "Logical replication slot dropped");
    Ok(())
}

pub(crate) fn classify_create_error(slot_name: &str, error: Error) -> Error {
    // Existing slot (DUPLICATE_OBJECT), unknown plugin (UNDEFINED_FILE) and any
    // other rejection of the command are all creation failures.
    match error {
        Error::Server { code, message } => {
            debug!(slot = %slot_name, code = %code, "Slot creation rejected");
            Error::SlotCreation {
                slot: slot_name.to_string(),
                message,
            }
        }
        other => other,
    }
}

pub(crate) fn classify_drop_error(slot_name: &str, error: Error) -> Error {
    match error {
        Error::Server { code, .. } if code == UNDEFINED_OBJECT => {
            Error::SlotNotFound(slot_name.to_string())
        }
        other => other,
    }
}

pub(crate) fn classify_start_error(slot_name: &str, error: Error) -> Error {
    classify_drop_error(slot_name, error)
}
