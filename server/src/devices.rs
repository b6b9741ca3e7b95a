use anyhow::Result;
use delivery_api::Platform;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::now_ms;

/// A registered out-of-band delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAddress {
    pub user_id: String,
    pub address: String,
    pub platform: Platform,
    pub active: bool,
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceAddress> {
    let platform: String = row.get(2)?;
    Ok(DeviceAddress {
        user_id: row.get(0)?,
        address: row.get(1)?,
        platform: Platform::parse(&platform).unwrap_or(Platform::Web),
        active: row.get::<_, i64>(3)? != 0,
    })
}

/// Insert or reactivate an address for a user.
pub fn register_address(
    conn: &Connection,
    user_id: &str,
    address: &str,
    platform: Platform,
) -> Result<()> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO notification_addresses (user_id, address, platform, active, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 1, ?4, ?4) \
         ON CONFLICT(user_id, address) DO UPDATE SET platform = excluded.platform, active = 1, \
         updated_at = excluded.updated_at",
        params![user_id, address, platform.as_str(), now],
    )?;
    Ok(())
}

/// Deactivate an address. Rows are never removed. Returns false when the
/// address was unknown or already inactive.
pub fn deactivate_address(conn: &Connection, user_id: &str, address: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE notification_addresses SET active = 0, updated_at = ?3 \
         WHERE user_id = ?1 AND address = ?2 AND active = 1",
        params![user_id, address, now_ms()],
    )?;
    Ok(changed > 0)
}

pub fn active_addresses(conn: &Connection, user_id: &str) -> Result<Vec<DeviceAddress>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, address, platform, active FROM notification_addresses \
         WHERE user_id = ?1 AND active = 1 ORDER BY created_at",
    )?;
    let devices = stmt
        .query_map([user_id], row_to_device)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(devices)
}

pub fn all_addresses(conn: &Connection, user_id: &str) -> Result<Vec<DeviceAddress>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, address, platform, active FROM notification_addresses \
         WHERE user_id = ?1 ORDER BY created_at",
    )?;
    let devices = stmt
        .query_map([user_id], row_to_device)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(devices)
}
