use anyhow::Result;
use std::collections::HashSet;

use crate::db::{now_ms, DbPool};
use crate::messages;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Capability check answered by the subscription side of the product.
pub trait Entitlements: Send + Sync {
    fn can_send(&self, user_id: &str) -> Result<bool>;
}

/// Everyone may send.
#[derive(Clone, Default)]
pub struct Unlimited;

impl Entitlements for Unlimited {
    fn can_send(&self, _user_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Allows `limit` messages per trailing 24 hours, except for exempt users.
pub struct DailyQuota {
    pool: DbPool,
    limit: u32,
    exempt: HashSet<String>,
}

impl DailyQuota {
    pub fn new(pool: DbPool, limit: u32, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            pool,
            limit,
            exempt: exempt.into_iter().collect(),
        }
    }
}

impl Entitlements for DailyQuota {
    fn can_send(&self, user_id: &str) -> Result<bool> {
        if self.exempt.contains(user_id) {
            return Ok(true);
        }
        let conn = self.pool.get()?;
        let sent = messages::count_sent_since(&conn, user_id, now_ms() - DAY_MS)?;
        Ok(sent < self.limit)
    }
}
