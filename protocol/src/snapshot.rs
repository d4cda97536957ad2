//! The durable config snapshot: rewritten atomically after every mutating
//! operation and read once at bootstrap. The serialized field names are a
//! compatibility surface; do not rename them.

use serde::{Deserialize, Serialize};

/// Connection parameters for the backing time-series store.
///
/// SQL statements travel over the store's HTTP exec endpoint; buffered row
/// inserts travel over its influx-line TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbParams {
    pub host: String,
    pub port_sql: u16,
    pub port_influx: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            host: "questdb".to_string(),
            port_sql: 9000,
            port_influx: 9009,
            user: "admin".to_string(),
            password: "quest".to_string(),
            database: "qdb".to_string(),
        }
    }
}

/// Serializable projection of the control plane's durable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub policy_negate: bool,
    pub db: DbParams,
    pub last_timestamp: Option<String>,
    pub last_sequence_index: u64,
}

impl ConfigSnapshot {
    pub fn with_db(db: DbParams) -> Self {
        Self {
            policy_negate: false,
            db,
            last_timestamp: None,
            last_sequence_index: 0,
        }
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::with_db(DbParams::default())
    }
}
