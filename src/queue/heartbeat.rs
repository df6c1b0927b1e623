//! Instance heartbeat & discovery
//!
//! Each process refreshes `magpie:instance:<id>` every 15 s with a 30 s TTL.
//! Instance discovery (worker sizing, rotator placement) scans that prefix.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::models::ActiveInstance;

pub const INSTANCE_KEY_PREFIX: &str = "magpie:instance:";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const HEARTBEAT_TTL_SECS: u64 = 30;

/// Periodic heartbeat announcing this instance and its port lease
pub struct InstanceHeartbeat {
    conn: ConnectionManager,
    payload: ActiveInstance,
}

impl InstanceHeartbeat {
    pub fn new(conn: ConnectionManager, config: &Config) -> Self {
        Self {
            conn,
            payload: ActiveInstance {
                id: config.instance.id.clone(),
                name: config.instance.name.clone(),
                region: config.instance.region.clone(),
                port_start: config.rotator.port_start,
                port_end: config.rotator.port_end,
            },
        }
    }

    /// Run the heartbeat loop (call in a spawned task)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let key = format!("{}{}", INSTANCE_KEY_PREFIX, self.payload.id);
        let value = match serde_json::to_string(&self.payload) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize instance heartbeat: {}", e);
                return;
            }
        };

        info!(instance_id = %self.payload.id, "Starting instance heartbeat");

        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self
                        .conn
                        .set_ex::<_, _, ()>(&key, &value, HEARTBEAT_TTL_SECS)
                        .await
                    {
                        error!(key = %key, "Failed to update instance heartbeat: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Instance heartbeat shutting down");
                        return;
                    }
                }
            }
        }
    }
}

/// Number of instances with a live heartbeat
pub async fn count_active_instances(conn: &mut ConnectionManager) -> Result<usize> {
    let keys: Vec<String> = conn.keys(format!("{}*", INSTANCE_KEY_PREFIX)).await?;
    Ok(keys.len())
}

/// All instances with a live heartbeat, payloads repaired where partial
pub async fn list_active_instances(
    conn: &mut ConnectionManager,
    fallback_port_start: u16,
    fallback_port_end: u16,
) -> Result<Vec<ActiveInstance>> {
    let keys: Vec<String> = conn.keys(format!("{}*", INSTANCE_KEY_PREFIX)).await?;
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let values: Vec<Option<String>> = conn.mget(&keys).await?;

    let mut instances = Vec::with_capacity(keys.len());
    for (key, value) in keys.iter().zip(values) {
        let id_from_key = key.trim_start_matches(INSTANCE_KEY_PREFIX).to_string();
        if id_from_key.is_empty() {
            continue;
        }

        let parsed = value
            .as_deref()
            .and_then(|raw| serde_json::from_str::<ActiveInstance>(raw).ok());

        let instance = match parsed {
            Some(mut payload) => {
                if payload.id.trim().is_empty() {
                    payload.id = id_from_key;
                }
                payload
            }
            None => ActiveInstance {
                id: id_from_key,
                name: String::new(),
                region: String::new(),
                port_start: 0,
                port_end: 0,
            },
        };

        instances.push(instance.normalized(fallback_port_start, fallback_port_end));
    }

    Ok(instances)
}
