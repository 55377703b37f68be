//! Purpose: Pool metadata JSON serializers for CLI output.
//! Exports: `pool_info_json`, `pool_stats_json`, `global_stats_json`.
//! Role: Keep pool metadata envelope shape consistent across commands.
//! Invariants: Stable key names; timestamps are emitted both as ms and RFC 3339.

use latzero::api::{GlobalStats, PoolInfo, PoolStats};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn pool_info_json(info: &PoolInfo) -> Value {
    let mut map = Map::new();
    map.insert("name".to_string(), json!(info.name));
    map.insert("dir".to_string(), json!(info.dir.display().to_string()));
    map.insert("require_auth".to_string(), json!(info.require_auth));
    map.insert("encrypted".to_string(), json!(info.encrypted));
    map.insert("client_count".to_string(), json!(info.client_count));
    map.insert("created".to_string(), time_json(info.created_ms));
    map.insert("last_heartbeat".to_string(), time_json(info.last_heartbeat_ms));
    if let Some(idle_since) = info.idle_since_ms {
        map.insert("idle_since".to_string(), time_json(idle_since));
    }
    map.insert("idle_destroy_ms".to_string(), json!(info.idle_destroy_ms));
    if let Some(ttl) = info.default_ttl_ms {
        map.insert("default_ttl_ms".to_string(), json!(ttl));
    }
    if let Some(rounds) = info.kdf_rounds {
        map.insert("kdf_rounds".to_string(), json!(rounds));
    }
    map.insert(
        "capacity".to_string(),
        json!({
            "bytes": info.capacity,
            "max_bytes": info.max_capacity,
            "segment_size": info.segment_size,
            "segments": info.segment_count,
        }),
    );
    Value::Object(map)
}

pub(crate) fn pool_stats_json(stats: &PoolStats) -> Value {
    let mut value = pool_info_json(&stats.info);
    if let Value::Object(map) = &mut value {
        map.insert("entry_count".to_string(), json!(stats.entry_count));
        map.insert(
            "usage".to_string(),
            json!({
                "used_bytes": stats.used_bytes,
                "dead_bytes": stats.dead_bytes,
                "used_percent": (stats.utilization * 10_000.0).round() / 100.0,
            }),
        );
    }
    value
}

pub(crate) fn global_stats_json(stats: &GlobalStats) -> Value {
    json!({
        "pool_count": stats.pool_count,
        "client_count": stats.client_count,
        "total_capacity": stats.total_capacity,
        "pool_slots": stats.pool_slots,
        "client_slots": stats.client_slots,
    })
}

fn time_json(ms: u64) -> Value {
    let rfc3339 = OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok());
    json!({ "ms": ms, "rfc3339": rfc3339 })
}
