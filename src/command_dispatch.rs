//! Purpose: Hold top-level CLI command dispatch for `latzero`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command opens the manager, does its work, and drops every handle before returning.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use latzero::api::{
    ConnectOptions, Error, ErrorKind, PoolHandle, PoolManager, PoolOptions, ReclaimConfig,
};
use serde_json::json;
use tracing::info;

use super::pool_info_json::{global_stats_json, pool_info_json, pool_stats_json};
use super::value_json::{value_from_json, value_to_json};
use super::{Command, RunOutcome, emit_json};

pub(super) fn dispatch_command(command: Command, base_dir: PathBuf) -> Result<RunOutcome, Error> {
    let manager = PoolManager::with_dir(base_dir)?;
    match command {
        Command::Create {
            name,
            initial_capacity,
            max_capacity,
            segment_size,
            idle_destroy_secs,
            default_ttl_secs,
            encrypted,
            require_auth,
            credential_env,
            kdf_rounds,
        } => {
            let mut options = PoolOptions::new()
                .encrypted(encrypted)
                .require_auth(require_auth);
            if let Some(rounds) = kdf_rounds {
                options = options.kdf_rounds(rounds);
            }
            if let Some(bytes) = segment_size {
                options = options.segment_size(bytes);
            }
            if let Some(bytes) = initial_capacity {
                options = options.initial_capacity(bytes);
            }
            if let Some(bytes) = max_capacity {
                options = options.max_capacity(bytes);
            }
            if let Some(secs) = idle_destroy_secs {
                options = options.idle_destroy(Duration::from_secs(secs));
            }
            if let Some(secs) = default_ttl_secs {
                options = options.default_ttl(Duration::from_secs(secs));
            }
            if let Some(credential) = read_credential(credential_env.as_deref())? {
                options = options.credential(credential);
            }
            let info = manager.create(&name, options)?;
            emit_json(&pool_info_json(&info));
            Ok(RunOutcome::ok())
        }
        Command::List => {
            let pools: Vec<_> = manager.list_pools()?.iter().map(pool_info_json).collect();
            emit_json(&json!({ "pools": pools }));
            Ok(RunOutcome::ok())
        }
        Command::Stats { name } => {
            match name {
                Some(name) => emit_json(&pool_stats_json(&manager.stats(&name)?)),
                None => emit_json(&global_stats_json(&manager.global_stats()?)),
            }
            Ok(RunOutcome::ok())
        }
        Command::Destroy { name } => {
            manager.destroy(&name)?;
            emit_json(&json!({ "destroyed": name }));
            Ok(RunOutcome::ok())
        }
        Command::Set {
            pool,
            key,
            value,
            ttl_secs,
            credential_env,
        } => {
            let value = parse_value(&value)?;
            let handle = connect(&manager, &pool, credential_env.as_deref(), false)?;
            let version = match ttl_secs {
                Some(secs) => handle.set_with_ttl(&key, value, Duration::from_secs(secs))?,
                None => handle.set(&key, value)?,
            };
            handle.disconnect()?;
            emit_json(&json!({ "pool": pool, "key": key, "version": version }));
            Ok(RunOutcome::ok())
        }
        Command::Get {
            pool,
            key,
            credential_env,
        } => {
            let handle = connect(&manager, &pool, credential_env.as_deref(), true)?;
            let entry = handle.get_entry(&key)?;
            handle.disconnect()?;
            match entry {
                Some(entry) => emit_json(&json!({
                    "pool": pool,
                    "key": key,
                    "found": true,
                    "value": value_to_json(&entry.value),
                    "version": entry.version,
                    "expires_at_ms": entry.expires_at_ms,
                })),
                None => emit_json(&json!({ "pool": pool, "key": key, "found": false })),
            }
            Ok(RunOutcome::ok())
        }
        Command::Del {
            pool,
            key,
            credential_env,
        } => {
            let handle = connect(&manager, &pool, credential_env.as_deref(), false)?;
            let deleted = handle.delete(&key)?;
            handle.disconnect()?;
            emit_json(&json!({ "pool": pool, "key": key, "deleted": deleted }));
            Ok(RunOutcome::ok())
        }
        Command::Keys {
            pool,
            prefix,
            credential_env,
        } => {
            let handle = connect(&manager, &pool, credential_env.as_deref(), true)?;
            let keys = handle.keys_with_prefix(&prefix)?;
            handle.disconnect()?;
            emit_json(&json!({ "pool": pool, "keys": keys }));
            Ok(RunOutcome::ok())
        }
        Command::Emit {
            pool,
            topic,
            value,
            credential_env,
        } => {
            let value = parse_value(&value)?;
            let handle = connect(&manager, &pool, credential_env.as_deref(), false)?;
            let seq = handle.emit_event(&topic, value)?;
            handle.disconnect()?;
            emit_json(&json!({ "pool": pool, "topic": topic, "seq": seq }));
            Ok(RunOutcome::ok())
        }
        Command::Call {
            pool,
            topic,
            value,
            timeout_ms,
            credential_env,
        } => {
            let value = parse_value(&value)?;
            let handle = connect(&manager, &pool, credential_env.as_deref(), false)?;
            let reply = handle.call_event(&topic, value, Duration::from_millis(timeout_ms))?;
            handle.disconnect()?;
            emit_json(&json!({ "pool": pool, "topic": topic, "reply": value_to_json(&reply) }));
            Ok(RunOutcome::ok())
        }
        Command::Cleanup { liveness_secs } => {
            let report = manager
                .reclaim_daemon(ReclaimConfig {
                    liveness_timeout: Duration::from_secs(liveness_secs),
                    ..ReclaimConfig::default()
                })
                .run_cycle()?;
            emit_json(&json!(report));
            Ok(RunOutcome::ok())
        }
        Command::Daemon {
            period_ms,
            liveness_secs,
        } => {
            let stop = Arc::new(AtomicBool::new(false));
            for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to install signal handler")
                        .with_source(err)
                })?;
            }
            let handle = manager
                .reclaim_daemon(ReclaimConfig {
                    period: Duration::from_millis(period_ms.max(1)),
                    liveness_timeout: Duration::from_secs(liveness_secs),
                })
                .spawn()?;
            info!(dir = %manager.base_dir().display(), period_ms, "reclaim daemon running");
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            handle.shutdown()?;
            emit_json(&json!({ "stopped": true }));
            Ok(RunOutcome::ok())
        }
    }
}

fn connect(
    manager: &PoolManager,
    pool: &str,
    credential_env: Option<&str>,
    readonly: bool,
) -> Result<PoolHandle, Error> {
    let mut options = ConnectOptions::new().readonly(readonly);
    if let Some(credential) = read_credential(credential_env)? {
        options = options.credential(credential);
    }
    manager.connect_with(pool, &options)
}

fn parse_value(text: &str) -> Result<latzero::api::Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("value is not valid JSON")
            .with_hint("Quote the value, e.g. '\"text\"' or '{\"a\":1}'.")
            .with_source(err)
    })?;
    value_from_json(&parsed)
}

fn read_credential(var: Option<&str>) -> Result<Option<String>, Error> {
    let Some(var) = var else {
        return Ok(None);
    };
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(Some(value)),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("credential variable {var} is unset or empty"))),
    }
}
