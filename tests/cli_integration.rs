// CLI integration tests for the pool lifecycle and error envelopes.
use std::process::Command;

use latzero::api::{PoolManager, PoolOptions, Value as PoolValue};
use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_latzero");
    Command::new(exe)
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

#[test]
fn create_set_get_del_destroy_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let create = cmd()
        .args(["--dir", dir, "create", "testpool", "--max-capacity", "8388608"])
        .output()
        .expect("create");
    assert!(create.status.success());
    let created = parse_json_line(&create.stdout);
    assert_eq!(created["name"], "testpool");
    assert_eq!(created["capacity"]["max_bytes"], 8_388_608);
    assert_eq!(created["client_count"], 0);

    let set = cmd()
        .args(["--dir", dir, "set", "testpool", "user:1", "{\"name\":\"ann\",\"age\":31}"])
        .output()
        .expect("set");
    assert!(set.status.success());
    let first_version = parse_json_line(&set.stdout)["version"].as_u64().expect("version");

    let get = cmd()
        .args(["--dir", dir, "get", "testpool", "user:1"])
        .output()
        .expect("get");
    assert!(get.status.success());
    let got = parse_json_line(&get.stdout);
    assert_eq!(got["found"], true);
    assert_eq!(got["value"]["name"], "ann");
    assert_eq!(got["value"]["age"], 31);
    assert_eq!(got["version"].as_u64(), Some(first_version));

    let list = cmd().args(["--dir", dir, "list"]).output().expect("list");
    let listed = parse_json_line(&list.stdout);
    assert_eq!(listed["pools"][0]["name"], "testpool");

    let del = cmd()
        .args(["--dir", dir, "del", "testpool", "user:1"])
        .output()
        .expect("del");
    assert_eq!(parse_json_line(&del.stdout)["deleted"], true);

    let get = cmd()
        .args(["--dir", dir, "get", "testpool", "user:1"])
        .output()
        .expect("get");
    assert_eq!(parse_json_line(&get.stdout)["found"], false);

    let destroy = cmd()
        .args(["--dir", dir, "destroy", "testpool"])
        .output()
        .expect("destroy");
    assert!(destroy.status.success());

    let stats = cmd()
        .args(["--dir", dir, "stats"])
        .output()
        .expect("stats");
    assert_eq!(parse_json_line(&stats.stdout)["pool_count"], 0);
}

#[test]
fn errors_are_json_with_stable_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let missing = cmd()
        .args(["--dir", dir, "get", "nope", "k"])
        .output()
        .expect("get");
    assert_eq!(missing.status.code(), Some(3));
    let err = parse_json_line(&missing.stderr);
    assert_eq!(err["error"]["kind"], "PoolNotFound");
    assert_eq!(err["error"]["pool"], "nope");

    assert!(cmd()
        .args(["--dir", dir, "create", "dup"])
        .output()
        .expect("create")
        .status
        .success());
    let dup = cmd()
        .args(["--dir", dir, "create", "dup"])
        .output()
        .expect("create again");
    assert_eq!(dup.status.code(), Some(4));
    assert_eq!(parse_json_line(&dup.stderr)["error"]["kind"], "PoolAlreadyExists");

    let bad_json = cmd()
        .args(["--dir", dir, "set", "dup", "k", "{not json"])
        .output()
        .expect("set");
    assert_eq!(bad_json.status.code(), Some(2));
    assert_eq!(parse_json_line(&bad_json.stderr)["error"]["kind"], "Usage");
}

#[test]
fn protected_pool_needs_credential_from_env() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    let create = cmd()
        .env("LZ_TEST_SECRET", "hunter2")
        .args([
            "--dir",
            dir,
            "create",
            "vault",
            "--encrypted",
            "--require-auth",
            "--credential-env",
            "LZ_TEST_SECRET",
            "--kdf-rounds",
            "10000",
        ])
        .output()
        .expect("create");
    assert!(create.status.success());
    let created = parse_json_line(&create.stdout);
    assert_eq!(created["encrypted"], true);
    assert_eq!(created["kdf_rounds"], 10_000);

    let anonymous = cmd()
        .args(["--dir", dir, "set", "vault", "k", "1"])
        .output()
        .expect("set");
    assert_eq!(anonymous.status.code(), Some(6));

    let wrong = cmd()
        .env("LZ_TEST_SECRET", "wrong")
        .args(["--dir", dir, "set", "vault", "k", "1", "--credential-env", "LZ_TEST_SECRET"])
        .output()
        .expect("set");
    assert_eq!(parse_json_line(&wrong.stderr)["error"]["kind"], "AuthFailure");

    let set = cmd()
        .env("LZ_TEST_SECRET", "hunter2")
        .args(["--dir", dir, "set", "vault", "k", "41", "--credential-env", "LZ_TEST_SECRET"])
        .output()
        .expect("set");
    assert!(set.status.success());

    let get = cmd()
        .env("LZ_TEST_SECRET", "hunter2")
        .args(["--dir", dir, "get", "vault", "k", "--credential-env", "LZ_TEST_SECRET"])
        .output()
        .expect("get");
    assert_eq!(parse_json_line(&get.stdout)["value"], 41);
}

#[test]
fn cleanup_destroys_idle_pools() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");

    assert!(cmd()
        .args(["--dir", dir, "create", "shortlived", "--idle-destroy-secs", "0"])
        .output()
        .expect("create")
        .status
        .success());

    let cleanup = cmd().args(["--dir", dir, "cleanup"]).output().expect("cleanup");
    assert!(cleanup.status.success());
    assert_eq!(parse_json_line(&cleanup.stdout)["destroyed_pools"], 1);

    let list = cmd().args(["--dir", dir, "list"]).output().expect("list");
    assert_eq!(
        parse_json_line(&list.stdout)["pools"].as_array().map(Vec::len),
        Some(0)
    );
}

#[test]
fn call_reaches_a_listener_in_another_process() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().expect("utf8 path");
    let manager = PoolManager::with_dir(temp.path()).expect("manager");
    manager.create("rpc", PoolOptions::new()).expect("create");
    let server = manager.connect("rpc").expect("connect");
    server.on_event("double", |value| match value {
        PoolValue::Int(n) => Ok(PoolValue::Int(n * 2)),
        other => Err(format!("cannot double {other:?}")),
    });
    server.listen().expect("listen");

    let call = cmd()
        .args(["--dir", dir, "call", "rpc", "double", "21"])
        .output()
        .expect("call");
    assert!(call.status.success(), "{}", String::from_utf8_lossy(&call.stderr));
    assert_eq!(parse_json_line(&call.stdout)["reply"], 42);

    let failed = cmd()
        .args(["--dir", dir, "call", "rpc", "double", "\"x\""])
        .output()
        .expect("call");
    assert_eq!(parse_json_line(&failed.stderr)["error"]["kind"], "HandlerFailed");
    assert_eq!(failed.status.code(), Some(16));

    let unanswered = cmd()
        .args(["--dir", dir, "call", "rpc", "nobody", "1", "--timeout-ms", "50"])
        .output()
        .expect("call");
    assert_eq!(unanswered.status.code(), Some(15));

    let emit = cmd()
        .args(["--dir", dir, "emit", "rpc", "note", "{\"a\":1}"])
        .output()
        .expect("emit");
    assert!(emit.status.success());
    assert!(parse_json_line(&emit.stdout)["seq"].is_u64());
}
