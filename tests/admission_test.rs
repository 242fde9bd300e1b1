// Admission pipeline behavior end to end: sliding-window rate limiting,
// maintenance blocking with buffered recovery, scope resolution and
// hierarchy ceilings, all through the public engine surface.

use serde_json::json;
use std::sync::Arc;
use tollgate::clock::{Clock, ManualClock};
use tollgate::error::rpc_code;
use tollgate::keys::CreateKeyOptions;
use tollgate::proxy::ProxyEngine;
use tollgate::rpc::backend::FnBackend;
use tollgate::rpc::RpcRequest;
use tollgate::ProxyConfig;

fn engine_with(config: ProxyConfig) -> (Arc<ProxyEngine>, Arc<ManualClock>) {
    let clock = ManualClock::shared(1_700_000_000_000);
    let backend = Arc::new(FnBackend::new(|_: &RpcRequest| Ok(json!({"ok": true}))));
    let engine = ProxyEngine::new(config, clock.clone(), backend, None);
    (engine, clock)
}

fn call(tool: &str, marker: u64) -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": {"name": tool, "arguments": {"marker": marker}},
        "id": marker
    })
}

#[tokio::test]
async fn sliding_window_allows_again_after_window_passes() {
    // Limit 3 per second over 6 sub-windows: three calls pass, the fourth
    // at +500ms is rejected with a bounded retry hint, and traffic flows
    // again at +1100ms.
    let mut config = ProxyConfig::default();
    config.rate_limit.limit = 3;
    config.rate_limit.window_ms = 1_000;
    config.rate_limit.sub_window_count = 6;
    let (engine, clock) = engine_with(config);
    let key = engine.keys.create_key("k", 100, CreateKeyOptions::default()).key;

    for i in 0..3 {
        assert!(engine.handle_rpc(&key, &call("search", i)).await.is_success());
    }

    clock.advance(500);
    let denied = engine.handle_rpc(&key, &call("search", 99)).await;
    let error = denied.error.unwrap();
    assert_eq!(error.code, rpc_code::SERVER_ERROR);
    let retry = error.data.unwrap()["retry_after_ms"].as_u64().unwrap();
    assert!(retry > 0 && retry <= 1_000);

    clock.advance(600);
    assert!(engine.handle_rpc(&key, &call("search", 100)).await.is_success());
}

#[tokio::test]
async fn maintenance_blocks_then_recovers_without_intervention() {
    let (engine, clock) = engine_with(ProxyConfig::default());
    let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;

    engine.maintenance.start_now("database upgrade", 60_000, true).unwrap();
    assert!(!engine.maintenance.get_status().operational);

    let blocked = engine.handle_rpc(&key, &call("search", 1)).await;
    assert!(blocked.error.unwrap().message.contains("database upgrade"));
    assert_eq!(engine.keys.balance(&key), Some(10));

    clock.advance(60_000);
    assert!(engine.maintenance.get_status().operational);
    assert!(engine.handle_rpc(&key, &call("search", 2)).await.is_success());
}

#[tokio::test]
async fn buffered_requests_replay_after_drain() {
    let (engine, clock) = engine_with(ProxyConfig::default());
    let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;

    engine.maintenance.start_now("upgrade", 30_000, true).unwrap();
    engine.buffer.start_buffering().unwrap();

    for i in 0..3 {
        let response = engine.handle_rpc(&key, &call("search", i)).await;
        assert_eq!(response.error.unwrap().data.unwrap()["buffered"], true);
    }
    assert_eq!(engine.buffer.len(), 3);
    assert_eq!(engine.keys.balance(&key), Some(10));

    clock.advance(30_000);
    let results = engine.drain_buffer().await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, r)| r.is_success()));
    assert_eq!(engine.keys.balance(&key), Some(7));
}

#[tokio::test]
async fn scope_disjunction_and_wildcard() {
    let (engine, _) = engine_with(ProxyConfig::default());
    engine.scopes.define_scope("admin", "", vec!["ops".to_string()]).unwrap();
    engine.scopes.set_tool_scopes("deploy", vec!["ops".to_string(), "release".to_string()]);

    // Unscoped key is denied.
    let plain = engine.keys.create_key("plain", 10, CreateKeyOptions::default()).key;
    assert!(engine.handle_rpc(&plain, &call("deploy", 1)).await.error.is_some());

    // A key holding one of the required scopes (via inclusion) passes.
    let op = engine.keys.create_key("op", 10, CreateKeyOptions::default()).key;
    engine.scopes.grant(&op, "admin");
    assert!(engine.handle_rpc(&op, &call("deploy", 2)).await.is_success());

    // Wildcard passes everything.
    let root = engine.keys.create_key("root", 10, CreateKeyOptions::default()).key;
    engine.scopes.grant(&root, "*");
    assert!(engine.handle_rpc(&root, &call("deploy", 3)).await.is_success());
}

#[tokio::test]
async fn temporary_grant_expires_mid_session() {
    let (engine, clock) = engine_with(ProxyConfig::default());
    engine.scopes.set_tool_scopes("deploy", vec!["ops".to_string()]);
    let key = engine.keys.create_key("temp", 10, CreateKeyOptions::default()).key;
    engine
        .scopes
        .grant_temporary(&key, "ops", clock.now_ms() + 10_000)
        .unwrap();

    assert!(engine.handle_rpc(&key, &call("deploy", 1)).await.is_success());
    clock.advance(10_000);
    assert!(engine.handle_rpc(&key, &call("deploy", 2)).await.error.is_some());
}

#[tokio::test]
async fn hierarchy_ceiling_gates_child_spend() {
    let mut config = ProxyConfig::default();
    config.tool_costs.insert("heavy".to_string(), 40);
    let (engine, _) = engine_with(config);

    let parent = engine.keys.create_key("parent", 1_000, CreateKeyOptions::default()).key;
    let child = engine.keys.create_key("child", 1_000, CreateKeyOptions::default()).key;
    engine.hierarchy.create_relation(&child, &parent, 100, false, false).unwrap();

    // 40 + 40 fits under the 100 ceiling, the third call does not.
    assert!(engine.handle_rpc(&child, &call("heavy", 1)).await.is_success());
    assert!(engine.handle_rpc(&child, &call("heavy", 2)).await.is_success());
    let denied = engine.handle_rpc(&child, &call("heavy", 3)).await;
    assert!(denied.error.unwrap().message.contains("ceiling"));

    let relation = engine.hierarchy.get_relation(&child).unwrap();
    assert_eq!(relation.credits_used, 80);
}

#[tokio::test]
async fn hierarchy_has_no_cycles() {
    let (engine, _) = engine_with(ProxyConfig::default());
    engine.hierarchy.create_relation("b", "a", 0, false, false).unwrap();
    engine.hierarchy.create_relation("c", "b", 0, false, false).unwrap();
    assert!(engine.hierarchy.create_relation("a", "c", 0, false, false).is_err());

    let ancestors = engine.hierarchy.get_ancestors("c");
    assert_eq!(ancestors, vec!["b", "a"]);
    assert!(!ancestors.contains(&"c".to_string()));
}

#[tokio::test]
async fn revoked_and_expired_keys_are_rejected() {
    let (engine, clock) = engine_with(ProxyConfig::default());

    let revoked = engine.keys.create_key("revoked", 10, CreateKeyOptions::default()).key;
    engine.keys.revoke_key(&revoked).unwrap();
    assert!(engine.handle_rpc(&revoked, &call("search", 1)).await.error.is_some());

    let expiring = engine
        .keys
        .create_key(
            "expiring",
            10,
            CreateKeyOptions {
                expires_at: Some(clock.now_ms() + 5_000),
                ..Default::default()
            },
        )
        .key;
    assert!(engine.handle_rpc(&expiring, &call("search", 2)).await.is_success());
    clock.advance(5_000);
    assert!(engine.handle_rpc(&expiring, &call("search", 3)).await.error.is_some());
}

#[tokio::test]
async fn group_rate_limit_overrides_default() {
    let mut config = ProxyConfig::default();
    config.rate_limit.limit = 100;
    let (engine, _) = engine_with(config);
    let key = engine.keys.create_key("grouped", 100, CreateKeyOptions::default()).key;

    let group = engine.groups.create_group("trial", "", Some(1), vec![], vec![]);
    engine.groups.assign_key(&key, &group.id).unwrap();

    assert!(engine.handle_rpc(&key, &call("search", 1)).await.is_success());
    let denied = engine.handle_rpc(&key, &call("search", 2)).await;
    assert_eq!(denied.error.unwrap().code, rpc_code::SERVER_ERROR);
}
