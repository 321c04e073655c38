//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use std::path::Path;
use std::sync::Arc;

use channel_compiler::{
    bundle::{read_bundle, verify_bundle},
    canonical_json,
    merkle::verify_proof,
    pipeline::CompileStage,
    policy::OrgPolicy,
    sources::LocalSource,
    CompileRequest, CompileResult, Compiler, CompilerConfig, PolicyLinter, PolicyRegistry, TemplateCache,
    TemplateResolver,
};
use regex::Regex;
use serde_json::{json, Value};

fn write_nexon(root: &Path, id: &str, version: &str, doc: Value) {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.json", version)), doc.to_string()).unwrap();
}

fn nexon_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_nexon(
        dir.path(),
        "http-request",
        "1.0.0",
        json!({
            "manifest": {
                "id": "http-request", "version": "1.0.0", "title": "HTTP Request",
                "capabilities": {"network": {"httpOut": true}},
                "parameters": {
                    "url": {"type": "string", "required": true},
                    "token": {"type": "secret"}
                },
                "outlets": ["success", "failure"]
            },
            "template": [
                {"id": "req", "type": "http request", "url": "{{params.url}}",
                 "token": "{{params.token}}", "wires": [["out"]]},
                {"id": "out", "type": "change", "name": "{{stage.title}}"}
            ]
        }),
    );
    dir
}

fn compiler_with(root: &Path, registry: PolicyRegistry) -> Compiler {
    let resolver = TemplateResolver::new(
        Arc::new(TemplateCache::default()),
        vec![Box::new(LocalSource::new(root))],
    );
    Compiler::new(
        CompilerConfig::default(),
        Arc::new(resolver),
        Arc::new(PolicyLinter::new(registry)),
    )
}

fn compiler(root: &Path) -> Compiler {
    compiler_with(root, PolicyRegistry::new())
}

fn request(channel: Value) -> CompileRequest {
    CompileRequest {
        channel,
        org_id: "acme".to_string(),
        user_id: "tester".to_string(),
        acknowledged_violations: vec![],
    }
}

fn orders_channel() -> Value {
    json!({
        "channelId": "orders",
        "title": "Orders",
        "version": "1.2.0",
        "stages": [
            {"id": "fetch", "nexonId": "http-request", "nexonVersion": "1.0.0",
             "params": {"url": "https://shop/api", "token": {"$secret": "vault://shop/token"}}},
            {"id": "notify", "nexonId": "http-request", "nexonVersion": "1.0.0",
             "params": {"url": {"$expr": "env.GJ_CHANNEL_ID"}, "token": {"$secret": "vault://shop/token"}}}
        ],
        "edges": [
            {"id": "e1", "from": {"stageId": "fetch", "outlet": "success"}, "to": {"stageId": "notify"}}
        ]
    })
}

fn warning_codes(result: &CompileResult) -> Vec<&str> {
    result.warnings.iter().map(|w| w.code.as_str()).collect()
}

#[tokio::test]
async fn invariant_compile_calls_validate() {
    let dir = nexon_dir();
    let c = compiler(dir.path());

    // Stage without a nexonId is structurally invalid
    let result = c
        .compile(request(json!({"channelId": "x", "stages": [{"id": "a"}]})))
        .await;

    assert!(!result.success);
    assert!(!result.validation.valid);
    assert!(result.bundle.is_none());
    assert!(result.policy_lint.is_none());
    assert!(result.errors.iter().all(|e| e.stage == CompileStage::Validate));
}

#[cfg(feature = "test-hooks")]
#[tokio::test]
async fn invariant_validation_counter_increments() {
    use channel_compiler::pipeline::{get_validation_call_count, reset_validation_call_count};

    let dir = nexon_dir();
    let c = compiler(dir.path());
    reset_validation_call_count();
    c.compile(request(orders_channel())).await;
    assert!(get_validation_call_count() >= 1);
}

#[tokio::test]
async fn invariant_identical_channels_hash_identically() {
    let dir = nexon_dir();
    let c = compiler(dir.path());

    let a = c.compile(request(orders_channel())).await;
    let b = c.compile(request(orders_channel())).await;
    assert!(a.success, "{:?}", a.errors);
    assert!(b.success, "{:?}", b.errors);
    assert_ne!(a.build_id, b.build_id);

    let (ha, hb) = (a.hashes.unwrap(), b.hashes.unwrap());
    assert_eq!(ha.artifacts, hb.artifacts);
    assert_eq!(ha.merkle_root, hb.merkle_root);
}

#[tokio::test]
async fn invariant_secrets_never_exposed() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let result = c.compile(request(orders_channel())).await;
    assert!(result.success, "{:?}", result.errors);

    let contents = read_bundle(result.bundle.as_ref().unwrap()).unwrap();
    let artifacts = contents.artifacts;
    assert!(!artifacts.flows_json.to_string().contains("vault://"));
    assert!(!artifacts.settings.to_string().contains("vault://"));
    assert!(!artifacts.manifest.to_string().contains("vault://"));

    // Both stages rendered from the template, not placeholders
    assert!(!warning_codes(&result).iter().any(|c| c.starts_with("generate.")));
    let requests: Vec<&Value> = artifacts
        .flows_json
        .as_array()
        .unwrap()
        .iter()
        .filter(|n| n["type"] == "http request")
        .collect();
    assert_eq!(requests.len(), 2);
    for req in &requests {
        assert_eq!(req["token"], "${GJ_SECRET_FETCH_TOKEN}");
    }

    let env_re = Regex::new(r"^GJ_SECRET_[A-Z0-9_]+$").unwrap();
    let creds = artifacts.credentials_map["credentials"].as_object().unwrap();
    assert_eq!(creds.len(), 1);
    for entry in creds.values() {
        assert!(env_re.is_match(entry["env"].as_str().unwrap()));
    }
    assert_eq!(
        artifacts.credentials_map["aliases"]["notify.token"],
        "GJ_SECRET_FETCH_TOKEN"
    );
    assert!(artifacts.flows_json.to_string().contains("${GJ_SECRET_FETCH_TOKEN}"));
}

#[tokio::test]
async fn invariant_graph_issues_warn_but_compile() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let channel = json!({
        "channelId": "loop",
        "stages": [
            {"id": "a", "nexonId": "function"},
            {"id": "b", "nexonId": "function"},
            {"id": "lonely", "nexonId": "function"}
        ],
        "edges": [
            {"id": "ab", "from": {"stageId": "a"}, "to": {"stageId": "b"}},
            {"id": "ba", "from": {"stageId": "b"}, "to": {"stageId": "a"}}
        ]
    });

    let result = c.compile(request(channel)).await;
    assert!(result.success, "{:?}", result.errors);
    let codes = warning_codes(&result);
    assert!(codes.contains(&"stage.orphan"));
    assert!(codes.contains(&"graph.cycle"));
    assert!(result.validation.warnings.iter().any(|w| w.message.contains("a -> b")));
}

#[tokio::test]
async fn invariant_three_stage_cycle_reports_path() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let channel = json!({
        "channelId": "ring",
        "stages": [
            {"id": "a", "nexonId": "function"},
            {"id": "b", "nexonId": "function"},
            {"id": "c", "nexonId": "function"}
        ],
        "edges": [
            {"id": "ab", "from": {"stageId": "a"}, "to": {"stageId": "b"}},
            {"id": "bc", "from": {"stageId": "b"}, "to": {"stageId": "c"}},
            {"id": "ca", "from": {"stageId": "c"}, "to": {"stageId": "a"}}
        ]
    });

    let result = c.compile(request(channel)).await;
    assert!(result.success, "{:?}", result.errors);
    let cycles: Vec<_> = result
        .validation
        .warnings
        .iter()
        .filter(|w| w.code == "graph.cycle")
        .collect();
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].message.contains("a -> b -> c -> a"), "{}", cycles[0].message);
}

#[tokio::test]
async fn invariant_out_of_range_outlet_is_skipped() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let mut channel = orders_channel();
    channel["edges"] = json!([
        {"id": "far", "from": {"stageId": "fetch", "outlet": 4294967295u64}, "to": {"stageId": "notify"}}
    ]);

    let result = c.compile(request(channel)).await;
    assert!(result.validation.valid);
    assert!(result.success, "{:?}", result.errors);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.code == "generate.wiring" && w.message.contains("out of range")));
    for node in result.artifacts.unwrap().flows_json.as_array().unwrap() {
        if let Some(wires) = node["wires"].as_array() {
            assert!(wires.len() <= 2);
        }
    }
}

#[tokio::test]
async fn invariant_deep_expression_rejected_in_validation() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let src = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
    let mut channel = orders_channel();
    channel["stages"][0]["params"]["url"] = json!({"$expr": src});

    let result = c.compile(request(channel)).await;
    assert!(!result.success);
    assert!(!result.validation.valid);
    assert!(result.bundle.is_none());
    assert!(result
        .errors
        .iter()
        .any(|e| e.stage == CompileStage::Validate && e.message.contains("nests deeper")));
}

#[tokio::test]
async fn invariant_policy_gates_unless_acknowledged() {
    let dir = nexon_dir();
    let mut registry = PolicyRegistry::new();
    let policy: OrgPolicy = serde_json::from_value(json!({
        "orgId": "acme",
        "internetEgress": {"http": "deny"},
        "requireDocumentation": "allow"
    }))
    .unwrap();
    registry.register(policy);
    let c = compiler_with(dir.path(), registry);

    let mut channel = orders_channel();
    channel["security"] = json!({"allowInternetHttpOut": true});

    let blocked = c.compile(request(channel.clone())).await;
    assert!(!blocked.success);
    assert!(blocked.bundle.is_none());
    let lint = blocked.policy_lint.as_ref().unwrap();
    assert!(!lint.passed);
    assert!(blocked
        .errors
        .iter()
        .any(|e| e.stage == CompileStage::Lint && e.code == "security.internet-http-out"));

    let mut acked = request(channel.clone());
    acked.acknowledged_violations = vec!["security.internet-http-out".to_string()];
    let passed = c.compile(acked).await;
    assert!(passed.success, "{:?}", passed.errors);
    assert_eq!(passed.policy_lint.unwrap().summary.acknowledged, 1);

    // Other orgs fall back to the default policy, where http egress only warns
    let mut other = request(channel);
    other.org_id = "globex".to_string();
    let warned = c.compile(other).await;
    assert!(warned.success, "{:?}", warned.errors);
    assert!(warning_codes(&warned).contains(&"security.internet-http-out"));
}

#[tokio::test]
async fn invariant_duplicate_edges_wire_once() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let mut channel = orders_channel();
    channel["edges"] = json!([
        {"id": "e1", "from": {"stageId": "fetch", "outlet": "success"}, "to": {"stageId": "notify"}},
        {"id": "e2", "from": {"stageId": "fetch", "outlet": 0}, "to": {"stageId": "notify"}}
    ]);

    let result = c.compile(request(channel)).await;
    assert!(result.success, "{:?}", result.errors);
    let flows = result.artifacts.unwrap().flows_json;
    let out = flows
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["type"] == "change" && n["name"] == "fetch")
        .cloned()
        .unwrap();
    let wires = out["wires"].as_array().unwrap();
    assert_eq!(wires[0].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invariant_minimal_channel_compiles() {
    let dir = tempfile::tempdir().unwrap();
    let c = compiler(dir.path());

    let result = c
        .compile(request(json!({"stages": [{"id": "only", "nexonId": "function"}]})))
        .await;
    assert!(result.success, "{:?}", result.errors);

    let codes = warning_codes(&result);
    assert!(codes.contains(&"channel.id-defaulted"));
    assert!(codes.contains(&"generate.template"));

    let artifacts = result.artifacts.unwrap();
    let flows = artifacts.flows_json.as_array().unwrap();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[0]["type"], "tab");
    assert_eq!(flows[1]["type"], "function");
}

#[tokio::test]
async fn invariant_merkle_proofs_verify() {
    let dir = nexon_dir();
    let c = compiler(dir.path());
    let result = c.compile(request(orders_channel())).await;
    assert!(result.success, "{:?}", result.errors);

    let hashes = result.hashes.clone().unwrap();
    assert_eq!(hashes.proofs.len(), 4);
    for proof in &hashes.proofs {
        assert!(verify_proof(&proof.leaf, proof, &hashes.merkle_root));
    }

    let bytes = result.bundle.unwrap();
    let report = verify_bundle(&bytes, Some(&hashes)).unwrap();
    assert!(report.valid, "{:?}", report.mismatches);
    assert_eq!(report.merkle_root, hashes.merkle_root);
}

#[test]
fn invariant_canonical_json_deterministic() {
    let obj1 = json!({"z": 1, "a": 2, "m": {"b": 1, "a": 2}});
    let obj2 = json!({"a": 2, "m": {"a": 2, "b": 1}, "z": 1});

    // Must be identical despite different input ordering
    assert_eq!(canonical_json(&obj1).unwrap(), canonical_json(&obj2).unwrap());
}
