//! Document-level round trips: discovery writes a session and a catalog,
//! evaluations and metrics read them back and graft results onto replicas
//! of their input documents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use flowscope_driver::{
    CriticalFlowJob, Error, EvaluateJob, FindFlowsJob, MetricKind, NeighborhoodJob,
};

const EPSILON: f64 = 1e-9;

fn write_doc(dir: &Path, name: &str, value: &Value) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(value)?)?;
    Ok(path)
}

/// A linear chain `n1 - n2 - n3` where `n3` serves `10.0.0.0/24`.
fn write_network_inputs(dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let topo = write_doc(
        dir,
        "topology.json",
        &json!({"one_hop_neighbor_nodes": {
            "n1": ["n2"],
            "n2": ["n1", "n3"],
            "n3": ["n2"],
        }}),
    )?;
    let rules = write_doc(
        dir,
        "rules.json",
        &json!({"nodes": {
            "n1": {"101": [
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:1"]},
            ]},
            "n2": {"102": [
                {"table_id": 0,
                 "match": {"ip_dscp": 0, "nw_dst": "10.0.0.0/24"},
                 "actions": ["DEC_NW_TTL", "OUTPUT:2"]},
            ]},
            "n3": {"103": []},
        }}),
    )?;
    let ips = write_doc(
        dir,
        "ips.json",
        &json!({
            "n1": ["10.0.1.0/24"],
            "n2": ["10.0.2.0/24"],
            "n3": ["10.0.0.0/24"],
        }),
    )?;
    Ok((topo, rules, ips))
}

fn discover(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let (topo, rules, ips) = write_network_inputs(dir)?;
    let session = dir.join("session.json");
    let flows = dir.join("flows.json");
    FindFlowsJob::builder()
        .topo_file(topo)
        .rules_file(rules)
        .ip_file(ips)
        .session_file(session.clone())
        .flows_file(flows.clone())
        .build()
        .run()?;
    Ok((session, flows))
}

fn session_block(session_file: &Path) -> Result<Value> {
    let text = fs::read_to_string(session_file)?;
    Ok(serde_json::from_str(&text)?)
}

#[test]
fn discovery_writes_session_and_catalog() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (session, flows) = discover(dir.path())?;

    let catalog: Value = serde_json::from_str(&fs::read_to_string(&flows)?)?;
    let names: Vec<&String> = catalog.as_object().context("catalog not an object")?.keys().collect();
    assert_eq!(names, ["n1-n3-0", "n2-n3-0"]);
    assert_eq!(catalog["n1-n3-0"]["visited"], json!(["n1", "n2", "n3"]));
    assert_eq!(catalog["n1-n3-0"]["ingress_port"], json!("*"));

    let session: Value = serde_json::from_str(&fs::read_to_string(&session)?)?;
    assert!(session["topo_file"].as_str().is_some());
    assert_eq!(session["flows_file"].as_str(), flows.to_str());
    Ok(())
}

#[test]
fn minimum_hops_is_honored_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (topo, rules, ips) = write_network_inputs(dir.path())?;
    let catalog = FindFlowsJob::builder()
        .topo_file(topo)
        .rules_file(rules)
        .ip_file(ips)
        .session_file(dir.path().join("session.json"))
        .flows_file(dir.path().join("flows.json"))
        .minimum_hops(3)
        .build()
        .run()?;
    let names: Vec<&String> = catalog.keys().collect();
    assert_eq!(names, ["n1-n3-0"]);
    Ok(())
}

#[test]
fn unknown_rule_attributes_abort_discovery() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (topo, _, ips) = write_network_inputs(dir.path())?;
    let rules = write_doc(
        dir.path(),
        "bad_rules.json",
        &json!({"nodes": {
            "n1": {"101": [
                {"table_id": 0, "match": {"tcp_flags": 2}, "actions": ["OUTPUT:1"]},
            ]},
            "n2": {"102": []},
            "n3": {"103": []},
        }}),
    )?;
    let res = FindFlowsJob::builder()
        .topo_file(topo)
        .rules_file(rules)
        .ip_file(ips)
        .session_file(dir.path().join("session.json"))
        .flows_file(dir.path().join("flows.json"))
        .build()
        .run();
    assert!(matches!(res, Err(Error::Spec(_))));
    // no partial outputs on a fatal error
    assert!(!dir.path().join("flows.json").exists());
    Ok(())
}

#[test]
fn evaluation_output_replicates_input_plus_failed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (session_file, _) = discover(dir.path())?;

    let evals = write_doc(
        dir.path(),
        "evals.json",
        &json!({
            "session": session_block(&session_file)?,
            "evaluations": {
                "1": {
                    "flows": ["n1-n3-0", "n2-n3-0"],
                    "links": ["n1-n2"],
                    "note": "operator comment",
                },
                "2": {
                    "flows": ["n2-n3-0"],
                    "links": [],
                },
            },
        }),
    )?;

    let output = dir.path().join("evals_out.json");
    let doc = EvaluateJob::builder()
        .evals_file(evals)
        .output_file(output.clone())
        .build()
        .run()?;

    assert_eq!(
        doc.evaluations["1"].failed,
        Some(vec!["n1-n3-0".to_string()])
    );
    assert_eq!(doc.evaluations["2"].failed, Some(vec![]));

    let written: Value = serde_json::from_str(&fs::read_to_string(&output)?)?;
    assert_eq!(written["evaluations"]["1"]["note"], json!("operator comment"));
    assert_eq!(written["evaluations"]["1"]["failed"], json!(["n1-n3-0"]));
    Ok(())
}

#[test]
fn evaluations_are_repeatable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (session_file, _) = discover(dir.path())?;
    let evals = write_doc(
        dir.path(),
        "evals.json",
        &json!({
            "session": session_block(&session_file)?,
            "evaluations": {"1": {"flows": ["n1-n3-0"], "links": ["n2-n3"]}},
        }),
    )?;

    let run = |out: PathBuf| -> Result<String> {
        EvaluateJob::builder()
            .evals_file(evals.clone())
            .output_file(out.clone())
            .build()
            .run()?;
        Ok(fs::read_to_string(out)?)
    };
    let first = run(dir.path().join("out1.json"))?;
    let second = run(dir.path().join("out2.json"))?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn critical_link_metric_fills_results() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (session_file, _) = discover(dir.path())?;

    let evals = write_doc(
        dir.path(),
        "critical.json",
        &json!({
            "session": session_block(&session_file)?,
            "parameters": {"failure_rate": "0.01", "time": "100", "tolerance": "0.05"},
            "evaluations": {
                "n1-n3-0": {"links": ["n1-n2", "n2-n3"]},
                "n2-n3-0": {"links": ["n1-n2"]},
            },
        }),
    )?;

    let doc = CriticalFlowJob::builder()
        .evals_file(evals)
        .output_file(dir.path().join("critical_out.json"))
        .kind(MetricKind::Links)
        .build()
        .run()?;

    // both chain links doom the flow, so each Poisson term carries p_m = 1
    let e = (-1.0f64).exp();
    let result = doc.evaluations["n1-n3-0"].result.as_ref().context("no result")?;
    assert!((result.probability - 1.5 * e).abs() < EPSILON);
    assert_eq!(result.upper_bound, None);

    // a flow that never rides the candidate link cannot fail
    let result = doc.evaluations["n2-n3-0"].result.as_ref().context("no result")?;
    assert_eq!(result.probability, 0.0);
    Ok(())
}

#[test]
fn neighborhood_metric_reports_per_switch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (session_file, _) = discover(dir.path())?;

    let evals = write_doc(
        dir.path(),
        "neigh.json",
        &json!({
            "session": session_block(&session_file)?,
            "parameters": {"failure_rate": 0.01, "time": 100, "tolerance": 0.9, "hops": 1},
            "evaluations": {"switches": ["n2"]},
        }),
    )?;

    let output = dir.path().join("neigh_out.json");
    let report = NeighborhoodJob::builder()
        .evals_file(evals)
        .output_file(output.clone())
        .build()
        .run()?;

    let entry = &report.evaluations["n2"];
    assert_eq!(entry.links, ["n1-n2", "n2-n3"]);
    assert_eq!(entry.flows.len(), 2);
    let e = (-1.0f64).exp();
    assert!((entry.result.probability - 1.25 * e).abs() < EPSILON);

    let written: Value = serde_json::from_str(&fs::read_to_string(&output)?)?;
    assert!(written["evaluations"]["n2"]["result"]["probability"].is_f64());
    Ok(())
}

#[test]
fn evaluation_without_session_block_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let evals = write_doc(
        dir.path(),
        "evals.json",
        &json!({"evaluations": {"1": {"flows": [], "links": []}}}),
    )?;
    let res = EvaluateJob::builder()
        .evals_file(evals)
        .output_file(dir.path().join("out.json"))
        .build()
        .run();
    assert!(matches!(res, Err(Error::MissingSession)));
    Ok(())
}
