use std::fs;
use std::process::Command;

use serde_json::Value;

const TRIANGLE_WITH_TAIL: &str = r#"{
    "nodes": [
        {"x": 0.10, "y": 0.10},
        {"x": 0.60, "y": 0.20},
        {"x": 0.30, "y": 0.70},
        {},
        {}
    ],
    "edges": [
        {"source": 0, "target": 1},
        {"source": 1, "target": 2},
        {"source": 2, "target": 0},
        {"source": 2, "target": 3},
        {"source": 3, "target": 4}
    ]
}"#;

#[test]
fn lays_out_graph_on_the_host() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let input = dir.path().join("graph.json");
    let output = dir.path().join("layout.json");
    fs::write(&input, TRIANGLE_WITH_TAIL).expect("Failed to write input");

    let result = Command::new(env!("CARGO_BIN_EXE_forcegraph"))
        .args([
            "layout",
            "--input",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--iterations",
            "60",
            "--ideal-length",
            "0.1",
            "--cpu",
        ])
        .output()
        .expect("Failed to execute forcegraph");

    assert!(
        result.status.success(),
        "forcegraph exited with error: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(
        stdout.contains("Completed in 60 iterations"),
        "Missing summary in: {}",
        stdout
    );

    let text = fs::read_to_string(&output).expect("Failed to read output");
    let graph: Value = serde_json::from_str(&text).expect("Output is not JSON");

    let nodes = graph["nodes"].as_array().expect("Missing nodes");
    assert_eq!(nodes.len(), 5);
    for node in nodes {
        let x = node["x"].as_f64().expect("Missing x");
        let y = node["y"].as_f64().expect("Missing y");
        assert!((-7.0..=8.0).contains(&x) && (-7.0..=8.0).contains(&y));
    }

    let edges = graph["edges"].as_array().expect("Missing edges");
    assert_eq!(edges.len(), 5);
    assert_eq!(edges[3]["source"], 2);
    assert_eq!(edges[3]["target"], 3);
}

#[test]
fn reads_parameters_from_config_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let input = dir.path().join("graph.json");
    let config = dir.path().join("layout.yaml");
    let output = dir.path().join("out.json");
    fs::write(&input, TRIANGLE_WITH_TAIL).expect("Failed to write input");
    fs::write(&config, "iteration_budget: 7\ntheta: 0.5\n").expect("Failed to write config");

    let result = Command::new(env!("CARGO_BIN_EXE_forcegraph"))
        .args([
            "layout",
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
            "--cpu",
        ])
        .output()
        .expect("Failed to execute forcegraph");

    assert!(result.status.success());
    assert!(String::from_utf8_lossy(&result.stdout).contains("Completed in 7 iterations"));
    assert!(output.exists());
}

#[test]
fn rejects_edges_to_missing_nodes() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let input = dir.path().join("broken.json");
    let output = dir.path().join("out.json");
    fs::write(
        &input,
        r#"{"nodes": [{"x": 0.0, "y": 0.0}], "edges": [{"source": 0, "target": 4}]}"#,
    )
    .expect("Failed to write input");

    let result = Command::new(env!("CARGO_BIN_EXE_forcegraph"))
        .args([
            "layout",
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--cpu",
        ])
        .output()
        .expect("Failed to execute forcegraph");

    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("out of range"), "Unexpected error: {}", stderr);
    assert!(!output.exists());
}
