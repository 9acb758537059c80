use std::collections::HashMap;

use lantern::VERSION;
use lantern::audits::byte_efficiency::round_to_ten_ms;
use lantern::audits::unminified_css::compute_waste;
use lantern::audits::{
    Audit, AuditOutcome, ComputedArtifacts, PageLoad, UsesRelPreconnect, default_audits, run_audits,
};
use lantern::builder::build_page_graph;
use lantern::graph::{DependencyGraph, Node, NodeType};
use lantern::model::{
    NavigationTimestamps, NetworkLogEntry, NetworkRecorder, NetworkRequest, ProcessedTrace, ResourcePriority,
    ResourceTiming, ResourceType, TraceEvent,
};
use lantern::simulator::{SimulationOptions, Simulator, SimulatorOptions};
use serde_json::json;

const ORIGIN: &str = "http://example.com";

fn simulator() -> Simulator {
    Simulator::new(SimulatorOptions {
        rtt: 20.0,
        throughput: f64::INFINITY,
        cpu_slowdown_multiplier: 1.0,
        server_response_time_by_origin: HashMap::from([(ORIGIN.to_string(), 0.0)]),
        ..SimulatorOptions::default()
    })
    .unwrap()
}

/// A document finishing at 100ms followed by a 50ms task.
fn document_then_task() -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    let document = graph.add_node(Node::network(NetworkRequest {
        request_id: "doc".to_string(),
        url: format!("{ORIGIN}/"),
        resource_type: Some(ResourceType::Document),
        priority: ResourcePriority::VeryHigh,
        end_time: Some(0.1),
        transfer_size: 30_000,
        ..NetworkRequest::default()
    }));
    let task = graph.add_node(Node::cpu(
        TraceEvent {
            name: "RunTask".to_string(),
            ts: 100_000.0,
            dur: Some(50_000.0),
            ..TraceEvent::default()
        },
        Vec::new(),
    ));
    graph.add_dependency(task, document).unwrap();
    graph
}

#[test]
fn scenarios_binary_smoke_runs() {
    assert!(!VERSION.is_empty());
}

#[test]
fn document_then_task_finishes_at_150ms() {
    let graph = document_then_task();
    let result = simulator().simulate(&graph, SimulationOptions::default()).unwrap();

    let document = graph.get_node_key_by_id("doc").unwrap();
    assert_eq!(result.timing(document).unwrap().end_time, 100.0);
    assert_eq!(result.time_in_ms, 150.0);
}

#[test]
fn emptied_document_on_a_clone_finishes_sooner() {
    let graph = document_then_task();
    let simulator = simulator();
    let before = simulator.simulate(&graph, SimulationOptions::default()).unwrap();

    let root = graph.root().unwrap();
    let (mut reduced, reduced_root) = graph.clone_with_relationships(root, None).unwrap();
    reduced
        .get_node_mut(reduced_root)
        .and_then(Node::as_network_mut)
        .unwrap()
        .set_transfer_size(0);
    let after = simulator.simulate(&reduced, SimulationOptions::default()).unwrap();

    assert!(after.time_in_ms < before.time_in_ms);
    assert_eq!(after.time_in_ms, 130.0);
    assert_eq!(round_to_ten_ms(before.time_in_ms - after.time_in_ms), 20.0);

    let original = graph.get_node(root).and_then(Node::record).unwrap();
    assert_eq!(original.transfer_size, 30_000);
}

#[test]
fn whitespace_heavy_css_wastes_forty_percent() {
    let content = "a{b:c}    ".repeat(10);
    let item = compute_waste("http://example.com/style.css", &content, content.len() as f64);
    assert!((item.wasted_percent.unwrap() - 40.0).abs() < 1e-9);
}

#[test]
fn already_connected_origin_is_never_preconnected() {
    let document = NetworkRequest {
        request_id: "doc".to_string(),
        url: "https://example.com/".to_string(),
        resource_type: Some(ResourceType::Document),
        end_time: Some(0.2),
        transfer_size: 10_000,
        ..NetworkRequest::default()
    };
    let warm = NetworkRequest {
        request_id: "cdn".to_string(),
        url: "https://cdn.example.net/lib.js".to_string(),
        resource_type: Some(ResourceType::Script),
        start_time: 3.0,
        end_time: Some(3.5),
        transfer_size: 10_000,
        timing: Some(ResourceTiming {
            request_time: 3.0,
            dns_start: 0.0,
            dns_end: 0.0,
            connect_start: 0.0,
            connect_end: 0.0,
            send_start: 1.0,
            send_end: 2.0,
            receive_headers_end: 400.0,
            ..ResourceTiming::default()
        }),
        ..NetworkRequest::default()
    };
    let page_load = PageLoad {
        records: vec![document, warm],
        final_url: Some("https://example.com/".to_string()),
        trace: ProcessedTrace {
            timestamps: NavigationTimestamps {
                navigation_start: 0.0,
                first_contentful_paint: Some(4_000_000.0),
                largest_contentful_paint: Some(4_000_000.0),
            },
            ..ProcessedTrace::default()
        },
        ..PageLoad::default()
    };
    let artifacts = ComputedArtifacts::new(&page_load);
    let product = UsesRelPreconnect.audit(&artifacts).unwrap();
    assert!(product.details.items.is_empty());
    assert_eq!(product.numeric_value, 0.0);
}

#[test]
fn simulation_is_deterministic() {
    let graph = document_then_task();
    let simulator = simulator();
    let first = simulator.simulate(&graph, SimulationOptions::default()).unwrap();
    let second = simulator.simulate(&graph, SimulationOptions::default()).unwrap();
    assert_eq!(first, second);
}

fn entry(method: &str, params: serde_json::Value) -> NetworkLogEntry {
    NetworkLogEntry {
        method: method.to_string(),
        params,
    }
}

fn network_log() -> Vec<NetworkLogEntry> {
    vec![
        entry(
            "Network.requestWillBeSent",
            json!({
                "requestId": "1",
                "frameId": "F",
                "documentURL": "http://example.com/",
                "request": { "url": "http://example.com/", "initialPriority": "VeryHigh" },
                "timestamp": 1.0,
                "type": "Document",
                "initiator": { "type": "other" }
            }),
        ),
        entry(
            "Network.responseReceived",
            json!({
                "requestId": "1",
                "timestamp": 1.1,
                "type": "Document",
                "response": { "status": 200, "mimeType": "text/html", "protocol": "http/1.1", "connectionId": 7 }
            }),
        ),
        entry(
            "Network.loadingFinished",
            json!({ "requestId": "1", "timestamp": 1.2, "encodedDataLength": 12000 }),
        ),
        entry(
            "Network.requestWillBeSent",
            json!({
                "requestId": "2",
                "frameId": "F",
                "documentURL": "http://example.com/",
                "request": { "url": "http://example.com/app.js", "initialPriority": "High" },
                "timestamp": 1.25,
                "type": "Script",
                "initiator": { "type": "parser", "url": "http://example.com/" }
            }),
        ),
        entry(
            "Network.responseReceived",
            json!({
                "requestId": "2",
                "timestamp": 1.3,
                "type": "Script",
                "response": { "status": 200, "mimeType": "text/javascript", "protocol": "http/1.1", "connectionId": 7, "connectionReused": true }
            }),
        ),
        entry(
            "Network.loadingFinished",
            json!({ "requestId": "2", "timestamp": 1.4, "encodedDataLength": 40000 }),
        ),
    ]
}

fn trace() -> ProcessedTrace {
    let trace = json!({
        "traceEvents": [
            { "name": "thread_name", "ph": "M", "pid": 1, "tid": 5, "ts": 0, "args": { "name": "CrRendererMain" } },
            { "name": "navigationStart", "ph": "R", "pid": 1, "tid": 5, "ts": 1000000, "args": { "frame": "F" } },
            { "name": "RunTask", "ph": "X", "pid": 1, "tid": 5, "ts": 1450000, "dur": 30000 },
            {
                "name": "EvaluateScript", "ph": "X", "pid": 1, "tid": 5, "ts": 1451000, "dur": 28000,
                "args": { "data": { "url": "http://example.com/app.js" } }
            },
            { "name": "firstContentfulPaint", "ph": "R", "pid": 1, "tid": 5, "ts": 1600000 },
            { "name": "largestContentfulPaint::Candidate", "ph": "R", "pid": 1, "tid": 5, "ts": 1700000 }
        ]
    });
    ProcessedTrace::from_json(&trace.to_string()).unwrap()
}

#[test]
fn captured_load_builds_a_linked_graph() {
    let records = NetworkRecorder::records_from_log(&network_log());
    assert_eq!(records.len(), 2);
    let trace = trace();
    assert_eq!(trace.timestamps.first_contentful_paint_ms(), Some(600.0));

    let page = build_page_graph(&trace, &records, Some("http://example.com/")).unwrap();
    let script = page.graph.get_node_key_by_id("2").unwrap();
    assert_eq!(page.graph.dependencies(script), vec![page.root]);

    let task = page
        .graph
        .nodes()
        .find(|(_, node)| node.node_type() == NodeType::Cpu)
        .map(|(key, _)| key)
        .unwrap();
    assert_eq!(page.graph.dependencies(task), vec![script]);
}

#[test]
fn audits_share_artifacts_across_threads() {
    let page_load = PageLoad {
        records: NetworkRecorder::records_from_log(&network_log()),
        trace: trace(),
        final_url: Some("http://example.com/".to_string()),
        ..PageLoad::default()
    };
    let artifacts = ComputedArtifacts::new(&page_load);
    let audits = default_audits();

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(|| run_audits(&audits, &artifacts));
        let second = scope.spawn(|| run_audits(&audits, &artifacts));
        (first.join().unwrap(), second.join().unwrap())
    });

    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
    for result in &first {
        assert!(
            matches!(result.outcome, AuditOutcome::Scored(_)),
            "{} failed: {:?}",
            result.id,
            result.outcome
        );
    }
}
