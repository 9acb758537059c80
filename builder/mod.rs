/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Builds the page dependency graph from a processed trace and the network
//! records of one page load.
//!
//! Every network request has exactly one initiator: the previous redirect
//! hop or initiating request, the task that evaluated the initiating script,
//! an unambiguous initiator URL, or the root document. CPU tasks on the main
//! thread then depend on the downloads they consumed and take over as the
//! initiator of the XHR, fetch, and script requests they sent. Short,
//! weakly connected tasks are pruned since they cannot move the simulation.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::graph::{CycleDirection, DependencyGraph, GraphError, Node, NodeKey};
use crate::model::{InitiatorType, NetworkRequest, ProcessedTrace, ResourceType, TraceEvent};
use crate::simulator::network_analyzer::find_main_document;

/// Tasks shorter than this (in microseconds) may be pruned.
pub const SIGNIFICANT_TASK_DURATION: f64 = 10_000.0;

/// A script may start evaluating this long (microseconds) before its
/// download is recorded as finished.
const SCRIPT_EVALUATION_SLACK: f64 = 100_000.0;

/// A dependency graph together with the nodes every consumer needs.
#[derive(Debug, Clone)]
pub struct PageGraph {
    pub graph: DependencyGraph,
    /// Earliest request; the only node without dependencies.
    pub root: NodeKey,
    /// The document that ended the navigation, after redirects.
    pub main_document: NodeKey,
    /// Data-quality issues found while building.
    pub warnings: Vec<String>,
}

/// Build the dependency graph for one page load. `final_url` selects the
/// main document when the navigation redirected.
pub fn build_page_graph(
    trace: &ProcessedTrace,
    records: &[NetworkRequest],
    final_url: Option<&str>,
) -> Result<PageGraph, GraphError> {
    let mut warnings = Vec::new();
    let mut graph = DependencyGraph::new();

    let network = add_network_nodes(&mut graph, records, &mut warnings);
    if network.keys.is_empty() {
        return Err(GraphError::NoNetworkRecords);
    }

    let kept: Vec<&NetworkRequest> = network
        .keys
        .iter()
        .filter_map(|&key| graph.get_node(key).and_then(Node::record))
        .collect();
    let root_id = kept
        .iter()
        .copied()
        .reduce(|min, record| if record.start_time < min.start_time { record } else { min })
        .map(|record| record.request_id.clone())
        .ok_or(GraphError::NoNetworkRecords)?;
    let main_document = find_main_document(&kept, final_url)
        .map(|record| (record.request_id.clone(), record.redirects.clone()))
        .ok_or(GraphError::MainDocumentNotFound)?;

    let root = graph
        .get_node_key_by_id(&root_id)
        .ok_or(GraphError::NoNetworkRecords)?;
    let main_document_key = graph
        .get_node_key_by_id(&main_document.0)
        .ok_or(GraphError::MainDocumentNotFound)?;
    if main_document_key != root && !main_document.1.contains(&root_id) {
        return Err(GraphError::RootNotInRedirectChain);
    }

    let cpu_keys = add_cpu_nodes(&mut graph, &trace.main_thread_events);
    link_network_nodes(&mut graph, root, &network.keys)?;
    link_cpu_nodes(&mut graph, root, &cpu_keys, &network.frame_documents)?;
    prune_short_tasks(&mut graph, &cpu_keys)?;

    if let Some(node) = graph.get_node_mut(main_document_key) {
        node.is_main_document = true;
    }

    if graph.has_cycle(root, CycleDirection::Both) {
        return Err(GraphError::CycleDetected);
    }

    debug!(
        "Built page graph: {} nodes, {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Ok(PageGraph {
        graph,
        root,
        main_document: main_document_key,
        warnings,
    })
}

struct NetworkNodes {
    /// In record order.
    keys: Vec<NodeKey>,
    /// Frame id → its document request; `None` once ambiguous.
    frame_documents: HashMap<String, Option<NodeKey>>,
}

fn add_network_nodes(
    graph: &mut DependencyGraph,
    records: &[NetworkRequest],
    warnings: &mut Vec<String>,
) -> NetworkNodes {
    let mut keys = Vec::with_capacity(records.len());
    let mut frame_documents: HashMap<String, Option<NodeKey>> = HashMap::new();

    for record in records {
        if record.mime_type.starts_with("video") {
            continue;
        }

        let mut record = record.clone();
        while graph.get_node_key_by_id(&record.request_id).is_some() {
            record.request_id.push_str(":duplicate");
        }
        if record.end_time.is_none() {
            let message = format!("Request {} never finished", record.url);
            warn!("{message}");
            warnings.push(message);
        }

        let is_frame_document = record.resource_type == Some(ResourceType::Document)
            && record.document_url == record.url;
        let frame_id = record.frame_id.clone();
        let key = graph.add_node(Node::network(record));
        keys.push(key);

        if let Some(frame_id) = frame_id.filter(|_| is_frame_document) {
            frame_documents
                .entry(frame_id)
                .and_modify(|existing| *existing = None)
                .or_insert(Some(key));
        }
    }

    NetworkNodes {
        keys,
        frame_documents,
    }
}

fn link_network_nodes(graph: &mut DependencyGraph, root: NodeKey, keys: &[NodeKey]) -> Result<(), GraphError> {
    for &key in keys {
        if key == root {
            continue;
        }
        let record = graph.node(key)?.record().cloned().unwrap_or_default();
        let initiator = find_initiator(graph, root, key, &record)?;
        graph.add_dependency(key, initiator)?;
    }
    Ok(())
}

/// The single node that caused `record` to be requested. In order: the
/// previous redirect hop or initiating request, the latest task that
/// evaluated the initiating script, the only request for the initiator URL,
/// and finally the root.
fn find_initiator(
    graph: &DependencyGraph,
    root: NodeKey,
    key: NodeKey,
    record: &NetworkRequest,
) -> Result<NodeKey, GraphError> {
    let usable = |candidate: NodeKey| candidate != key && !graph.is_dependent_on(candidate, key, false);
    let start_time = record.start_time_us();

    let explicit = record
        .redirects
        .last()
        .or(record.initiator_request_id.as_ref())
        .and_then(|id| graph.get_node_key_by_id(id))
        .filter(|&candidate| usable(candidate));
    if let Some(initiator) = explicit {
        return Ok(initiator);
    }

    let candidate_urls: HashSet<String> = record.initiator.candidate_urls().into_iter().collect();
    if candidate_urls.is_empty() {
        return Ok(root);
    }

    if record.initiator.initiator_type == InitiatorType::Script {
        let mut latest: Option<(NodeKey, f64)> = None;
        for (candidate, node) in graph.nodes() {
            let Some(cpu) = node.as_cpu() else {
                continue;
            };
            let started = node.start_time();
            if started > start_time || !cpu.is_evaluate_script_for(&candidate_urls) {
                continue;
            }
            if latest.is_none_or(|(_, latest_start)| started > latest_start) && usable(candidate) {
                latest = Some((candidate, started));
            }
        }
        if let Some((task, _)) = latest {
            return Ok(task);
        }
    }

    let mut urls: Vec<&String> = candidate_urls.iter().collect();
    urls.sort();
    for url in urls {
        if let [only] = graph.get_nodes_by_url(url)
            && graph.node(*only)?.start_time() <= start_time
            && usable(*only)
        {
            return Ok(*only);
        }
    }
    Ok(root)
}

/// One node per top-level task; events inside a task's span become its
/// children.
fn add_cpu_nodes(graph: &mut DependencyGraph, events: &[TraceEvent]) -> Vec<NodeKey> {
    let mut keys = Vec::new();
    let mut index = 0;
    while index < events.len() {
        let event = &events[index];
        index += 1;
        if !event.is_schedulable_task() || !event.dur.is_some_and(|dur| dur > 0.0) {
            continue;
        }

        let end_time = event.end_time();
        let mut children = Vec::new();
        while index < events.len() && events[index].ts < end_time {
            children.push(events[index].clone());
            index += 1;
        }
        keys.push(graph.add_node(Node::cpu(event.clone(), children)));
    }
    keys
}

fn link_cpu_nodes(
    graph: &mut DependencyGraph,
    root: NodeKey,
    cpu_keys: &[NodeKey],
    frame_documents: &HashMap<String, Option<NodeKey>>,
) -> Result<(), GraphError> {
    let mut timers: HashMap<i64, NodeKey> = HashMap::new();

    for &key in cpu_keys {
        let Some(cpu) = graph.node(key)?.as_cpu().cloned() else {
            continue;
        };
        let start_time = cpu.event().ts;

        for event in cpu.child_events() {
            let Some(data) = event.data() else {
                continue;
            };
            let stack_urls = || {
                data.stack_trace
                    .iter()
                    .map(|frame| frame.url.as_str())
                    .filter(|url| !url.is_empty())
            };

            match event.name.as_str() {
                "TimerInstall" => {
                    if let Some(timer_id) = data.timer_id {
                        timers.insert(timer_id, key);
                    }
                    for url in stack_urls() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                "TimerFire" => {
                    let Some(&installer) = data.timer_id.and_then(|id| timers.get(&id)) else {
                        continue;
                    };
                    let installed_before = graph
                        .node(installer)?
                        .end_time()
                        .is_some_and(|end| end <= start_time);
                    if installed_before && installer != key {
                        graph.add_dependency(key, installer)?;
                    }
                }
                "InvalidateLayout" | "ScheduleStyleRecalculation" => {
                    for url in stack_urls() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                "EvaluateScript" => {
                    if let Some(url) = data.url.as_deref() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                    for url in stack_urls() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                "XHRReadyStateChange" => {
                    if data.ready_state != Some(4) {
                        continue;
                    }
                    if let Some(url) = data.url.as_deref() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                    for url in stack_urls() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                "FunctionCall" | "v8.compile" => {
                    if let Some(url) = data.url.as_deref() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                "ParseAuthorStyleSheet" => {
                    if let Some(url) = data.style_sheet_url.as_deref() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                "ResourceSendRequest" => {
                    if let Some(request_id) = data.request_id.as_deref() {
                        add_dependent_network_request(graph, key, start_time, request_id)?;
                    }
                    for url in stack_urls() {
                        add_dependency_on_url(graph, key, start_time, url)?;
                    }
                }
                _ => {}
            }
        }

        let frame_document = cpu
            .event()
            .data()
            .and_then(|data| data.frame.as_deref())
            .and_then(|frame| frame_documents.get(frame).copied().flatten());
        if let Some(document) = frame_document
            && graph.node(document)?.start_time() < start_time
        {
            graph.add_dependency(key, document)?;
        }

        if graph.dependencies(key).is_empty() {
            graph.add_dependency(key, root)?;
        }
    }
    Ok(())
}

/// Depend on the closest download of `url` that finished before the task
/// started, allowing a little slack for scripts that start evaluating early.
fn add_dependency_on_url(
    graph: &mut DependencyGraph,
    cpu: NodeKey,
    cpu_start_time: f64,
    url: &str,
) -> Result<(), GraphError> {
    let mut closest: Option<(NodeKey, f64)> = None;
    for &candidate in graph.get_nodes_by_url(url) {
        let node = graph.node(candidate)?;
        // A request started after the task cannot be one of its inputs.
        if cpu_start_time <= node.start_time() {
            return Ok(());
        }
        let Some(end_time) = node.end_time() else {
            continue;
        };
        let distance = cpu_start_time - end_time;
        if distance >= -SCRIPT_EVALUATION_SLACK
            && closest.is_none_or(|(_, closest_distance)| distance < closest_distance)
        {
            closest = Some((candidate, distance));
        }
    }

    if let Some((candidate, _)) = closest {
        graph.add_dependency(cpu, candidate)?;
    }
    Ok(())
}

/// Make the task the sole initiator of a script, XHR, or fetch request it
/// sent. Redirect hops keep the previous hop as their initiator.
fn add_dependent_network_request(
    graph: &mut DependencyGraph,
    cpu: NodeKey,
    cpu_start_time: f64,
    request_id: &str,
) -> Result<(), GraphError> {
    let Some(network) = graph.get_node_key_by_id(request_id) else {
        return Ok(());
    };
    let node = graph.node(network)?;
    if node.start_time() <= cpu_start_time {
        return Ok(());
    }
    let Some(record) = node.record() else {
        return Ok(());
    };
    let linkable = matches!(
        record.resource_type,
        Some(ResourceType::Xhr | ResourceType::Fetch | ResourceType::Script)
    );
    if !linkable || !record.redirects.is_empty() || graph.is_dependent_on(cpu, network, false) {
        return Ok(());
    }
    graph.remove_all_dependencies(network);
    graph.add_dependent(cpu, network)
}

/// Drop short tasks that sit on a single path, keeping the first task that
/// laid out, painted, or parsed HTML.
fn prune_short_tasks(graph: &mut DependencyGraph, cpu_keys: &[NodeKey]) -> Result<(), GraphError> {
    let mut seen_first: HashSet<&'static str> = HashSet::new();
    let mut pruned = 0;

    for &key in cpu_keys {
        let Some(cpu) = graph.get_node(key).and_then(Node::as_cpu) else {
            continue;
        };

        let mut is_first = false;
        for name in ["Layout", "Paint", "ParseHTML"] {
            if !seen_first.contains(name) && cpu.child_events().iter().any(|event| event.name == name) {
                seen_first.insert(name);
                is_first = true;
            }
        }
        if is_first || cpu.duration() >= SIGNIFICANT_TASK_DURATION {
            continue;
        }

        if graph.dependencies(key).len() == 1 && graph.dependents(key).len() <= 1 {
            graph.prune_node(key)?;
            pruned += 1;
        }
    }

    if pruned > 0 {
        debug!("Pruned {pruned} short tasks");
    }
    Ok(())
}
