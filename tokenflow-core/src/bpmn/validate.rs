use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

use crate::bpmn::model::{EventKind, Node, ProcessGraph, SequenceFlow};
use crate::bpmn::parser::build_graph;
use crate::error::{EngineError, Result};

// ─── Error codes ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationCode {
    EmptyXml,
    XmlParseError,
    SchemaError,
    ExtensionError,
    DuplicateId,
    InvalidFlow,
    InvalidReference,
    MissingAttribute,
    InvalidStructure,
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationCode::EmptyXml => "EMPTY_XML",
            ValidationCode::XmlParseError => "XML_PARSE_ERROR",
            ValidationCode::SchemaError => "SCHEMA_ERROR",
            ValidationCode::ExtensionError => "EXTENSION_ERROR",
            ValidationCode::DuplicateId => "DUPLICATE_ID",
            ValidationCode::InvalidFlow => "INVALID_FLOW",
            ValidationCode::InvalidReference => "INVALID_REFERENCE",
            ValidationCode::MissingAttribute => "MISSING_ATTRIBUTE",
            ValidationCode::InvalidStructure => "INVALID_STRUCTURE",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
    pub element_id: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.element_id {
            Some(id) => write!(f, "{}: {} (element: {})", self.code, self.message, id),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn add(&mut self, code: ValidationCode, message: impl Into<String>, element_id: Option<&str>) {
        self.errors.push(ValidationError {
            code,
            message: message.into(),
            element_id: element_id.map(str::to_string),
        });
    }
}

// ─── Entry point ──────────────────────────────────────────────

/// Validate BPMN XML without throwing: all detectable problems are collected
/// with their codes. Vendor extensions are validated only when present (lax).
pub fn validate(xml: &str) -> ValidationResult {
    let mut result = ValidationResult::default();

    let graph = match build_graph(xml) {
        Ok(g) => g,
        Err(e) => {
            result.add(e.code, e.message, None);
            return result;
        }
    };

    for err in check_structure(&graph) {
        result.errors.push(err);
    }

    if let Err(EngineError::CyclicGraph(node)) = detect_cycles(&graph) {
        result.add(
            ValidationCode::InvalidStructure,
            format!("Cycle detected at '{node}'"),
            Some(&node),
        );
    }

    result
}

// ─── Structural checks ────────────────────────────────────────

/// Duplicate-id, reference, flow, and extension checks over a built graph.
/// Shared by `parse()` (fail-fast) and `validate()` (collecting).
pub(crate) fn check_structure(graph: &ProcessGraph) -> Vec<ValidationError> {
    let mut result = ValidationResult::default();

    let mut ids: HashSet<&str> = HashSet::new();
    check_container(
        &graph.nodes,
        &graph.flows,
        graph,
        &mut ids,
        &mut result,
    );

    if graph.start_events().is_empty() {
        result.add(
            ValidationCode::InvalidStructure,
            "process has no start event",
            None,
        );
    }

    result.errors
}

fn check_container<'a>(
    nodes: &'a [Node],
    flows: &'a [SequenceFlow],
    graph: &'a ProcessGraph,
    ids: &mut HashSet<&'a str>,
    result: &mut ValidationResult,
) {
    // ids must be unique across the whole document, including flows
    for node in nodes {
        if !insert_id(ids, node.id(), result) {
            continue;
        }
        match node {
            Node::Event(ev) => {
                if ev.kind == EventKind::Start && !ev.incoming.is_empty() {
                    result.add(
                        ValidationCode::SchemaError,
                        "start event must not have incoming flows",
                        Some(&ev.id),
                    );
                }
                if ev.kind == EventKind::End && !ev.outgoing.is_empty() {
                    result.add(
                        ValidationCode::SchemaError,
                        "end event must not have outgoing flows",
                        Some(&ev.id),
                    );
                }
                if ev.kind == EventKind::Boundary {
                    match &ev.attached_to {
                        Some(target) if graph.find_node(target).is_none() => result.add(
                            ValidationCode::InvalidReference,
                            format!("boundary event attached to unknown activity '{target}'"),
                            Some(&ev.id),
                        ),
                        Some(target) => {
                            if graph
                                .find_node(target)
                                .map(|n| !n.is_activity())
                                .unwrap_or(false)
                            {
                                result.add(
                                    ValidationCode::InvalidReference,
                                    format!("boundary event attached to non-activity '{target}'"),
                                    Some(&ev.id),
                                );
                            }
                        }
                        None => result.add(
                            ValidationCode::MissingAttribute,
                            "boundary event is missing attachedToRef",
                            Some(&ev.id),
                        ),
                    }
                }
            }
            Node::Task(task) => {
                if let Some(svc) = &task.service {
                    if svc.task_name.is_empty() {
                        result.add(
                            ValidationCode::ExtensionError,
                            "serviceTaskConfig is missing taskName",
                            Some(&task.id),
                        );
                    }
                }
            }
            Node::Gateway(gw) => {
                if let Some(default) = &gw.default_flow {
                    if !gw.outgoing.contains(default) {
                        result.add(
                            ValidationCode::InvalidReference,
                            format!("default flow '{default}' is not an outgoing flow"),
                            Some(&gw.id),
                        );
                    }
                }
            }
            Node::SubProcess(sp) => {
                check_container(&sp.nodes, &sp.flows, graph, ids, result);
            }
            Node::CallActivity(_) => {}
        }
    }

    let container_ids: HashSet<&str> = nodes.iter().map(|n| n.id()).collect();
    for flow in flows {
        insert_id(ids, &flow.id, result);
        if flow.source_ref == flow.target_ref {
            result.add(
                ValidationCode::InvalidFlow,
                "sequence flow connects a node to itself",
                Some(&flow.id),
            );
        }
        for (attr, reference) in [("sourceRef", &flow.source_ref), ("targetRef", &flow.target_ref)]
        {
            if !container_ids.contains(reference.as_str()) {
                result.add(
                    ValidationCode::InvalidReference,
                    format!("sequence flow {attr} references unknown node '{reference}'"),
                    Some(&flow.id),
                );
            }
        }
    }
}

fn insert_id<'a>(ids: &mut HashSet<&'a str>, id: &'a str, result: &mut ValidationResult) -> bool {
    if ids.insert(id) {
        true
    } else {
        result.add(
            ValidationCode::DuplicateId,
            format!("duplicate element id '{id}'"),
            Some(id),
        );
        false
    }
}

// ─── Cycle detection ──────────────────────────────────────────

/// Reject cyclic graphs unconditionally. The run loop is a bounded iterator
/// over active tokens; loops must be modeled as multi-instance activities.
///
/// Each container (the process body and every subprocess body) is checked
/// independently; a subprocess executes as its own token scope.
pub fn detect_cycles(graph: &ProcessGraph) -> Result<()> {
    check_container_cycles(&graph.nodes, &graph.flows)
}

fn check_container_cycles(nodes: &[Node], flows: &[SequenceFlow]) -> Result<()> {
    let mut pg: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in nodes {
        index.insert(node.id(), pg.add_node(node.id()));
    }
    for flow in flows {
        if let (Some(&a), Some(&b)) = (
            index.get(flow.source_ref.as_str()),
            index.get(flow.target_ref.as_str()),
        ) {
            pg.add_edge(a, b, ());
        }
    }
    if let Err(cycle) = toposort(&pg, None) {
        let at = pg[cycle.node_id()].to_string();
        return Err(EngineError::CyclicGraph(at));
    }
    for node in nodes {
        if let Node::SubProcess(sp) = node {
            check_container_cycles(&sp.nodes, &sp.flows)?;
        }
    }
    Ok(())
}
