use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Events ───────────────────────────────────────────────────

/// Where an event sits in the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    End,
    Intermediate,
    Boundary,
}

/// What triggers (or is thrown by) an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDefinition {
    Timer,
    Message,
    Signal,
    Error,
    Compensation,
    Terminate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<EventDefinition>,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Message/signal name, from the referenced definition element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// Raw ISO-8601 timer expression (`PT1H`, `R3/PT5M`, absolute instant).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_definition: Option<String>,
    /// Error code for error events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Compensation events: specific activity to compensate (whole scope
    /// when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_ref: Option<String>,
    /// Boundary events only: the activity they attach to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
    /// Boundary events only: whether firing cancels the attached activity.
    #[serde(default = "default_true")]
    pub interrupting: bool,
    /// True for throw events (intermediate throw, e.g. compensation).
    #[serde(default)]
    pub throwing: bool,
}

fn default_true() -> bool {
    true
}

// ─── Tasks ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Task,
    ScriptTask,
    ServiceTask,
}

/// `serviceTaskConfig` extension: which registered implementation to run and
/// with which properties.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceTaskConfig {
    pub task_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: TaskKind,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceTaskConfig>,
    /// Arbitrary extension payloads keyed by element name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceSpec>,
}

// ─── Gateways ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Exclusive,
    Parallel,
    Inclusive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: GatewayKind,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Flow id marked `default` on the gateway element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_flow: Option<String>,
}

// ─── Subprocesses and call activities ─────────────────────────

/// `multiInstanceLoopCharacteristics`: cardinality or collection reference,
/// parallel vs sequential, optional completion condition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    #[serde(default)]
    pub sequential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubProcessNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    pub nodes: Vec<Node>,
    pub flows: Vec<SequenceFlow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceSpec>,
    /// Transaction subprocesses get compensation-on-cancel semantics.
    #[serde(default)]
    pub transactional: bool,
}

impl SubProcessNode {
    /// The inner start event, if the subprocess body has one.
    pub fn start_event(&self) -> Option<&EventNode> {
        self.nodes.iter().find_map(|n| match n {
            Node::Event(e) if e.kind == EventKind::Start => Some(e),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallActivityNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Definition id of the called process (`calledElement`). Token data may
    /// override with `called_process_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceSpec>,
}

// ─── Flows and data objects ───────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataObject {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
}

// ─── Node sum type ────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum Node {
    Event(EventNode),
    Task(TaskNode),
    Gateway(GatewayNode),
    SubProcess(SubProcessNode),
    CallActivity(CallActivityNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Event(n) => &n.id,
            Node::Task(n) => &n.id,
            Node::Gateway(n) => &n.id,
            Node::SubProcess(n) => &n.id,
            Node::CallActivity(n) => &n.id,
        }
    }

    pub fn incoming(&self) -> &[String] {
        match self {
            Node::Event(n) => &n.incoming,
            Node::Task(n) => &n.incoming,
            Node::Gateway(n) => &n.incoming,
            Node::SubProcess(n) => &n.incoming,
            Node::CallActivity(n) => &n.incoming,
        }
    }

    pub fn outgoing(&self) -> &[String] {
        match self {
            Node::Event(n) => &n.outgoing,
            Node::Task(n) => &n.outgoing,
            Node::Gateway(n) => &n.outgoing,
            Node::SubProcess(n) => &n.outgoing,
            Node::CallActivity(n) => &n.outgoing,
        }
    }

    /// Multi-instance characteristics, for node kinds that can carry them.
    pub fn multi_instance(&self) -> Option<&MultiInstanceSpec> {
        match self {
            Node::Task(n) => n.multi_instance.as_ref(),
            Node::SubProcess(n) => n.multi_instance.as_ref(),
            Node::CallActivity(n) => n.multi_instance.as_ref(),
            _ => None,
        }
    }

    /// True for nodes that can have boundary events attached.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Node::Task(_) | Node::SubProcess(_) | Node::CallActivity(_)
        )
    }
}

// ─── Process graph ────────────────────────────────────────────

/// The parsed, immutable process graph. Derived from BPMN XML on demand and
/// cached keyed by `(definition_id, version)`; never persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub nodes: Vec<Node>,
    pub flows: Vec<SequenceFlow>,
    #[serde(default)]
    pub data_objects: Vec<DataObject>,
}

impl ProcessGraph {
    /// Find a node by id, searching subprocess bodies recursively.
    pub fn find_node(&self, id: &str) -> Option<&Node> {
        find_in(&self.nodes, id)
    }

    /// Find a sequence flow by id, searching subprocess bodies recursively.
    pub fn find_flow(&self, id: &str) -> Option<&SequenceFlow> {
        fn search<'a>(
            flows: &'a [SequenceFlow],
            nodes: &'a [Node],
            id: &str,
        ) -> Option<&'a SequenceFlow> {
            if let Some(f) = flows.iter().find(|f| f.id == id) {
                return Some(f);
            }
            nodes.iter().find_map(|n| match n {
                Node::SubProcess(sp) => search(&sp.flows, &sp.nodes, id),
                _ => None,
            })
        }
        search(&self.flows, &self.nodes, id)
    }

    /// Outgoing flows of a node in source-declaration order.
    pub fn outgoing_flows(&self, node_id: &str) -> Vec<&SequenceFlow> {
        let mut out = Vec::new();
        collect_flows(&self.flows, &self.nodes, node_id, &mut out);
        out
    }

    /// Target node of a flow, resolved through the flow's id.
    pub fn flow_target(&self, flow_id: &str) -> Option<&str> {
        self.find_flow(flow_id).map(|f| f.target_ref.as_str())
    }

    /// All start events at the top level.
    pub fn start_events(&self) -> Vec<&EventNode> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Event(e) if e.kind == EventKind::Start => Some(e),
                _ => None,
            })
            .collect()
    }

    /// Boundary events attached to the given activity (any nesting level).
    pub fn boundary_events_for(&self, activity_id: &str) -> Vec<&EventNode> {
        fn collect<'a>(nodes: &'a [Node], activity_id: &str, out: &mut Vec<&'a EventNode>) {
            for n in nodes {
                match n {
                    Node::Event(e)
                        if e.kind == EventKind::Boundary
                            && e.attached_to.as_deref() == Some(activity_id) =>
                    {
                        out.push(e)
                    }
                    Node::SubProcess(sp) => collect(&sp.nodes, activity_id, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.nodes, activity_id, &mut out);
        out
    }

    /// True when `node_id` is the target of a compensation boundary event's
    /// outgoing flow, i.e. the node only runs as a compensation handler.
    pub fn is_compensation_handler(&self, node_id: &str) -> bool {
        fn scan(nodes: &[Node], flows: &[SequenceFlow], node_id: &str) -> bool {
            for n in nodes {
                if let Node::Event(e) = n {
                    if e.kind == EventKind::Boundary
                        && e.definition == Some(EventDefinition::Compensation)
                        && flows
                            .iter()
                            .any(|f| f.source_ref == e.id && f.target_ref == node_id)
                    {
                        return true;
                    }
                }
                if let Node::SubProcess(sp) = n {
                    if scan(&sp.nodes, &sp.flows, node_id) {
                        return true;
                    }
                }
            }
            false
        }
        scan(&self.nodes, &self.flows, node_id)
    }

    /// The subprocess node that lexically contains `node_id`, if any.
    pub fn enclosing_subprocess(&self, node_id: &str) -> Option<&SubProcessNode> {
        fn search<'a>(nodes: &'a [Node], node_id: &str) -> Option<&'a SubProcessNode> {
            for n in nodes {
                if let Node::SubProcess(sp) = n {
                    if sp.nodes.iter().any(|c| c.id() == node_id) {
                        return Some(sp);
                    }
                    if let Some(inner) = search(&sp.nodes, node_id) {
                        return Some(inner);
                    }
                }
            }
            None
        }
        search(&self.nodes, node_id)
    }
}

fn find_in<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
    for n in nodes {
        if n.id() == id {
            return Some(n);
        }
        if let Node::SubProcess(sp) = n {
            if let Some(found) = find_in(&sp.nodes, id) {
                return Some(found);
            }
        }
    }
    None
}

fn collect_flows<'a>(
    flows: &'a [SequenceFlow],
    nodes: &'a [Node],
    node_id: &str,
    out: &mut Vec<&'a SequenceFlow>,
) {
    out.extend(flows.iter().filter(|f| f.source_ref == node_id));
    for n in nodes {
        if let Node::SubProcess(sp) = n {
            collect_flows(&sp.flows, &sp.nodes, node_id, out);
        }
    }
}
