use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::reader::Reader;
use std::collections::{BTreeMap, HashMap};

use crate::bpmn::model::*;
use crate::bpmn::validate::{check_structure, ValidationCode};
use crate::error::{EngineError, Result};

/// Parse BPMN 2.0 XML into a [`ProcessGraph`].
///
/// Accepts both prefixed (`bpmn:startEvent`) and default-namespace forms,
/// plus the `http://pythmata.org/schema/1.0/bpmn` extension elements
/// (`taskConfig`, `scriptConfig`, `serviceTaskConfig`, `timerEventConfig`).
/// Fails with [`EngineError::InvalidBpmn`] on schema violations: duplicate
/// ids, missing `sourceRef`/`targetRef`, unknown references, unsupported
/// elements.
pub fn parse(xml: &str) -> Result<ProcessGraph> {
    let graph = build_graph(xml).map_err(|e| EngineError::InvalidBpmn(e.to_string()))?;
    let errors = check_structure(&graph);
    if let Some(err) = errors.first() {
        return Err(EngineError::InvalidBpmn(err.to_string()));
    }
    Ok(graph)
}

// ─── Build failure (carries a validation code for validate()) ──

#[derive(Debug)]
pub(crate) struct BuildError {
    pub code: ValidationCode,
    pub message: String,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn fail(code: ValidationCode, message: impl Into<String>) -> BuildError {
    BuildError {
        code,
        message: message.into(),
    }
}

// ─── Parser state ─────────────────────────────────────────────

/// Activity elements that accept children (extensions, event definitions,
/// multi-instance characteristics) are parsed via a pending context that is
/// committed when the closing tag arrives.
enum Pending {
    Event(EventNode),
    Task(TaskNode),
    SubProcess(SubProcessNode),
    CallActivity(CallActivityNode),
    Flow(SequenceFlow),
}

impl Pending {
    fn multi_instance_slot(&mut self) -> Option<&mut Option<MultiInstanceSpec>> {
        match self {
            Pending::Task(t) => Some(&mut t.multi_instance),
            Pending::SubProcess(s) => Some(&mut s.multi_instance),
            Pending::CallActivity(c) => Some(&mut c.multi_instance),
            _ => None,
        }
    }
}

/// One level of containment: the top-level process or an open subprocess.
struct Container {
    nodes: Vec<Node>,
    flows: Vec<SequenceFlow>,
    data_objects: Vec<DataObject>,
}

pub(crate) fn build_graph(xml: &str) -> std::result::Result<ProcessGraph, BuildError> {
    if xml.trim().is_empty() {
        return Err(fail(ValidationCode::EmptyXml, "XML content is empty"));
    }

    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut in_process = false;
    // Stack of open containers; index 0 is the process body.
    let mut containers: Vec<Container> = Vec::new();
    // Pending elements awaiting their close tag. Subprocess bodies interleave
    // here: an open subProcess pushes both a Pending and a Container.
    let mut pending: Vec<Pending> = Vec::new();

    // definitions-level name registries
    let mut messages: HashMap<String, String> = HashMap::new();
    let mut signals: HashMap<String, String> = HashMap::new();
    let mut errors: HashMap<String, String> = HashMap::new();

    // Character-data capture targets
    let mut in_condition = false;
    let mut condition_text: Option<String> = None;
    let mut timer_child = false;
    let mut timer_text: Option<String> = None;
    let mut in_extensions = false;
    let mut script_child = false;
    let mut script_text: Option<String> = None;
    let mut in_cardinality = false;
    let mut cardinality_text: Option<String> = None;
    let mut in_completion_condition = false;
    let mut completion_text: Option<String> = None;
    let mut mi_spec: Option<MultiInstanceSpec> = None;
    // serviceTaskConfig accumulation
    let mut service_config: Option<ServiceTaskConfig> = None;
    // taskConfig input/output variable capture
    let mut var_section: Option<VarSection> = None;

    enum VarSection {
        Input,
        Output,
    }

    loop {
        let event = reader.read_event_into(&mut buf);
        match event {
            Ok(XmlEvent::Start(ref e)) | Ok(XmlEvent::Empty(ref e)) => {
                let is_empty = matches!(event, Ok(XmlEvent::Empty(_)));
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    // ── definitions-level registries ──
                    "message" if !in_process => {
                        if let (Some(id), Some(name)) = (attr(e, "id"), attr(e, "name")) {
                            messages.insert(id, name);
                        }
                    }
                    "signal" if !in_process => {
                        if let (Some(id), Some(name)) = (attr(e, "id"), attr(e, "name")) {
                            signals.insert(id, name);
                        }
                    }
                    "error" if !in_process => {
                        if let (Some(id), Some(code)) = (attr(e, "id"), attr(e, "errorCode")) {
                            errors.insert(id, code);
                        }
                    }
                    "process" => {
                        in_process = true;
                        containers.push(Container {
                            nodes: Vec::new(),
                            flows: Vec::new(),
                            data_objects: Vec::new(),
                        });
                    }

                    // ── events ──
                    "startEvent" | "endEvent" | "intermediateCatchEvent"
                    | "intermediateThrowEvent"
                        if in_process =>
                    {
                        let node = event_node(e, &local)?;
                        if is_empty {
                            push_node(&mut containers, Node::Event(node));
                        } else {
                            pending.push(Pending::Event(node));
                        }
                    }
                    "boundaryEvent" if in_process => {
                        let mut node = event_node(e, &local)?;
                        node.attached_to = Some(require_attr(e, "attachedToRef", &local)?);
                        node.interrupting =
                            attr(e, "cancelActivity").as_deref() != Some("false");
                        if is_empty {
                            push_node(&mut containers, Node::Event(node));
                        } else {
                            pending.push(Pending::Event(node));
                        }
                    }

                    // ── event definitions (children of a pending event) ──
                    "timerEventDefinition" => set_definition(&mut pending, EventDefinition::Timer),
                    "messageEventDefinition" => {
                        set_definition(&mut pending, EventDefinition::Message);
                        if let Some(r) = attr(e, "messageRef") {
                            let name = messages.get(&r).cloned().unwrap_or(r);
                            set_event_name(&mut pending, name);
                        }
                    }
                    "signalEventDefinition" => {
                        set_definition(&mut pending, EventDefinition::Signal);
                        if let Some(r) = attr(e, "signalRef") {
                            let name = signals.get(&r).cloned().unwrap_or(r);
                            set_event_name(&mut pending, name);
                        }
                    }
                    "errorEventDefinition" => {
                        set_definition(&mut pending, EventDefinition::Error);
                        if let Some(r) = attr(e, "errorRef") {
                            let code = errors.get(&r).cloned().unwrap_or(r);
                            if let Some(Pending::Event(ev)) = pending.last_mut() {
                                ev.error_code = Some(code);
                            }
                        }
                    }
                    "compensateEventDefinition" => {
                        set_definition(&mut pending, EventDefinition::Compensation);
                        if let Some(r) = attr(e, "activityRef") {
                            if let Some(Pending::Event(ev)) = pending.last_mut() {
                                ev.activity_ref = Some(r);
                            }
                        }
                    }
                    "terminateEventDefinition" => {
                        set_definition(&mut pending, EventDefinition::Terminate)
                    }
                    "timeDuration" | "timeDate" | "timeCycle" => {
                        timer_child = true;
                        timer_text = None;
                    }

                    // ── tasks ──
                    "task" | "scriptTask" | "serviceTask" | "userTask" | "manualTask"
                        if in_process =>
                    {
                        let kind = match local.as_str() {
                            "scriptTask" => TaskKind::ScriptTask,
                            "serviceTask" => TaskKind::ServiceTask,
                            _ => TaskKind::Task,
                        };
                        let node = TaskNode {
                            id: require_attr(e, "id", &local)?,
                            name: attr(e, "name"),
                            kind,
                            incoming: vec![],
                            outgoing: vec![],
                            script: None,
                            input_variables: None,
                            output_variables: None,
                            service: None,
                            extensions: BTreeMap::new(),
                            multi_instance: None,
                        };
                        if is_empty {
                            push_node(&mut containers, Node::Task(node));
                        } else {
                            pending.push(Pending::Task(node));
                        }
                    }

                    // ── gateways ──
                    "exclusiveGateway" | "parallelGateway" | "inclusiveGateway" if in_process => {
                        let kind = match local.as_str() {
                            "exclusiveGateway" => GatewayKind::Exclusive,
                            "parallelGateway" => GatewayKind::Parallel,
                            _ => GatewayKind::Inclusive,
                        };
                        push_node(
                            &mut containers,
                            Node::Gateway(GatewayNode {
                                id: require_attr(e, "id", &local)?,
                                name: attr(e, "name"),
                                kind,
                                incoming: vec![],
                                outgoing: vec![],
                                default_flow: attr(e, "default"),
                            }),
                        );
                    }

                    // ── subprocesses / call activities ──
                    "subProcess" | "transaction" if in_process => {
                        let node = SubProcessNode {
                            id: require_attr(e, "id", &local)?,
                            name: attr(e, "name"),
                            incoming: vec![],
                            outgoing: vec![],
                            nodes: vec![],
                            flows: vec![],
                            multi_instance: None,
                            transactional: local == "transaction",
                        };
                        if is_empty {
                            push_node(&mut containers, Node::SubProcess(node));
                        } else {
                            pending.push(Pending::SubProcess(node));
                            containers.push(Container {
                                nodes: Vec::new(),
                                flows: Vec::new(),
                                data_objects: Vec::new(),
                            });
                        }
                    }
                    "callActivity" if in_process => {
                        let node = CallActivityNode {
                            id: require_attr(e, "id", &local)?,
                            name: attr(e, "name"),
                            incoming: vec![],
                            outgoing: vec![],
                            called_element: attr(e, "calledElement"),
                            multi_instance: None,
                        };
                        if is_empty {
                            push_node(&mut containers, Node::CallActivity(node));
                        } else {
                            pending.push(Pending::CallActivity(node));
                        }
                    }

                    // ── multi-instance ──
                    "multiInstanceLoopCharacteristics" if in_process => {
                        mi_spec = Some(MultiInstanceSpec {
                            sequential: attr(e, "isSequential").as_deref() == Some("true"),
                            cardinality: None,
                            collection: attr(e, "collection"),
                            completion_condition: None,
                        });
                        if is_empty {
                            commit_mi(&mut pending, &mut mi_spec);
                        }
                    }
                    "loopCardinality" => {
                        in_cardinality = true;
                        cardinality_text = None;
                    }
                    "completionCondition" => {
                        in_completion_condition = true;
                        completion_text = None;
                    }

                    // ── flows ──
                    "sequenceFlow" if in_process => {
                        let flow = SequenceFlow {
                            id: require_attr(e, "id", &local)?,
                            source_ref: require_attr(e, "sourceRef", &local)?,
                            target_ref: require_attr(e, "targetRef", &local)?,
                            condition_expression: None,
                        };
                        if is_empty {
                            push_flow(&mut containers, flow);
                        } else {
                            pending.push(Pending::Flow(flow));
                        }
                    }
                    "conditionExpression" => {
                        in_condition = true;
                        condition_text = None;
                    }

                    // ── data objects ──
                    "dataObject" if in_process => {
                        if let Some(c) = containers.last_mut() {
                            c.data_objects.push(DataObject {
                                id: require_attr(e, "id", &local)?,
                                name: attr(e, "name"),
                                item_type: attr(e, "itemSubjectRef"),
                            });
                        }
                    }

                    // ── vendor extensions ──
                    "extensionElements" => in_extensions = true,
                    "taskConfig" | "scriptConfig" if in_extensions => {}
                    "script" | "scriptContent" if in_extensions => {
                        script_child = true;
                        script_text = None;
                    }
                    "inputVariables" if in_extensions => var_section = Some(VarSection::Input),
                    "outputVariables" if in_extensions => var_section = Some(VarSection::Output),
                    "variable" if in_extensions => {
                        if let Some(section) = &var_section {
                            if let (Some(name), Some(ty)) = (attr(e, "name"), attr(e, "type")) {
                                if let Some(Pending::Task(task)) = pending.last_mut() {
                                    let map = match section {
                                        VarSection::Input => {
                                            task.input_variables.get_or_insert_with(BTreeMap::new)
                                        }
                                        VarSection::Output => {
                                            task.output_variables.get_or_insert_with(BTreeMap::new)
                                        }
                                    };
                                    map.insert(name, ty);
                                }
                            }
                        }
                    }
                    "serviceTaskConfig" if in_extensions => {
                        service_config = Some(ServiceTaskConfig {
                            task_name: attr(e, "taskName").unwrap_or_default(),
                            properties: BTreeMap::new(),
                        });
                        if is_empty {
                            commit_service_config(&mut pending, &mut service_config);
                        }
                    }
                    "property" if in_extensions => {
                        if let Some(cfg) = service_config.as_mut() {
                            if let (Some(name), Some(value)) = (attr(e, "name"), attr(e, "value")) {
                                cfg.properties
                                    .insert(name, serde_json::Value::String(value));
                            }
                        }
                    }
                    "timerEventConfig" if in_extensions => {
                        if let Some(value) = attr(e, "timerValue") {
                            if let Some(Pending::Event(ev)) = pending.last_mut() {
                                ev.timer_definition.get_or_insert(value);
                                ev.definition.get_or_insert(EventDefinition::Timer);
                            }
                        }
                    }
                    "timeout" if in_extensions => {}

                    // ── explicit rejections ──
                    "businessRuleTask" | "sendTask" | "receiveTask" | "eventBasedGateway"
                    | "complexGateway"
                        if in_process =>
                    {
                        let id = attr(e, "id").unwrap_or_else(|| local.clone());
                        return Err(fail(
                            ValidationCode::InvalidStructure,
                            format!("unsupported BPMN element: <{local}> (id={id})"),
                        ));
                    }
                    _ => {}
                }
            }
            Ok(XmlEvent::End(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "process" => in_process = false,
                    "conditionExpression" => in_condition = false,
                    "timeDuration" | "timeDate" | "timeCycle" => {
                        timer_child = false;
                        if let Some(text) = timer_text.take() {
                            if let Some(Pending::Event(ev)) = pending.last_mut() {
                                ev.timer_definition = Some(text);
                            }
                        }
                    }
                    "script" | "scriptContent" => {
                        script_child = false;
                        if let Some(text) = script_text.take() {
                            if let Some(Pending::Task(task)) = pending.last_mut() {
                                task.script = Some(text);
                            }
                        }
                    }
                    "inputVariables" | "outputVariables" => var_section = None,
                    "serviceTaskConfig" => commit_service_config(&mut pending, &mut service_config),
                    "extensionElements" => in_extensions = false,
                    "loopCardinality" => {
                        in_cardinality = false;
                        if let (Some(text), Some(spec)) = (cardinality_text.take(), mi_spec.as_mut())
                        {
                            spec.cardinality = Some(text);
                        }
                    }
                    "completionCondition" => {
                        in_completion_condition = false;
                        if let (Some(text), Some(spec)) = (completion_text.take(), mi_spec.as_mut())
                        {
                            spec.completion_condition = Some(text);
                        }
                    }
                    "multiInstanceLoopCharacteristics" => commit_mi(&mut pending, &mut mi_spec),
                    "startEvent" | "endEvent" | "intermediateCatchEvent"
                    | "intermediateThrowEvent" | "boundaryEvent" => {
                        if let Some(Pending::Event(ev)) = pending.pop() {
                            push_node(&mut containers, Node::Event(ev));
                        }
                    }
                    "task" | "scriptTask" | "serviceTask" | "userTask" | "manualTask" => {
                        if let Some(Pending::Task(task)) = pending.pop() {
                            push_node(&mut containers, Node::Task(task));
                        }
                    }
                    "subProcess" | "transaction" => {
                        if let Some(Pending::SubProcess(mut sp)) = pending.pop() {
                            if let Some(body) = containers.pop() {
                                sp.nodes = body.nodes;
                                sp.flows = body.flows;
                            }
                            push_node(&mut containers, Node::SubProcess(sp));
                        }
                    }
                    "callActivity" => {
                        if let Some(Pending::CallActivity(ca)) = pending.pop() {
                            push_node(&mut containers, Node::CallActivity(ca));
                        }
                    }
                    "sequenceFlow" => {
                        if let Some(Pending::Flow(mut flow)) = pending.pop() {
                            flow.condition_expression = condition_text.take();
                            push_flow(&mut containers, flow);
                        }
                    }
                    _ => {}
                }
            }
            Ok(XmlEvent::Text(ref e)) => {
                if let Ok(text) = e.unescape() {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        if in_condition {
                            condition_text = Some(text);
                        } else if timer_child {
                            timer_text = Some(text);
                        } else if script_child {
                            script_text = Some(text);
                        } else if in_cardinality {
                            cardinality_text = Some(text);
                        } else if in_completion_condition {
                            completion_text = Some(text);
                        }
                    }
                }
            }
            Ok(XmlEvent::CData(ref e)) => {
                if script_child {
                    script_text = Some(String::from_utf8_lossy(e).trim().to_string());
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => {
                return Err(fail(
                    ValidationCode::XmlParseError,
                    format!("XML parse error: {e}"),
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    let Some(body) = containers.pop() else {
        return Err(fail(
            ValidationCode::InvalidStructure,
            "no process found in BPMN XML",
        ));
    };

    let mut graph = ProcessGraph {
        nodes: body.nodes,
        flows: body.flows,
        data_objects: body.data_objects,
    };
    wire_incoming_outgoing(&mut graph.nodes, &graph.flows.clone());
    Ok(graph)
}

// ─── Helpers ──────────────────────────────────────────────────

fn event_node(e: &BytesStart<'_>, local: &str) -> std::result::Result<EventNode, BuildError> {
    let kind = match local {
        "startEvent" => EventKind::Start,
        "endEvent" => EventKind::End,
        "boundaryEvent" => EventKind::Boundary,
        _ => EventKind::Intermediate,
    };
    Ok(EventNode {
        id: require_attr(e, "id", local)?,
        name: attr(e, "name"),
        kind,
        definition: None,
        incoming: vec![],
        outgoing: vec![],
        event_name: None,
        timer_definition: None,
        error_code: None,
        activity_ref: None,
        attached_to: None,
        interrupting: true,
        throwing: local == "intermediateThrowEvent" || local == "endEvent",
    })
}

fn set_definition(pending: &mut [Pending], def: EventDefinition) {
    if let Some(Pending::Event(ev)) = pending.last_mut() {
        ev.definition = Some(def);
    }
}

fn set_event_name(pending: &mut [Pending], name: String) {
    if let Some(Pending::Event(ev)) = pending.last_mut() {
        ev.event_name = Some(name);
    }
}

fn commit_mi(pending: &mut [Pending], spec: &mut Option<MultiInstanceSpec>) {
    if let (Some(p), Some(s)) = (pending.last_mut(), spec.take()) {
        if let Some(slot) = p.multi_instance_slot() {
            *slot = Some(s);
        }
    }
}

fn commit_service_config(pending: &mut [Pending], cfg: &mut Option<ServiceTaskConfig>) {
    if let (Some(Pending::Task(task)), Some(c)) = (pending.last_mut(), cfg.take()) {
        task.extensions.insert(
            "serviceTaskConfig".into(),
            serde_json::to_value(&c).unwrap_or(serde_json::Value::Null),
        );
        task.service = Some(c);
    }
}

fn push_node(containers: &mut [Container], node: Node) {
    if let Some(c) = containers.last_mut() {
        c.nodes.push(node);
    }
}

fn push_flow(containers: &mut [Container], flow: SequenceFlow) {
    if let Some(c) = containers.last_mut() {
        c.flows.push(flow);
    }
}

/// Populate `incoming`/`outgoing` on every node from its container's flows,
/// recursing into subprocess bodies.
fn wire_incoming_outgoing(nodes: &mut [Node], flows: &[SequenceFlow]) {
    for node in nodes.iter_mut() {
        let id = node.id().to_string();
        let incoming: Vec<String> = flows
            .iter()
            .filter(|f| f.target_ref == id)
            .map(|f| f.id.clone())
            .collect();
        let outgoing: Vec<String> = flows
            .iter()
            .filter(|f| f.source_ref == id)
            .map(|f| f.id.clone())
            .collect();
        match node {
            Node::Event(n) => {
                n.incoming = incoming;
                n.outgoing = outgoing;
            }
            Node::Task(n) => {
                n.incoming = incoming;
                n.outgoing = outgoing;
            }
            Node::Gateway(n) => {
                n.incoming = incoming;
                n.outgoing = outgoing;
            }
            Node::SubProcess(n) => {
                n.incoming = incoming;
                n.outgoing = outgoing;
                let inner = n.flows.clone();
                wire_incoming_outgoing(&mut n.nodes, &inner);
            }
            Node::CallActivity(n) => {
                n.incoming = incoming;
                n.outgoing = outgoing;
            }
        }
    }
}

fn local_name(qname: &[u8]) -> String {
    let name = match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    };
    String::from_utf8_lossy(name).to_string()
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        let key = local_name(a.key.as_ref());
        if key == name {
            a.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

fn require_attr(
    e: &BytesStart<'_>,
    name: &str,
    element: &str,
) -> std::result::Result<String, BuildError> {
    attr(e, name).ok_or_else(|| {
        fail(
            ValidationCode::MissingAttribute,
            format!("<{element}> is missing required attribute '{name}'"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL"
                      xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
      <bpmn:process id="proc" isExecutable="true">
        <bpmn:startEvent id="Start_1" />
        <bpmn:task id="Task_1" name="Do work">
          <bpmn:extensionElements>
            <pythmata:taskConfig>
              <pythmata:script>result = 1 + 0</pythmata:script>
              <pythmata:inputVariables>
                <pythmata:variable name="amount" type="integer" />
              </pythmata:inputVariables>
            </pythmata:taskConfig>
          </bpmn:extensionElements>
        </bpmn:task>
        <bpmn:endEvent id="End_1" />
        <bpmn:sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Task_1" />
        <bpmn:sequenceFlow id="F_2" sourceRef="Task_1" targetRef="End_1" />
      </bpmn:process>
    </bpmn:definitions>"#;

    #[test]
    fn parses_linear_process() {
        let graph = parse(LINEAR).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.flows.len(), 2);
        let task = match graph.find_node("Task_1").unwrap() {
            Node::Task(t) => t,
            other => panic!("expected task, got {other:?}"),
        };
        assert_eq!(task.script.as_deref(), Some("result = 1 + 0"));
        assert_eq!(
            task.input_variables.as_ref().unwrap().get("amount"),
            Some(&"integer".to_string())
        );
        assert_eq!(task.incoming, vec!["F_1"]);
        assert_eq!(task.outgoing, vec!["F_2"]);
    }

    #[test]
    fn parses_gateway_with_conditions_and_default() {
        let xml = r#"<?xml version="1.0"?>
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p">
            <startEvent id="Start_1" />
            <exclusiveGateway id="Gw_1" default="F_B" />
            <task id="A" /><task id="B" />
            <endEvent id="End_1" /><endEvent id="End_2" />
            <sequenceFlow id="F_0" sourceRef="Start_1" targetRef="Gw_1" />
            <sequenceFlow id="F_A" sourceRef="Gw_1" targetRef="A">
              <conditionExpression>${amount &gt; 1000}</conditionExpression>
            </sequenceFlow>
            <sequenceFlow id="F_B" sourceRef="Gw_1" targetRef="B" />
            <sequenceFlow id="F_1" sourceRef="A" targetRef="End_1" />
            <sequenceFlow id="F_2" sourceRef="B" targetRef="End_2" />
          </process>
        </definitions>"#;
        let graph = parse(xml).unwrap();
        let gw = match graph.find_node("Gw_1").unwrap() {
            Node::Gateway(g) => g,
            other => panic!("expected gateway, got {other:?}"),
        };
        assert_eq!(gw.kind, GatewayKind::Exclusive);
        assert_eq!(gw.default_flow.as_deref(), Some("F_B"));
        let f_a = graph.find_flow("F_A").unwrap();
        assert_eq!(f_a.condition_expression.as_deref(), Some("${amount > 1000}"));
    }

    #[test]
    fn parses_nested_subprocess_and_boundary() {
        let xml = r#"<?xml version="1.0"?>
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p">
            <startEvent id="Start_1" />
            <subProcess id="Sub_1">
              <multiInstanceLoopCharacteristics isSequential="false" collection="departments">
                <completionCondition>${count &gt;= 2}</completionCondition>
              </multiInstanceLoopCharacteristics>
              <startEvent id="SubStart" />
              <task id="Inner" />
              <endEvent id="SubEnd" />
              <sequenceFlow id="SF_1" sourceRef="SubStart" targetRef="Inner" />
              <sequenceFlow id="SF_2" sourceRef="Inner" targetRef="SubEnd" />
            </subProcess>
            <boundaryEvent id="Timeout" attachedToRef="Sub_1" cancelActivity="true">
              <timerEventDefinition><timeDuration>PT5M</timeDuration></timerEventDefinition>
            </boundaryEvent>
            <endEvent id="End_1" />
            <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Sub_1" />
            <sequenceFlow id="F_2" sourceRef="Sub_1" targetRef="End_1" />
            <sequenceFlow id="F_3" sourceRef="Timeout" targetRef="End_1" />
          </process>
        </definitions>"#;
        let graph = parse(xml).unwrap();
        let sub = match graph.find_node("Sub_1").unwrap() {
            Node::SubProcess(s) => s,
            other => panic!("expected subprocess, got {other:?}"),
        };
        let mi = sub.multi_instance.as_ref().unwrap();
        assert!(!mi.sequential);
        assert_eq!(mi.collection.as_deref(), Some("departments"));
        assert_eq!(mi.completion_condition.as_deref(), Some("${count >= 2}"));
        assert_eq!(sub.start_event().unwrap().id, "SubStart");

        let boundary = &graph.boundary_events_for("Sub_1");
        assert_eq!(boundary.len(), 1);
        assert_eq!(boundary[0].definition, Some(EventDefinition::Timer));
        assert_eq!(boundary[0].timer_definition.as_deref(), Some("PT5M"));
        assert!(boundary[0].interrupting);
    }

    #[test]
    fn parses_service_task_config() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL"
                          xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
          <bpmn:process id="p">
            <bpmn:startEvent id="Start_1" />
            <bpmn:serviceTask id="Svc_1">
              <bpmn:extensionElements>
                <pythmata:serviceTaskConfig taskName="http">
                  <pythmata:properties>
                    <pythmata:property name="url" value="https://example.org" />
                  </pythmata:properties>
                </pythmata:serviceTaskConfig>
              </bpmn:extensionElements>
            </bpmn:serviceTask>
            <bpmn:endEvent id="End_1" />
            <bpmn:sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Svc_1" />
            <bpmn:sequenceFlow id="F_2" sourceRef="Svc_1" targetRef="End_1" />
          </bpmn:process>
        </bpmn:definitions>"#;
        let graph = parse(xml).unwrap();
        let task = match graph.find_node("Svc_1").unwrap() {
            Node::Task(t) => t,
            other => panic!("expected task, got {other:?}"),
        };
        let svc = task.service.as_ref().unwrap();
        assert_eq!(svc.task_name, "http");
        assert_eq!(
            svc.properties.get("url"),
            Some(&serde_json::Value::String("https://example.org".into()))
        );
    }

    #[test]
    fn rejects_unknown_flow_reference() {
        let xml = r#"<?xml version="1.0"?>
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p">
            <startEvent id="Start_1" />
            <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Ghost" />
          </process>
        </definitions>"#;
        let err = parse(xml).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBpmn(_)));
    }

    #[test]
    fn rejects_missing_source_ref() {
        let xml = r#"<?xml version="1.0"?>
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p">
            <startEvent id="Start_1" />
            <sequenceFlow id="F_1" targetRef="Start_1" />
          </process>
        </definitions>"#;
        assert!(parse(xml).is_err());
    }

    #[test]
    fn rejects_unsupported_element() {
        let xml = r#"<?xml version="1.0"?>
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p">
            <startEvent id="Start_1" />
            <eventBasedGateway id="Ebg_1" />
          </process>
        </definitions>"#;
        assert!(parse(xml).is_err());
    }
}
