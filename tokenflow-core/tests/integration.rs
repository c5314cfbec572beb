//! End-to-end scenarios against the in-memory stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use tokenflow_core::bus::{EventBusBridge, InMemoryEventBus, ProcessStartedEvent};
use tokenflow_core::engine::ProcessEngine;
use tokenflow_core::scheduler::TimerScheduler;
use tokenflow_core::service::{ServiceContext, ServiceTask, ServiceTaskRegistry};
use tokenflow_core::store::{DurableStore, RuntimeStore};
use tokenflow_core::store_memory::{MemoryDurableStore, MemoryRuntimeStore};
use tokenflow_core::{
    ActivityType, InstanceStatus, ProcessDefinitionRecord, TokenState, VariableType, VariableValue,
};

struct Harness {
    durable: Arc<MemoryDurableStore>,
    runtime: Arc<MemoryRuntimeStore>,
    registry: Arc<ServiceTaskRegistry>,
    engine: Arc<ProcessEngine>,
}

fn harness() -> Harness {
    let durable = Arc::new(MemoryDurableStore::new());
    let runtime = Arc::new(MemoryRuntimeStore::new());
    let registry = Arc::new(ServiceTaskRegistry::new());
    let engine = Arc::new(ProcessEngine::new(
        durable.clone(),
        runtime.clone(),
        registry.clone(),
    ));
    Harness {
        durable,
        runtime,
        registry,
        engine,
    }
}

impl Harness {
    async fn deploy(&self, name: &str, xml: &str) -> Uuid {
        let id = Uuid::now_v7();
        self.engine
            .deploy_definition(&ProcessDefinitionRecord {
                id,
                name: name.into(),
                version: 1,
                bpmn_xml: xml.into(),
                variable_definitions: vec![],
            })
            .await
            .unwrap();
        id
    }

    async fn activity_types(&self, instance: Uuid) -> Vec<(ActivityType, Option<String>)> {
        self.durable
            .read_activities(instance)
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.activity_type, a.node_id))
            .collect()
    }

    async fn variable(&self, instance: Uuid, name: &str) -> Option<Value> {
        self.durable
            .load_variables(instance, None)
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.name == name)
            .map(|v| v.value.value)
    }
}

fn int_var(n: i64) -> VariableValue {
    VariableValue::new(VariableType::Integer, json!(n)).unwrap()
}

fn string_var(s: &str) -> VariableValue {
    VariableValue::new(VariableType::String, json!(s)).unwrap()
}

/// Assert that `needle` appears as a subsequence of `haystack`.
fn assert_subsequence(haystack: &[(ActivityType, Option<String>)], needle: &[(ActivityType, Option<&str>)]) {
    let mut it = haystack.iter();
    for expected in needle {
        let found = it.any(|(ty, node)| {
            *ty == expected.0 && node.as_deref() == expected.1
        });
        assert!(
            found,
            "expected {:?} in order within {:?}",
            expected, haystack
        );
    }
}

// ─── S1: simple linear flow ───────────────────────────────────

const S1_LINEAR: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="linear">
    <startEvent id="Start_1" />
    <task id="Task_1" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Task_1" />
    <sequenceFlow id="F_2" sourceRef="Task_1" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s1_linear_flow_completes() {
    let h = harness();
    let def = h.deploy("linear", S1_LINEAR).await;

    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.end_time.is_some());

    // zero live tokens
    assert!(h.runtime.list_tokens(instance.id).await.unwrap().is_empty());

    let log = h.activity_types(instance.id).await;
    assert_subsequence(
        &log,
        &[
            (ActivityType::InstanceCreated, None),
            (ActivityType::NodeEntered, Some("Start_1")),
            (ActivityType::NodeCompleted, Some("Start_1")),
            (ActivityType::NodeEntered, Some("Task_1")),
            (ActivityType::NodeCompleted, Some("Task_1")),
            (ActivityType::InstanceCompleted, None),
        ],
    );
}

// ─── S2: exclusive gateway with default ───────────────────────

const S2_EXCLUSIVE: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="decide">
    <startEvent id="Start_1" />
    <exclusiveGateway id="Gw_1" default="F_B" />
    <scriptTask id="Task_A">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("branch", "A")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <scriptTask id="Task_B">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("branch", "B")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <endEvent id="End_A" /><endEvent id="End_B" />
    <sequenceFlow id="F_0" sourceRef="Start_1" targetRef="Gw_1" />
    <sequenceFlow id="F_A" sourceRef="Gw_1" targetRef="Task_A">
      <conditionExpression>${amount &gt; 1000}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="F_B" sourceRef="Gw_1" targetRef="Task_B" />
    <sequenceFlow id="F_3" sourceRef="Task_A" targetRef="End_A" />
    <sequenceFlow id="F_4" sourceRef="Task_B" targetRef="End_B" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s2_exclusive_gateway_takes_default() {
    let h = harness();
    let def = h.deploy("decide", S2_EXCLUSIVE).await;

    let mut vars = BTreeMap::new();
    vars.insert("amount".to_string(), int_var(500));
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(h.variable(instance.id, "branch").await, Some(json!("B")));
}

#[tokio::test]
async fn s2_exclusive_gateway_takes_condition_when_true() {
    let h = harness();
    let def = h.deploy("decide", S2_EXCLUSIVE).await;

    let mut vars = BTreeMap::new();
    vars.insert("amount".to_string(), int_var(5000));
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(h.variable(instance.id, "branch").await, Some(json!("A")));
}

#[tokio::test]
async fn exclusive_gateway_without_any_path_fails_instance() {
    let xml = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="p">
        <startEvent id="Start_1" />
        <exclusiveGateway id="Gw_1" />
        <task id="A" />
        <endEvent id="End_1" />
        <sequenceFlow id="F_0" sourceRef="Start_1" targetRef="Gw_1" />
        <sequenceFlow id="F_A" sourceRef="Gw_1" targetRef="A">
          <conditionExpression>${amount &gt; 1000}</conditionExpression>
        </sequenceFlow>
        <sequenceFlow id="F_1" sourceRef="A" targetRef="End_1" />
      </process>
    </definitions>"#;
    let h = harness();
    let def = h.deploy("nopath", xml).await;

    let mut vars = BTreeMap::new();
    vars.insert("amount".to_string(), int_var(1));
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Error);
    // the token is retained at the failing gateway for resume
    let tokens = h.runtime.list_tokens(instance.id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].node_id, "Gw_1");
    let log = h.activity_types(instance.id).await;
    assert!(log.iter().any(|(ty, _)| *ty == ActivityType::InstanceError));
}

// ─── S3: parallel split-join ──────────────────────────────────

const S3_PARALLEL: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="fanout">
    <startEvent id="Start_1" />
    <parallelGateway id="Split" />
    <scriptTask id="Task_A">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("ran_a", true)</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <scriptTask id="Task_B">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("ran_b", true)</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <parallelGateway id="Join" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_0" sourceRef="Start_1" targetRef="Split" />
    <sequenceFlow id="F_A" sourceRef="Split" targetRef="Task_A" />
    <sequenceFlow id="F_B" sourceRef="Split" targetRef="Task_B" />
    <sequenceFlow id="F_JA" sourceRef="Task_A" targetRef="Join" />
    <sequenceFlow id="F_JB" sourceRef="Task_B" targetRef="Join" />
    <sequenceFlow id="F_E" sourceRef="Join" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s3_parallel_split_join_conserves_tokens() {
    let h = harness();
    let def = h.deploy("fanout", S3_PARALLEL).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(h.variable(instance.id, "ran_a").await, Some(json!(true)));
    assert_eq!(h.variable(instance.id, "ran_b").await, Some(json!(true)));

    let log = h.activity_types(instance.id).await;
    // the join forwards exactly one token: End_1 entered once, one completion
    let end_entries = log
        .iter()
        .filter(|(ty, node)| *ty == ActivityType::NodeEntered && node.as_deref() == Some("End_1"))
        .count();
    assert_eq!(end_entries, 1);
    let completions = log
        .iter()
        .filter(|(ty, _)| *ty == ActivityType::InstanceCompleted)
        .count();
    assert_eq!(completions, 1);
}

// ─── Inclusive gateway ────────────────────────────────────────

const INCLUSIVE: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="inclusive">
    <startEvent id="Start_1" />
    <inclusiveGateway id="Split" default="F_C" />
    <scriptTask id="Task_A">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("ran_a", true)</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <scriptTask id="Task_B">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("ran_b", true)</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <scriptTask id="Task_C">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("ran_c", true)</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <inclusiveGateway id="Join" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_0" sourceRef="Start_1" targetRef="Split" />
    <sequenceFlow id="F_A" sourceRef="Split" targetRef="Task_A">
      <conditionExpression>${amount &gt; 10}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="F_B" sourceRef="Split" targetRef="Task_B">
      <conditionExpression>${amount &gt; 100}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="F_C" sourceRef="Split" targetRef="Task_C" />
    <sequenceFlow id="F_JA" sourceRef="Task_A" targetRef="Join" />
    <sequenceFlow id="F_JB" sourceRef="Task_B" targetRef="Join" />
    <sequenceFlow id="F_JC" sourceRef="Task_C" targetRef="Join" />
    <sequenceFlow id="F_E" sourceRef="Join" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn inclusive_gateway_takes_all_truthy_paths() {
    let h = harness();
    let def = h.deploy("inclusive", INCLUSIVE).await;

    let mut vars = BTreeMap::new();
    vars.insert("amount".to_string(), int_var(500));
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(h.variable(instance.id, "ran_a").await, Some(json!(true)));
    assert_eq!(h.variable(instance.id, "ran_b").await, Some(json!(true)));
    assert_eq!(h.variable(instance.id, "ran_c").await, None);
}

#[tokio::test]
async fn inclusive_gateway_falls_back_to_default() {
    let h = harness();
    let def = h.deploy("inclusive", INCLUSIVE).await;

    let mut vars = BTreeMap::new();
    vars.insert("amount".to_string(), int_var(1));
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(h.variable(instance.id, "ran_c").await, Some(json!(true)));
    assert_eq!(h.variable(instance.id, "ran_a").await, None);
}

// ─── S4: parallel multi-instance ──────────────────────────────

const S4_MULTI: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="multi">
    <startEvent id="Start_1" />
    <scriptTask id="A">
      <multiInstanceLoopCharacteristics isSequential="false" collection="departments" />
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("seen_" + str(index), item)</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <task id="Task_1" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="A" />
    <sequenceFlow id="F_2" sourceRef="A" targetRef="Task_1" />
    <sequenceFlow id="F_3" sourceRef="Task_1" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s4_parallel_multi_instance_over_collection() {
    let h = harness();
    let def = h.deploy("multi", S4_MULTI).await;

    let mut vars = BTreeMap::new();
    vars.insert(
        "departments".to_string(),
        VariableValue::new(VariableType::Json, json!(["HR", "IT", "Finance"])).unwrap(),
    );
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);

    // each instance ran with its own item, in its own scope segment
    let all = h.durable.load_variables(instance.id, None).await.unwrap();
    for (i, dept) in ["HR", "IT", "Finance"].iter().enumerate() {
        let var = all
            .iter()
            .find(|v| v.name == format!("seen_{i}"))
            .unwrap_or_else(|| panic!("missing seen_{i}"));
        assert_eq!(var.value.value, json!(dept));
        assert_eq!(var.scope_id.as_deref(), Some(format!("A_instance_{i}").as_str()));
    }

    // the successor ran exactly once
    let log = h.activity_types(instance.id).await;
    let successor_entries = log
        .iter()
        .filter(|(ty, node)| *ty == ActivityType::NodeEntered && node.as_deref() == Some("Task_1"))
        .count();
    assert_eq!(successor_entries, 1);
}

/// Records each execution's `item` so the test can assert ordering.
struct RecorderTask {
    seen: std::sync::Mutex<Vec<Value>>,
}

#[async_trait]
impl ServiceTask for RecorderTask {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn execute(
        &self,
        context: ServiceContext<'_>,
        _properties: &BTreeMap<String, Value>,
    ) -> anyhow::Result<Value> {
        let item = context
            .token
            .data
            .get("item")
            .cloned()
            .unwrap_or(Value::Null);
        self.seen.lock().unwrap().push(item);
        Ok(json!(null))
    }
}

#[tokio::test]
async fn sequential_multi_instance_steps_in_order() {
    let xml = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
        xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
      <process id="seq">
        <startEvent id="Start_1" />
        <serviceTask id="A">
          <multiInstanceLoopCharacteristics isSequential="true" collection="steps" />
          <extensionElements>
            <pythmata:serviceTaskConfig taskName="recorder" />
          </extensionElements>
        </serviceTask>
        <endEvent id="End_1" />
        <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="A" />
        <sequenceFlow id="F_2" sourceRef="A" targetRef="End_1" />
      </process>
    </definitions>"#;
    let h = harness();
    let recorder = Arc::new(RecorderTask {
        seen: std::sync::Mutex::new(Vec::new()),
    });
    h.registry.register(recorder.clone());
    let def = h.deploy("seq", xml).await;

    let mut vars = BTreeMap::new();
    vars.insert(
        "steps".to_string(),
        VariableValue::new(VariableType::Json, json!(["x", "y", "z"])).unwrap(),
    );
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![json!("x"), json!("y"), json!("z")]);
}

#[tokio::test]
async fn empty_collection_skips_activity() {
    let h = harness();
    let def = h.deploy("multi", S4_MULTI).await;

    let mut vars = BTreeMap::new();
    vars.insert(
        "departments".to_string(),
        VariableValue::new(VariableType::Json, json!([])).unwrap(),
    );
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    // the multi-instance body never ran
    let all = h.durable.load_variables(instance.id, None).await.unwrap();
    assert!(all.iter().all(|v| !v.name.starts_with("seen_")));
}

// ─── S5: call activity with variable mapping ──────────────────

const S5_CHILD: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="child">
    <startEvent id="Start_1" />
    <scriptTask id="Work">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("result", "done")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Work" />
    <sequenceFlow id="F_2" sourceRef="Work" targetRef="End_1" />
  </process>
</definitions>"#;

const S5_PARENT: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="parent">
    <startEvent id="Start_1" />
    <callActivity id="Call_1" calledElement="child" />
    <task id="After" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Call_1" />
    <sequenceFlow id="F_2" sourceRef="Call_1" targetRef="After" />
    <sequenceFlow id="F_3" sourceRef="After" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s5_call_activity_maps_variables_both_ways() {
    let h = harness();
    h.deploy("child", S5_CHILD).await;
    let parent_def = h.deploy("parent", S5_PARENT).await;

    let mut vars = BTreeMap::new();
    vars.insert("parent_var".to_string(), string_var("hello"));
    // mappings ride on the token, as the engine's callers provide them
    let created = h
        .engine
        .instances()
        .create_instance(parent_def, None, Some(vars), None)
        .await
        .unwrap();
    let mut entries = BTreeMap::new();
    entries.insert(
        "input_vars".to_string(),
        json!({"subprocess_var": "parent_var"}),
    );
    entries.insert(
        "output_vars".to_string(),
        json!({"parent_result": "result"}),
    );
    h.runtime
        .merge_token_data(created.id, "Start_1", None, &entries)
        .await
        .unwrap();
    h.engine.run_instance(created.id).await.unwrap();

    let parent = h.engine.get_instance(created.id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Completed);
    assert_eq!(
        h.variable(parent.id, "parent_result").await,
        Some(json!("done"))
    );

    // the child instance completed with zero live tokens and saw the input
    let instances = h.engine.list_instances().await.unwrap();
    let child = instances
        .iter()
        .find(|i| i.id != parent.id)
        .expect("child instance row");
    assert_eq!(child.status, InstanceStatus::Completed);
    assert!(h.runtime.list_tokens(child.id).await.unwrap().is_empty());
    assert_eq!(
        h.variable(child.id, "subprocess_var").await,
        Some(json!("hello"))
    );
}

// ─── S6: timer start event ────────────────────────────────────

const S6_TIMER: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="timed">
    <startEvent id="TimerStart">
      <timerEventDefinition><timeDuration>PT1H</timeDuration></timerEventDefinition>
    </startEvent>
    <task id="Task_1" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="TimerStart" targetRef="Task_1" />
    <sequenceFlow id="F_2" sourceRef="Task_1" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s6_timer_start_event_schedules_and_fires_once() {
    let h = harness();
    let def = h.deploy("timed", S6_TIMER).await;

    let (bus, mut rx) = InMemoryEventBus::channel();
    let scheduler = TimerScheduler::new(
        h.durable.clone() as Arc<dyn DurableStore>,
        h.runtime.clone() as Arc<dyn RuntimeStore>,
        Arc::new(bus),
    );

    // first scan schedules exactly one job ~1h out
    assert!(scheduler.scan_definitions().await.unwrap());
    let jobs = scheduler.jobs().await;
    assert_eq!(jobs.len(), 1);
    let delta = jobs[0].next_fire - Utc::now();
    assert!(delta > Duration::minutes(59) && delta <= Duration::hours(1));

    // unchanged definitions: digest short-circuits the rescan
    assert!(!scheduler.scan_definitions().await.unwrap());

    // nothing due yet
    let started = scheduler.fire_due(&h.engine, Utc::now()).await.unwrap();
    assert!(started.is_empty());

    // one firing at t0+1h, and the one-shot job is gone afterwards
    let started = scheduler
        .fire_due(&h.engine, Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    assert!(scheduler.jobs().await.is_empty());

    let event = rx.recv().await.unwrap();
    assert_eq!(event.definition_id, def);
    assert_eq!(event.source, "timer_scheduler");

    // consume: one instance; duplicate delivery reuses the row
    EventBusBridge::handle(&h.engine, event.clone()).await.unwrap();
    EventBusBridge::handle(&h.engine, event.clone()).await.unwrap();
    let instances = h.engine.list_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, event.instance_id);
    assert_eq!(instances[0].status, InstanceStatus::Completed);
}

#[tokio::test]
async fn duplicate_process_started_creates_one_token() {
    let h = harness();
    let def = h.deploy("linear", S1_LINEAR).await;

    // first delivery creates the row and plants the token but does not run
    let id = Uuid::now_v7();
    let event = ProcessStartedEvent::new(id, def, "test");
    h.engine
        .instances()
        .create_instance(def, Some(id), None, None)
        .await
        .unwrap();
    // redelivery must reuse the row and never plant a second token
    EventBusBridge::handle(&h.engine, event).await.unwrap();

    let instances = h.engine.list_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
}

// ─── Message events ───────────────────────────────────────────

const MESSAGE_WAIT: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <message id="Msg_Order" name="order_placed" />
  <process id="waiter">
    <startEvent id="Start_1" />
    <intermediateCatchEvent id="Catch_1">
      <messageEventDefinition messageRef="Msg_Order" />
    </intermediateCatchEvent>
    <task id="After" />
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Catch_1" />
    <sequenceFlow id="F_2" sourceRef="Catch_1" targetRef="After" />
    <sequenceFlow id="F_3" sourceRef="After" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn message_catch_parks_and_resumes_on_publish() {
    let h = harness();
    let def = h.deploy("waiter", MESSAGE_WAIT).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    // parked on the subscription
    assert_eq!(instance.status, InstanceStatus::Running);
    let tokens = h.runtime.list_tokens(instance.id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].node_id, "Catch_1");
    assert_eq!(tokens[0].state, TokenState::Waiting);

    h.engine
        .publish_message("order_placed", Some(instance.id), None, Some(json!({"qty": 3})))
        .await
        .unwrap();

    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert!(h.runtime.list_tokens(instance.id).await.unwrap().is_empty());
    assert!(h
        .runtime
        .list_instance_subscriptions(instance.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn suspend_resume_preserves_waiting_position() {
    let h = harness();
    let def = h.deploy("waiter", MESSAGE_WAIT).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    let before = h.runtime.list_tokens(instance.id).await.unwrap();
    h.engine.suspend_instance(instance.id).await.unwrap();
    let during = h.runtime.list_tokens(instance.id).await.unwrap();
    assert_eq!(before.len(), during.len());
    assert_eq!(before[0].node_id, during[0].node_id);

    h.engine.resume_instance(instance.id).await.unwrap();
    let after = h.runtime.list_tokens(instance.id).await.unwrap();
    assert_eq!(before[0].node_id, after[0].node_id);

    // still responsive to the message after the round trip
    h.engine
        .publish_message("order_placed", Some(instance.id), None, None)
        .await
        .unwrap();
    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn terminate_clears_subscriptions_and_tokens() {
    let h = harness();
    let def = h.deploy("waiter", MESSAGE_WAIT).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    h.engine.terminate_instance(instance.id).await.unwrap();
    assert!(h.runtime.list_tokens(instance.id).await.unwrap().is_empty());
    assert!(h
        .runtime
        .list_instance_subscriptions(instance.id)
        .await
        .unwrap()
        .is_empty());

    // a late publish is a no-op
    h.engine
        .publish_message("order_placed", Some(instance.id), None, None)
        .await
        .unwrap();
    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

// ─── Signal broadcast ─────────────────────────────────────────

#[tokio::test]
async fn signal_broadcasts_to_every_waiting_instance() {
    let xml = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <signal id="Sig_Go" name="go" />
      <process id="sigwaiter">
        <startEvent id="Start_1" />
        <intermediateCatchEvent id="Catch_1">
          <signalEventDefinition signalRef="Sig_Go" />
        </intermediateCatchEvent>
        <endEvent id="End_1" />
        <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Catch_1" />
        <sequenceFlow id="F_2" sourceRef="Catch_1" targetRef="End_1" />
      </process>
    </definitions>"#;
    let h = harness();
    let def = h.deploy("sigwaiter", xml).await;

    let a = h.engine.create_instance(def, None, None, None).await.unwrap();
    let b = h.engine.create_instance(def, None, None, None).await.unwrap();
    assert_eq!(a.status, InstanceStatus::Running);
    assert_eq!(b.status, InstanceStatus::Running);

    h.engine.publish_signal("go", None, None).await.unwrap();

    assert_eq!(
        h.engine.get_instance(a.id).await.unwrap().status,
        InstanceStatus::Completed
    );
    assert_eq!(
        h.engine.get_instance(b.id).await.unwrap().status,
        InstanceStatus::Completed
    );
}

// ─── Subprocess + boundary events ─────────────────────────────

const SUBPROCESS_BOUNDARY: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <message id="Msg_Stop" name="stop_it" />
  <process id="subp">
    <startEvent id="Start_1" />
    <subProcess id="Sub_1">
      <startEvent id="SubStart" />
      <intermediateCatchEvent id="InnerWait">
        <messageEventDefinition messageRef="Msg_Stop" />
      </intermediateCatchEvent>
      <endEvent id="SubEnd" />
      <sequenceFlow id="SF_1" sourceRef="SubStart" targetRef="InnerWait" />
      <sequenceFlow id="SF_2" sourceRef="InnerWait" targetRef="SubEnd" />
    </subProcess>
    <boundaryEvent id="Timeout" attachedToRef="Sub_1" cancelActivity="true">
      <timerEventDefinition><timeDuration>PT10M</timeDuration></timerEventDefinition>
    </boundaryEvent>
    <task id="Escalate" />
    <endEvent id="End_Normal" />
    <endEvent id="End_Escalated" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Sub_1" />
    <sequenceFlow id="F_2" sourceRef="Sub_1" targetRef="End_Normal" />
    <sequenceFlow id="F_3" sourceRef="Timeout" targetRef="Escalate" />
    <sequenceFlow id="F_4" sourceRef="Escalate" targetRef="End_Escalated" />
  </process>
</definitions>"#;

#[tokio::test]
async fn subprocess_scope_entry_and_exit() {
    let h = harness();
    let def = h.deploy("subp", SUBPROCESS_BOUNDARY).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    // inner wait carries the subprocess scope
    let tokens = h.runtime.list_tokens(instance.id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].node_id, "InnerWait");
    assert_eq!(tokens[0].scope_id.as_deref(), Some("Sub_1"));

    h.engine
        .publish_message("stop_it", Some(instance.id), None, None)
        .await
        .unwrap();
    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn interrupting_boundary_timer_cancels_subprocess() {
    let h = harness();
    let def = h.deploy("subp", SUBPROCESS_BOUNDARY).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    // the boundary timer was registered when the subprocess was entered
    let timers = h.runtime.list_token_timers().await.unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].node_id, "Timeout");

    h.engine
        .fire_token_timer(instance.id, "Timeout")
        .await
        .unwrap();

    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    // the escalation path ran; the inner wait token is gone
    let log = h.activity_types(instance.id).await;
    assert_subsequence(&log, &[(ActivityType::NodeEntered, Some("Escalate"))]);
    assert!(h.runtime.list_tokens(instance.id).await.unwrap().is_empty());
}

// ─── Service tasks ────────────────────────────────────────────

struct FlakyTask {
    fail_first: AtomicBool,
}

#[async_trait]
impl ServiceTask for FlakyTask {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(
        &self,
        _context: ServiceContext<'_>,
        _properties: &BTreeMap<String, Value>,
    ) -> anyhow::Result<Value> {
        if self.fail_first.swap(false, Ordering::SeqCst) {
            anyhow::bail!("downstream unavailable");
        }
        Ok(json!({"status": {"code": "ok"}, "attempts": 2}))
    }
}

const SERVICE_FLOW: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="svc">
    <startEvent id="Start_1" />
    <serviceTask id="Svc_1">
      <extensionElements>
        <pythmata:serviceTaskConfig taskName="flaky">
          <pythmata:properties>
            <pythmata:property name="output_mapping" value="ignored" />
          </pythmata:properties>
        </pythmata:serviceTaskConfig>
      </extensionElements>
    </serviceTask>
    <endEvent id="End_1" />
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Svc_1" />
    <sequenceFlow id="F_2" sourceRef="Svc_1" targetRef="End_1" />
  </process>
</definitions>"#;

#[tokio::test]
async fn service_failure_sets_error_and_resume_recovers() {
    let h = harness();
    h.registry.register(Arc::new(FlakyTask {
        fail_first: AtomicBool::new(true),
    }));
    let def = h.deploy("svc", SERVICE_FLOW).await;

    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Error);

    // SERVICE_TASK_EXECUTED with ERROR status was recorded
    let activities = h.durable.read_activities(instance.id).await.unwrap();
    let failed = activities
        .iter()
        .find(|a| a.activity_type == ActivityType::ServiceTaskExecuted)
        .expect("service task log entry");
    assert_eq!(failed.details.as_ref().unwrap()["status"], json!("ERROR"));

    // the token is retained at the failing node; resume re-enters from it
    let tokens = h.runtime.list_tokens(instance.id).await.unwrap();
    assert_eq!(tokens[0].node_id, "Svc_1");
    let resumed = h.engine.resume_instance(instance.id).await.unwrap();
    assert_eq!(resumed.status, InstanceStatus::Running);
    let done = h.engine.get_instance(instance.id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn unregistered_service_task_fails_instance() {
    let h = harness();
    let def = h.deploy("svc", SERVICE_FLOW).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Error);
}

// ─── Compensation ─────────────────────────────────────────────

const COMPENSATION: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
    xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
  <process id="comp">
    <startEvent id="Start_1" />
    <scriptTask id="Book_Hotel">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("order", order + "H")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <scriptTask id="Book_Flight">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("order", order + "F")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <intermediateThrowEvent id="Undo">
      <compensateEventDefinition />
    </intermediateThrowEvent>
    <endEvent id="End_1" />
    <boundaryEvent id="Comp_Hotel" attachedToRef="Book_Hotel">
      <compensateEventDefinition />
    </boundaryEvent>
    <boundaryEvent id="Comp_Flight" attachedToRef="Book_Flight">
      <compensateEventDefinition />
    </boundaryEvent>
    <scriptTask id="Cancel_Hotel">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("order", order + "h")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <scriptTask id="Cancel_Flight">
      <extensionElements>
        <pythmata:scriptConfig>
          <pythmata:scriptContent>set_variable("order", order + "f")</pythmata:scriptContent>
        </pythmata:scriptConfig>
      </extensionElements>
    </scriptTask>
    <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Book_Hotel" />
    <sequenceFlow id="F_2" sourceRef="Book_Hotel" targetRef="Book_Flight" />
    <sequenceFlow id="F_3" sourceRef="Book_Flight" targetRef="Undo" />
    <sequenceFlow id="F_4" sourceRef="Undo" targetRef="End_1" />
    <sequenceFlow id="F_CH" sourceRef="Comp_Hotel" targetRef="Cancel_Hotel" />
    <sequenceFlow id="F_CF" sourceRef="Comp_Flight" targetRef="Cancel_Flight" />
  </process>
</definitions>"#;

#[tokio::test]
async fn compensation_runs_handlers_in_reverse_order() {
    let h = harness();
    let def = h.deploy("comp", COMPENSATION).await;

    let mut vars = BTreeMap::new();
    vars.insert("order".to_string(), string_var(""));
    let instance = h
        .engine
        .create_instance(def, None, Some(vars), None)
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    // bookings in order, compensations LIFO: flight first, then hotel
    assert_eq!(h.variable(instance.id, "order").await, Some(json!("HFfh")));
}

// ─── Terminate end event ──────────────────────────────────────

#[tokio::test]
async fn terminate_end_event_ends_whole_instance() {
    let xml = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <message id="Msg_Never" name="never" />
      <process id="term">
        <startEvent id="Start_1" />
        <parallelGateway id="Split" />
        <intermediateCatchEvent id="Forever">
          <messageEventDefinition messageRef="Msg_Never" />
        </intermediateCatchEvent>
        <endEvent id="Kill">
          <terminateEventDefinition />
        </endEvent>
        <endEvent id="End_1" />
        <sequenceFlow id="F_0" sourceRef="Start_1" targetRef="Split" />
        <sequenceFlow id="F_A" sourceRef="Split" targetRef="Forever" />
        <sequenceFlow id="F_B" sourceRef="Split" targetRef="Kill" />
        <sequenceFlow id="F_C" sourceRef="Forever" targetRef="End_1" />
      </process>
    </definitions>"#;
    let h = harness();
    let def = h.deploy("term", xml).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(h.runtime.list_tokens(instance.id).await.unwrap().is_empty());
    assert!(h
        .runtime
        .list_instance_subscriptions(instance.id)
        .await
        .unwrap()
        .is_empty());
}

// ─── Definition errors ────────────────────────────────────────

#[tokio::test]
async fn cyclic_definition_is_rejected_at_deploy() {
    let xml = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="loop">
        <startEvent id="Start_1" />
        <task id="A" /><task id="B" />
        <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="A" />
        <sequenceFlow id="F_2" sourceRef="A" targetRef="B" />
        <sequenceFlow id="F_3" sourceRef="B" targetRef="A" />
      </process>
    </definitions>"#;
    let h = harness();
    let result = h
        .engine
        .deploy_definition(&ProcessDefinitionRecord {
            id: Uuid::now_v7(),
            name: "loop".into(),
            version: 1,
            bpmn_xml: xml.into(),
            variable_definitions: vec![],
        })
        .await;
    assert!(matches!(
        result,
        Err(tokenflow_core::EngineError::CyclicGraph(_))
    ));
}

#[tokio::test]
async fn script_error_moves_instance_to_error() {
    let xml = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
        xmlns:pythmata="http://pythmata.org/schema/1.0/bpmn">
      <process id="bad">
        <startEvent id="Start_1" />
        <scriptTask id="Boom">
          <extensionElements>
            <pythmata:scriptConfig>
              <pythmata:scriptContent>result = no_such_variable</pythmata:scriptContent>
            </pythmata:scriptConfig>
          </extensionElements>
        </scriptTask>
        <endEvent id="End_1" />
        <sequenceFlow id="F_1" sourceRef="Start_1" targetRef="Boom" />
        <sequenceFlow id="F_2" sourceRef="Boom" targetRef="End_1" />
      </process>
    </definitions>"#;
    let h = harness();
    let def = h.deploy("bad", xml).await;
    let instance = h.engine.create_instance(def, None, None, None).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Error);
    let log = h.activity_types(instance.id).await;
    assert!(log
        .iter()
        .any(|(ty, node)| *ty == ActivityType::InstanceError && node.as_deref() == Some("Boom")));
}
