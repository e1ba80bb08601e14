use super::*;
use crate::config::JobConfig;
use crate::directory::{DeviceInfo, RoomInfo};
use crate::event::{Event, ScopeKey};
use crate::schedule::{ClassSlot, NoSchedule};
use crate::state::MachineState;
use anyhow::anyhow;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

const DISPLAY: &str = "ITB-1101-D1";

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 9, 3, 15, 0, 0).unwrap() + Duration::seconds(secs)
}

fn ev(key: &str, value: &str, secs: i64) -> Event {
    Event::for_device(DISPLAY, key, value, t(secs))
}

fn directory() -> Arc<Directory> {
    Arc::new(Directory::from_parts(
        vec![
            DeviceInfo {
                id: DISPLAY.into(),
                device_type: "non-controllable".into(),
                device_roles: vec!["VideoOut".into()],
                tags: vec![],
            },
            DeviceInfo {
                id: "ITB-1101-VIA1".into(),
                device_type: "via-connect-pro".into(),
                ..Default::default()
            },
        ],
        vec![RoomInfo {
            id: "ITB-1101".into(),
            deployment_group: "production".into(),
            tags: vec![],
        }],
    ))
}

struct FixedSchedule(Vec<ClassSlot>);

#[async_trait]
impl ScheduleLookup for FixedSchedule {
    async fn classes(
        &self,
        _room_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ClassSlot>> {
        Ok(self.0.clone())
    }
}

struct BrokenSchedule;

#[async_trait]
impl ScheduleLookup for BrokenSchedule {
    async fn classes(
        &self,
        _room_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ClassSlot>> {
        Err(anyhow!("schedule service unreachable"))
    }
}

#[derive(Default)]
struct Collector(Mutex<Vec<MetricsRecord>>);

impl Collector {
    fn take(&self) -> Vec<MetricsRecord> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[async_trait]
impl Forward<MetricsRecord> for Collector {
    async fn forward(&self, records: Vec<MetricsRecord>) {
        self.0.lock().unwrap().extend(records);
    }
}

fn machine_with(schedule: Arc<dyn ScheduleLookup>) -> StateMachine<DisplayState, MetricsRecord> {
    let enricher = Arc::new(Enricher::new(directory(), schedule));
    StateMachine::new(Arc::new(display_graph(enricher).unwrap()), ScopeKey::Device)
}

fn machine() -> StateMachine<DisplayState, MetricsRecord> {
    machine_with(Arc::new(NoSchedule))
}

async fn feed(
    machine: &mut StateMachine<DisplayState, MetricsRecord>,
    out: &Collector,
    events: &[Event],
) {
    for event in events {
        machine.process_event(event, out).await.unwrap();
    }
}

/// (type, subject, start, end) in seconds since t(0)
fn spans(records: &[MetricsRecord]) -> Vec<(RecordType, String, i64, i64)> {
    records
        .iter()
        .map(|r| {
            (
                r.record_type,
                r.subject(),
                (r.start_time - t(0)).num_seconds(),
                (r.end_time - t(0)).num_seconds(),
            )
        })
        .collect()
}

fn span(kind: RecordType, subject: &str, start: i64, end: i64) -> (RecordType, String, i64, i64) {
    (kind, subject.to_string(), start, end)
}

#[tokio::test]
async fn test_power_input_standby_scenario() {
    let mut machine = machine();
    let out = Collector::default();

    feed(&mut machine, &out, &[ev("power", "on", 0), ev("input", "hdmi1", 0)]).await;
    assert!(out.take().is_empty());
    assert_eq!(machine.state(DISPLAY).unwrap().current_node, INPUT_ACTIVE);

    feed(&mut machine, &out, &[ev("input", "hdmi2", 600)]).await;
    let records = out.take();
    assert_eq!(spans(&records), vec![span(RecordType::Input, "hdmi1", 0, 600)]);
    assert_eq!(records[0].elapsed_in_seconds, 600);
    assert_eq!(records[0].input_type.as_deref(), Some("hdmi"));
    assert_eq!(records[0].device.device_type, "non-controllable");
    assert_eq!(records[0].room.deployment_group, "production");

    feed(&mut machine, &out, &[ev("power", "standby", 1200)]).await;
    assert_eq!(
        spans(&out.take()),
        vec![
            span(RecordType::Input, "hdmi2", 600, 1200),
            span(RecordType::Blank, "false", 0, 1200),
            span(RecordType::Power, "on", 0, 1200),
        ]
    );
    assert_eq!(machine.state(DISPLAY).unwrap().current_node, POWER_STANDBY);
}

#[tokio::test]
async fn test_blank_and_power_cycle_tile_time() {
    let mut machine = machine();
    let out = Collector::default();

    feed(
        &mut machine,
        &out,
        &[
            ev("power", "on", 0),
            ev("input", "hdmi2", 0),
            ev("blanked", "true", 900),
            ev("input", "hdmi3", 950),
            ev("blanked", "false", 1000),
            ev("power", "standby", 1200),
            ev("power", "on", 1500),
        ],
    )
    .await;

    assert_eq!(
        spans(&out.take()),
        vec![
            span(RecordType::Input, "hdmi2", 0, 900),
            span(RecordType::Blank, "false", 0, 900),
            span(RecordType::Blank, "true", 900, 1000),
            span(RecordType::Input, "hdmi3", 1000, 1200),
            span(RecordType::Blank, "false", 1000, 1200),
            span(RecordType::Power, "on", 0, 1200),
            span(RecordType::Power, "standby", 1200, 1500),
        ]
    );
    assert_eq!(machine.state(DISPLAY).unwrap().current_node, POWER_ON);
}

#[tokio::test]
async fn test_repeated_input_does_not_restart_timer() {
    let mut machine = machine();
    let out = Collector::default();

    feed(
        &mut machine,
        &out,
        &[
            ev("power", "on", 0),
            ev("input", "hdmi1", 0),
            ev("input", "hdmi1", 300),
            ev("input", "hdmi2", 600),
        ],
    )
    .await;

    assert_eq!(spans(&out.take()), vec![span(RecordType::Input, "hdmi1", 0, 600)]);
}

#[tokio::test]
async fn test_missing_timer_is_invalid_state() {
    let enricher = Arc::new(Enricher::new(directory(), Arc::new(NoSchedule)));
    let graph = Arc::new(display_graph(enricher).unwrap());
    let states = HashMap::from([(DISPLAY.to_string(), MachineState::<DisplayState>::at(POWER_ON))]);
    let mut machine = StateMachine::with_states(graph, ScopeKey::Device, states);
    let out = Collector::default();

    let err = machine
        .process_event(&ev("power", "standby", 60), &out)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "invalid-state");
    assert!(err.to_string().contains("blank-set"));
    assert_eq!(machine.state(DISPLAY).unwrap().current_node, POWER_ON);
    assert!(out.take().is_empty());
}

#[tokio::test]
async fn test_unknown_device_still_emits_record() {
    let mut machine = machine();
    let out = Collector::default();
    let stranger = |key: &str, value: &str, secs| Event::for_device("JFSB-9-D1", key, value, t(secs));

    machine.process_event(&stranger("power", "on", 0), &out).await.unwrap();
    let err = machine
        .process_event(&stranger("power", "standby", 100), &out)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "invalid-device");
    let records = out.take();
    assert_eq!(spans(&records), vec![span(RecordType::Blank, "false", 0, 100)]);
    assert_eq!(records[0].device.id, "JFSB-9-D1");
    assert_eq!(records[0].room.id, "JFSB-9");
    assert_eq!(machine.state("JFSB-9-D1").unwrap().current_node, POWER_ON);
}

#[tokio::test]
async fn test_input_type_from_directory_or_name() {
    let mut machine = machine();
    let out = Collector::default();

    feed(
        &mut machine,
        &out,
        &[
            ev("power", "on", 0),
            ev("input", "ITB-1101-VIA1", 0),
            ev("input", "hdmi3", 60),
            ev("power", "standby", 120),
        ],
    )
    .await;

    let input_types: Vec<Option<String>> = out
        .take()
        .into_iter()
        .filter(|r| r.record_type == RecordType::Input)
        .map(|r| r.input_type)
        .collect();
    assert_eq!(
        input_types,
        vec![Some("via-connect-pro".to_string()), Some("hdmi".to_string())]
    );
}

#[tokio::test]
async fn test_volume_and_mute_records() {
    let mut machine = machine();
    let out = Collector::default();

    feed(
        &mut machine,
        &out,
        &[
            ev("power", "on", 0),
            ev("volume", "30", 10),
            ev("volume", "45", 70),
            ev("muted", "true", 100),
            ev("volume", "loud", 150),
            ev("power", "standby", 200),
            ev("volume", "50", 250),
            ev("power", "on", 300),
            ev("volume", "60", 400),
        ],
    )
    .await;

    assert_eq!(
        spans(&out.take()),
        vec![
            span(RecordType::Volume, "30", 10, 70),
            span(RecordType::Blank, "false", 0, 200),
            span(RecordType::Power, "on", 0, 200),
            span(RecordType::Volume, "45", 70, 200),
            span(RecordType::Mute, "true", 100, 200),
            span(RecordType::Power, "standby", 200, 300),
            span(RecordType::Volume, "50", 300, 400),
        ]
    );
}

fn class(name: &str, start: i64, end: i64) -> ClassSlot {
    ClassSlot {
        start: t(start),
        end: t(end),
        department: "C S".into(),
        catalog_number: name.into(),
        credit_hours: 3.0,
        class_size: 100,
        enrollment: 80,
        instructor: "Jane Doe".into(),
    }
}

#[test]
fn test_split_by_classes_pads_and_clips() {
    let record = MetricsRecord::power("on").span(t(0), t(7200));
    let classes = vec![
        class("260", 4200, 9000),
        class("235", 1800, 4800),
        class("101", -3600, -60),
    ];

    let parts = split_by_classes(record, &classes);

    let layout: Vec<(i64, i64, Option<String>)> = parts
        .iter()
        .map(|p| {
            (
                (p.start_time - t(0)).num_seconds(),
                (p.end_time - t(0)).num_seconds(),
                p.class.as_ref().map(|c| c.class_name.clone()),
            )
        })
        .collect();
    assert_eq!(
        layout,
        vec![
            (0, 1800, None),
            (1800, 4800, Some("C S-235".to_string())),
            (4800, 7200, Some("C S-260".to_string())),
        ]
    );

    let total: i64 = parts.iter().map(|p| p.elapsed_in_seconds).sum();
    assert_eq!(total, 7200);
    assert!(parts.iter().all(|p| p.power.as_deref() == Some("on")));
}

#[test]
fn test_split_without_classes_keeps_record() {
    let record = MetricsRecord::blank(true).span(t(0), t(90));
    let parts = split_by_classes(record.clone(), &[]);
    assert_eq!(parts, vec![record]);
}

#[tokio::test]
async fn test_records_split_at_class_boundaries() {
    let mut machine = machine_with(Arc::new(FixedSchedule(vec![class("235", 200, 400)])));
    let out = Collector::default();

    feed(
        &mut machine,
        &out,
        &[ev("power", "on", 0), ev("input", "hdmi1", 0), ev("input", "hdmi2", 600)],
    )
    .await;

    let records = out.take();
    assert_eq!(
        spans(&records),
        vec![
            span(RecordType::Input, "hdmi1", 0, 200),
            span(RecordType::Input, "hdmi1", 200, 400),
            span(RecordType::Input, "hdmi1", 400, 600),
        ]
    );
    assert!(records[0].class.is_none());
    assert_eq!(records[1].class.as_ref().unwrap().class_enrollment, 80);
    assert!(records[2].class.is_none());
}

#[tokio::test]
async fn test_schedule_failure_emits_unsplit_record() {
    let mut machine = machine_with(Arc::new(BrokenSchedule));
    let out = Collector::default();

    feed(
        &mut machine,
        &out,
        &[ev("power", "on", 0), ev("input", "hdmi1", 0), ev("input", "hdmi2", 600)],
    )
    .await;

    assert_eq!(spans(&out.take()), vec![span(RecordType::Input, "hdmi1", 0, 600)]);
}

#[tokio::test]
async fn test_forwarder_drops_sub_second_records() {
    let (tx, mut rx) = mpsc::channel(8);
    let forwarder = RecordForwarder::new("oit-static-av-metrics", tx);

    forwarder
        .forward(vec![
            MetricsRecord::input("hdmi1").span(t(0), t(0)),
            MetricsRecord::input("hdmi2").span(t(0), t(5)),
        ])
        .await;
    drop(forwarder);

    let entry = rx.recv().await.unwrap();
    assert_eq!(entry.header.index.index, "oit-static-av-metrics");
    assert_eq!(entry.header.index.doc_type, "metrics");
    assert_eq!(entry.body["input"], "hdmi2");
    assert_eq!(entry.body["elapsed-in-seconds"], 5);
    assert!(rx.recv().await.is_none());
}

fn job() -> JobConfig {
    serde_json::from_value(json!({
        "id": "display-metrics",
        "type": DISPLAY_STATE,
        "index": "oit-static-av-*",
        "query": {},
        "time_field": "timestamp",
        "type_config": {"output-index": "oit-static-av-metrics"}
    }))
    .unwrap()
}

async fn run_once(
    caterpillar: &DisplayStateCaterpillar,
    checkpoint: Checkpoint,
    events: &[Event],
) -> (Checkpoint, Vec<Value>) {
    let (event_tx, event_rx) = mpsc::channel(events.len().max(1));
    for event in events {
        event_tx.send(event.clone()).await.unwrap();
    }
    drop(event_tx);

    let (record_tx, mut record_rx) = mpsc::channel(256);
    let ctx = RunContext {
        run_id: Uuid::now_v7(),
        job: job(),
        checkpoint,
        events: event_rx,
        records: record_tx,
    };

    let checkpoint = caterpillar.run(ctx).await.unwrap();

    let mut bodies = Vec::new();
    while let Some(entry) = record_rx.recv().await {
        bodies.push(entry.body);
    }
    (checkpoint, bodies)
}

fn day() -> Vec<Event> {
    vec![
        ev("power", "on", 0),
        ev("input", "hdmi1", 0),
        ev("input", "hdmi2", 600),
        ev("blanked", "true", 900),
        ev("blanked", "false", 1000),
        ev("power", "standby", 1200),
        ev("power", "on", 1500),
        ev("input", "hdmi1", 1600),
        ev("power", "standby", 2000),
    ]
}

#[tokio::test]
async fn test_checkpointed_runs_match_single_run() {
    let caterpillar = DisplayStateCaterpillar::new(directory(), Arc::new(NoSchedule)).unwrap();
    let events = day();

    let (full_checkpoint, full) = run_once(&caterpillar, Checkpoint::default(), &events).await;

    let (middle, first) = run_once(&caterpillar, Checkpoint::default(), &events[..3]).await;
    assert_eq!(middle.last_event_time, Some(t(600)));

    let stored: Checkpoint = serde_json::from_str(&serde_json::to_string(&middle).unwrap()).unwrap();
    let (last, second) = run_once(&caterpillar, stored, &events[3..]).await;

    let mut split = first;
    split.extend(second);
    assert_eq!(split, full);
    assert_eq!(last.last_event_time, full_checkpoint.last_event_time);
    assert_eq!(last.states, full_checkpoint.states);
}

#[tokio::test]
async fn test_failed_event_does_not_advance_checkpoint() {
    let caterpillar = DisplayStateCaterpillar::new(directory(), Arc::new(NoSchedule)).unwrap();
    let mut checkpoint = Checkpoint::default();
    checkpoint.observe(t(10));
    let states = HashMap::from([(DISPLAY.to_string(), MachineState::<DisplayState>::at(POWER_ON))]);
    checkpoint.set_states(&states).unwrap();

    // Standby out of poweron needs a blank timer this state never set.
    let (checkpoint, bodies) = run_once(&caterpillar, checkpoint, &[ev("power", "standby", 60)]).await;

    assert_eq!(checkpoint.last_event_time, Some(t(10)));
    assert!(bodies.is_empty());
}

#[tokio::test]
async fn test_corrupt_checkpoint_state_fails_run() {
    let caterpillar = DisplayStateCaterpillar::new(directory(), Arc::new(NoSchedule)).unwrap();
    let mut checkpoint = Checkpoint::default();
    checkpoint
        .states
        .insert(DISPLAY.to_string(), json!({"current_node": 7}));

    let (_event_tx, event_rx) = mpsc::channel(1);
    let (record_tx, _record_rx) = mpsc::channel(1);
    let ctx = RunContext {
        run_id: Uuid::now_v7(),
        job: job(),
        checkpoint,
        events: event_rx,
        records: record_tx,
    };

    let err = caterpillar.run(ctx).await.unwrap_err();
    assert_eq!(err.kind(), "checkpoint");
}

#[tokio::test]
async fn test_registry_builds_display_state() {
    let mut registry = CaterpillarRegistry::new();
    DisplayStateCaterpillar::register(&mut registry, directory(), Arc::new(NoSchedule));

    assert_eq!(registry.names(), vec![DISPLAY_STATE]);
    assert!(registry.create(&job()).is_ok());
}

#[test]
fn test_display_graph_renders() {
    let caterpillar = DisplayStateCaterpillar::new(directory(), Arc::new(NoSchedule)).unwrap();
    let dot = caterpillar.graph().to_dot();

    for node in [START, POWER_ON, INPUT_ACTIVE, BLANK, POWER_STANDBY] {
        assert!(dot.contains(node), "missing node {}", node);
    }
    assert!(dot.contains("standby-enter"));
    assert!(dot.contains("unblanked-record"));
    assert_eq!(caterpillar.graph().len(), 5);
}
