//! Snapshot store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Map, Value};
use statech_event::{Event, EventQueueSet, SessionId, UnreachableIo};
use statech_interp::{
    InstanceRecord, Interpreter, InterpreterConfig, JsonDataModel, NullServiceFactory,
};
use statech_persist::SnapshotStore;
use statech_tree::StateChart;
use std::sync::Arc;

fn counter_chart(extra_keys: usize) -> Arc<StateChart> {
    // Extra declarations pad the data model to scale the serialized
    // record size.
    let mut datamodel = Map::new();
    datamodel.insert("count".into(), json!(0));
    for i in 0..extra_keys {
        datamodel.insert(format!("pad{}", i), json!("x".repeat(64)));
    }
    let definition = json!({
        "datamodel": datamodel,
        "states": [
            {"id": "run", "transitions": [
                {"event": "tick", "target": "run",
                 "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]}
            ]}
        ]
    });
    Arc::new(StateChart::from_json("counter", 1, &definition).unwrap())
}

fn running_record(extra_keys: usize) -> InstanceRecord {
    let mut queues = EventQueueSet::new();
    let mut interp = Interpreter::new(
        counter_chart(extra_keys),
        SessionId::generate(),
        Box::new(JsonDataModel::new()),
        Arc::new(NullServiceFactory),
        Arc::new(UnreachableIo),
        InterpreterConfig::default(),
        queues.handle(),
    );
    interp.start(&mut queues).unwrap();
    for _ in 0..8 {
        interp
            .run_macrostep(&mut queues, Some(Event::external("tick", Value::Null)))
            .unwrap();
    }
    interp.capture(&queues).unwrap()
}

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_save");
    group.throughput(Throughput::Elements(1));

    for extra_keys in [0usize, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(extra_keys),
            &extra_keys,
            |b, &n| {
                let record = running_record(n);
                let dir = tempfile::tempdir().unwrap();
                let store = SnapshotStore::open(dir.path()).unwrap();
                b.iter(|| black_box(store.save(&record).unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_load");
    group.throughput(Throughput::Elements(1));

    for extra_keys in [0usize, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(extra_keys),
            &extra_keys,
            |b, &n| {
                let record = running_record(n);
                let dir = tempfile::tempdir().unwrap();
                let store = SnapshotStore::open(dir.path()).unwrap();
                store.save(&record).unwrap();
                b.iter(|| black_box(store.load(&record.session_id).unwrap()));
            },
        );
    }
    group.finish();
}

fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_list");

    for sessions in [8usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, &n| {
            let dir = tempfile::tempdir().unwrap();
            let store = SnapshotStore::open(dir.path()).unwrap();
            for _ in 0..n {
                store.save(&running_record(0)).unwrap();
            }
            b.iter(|| black_box(store.list()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_save, bench_load, bench_list);
criterion_main!(benches);
