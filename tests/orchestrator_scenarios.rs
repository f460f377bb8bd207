//! End-to-end runs of the orchestrator against in-process fake clients.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{node, spawn_http_server, FakeFactory};
use proxyspeed::config::PingConfig;
use proxyspeed::context::{RetryPolicy, RunContext, Timeouts};
use proxyspeed::orchestrator::export::MemoryExporter;
use proxyspeed::orchestrator::{Orchestrator, RunState, SortSpec};
use proxyspeed::ports::{PortAllocator, PortProbe};
use proxyspeed::record::RecordStatus;
use proxyspeed::strategy::TestStrategy;

fn ctx(concurrency: usize) -> RunContext {
    RunContext {
        concurrency,
        timeouts: Timeouts {
            client_start: Duration::from_secs(2),
            client_stop_grace: Duration::from_millis(200),
            node_deadline: Duration::from_secs(30),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        },
        ..Default::default()
    }
}

fn ping_to(target: std::net::SocketAddr) -> TestStrategy {
    TestStrategy::TcpPing(PingConfig {
        target_host: target.ip().to_string(),
        target_port: target.port(),
        count: 2,
        attempt_timeout_ms: 60_000,
        interval_ms: 0,
    })
}

#[tokio::test]
async fn scenario_a_all_nodes_succeed() {
    let (http, _server) = spawn_http_server().await;
    let factory = FakeFactory::default();
    let ports = Arc::new(PortAllocator::new(43000..=43199, 64));

    let mut orch = Orchestrator::new(ctx(2), ports.clone(), Arc::new(factory.clone()), ping_to(http))
        .with_sort(SortSpec::Ping);
    let nodes = vec![node("a", 1), node("b", 2), node("c", 3)];
    let mut exporter = MemoryExporter::default();

    let outcome = orch.run(nodes, &mut exporter, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.store.len(), 3);
    for entry in outcome.store.iter() {
        assert_eq!(entry.record.status, RecordStatus::Success, "{:?}", entry.record.message);
        let ping = entry.record.ping.as_ref().expect("ping populated");
        assert_eq!(ping.samples_ms.len(), 2);
        assert!(entry.record.local_port.is_some());
    }
    assert_eq!(
        orch.history(),
        &[RunState::Idle, RunState::Scheduling, RunState::Running, RunState::Aggregating, RunState::Done]
    );

    let lat: Vec<f64> = exporter.entries.iter().filter_map(|e| e.record.latency_ms()).collect();
    assert!(lat.windows(2).all(|w| w[0] <= w[1]));

    let stats = &factory.stats;
    assert_eq!(stats.double_binds.load(Ordering::SeqCst), 0);
    assert!(stats.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(stats.running_count(), 0);
    assert_eq!(stats.starts.load(Ordering::SeqCst), stats.stops.load(Ordering::SeqCst));
    assert_eq!(ports.leased_count(), 0);
}

#[tokio::test]
async fn more_nodes_than_slots_yields_one_record_each() {
    let (http, _server) = spawn_http_server().await;
    let factory = FakeFactory::default();
    let ports = Arc::new(PortAllocator::new(43200..=43399, 64));

    let mut orch = Orchestrator::new(ctx(3), ports.clone(), Arc::new(factory.clone()), ping_to(http));
    let nodes: Vec<_> = (1..=8)
        .map(|i| if i % 3 == 0 { node("broken", i) } else { node("ok", i) })
        .collect();

    let outcome = orch
        .run(nodes.clone(), &mut MemoryExporter::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.store.len(), nodes.len());
    for n in &nodes {
        let entry = outcome.store.get(&n.id()).expect("record for every node");
        let expected = if n.server == "broken" {
            RecordStatus::ClientStartFailed
        } else {
            RecordStatus::Success
        };
        assert_eq!(entry.record.status, expected);
    }
    assert!(factory.stats.max_running.load(Ordering::SeqCst) <= 3);
    assert_eq!(factory.stats.double_binds.load(Ordering::SeqCst), 0);
    assert_eq!(factory.stats.running_count(), 0);
    assert_eq!(ports.leased_count(), 0);
}

#[tokio::test]
async fn scenario_c_cancel_with_two_in_flight() {
    let (http, _server) = spawn_http_server().await;
    let factory = FakeFactory::default();
    let ports = Arc::new(PortAllocator::new(43400..=43599, 64));

    let mut orch = Orchestrator::new(ctx(2), ports.clone(), Arc::new(factory.clone()), ping_to(http));
    let nodes = vec![node("a", 1), node("b", 2), node("hang", 3), node("hang", 4), node("e", 5)];
    let mut exporter = MemoryExporter::default();
    let cancel = CancellationToken::new();

    let stats = factory.stats.clone();
    let trigger = cancel.clone();
    let watcher = async move {
        // a and b done, both hanging nodes started and still up
        while !(stats.starts.load(Ordering::SeqCst) >= 4 && stats.running_count() == 2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();
    };

    let (result, ()) = tokio::join!(orch.run(nodes.clone(), &mut exporter, cancel), watcher);
    let outcome = result.unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.store.len(), 5);
    let status = |i: usize| outcome.store.get(&nodes[i].id()).unwrap().record.status;
    assert_eq!(status(0), RecordStatus::Success);
    assert_eq!(status(1), RecordStatus::Success);
    assert_eq!(status(2), RecordStatus::Timeout);
    assert_eq!(status(3), RecordStatus::Timeout);
    assert_eq!(status(4), RecordStatus::Timeout);
    assert_eq!(
        outcome.store.get(&nodes[4].id()).unwrap().record.message.as_deref(),
        Some("cancelled before start")
    );

    assert_eq!(factory.stats.running_count(), 0);
    assert_eq!(factory.stats.starts.load(Ordering::SeqCst), 4);
    assert_eq!(factory.stats.stops.load(Ordering::SeqCst), 4);
    assert_eq!(ports.leased_count(), 0);
    assert_eq!(orch.state(), RunState::Done);
}

/// Reports the first `busy` probes as taken, everything after as free.
struct BusyAtFirst {
    calls: AtomicUsize,
    busy: usize,
}

impl PortProbe for BusyAtFirst {
    fn is_free(&self, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) >= self.busy
    }
}

#[tokio::test]
async fn scenario_d_exhausted_ports_fail_one_node_only() {
    let (http, _server) = spawn_http_server().await;
    let factory = FakeFactory::default();
    let probe = BusyAtFirst {
        calls: AtomicUsize::new(0),
        busy: 16,
    };
    let ports = Arc::new(PortAllocator::with_probe(43600..=43799, 16, Box::new(probe)));

    let mut orch = Orchestrator::new(ctx(1), ports.clone(), Arc::new(factory.clone()), ping_to(http));
    let nodes = vec![node("first", 1), node("second", 2), node("third", 3)];

    let outcome = orch
        .run(nodes.clone(), &mut MemoryExporter::default(), CancellationToken::new())
        .await
        .unwrap();

    let status = |i: usize| outcome.store.get(&nodes[i].id()).unwrap().record.status;
    assert_eq!(status(0), RecordStatus::PortsExhausted);
    assert_eq!(status(1), RecordStatus::Success);
    assert_eq!(status(2), RecordStatus::Success);
    assert_eq!(factory.stats.starts.load(Ordering::SeqCst), 2);
    assert_eq!(ports.leased_count(), 0);
}

#[tokio::test]
async fn only_success_filter_hides_failures_from_report_not_store() {
    let (http, _server) = spawn_http_server().await;
    let factory = FakeFactory::default();
    let ports = Arc::new(PortAllocator::new(43800..=43999, 64));

    let mut orch = Orchestrator::new(ctx(2), ports, Arc::new(factory), ping_to(http)).with_filter(
        proxyspeed::orchestrator::FilterSpec {
            only_success: true,
            ..Default::default()
        },
    );
    let mut exporter = MemoryExporter::default();
    let outcome = orch
        .run(vec![node("ok", 1), node("broken", 2)], &mut exporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.store.len(), 2);
    assert_eq!(outcome.report.len(), 1);
    assert_eq!(exporter.entries.len(), 1);
    assert_eq!(exporter.entries[0].node.server, "ok");
}

#[tokio::test]
async fn panicking_client_becomes_internal_error() {
    let (http, _server) = spawn_http_server().await;
    let factory = FakeFactory::default();
    let ports = Arc::new(PortAllocator::new(44400..=44599, 64));

    let mut orch = Orchestrator::new(ctx(2), ports.clone(), Arc::new(factory.clone()), ping_to(http));
    let nodes = vec![node("a", 1), node("panic", 2), node("c", 3)];

    let outcome = orch
        .run(nodes.clone(), &mut MemoryExporter::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.store.len(), 3);
    let record = |i: usize| outcome.store.get(&nodes[i].id()).unwrap().record.clone();
    assert_eq!(record(0).status, RecordStatus::Success);
    assert_eq!(record(1).status, RecordStatus::InternalError);
    assert!(record(1).message.unwrap().contains("panicked"));
    assert_eq!(record(2).status, RecordStatus::Success);
    assert_eq!(factory.stats.running_count(), 0);
    assert_eq!(ports.leased_count(), 0);
    assert_eq!(orch.state(), RunState::Done);
}
