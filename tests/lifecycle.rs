use host_portal::testing::{wait_until, EventLog, MockTransport, Phase, ScriptedOp};
use host_portal::{completion_channel, EndpointKey, Error, OpStatus, Operation, PortalConfig, PortalContext};
use std::thread;
use std::time::Duration;

type Ctx = PortalContext<MockTransport, ScriptedOp>;

const LONG: Duration = Duration::from_secs(10);

fn key(s: &str) -> EndpointKey {
    EndpointKey::parse(s).unwrap()
}

fn config() -> PortalConfig {
    PortalConfig {
        check_interval: Duration::from_millis(100),
        compact_interval: Duration::from_secs(3600),
        ..PortalConfig::default()
    }
}

#[test]
fn invalid_config_is_rejected() {
    let result = Ctx::new(
        MockTransport::new(),
        PortalConfig {
            min_host_connections: 3,
            max_host_connections: 1,
            ..config()
        },
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn new_header_uses_default_retry_budget() {
    let ctx = Ctx::new(
        MockTransport::new(),
        PortalConfig {
            max_retry: 7,
            ..config()
        },
    )
    .unwrap();
    let header = ctx
        .new_header("depot:6714:sock", (), Duration::from_secs(3), 128)
        .unwrap();
    assert_eq!(header.retries_left, 7);
    assert_eq!(header.workload, 128);
    assert_eq!(header.endpoint.transport(), Some("sock"));

    assert!(matches!(
        ctx.new_header("no-port", (), Duration::from_secs(3), 1),
        Err(Error::InvalidEndpoint(_))
    ));
}

#[test]
fn sequential_dedicated_calls_reuse_one_connection() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(transport.clone(), config()).unwrap();
    let (sink, rx) = completion_channel();

    for i in 0..3 {
        ctx.submit_dedicated(ScriptedOp::new(key("sync:6714"), i, 1, 2), sink.clone())
            .unwrap();
        let done = rx.wait_for(1, LONG);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, OpStatus::Ok);
    }

    let stats = ctx.host_stats("sync:6714").unwrap();
    assert_eq!(stats.dedicated_pools, 1);
    assert_eq!(stats.connections, 0);
    assert_eq!(transport.connections_opened(), 1);
}

#[test]
fn busy_dedicated_connection_is_not_shared() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(
        transport.clone(),
        PortalConfig {
            min_idle: Duration::from_millis(200),
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    let slow = ScriptedOp::new(key("sync:7000"), 1, 1, 2).with_recv_delay(Duration::from_millis(300));
    ctx.submit_dedicated(slow, sink.clone()).unwrap();
    ctx.submit_dedicated(ScriptedOp::new(key("sync:7000"), 2, 1, 2), sink)
        .unwrap();

    let done = rx.wait_for(2, LONG);
    assert_eq!(done.len(), 2);
    assert_eq!(ctx.host_stats("sync:7000").unwrap().dedicated_pools, 2);
    assert_eq!(transport.connections_opened(), 2);

    // Both idle out; the sub-pools and then the parent are collected.
    assert!(wait_until(LONG, || {
        ctx.compact();
        ctx.host_count() == 0
    }));
    assert_eq!(transport.connections_closed(), 2);
}

#[test]
fn shutdown_fails_queued_work_and_joins_everything() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(
        transport.clone(),
        PortalConfig {
            max_host_connections: 1,
            max_workload: 1,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    for i in 0..10 {
        let op = ScriptedOp::new(key("busy:6714"), i, 1, 2).with_recv_delay(Duration::from_millis(100));
        ctx.submit(op, sink.clone()).unwrap();
    }
    let first = rx.recv_timeout(LONG).unwrap();
    assert_eq!(first.status, OpStatus::Ok);

    ctx.shutdown();

    let rest = rx.wait_for(9, LONG);
    assert_eq!(rest.len(), 9);
    assert!(rest.iter().any(|c| c.status == OpStatus::Generic));
    assert!(rest
        .iter()
        .all(|c| matches!(c.status, OpStatus::Ok | OpStatus::Generic | OpStatus::DeadConnection)));

    assert_eq!(ctx.running_threads(), 0);
    assert_eq!(ctx.host_count(), 0);
    assert_eq!(transport.connections_closed(), transport.connections_opened());

    let late = ScriptedOp::new(key("busy:6714"), 99, 1, 2);
    assert!(matches!(ctx.submit(late, sink), Err(Error::ShutDown)));
    let rejected = rx.recv_timeout(LONG).unwrap();
    assert_eq!(rejected.op.id, 99);
    assert_eq!(rejected.status, OpStatus::Generic);

    // Idempotent
    ctx.shutdown();
}

#[test]
fn dropping_the_context_completes_everything() {
    let transport = MockTransport::new().with_connect_delay(Duration::from_millis(100));
    let (sink, rx) = completion_channel();
    {
        let ctx = Ctx::new(transport.clone(), config()).unwrap();
        for i in 0..5 {
            ctx.submit(ScriptedOp::new(key("gone:6714"), i, 1, 2), sink.clone())
                .unwrap();
        }
    }
    let done = rx.wait_for(5, LONG);
    assert_eq!(done.len(), 5);
    assert_eq!(transport.connections_closed(), transport.connections_opened());
}

#[test]
fn garbage_collection_is_idempotent() {
    let ctx = Ctx::new(
        MockTransport::new(),
        PortalConfig {
            min_idle: Duration::from_millis(150),
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    ctx.submit(ScriptedOp::new(key("idle-a:1"), 1, 1, 2), sink.clone())
        .unwrap();
    ctx.submit(ScriptedOp::new(key("idle-b:1"), 2, 1, 2), sink.clone())
        .unwrap();
    assert_eq!(rx.wait_for(2, LONG).len(), 2);

    let busy = ScriptedOp::new(key("busy:1"), 3, 1, 2).with_recv_delay(Duration::from_secs(3));
    ctx.submit(busy, sink).unwrap();

    assert!(wait_until(LONG, || {
        ["idle-a:1", "idle-b:1"]
            .iter()
            .all(|k| ctx.host_stats(k).map_or(false, |s| s.reserved == 0))
    }));

    assert_eq!(ctx.compact(), 2);
    assert_eq!(ctx.compact(), 0);
    assert_eq!(ctx.host_count(), 1);
    assert!(ctx.host_stats("busy:1").is_some());
}

#[test]
fn global_budget_evicts_an_idle_connection() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(
        transport.clone(),
        PortalConfig {
            max_connections: 2,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    ctx.submit(ScriptedOp::new(key("one:1"), 1, 1, 2), sink.clone())
        .unwrap();
    ctx.submit(ScriptedOp::new(key("two:2"), 2, 1, 2), sink.clone())
        .unwrap();
    assert_eq!(rx.wait_for(2, LONG).len(), 2);
    assert_eq!(ctx.running_threads(), 2);

    ctx.submit(ScriptedOp::new(key("three:3"), 3, 1, 2), sink)
        .unwrap();
    let done = rx.wait_for(1, LONG);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, OpStatus::Ok);

    assert!(wait_until(LONG, || transport.connections_closed() == 1));
    assert!(wait_until(LONG, || ctx.running_threads() == 2));
    let survivors = ["one:1", "two:2"]
        .iter()
        .filter(|k| ctx.host_stats(k).map_or(false, |s| s.reserved == 1))
        .count();
    assert_eq!(survivors, 1);
}

#[test]
fn eviction_lets_an_in_progress_send_finish() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(
        transport.clone(),
        PortalConfig {
            max_connections: 1,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();
    let log = EventLog::default();

    // No retry budget: any connection-level failure would surface.
    let slow = ScriptedOp::new(key("a:1"), 1, 1, 0)
        .with_send_delay(Duration::from_millis(400))
        .with_log(log.clone());
    ctx.submit(slow, sink.clone()).unwrap();
    assert!(wait_until(LONG, || transport.connections_opened() == 1));
    thread::sleep(Duration::from_millis(100));

    // Over budget: a:1's connection is evicted while it is mid-send.
    ctx.submit(ScriptedOp::new(key("b:1"), 2, 1, 0), sink).unwrap();

    let mut done = rx.wait_for(2, LONG);
    assert_eq!(done.len(), 2);
    done.sort_by_key(|c| c.op.id);
    assert_eq!(done[0].status, OpStatus::Ok);
    assert_eq!(done[0].op.header().retries_left, 0);
    assert_eq!(done[0].op.recv_streams.len(), 1);
    assert_eq!(done[1].status, OpStatus::Ok);

    let sends = log.lock().iter().filter(|e| e.phase == Phase::Send).count();
    assert_eq!(sends, 1);
    assert!(wait_until(LONG, || transport.connections_closed() == 1));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_none());
}
