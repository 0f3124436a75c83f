use host_portal::testing::{wait_until, EventLog, MockTransport, Phase, ScriptedOp};
use host_portal::{completion_channel, EndpointKey, OpStatus, Operation, Placement, PortalConfig, PortalContext};
use std::collections::HashMap;
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
fn single_op_then_idle_close_and_collect() {
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

    ctx.submit(ScriptedOp::new(key("depot1:6714"), 1, 1, 2), sink).unwrap();

    let done = rx.wait_for(1, LONG);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, OpStatus::Ok);
    assert_eq!(transport.connections_opened(), 1);

    assert!(wait_until(LONG, || {
        ctx.host_stats("depot1:6714").map_or(false, |s| s.reserved == 0)
    }));
    assert_eq!(transport.connections_closed(), 1);
    assert_eq!(ctx.host_stats("depot1:6714").unwrap().cmds_processed, 1);

    assert_eq!(ctx.compact(), 1);
    assert_eq!(ctx.host_count(), 0);
    assert_eq!(ctx.running_threads(), 0);
}

#[test]
fn workload_drives_connection_count_up_to_maximum() {
    let transport = MockTransport::new().with_connect_delay(Duration::from_millis(150));
    let ctx = Ctx::new(
        transport.clone(),
        PortalConfig {
            max_workload: 10,
            max_host_connections: 5,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    for i in 0..100 {
        ctx.submit(ScriptedOp::new(key("depot2:6714"), i, 1, 2), sink.clone())
            .unwrap();
        assert!(ctx.host_stats("depot2:6714").unwrap().reserved <= 5);
    }

    let done = rx.wait_for(100, LONG);
    assert_eq!(done.len(), 100);
    assert!(done.iter().all(|c| c.status == OpStatus::Ok));
    assert_eq!(transport.connect_attempts(), 5);

    let stats = ctx.host_stats("depot2:6714").unwrap();
    assert_eq!(stats.connections, 5);
    assert_eq!(stats.cmds_processed, 100);
    assert_eq!(stats.pending_workload, 0);
}

#[test]
fn repeated_connect_failures_fail_queued_work() {
    let transport = MockTransport::new()
        .with_connect_delay(Duration::from_millis(20))
        .failing_connects();
    let ctx = Ctx::new(
        transport.clone(),
        PortalConfig {
            min_host_connections: 1,
            max_host_connections: 1,
            abort_conn_attempts: 3,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    for i in 0..4 {
        ctx.submit(ScriptedOp::new(key("down:6714"), i, 1, 2), sink.clone())
            .unwrap();
    }

    let done = rx.wait_for(4, LONG);
    assert_eq!(done.len(), 4);
    assert!(done.iter().all(|c| c.status == OpStatus::CantConnect));

    thread::sleep(Duration::from_millis(200));
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(transport.connections_opened(), 0);
    let stats = ctx.host_stats("down:6714").unwrap();
    assert_eq!(stats.failed_connects, 3);
    assert_eq!(stats.pending_ops, 0);
}

#[test]
fn dead_socket_is_retried_on_a_new_connection() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(transport.clone(), config()).unwrap();
    let (sink, rx) = completion_channel();

    let op = ScriptedOp::new(key("flaky:6714"), 1, 1, 2).with_recv_script([OpStatus::RetryDeadSocket]);
    ctx.submit(op, sink).unwrap();

    let done = rx.wait_for(1, LONG);
    assert_eq!(done.len(), 1);
    let done = &done[0];
    assert_eq!(done.status, OpStatus::Ok);
    assert_eq!(done.op.header().retries_left, 1);
    assert_eq!(done.op.recv_streams.len(), 2);
    assert_ne!(done.op.recv_streams[0], done.op.recv_streams[1]);

    assert_eq!(transport.connections_opened(), 2);
    assert!(wait_until(LONG, || transport.connections_closed() == 1));

    assert!(wait_until(LONG, || {
        ctx.host_stats("flaky:6714").map_or(false, |s| s.connections == 1)
    }));
    assert_eq!(ctx.host_stats("flaky:6714").unwrap().stable_target, 1);
}

#[test]
fn failed_send_is_requeued_on_a_new_connection() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(transport.clone(), config()).unwrap();
    let (sink, rx) = completion_channel();
    let log = EventLog::default();

    let op = ScriptedOp::new(key("wobbly:6714"), 1, 1, 2)
        .with_send_script([OpStatus::RetryDeadSocket])
        .with_log(log.clone());
    ctx.submit(op, sink).unwrap();

    let done = rx.wait_for(1, LONG);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, OpStatus::Ok);
    assert_eq!(done[0].op.header().retries_left, 1);
    assert_eq!(transport.connections_opened(), 2);

    let send_streams: Vec<u64> = log
        .lock()
        .iter()
        .filter(|e| e.phase == Phase::Send)
        .map(|e| e.stream)
        .collect();
    assert_eq!(send_streams.len(), 2);
    assert_ne!(send_streams[0], send_streams[1]);
    assert_eq!(done[0].op.recv_streams, vec![send_streams[1]]);
}

#[test]
fn failed_send_without_budget_completes_with_its_status() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(transport.clone(), config()).unwrap();
    let (sink, rx) = completion_channel();

    let op = ScriptedOp::new(key("wobbly:6715"), 1, 1, 0).with_send_script([OpStatus::RetryDeadSocket]);
    ctx.submit(op, sink).unwrap();

    let done = rx.wait_for(1, LONG);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, OpStatus::RetryDeadSocket);
    assert_eq!(done[0].op.header().retries_left, 0);
    assert!(done[0].op.recv_streams.is_empty());
    assert_eq!(transport.connections_opened(), 1);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_none());
}

#[test]
fn timeout_with_budget_retries_then_gives_up() {
    let ctx = Ctx::new(MockTransport::new(), config()).unwrap();
    let (sink, rx) = completion_channel();

    let op = ScriptedOp::new(key("slow:6714"), 1, 1, 1)
        .with_recv_script([OpStatus::Timeout, OpStatus::Timeout]);
    ctx.submit(op, sink).unwrap();

    let done = rx.wait_for(1, LONG);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, OpStatus::Timeout);
    assert_eq!(done[0].op.header().retries_left, 0);
    assert_eq!(done[0].op.recv_streams.len(), 2);
}

#[test]
fn remote_errors_complete_without_retry() {
    let transport = MockTransport::new();
    let ctx = Ctx::new(transport.clone(), config()).unwrap();
    let (sink, rx) = completion_channel();

    let op = ScriptedOp::new(key("strict:6714"), 1, 1, 2).with_recv_script([OpStatus::Remote(-3)]);
    ctx.submit(op, sink).unwrap();

    let done = rx.wait_for(1, LONG);
    assert_eq!(done[0].status, OpStatus::Remote(-3));
    assert_eq!(done[0].op.header().retries_left, 2);
    assert_eq!(transport.connections_opened(), 1);
}

#[test]
fn responses_follow_send_order_per_connection() {
    let transport = MockTransport::new().with_connect_delay(Duration::from_millis(50));
    let ctx = Ctx::new(
        transport,
        PortalConfig {
            max_workload: 4,
            max_host_connections: 3,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();
    let log = EventLog::default();

    for i in 0..60 {
        let op = ScriptedOp::new(key("fifo:6714"), i, 1, 2)
            .with_recv_delay(Duration::from_millis(2))
            .with_log(log.clone());
        ctx.submit(op, sink.clone()).unwrap();
    }
    assert_eq!(rx.wait_for(60, LONG).len(), 60);

    let mut sends: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut recvs: HashMap<u64, Vec<u64>> = HashMap::new();
    for event in log.lock().iter() {
        let per_stream = match event.phase {
            Phase::Send => &mut sends,
            Phase::Recv => &mut recvs,
        };
        per_stream.entry(event.stream).or_default().push(event.op);
    }
    assert!(sends.len() > 1);
    assert_eq!(sends, recvs);
}

#[test]
fn every_op_completes_exactly_once_under_failures() {
    let ctx = Ctx::new(
        MockTransport::new(),
        PortalConfig {
            max_workload: 8,
            max_host_connections: 4,
            wait_stable_time: Duration::from_millis(50),
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();

    let endpoints = ["a:1", "b:2", "c:3"];
    let total = 300u64;
    for i in 0..total {
        let mut op = ScriptedOp::new(key(endpoints[i as usize % 3]), i, 1, 5);
        if i % 7 == 0 {
            op = op.with_recv_script([OpStatus::RetryDeadSocket]);
        }
        ctx.submit(op, sink.clone()).unwrap();
    }

    let done = rx.wait_for(total as usize, LONG);
    assert_eq!(done.len(), total as usize);
    let mut ids: Vec<u64> = done.iter().map(|c| c.op.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total as usize);

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_none());
}

#[test]
fn unresolvable_host_fails_everything_with_invalid_host() {
    let transport = MockTransport::new().unresolvable("ghost");
    let ctx = Ctx::new(transport.clone(), config()).unwrap();
    let (sink, rx) = completion_channel();

    for i in 0..3 {
        ctx.submit(ScriptedOp::new(key("ghost:6714"), i, 1, 2), sink.clone())
            .unwrap();
    }

    let done = rx.wait_for(3, LONG);
    assert_eq!(done.len(), 3);
    assert!(done.iter().all(|c| c.status == OpStatus::InvalidHost));
    assert_eq!(transport.connect_attempts(), 0);
    assert!(ctx.host_stats("ghost:6714").unwrap().invalid_host);
}

#[test]
fn ordered_and_front_placement_shape_the_queue() {
    let transport = MockTransport::new().with_connect_delay(Duration::from_millis(150));
    let ctx = Ctx::new(
        transport,
        PortalConfig {
            max_host_connections: 1,
            ..config()
        },
    )
    .unwrap();
    let (sink, rx) = completion_channel();
    let log = EventLog::default();

    for (id, ordering) in [(1u64, 5i64), (2, 1), (3, 3)] {
        let op = ScriptedOp::new(key("sorted:6714"), id, 1, 2)
            .with_ordering(ordering)
            .with_log(log.clone());
        ctx.submit_with(op, sink.clone(), Placement::Ordered).unwrap();
    }
    let urgent = ScriptedOp::new(key("sorted:6714"), 4, 1, 2).with_log(log.clone());
    ctx.submit_with(urgent, sink, Placement::Front).unwrap();

    assert_eq!(rx.wait_for(4, LONG).len(), 4);
    let sent: Vec<u64> = log
        .lock()
        .iter()
        .filter(|e| e.phase == Phase::Send)
        .map(|e| e.op)
        .collect();
    assert_eq!(sent, vec![4, 2, 3, 1]);
}
