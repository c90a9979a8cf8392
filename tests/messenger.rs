//! End-to-end tests over real TCP: call delivery, negotiation
//! deadlines, idle reaping, broadcast, and targeted drops.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use trunkline::{
    Config, ConfigBuilder, Connection, ConnectionId, DelimitedContext, Error, Messenger,
    Negotiator, OutboundCall, UserCredentials,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn base_config(name: &str) -> Config {
    ConfigBuilder::new(name)
        .reactors(2)
        .negotiation_threads(2)
        .coarse_timer_granularity(Duration::from_millis(20))
        .build()
        .unwrap()
}

fn echo_server(name: &str) -> (Arc<Messenger>, SocketAddr) {
    let messenger = Messenger::new(base_config(name)).unwrap();
    let addr = messenger.add_acceptor("127.0.0.1:0".parse().unwrap()).unwrap();
    (messenger, addr)
}

fn conn_id(remote: SocketAddr) -> ConnectionId {
    ConnectionId::new(remote, UserCredentials::new("app"), 0)
}

/// Poll `probe` until it returns true or `timeout` elapses.
fn wait_for(timeout: Duration, what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn inbound_count(messenger: &Messenger) -> usize {
    messenger
        .metrics()
        .map(|m| m.iter().map(|r| r.num_server_connections).sum())
        .unwrap_or(0)
}

// ── Call delivery ───────────────────────────────────────────────────

#[test]
fn call_round_trip_completes() {
    let (server, addr) = echo_server("rt-server");
    let client = Messenger::new(base_config("rt-client")).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let call = OutboundCall::new(
        conn_id(addr),
        DelimitedContext::encode(b"ping"),
        Some(Duration::from_secs(5)),
    )
    .on_completion(move |result| {
        tx.send(result).unwrap();
    });
    client.queue_outbound_call(call);

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_ok(), "call failed: {result:?}");

    // The one flush kicked the one connection exactly once.
    let dump = client.dump_running_rpcs(Default::default()).unwrap();
    assert_eq!(dump.outbound_connections.len(), 1);
    assert_eq!(dump.outbound_connections[0].outbound_kicks, 1);
    assert!(dump.outbound_connections[0].negotiated);

    wait_for(Duration::from_secs(5), "server to register the connection", || {
        inbound_count(&server) == 1
    });

    client.shutdown();
    server.shutdown();
}

#[test]
fn calls_to_same_remote_share_one_connection() {
    let (server, addr) = echo_server("share-server");
    let client = Messenger::new(base_config("share-client")).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(8);
    for _ in 0..8 {
        let tx = tx.clone();
        let call = OutboundCall::new(
            conn_id(addr),
            DelimitedContext::encode(b"again"),
            Some(Duration::from_secs(5)),
        )
        .on_completion(move |result| {
            tx.send(result).unwrap();
        });
        client.queue_outbound_call(call);
    }
    for _ in 0..8 {
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }

    let dump = client.dump_running_rpcs(Default::default()).unwrap();
    assert_eq!(dump.outbound_connections.len(), 1);

    client.shutdown();
    server.shutdown();
}

// ── Negotiation ─────────────────────────────────────────────────────

struct StallingNegotiator(Duration);

impl Negotiator for StallingNegotiator {
    fn negotiate(&self, _conn: &Connection, _deadline: Instant) -> Result<(), Error> {
        std::thread::sleep(self.0);
        Ok(())
    }
}

struct RejectingNegotiator;

impl Negotiator for RejectingNegotiator {
    fn negotiate(&self, conn: &Connection, _deadline: Instant) -> Result<(), Error> {
        Err(Error::NetworkError(format!(
            "handshake with {} rejected",
            conn.remote()
        )))
    }
}

#[test]
fn negotiation_timeout_destroys_connection_and_fails_call() {
    // A plain listener that never speaks: negotiation can only stall.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ConfigBuilder::new("nego-timeout")
        .reactors(1)
        .negotiation_threads(1)
        .rpc_negotiation_timeout(Duration::from_millis(150))
        .coarse_timer_granularity(Duration::from_millis(20))
        .build()
        .unwrap();
    let client = Messenger::with_protocol(
        config,
        DelimitedContext::factory(),
        Arc::new(StallingNegotiator(Duration::from_secs(1))),
    )
    .unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let started = Instant::now();
    let call = OutboundCall::new(
        conn_id(addr),
        DelimitedContext::encode(b"never"),
        Some(Duration::from_secs(10)),
    )
    .on_completion(move |result| {
        tx.send(result).unwrap();
    });
    client.queue_outbound_call(call);

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = started.elapsed();
    let err = result.unwrap_err();
    assert!(err.is_timed_out(), "expected timeout, got {err:?}");
    // The watchdog fired, not the negotiator's own return.
    assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");

    wait_for(Duration::from_secs(5), "connection teardown", || {
        client
            .metrics()
            .map(|m| m.iter().map(|r| r.num_client_connections).sum::<usize>() == 0)
            .unwrap_or(true)
    });

    client.shutdown();
}

#[test]
fn negotiation_failure_fails_call() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Messenger::with_protocol(
        base_config("nego-reject"),
        DelimitedContext::factory(),
        Arc::new(RejectingNegotiator),
    )
    .unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let call = OutboundCall::new(
        conn_id(addr),
        DelimitedContext::encode(b"denied"),
        Some(Duration::from_secs(5)),
    )
    .on_completion(move |result| {
        tx.send(result).unwrap();
    });
    client.queue_outbound_call(call);

    let err = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert!(err.is_network_error(), "expected handshake rejection, got {err:?}");

    client.shutdown();
}

// ── Idle reaping ────────────────────────────────────────────────────

#[test]
fn idle_inbound_connections_are_reaped() {
    let config = ConfigBuilder::new("reaper")
        .reactors(1)
        .negotiation_threads(1)
        .connection_keepalive_time(Duration::from_millis(150))
        .coarse_timer_granularity(Duration::from_millis(30))
        .build()
        .unwrap();
    let server = Messenger::new(config).unwrap();
    let addr = server.add_acceptor("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    wait_for(Duration::from_secs(5), "connection registration", || {
        inbound_count(&server) == 1
    });

    wait_for(Duration::from_secs(5), "idle reap", || {
        inbound_count(&server) == 0
    });

    // The reap shut the socket down: the client sees EOF.
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    server.shutdown();
}

#[test]
fn active_connections_survive_the_keepalive() {
    let config = ConfigBuilder::new("keeper")
        .reactors(1)
        .negotiation_threads(1)
        .connection_keepalive_time(Duration::from_millis(200))
        .coarse_timer_granularity(Duration::from_millis(30))
        .build()
        .unwrap();
    let server = Messenger::new(config).unwrap();
    let addr = server.add_acceptor("127.0.0.1:0".parse().unwrap()).unwrap();

    use std::io::Write;
    let mut client = TcpStream::connect(addr).unwrap();
    wait_for(Duration::from_secs(5), "connection registration", || {
        inbound_count(&server) == 1
    });

    // Keep writing frames for several keep-alive periods.
    client
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    for _ in 0..10 {
        client
            .write_all(&DelimitedContext::encode(b"still here"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
    }
    assert_eq!(inbound_count(&server), 1);

    server.shutdown();
}

// ── Broadcast and targeted drop ─────────────────────────────────────

#[test]
fn broadcast_reaches_inbound_connections() {
    let (server, addr) = echo_server("bcast");

    let mut client = TcpStream::connect(addr).unwrap();
    wait_for(Duration::from_secs(5), "connection negotiation", || {
        server
            .dump_running_rpcs(Default::default())
            .map(|dump| dump.inbound_connections.iter().any(|c| c.negotiated))
            .unwrap_or(false)
    });

    let event = DelimitedContext::encode(b"announcement");
    server.queue_event_on_all_connections(event.clone());

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = vec![0u8; event.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, event);

    server.shutdown();
}

#[test]
fn drop_with_remote_address_kills_matching_connections() {
    let (server, addr) = echo_server("dropper");

    let mut client = TcpStream::connect(addr).unwrap();
    wait_for(Duration::from_secs(5), "connection negotiation", || {
        server
            .dump_running_rpcs(Default::default())
            .map(|dump| dump.inbound_connections.iter().any(|c| c.negotiated))
            .unwrap_or(false)
    });

    server.drop_connections_from(IpAddr::V4(Ipv4Addr::LOCALHOST));

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    wait_for(Duration::from_secs(5), "table cleanup", || {
        inbound_count(&server) == 0
    });

    server.shutdown();
}

// ── Introspection ───────────────────────────────────────────────────

#[test]
fn dump_running_rpcs_reports_both_directions() {
    let (server, addr) = echo_server("dump-server");
    let client = Messenger::new(base_config("dump-client")).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let call = OutboundCall::new(
        conn_id(addr),
        DelimitedContext::encode(b"dump me"),
        Some(Duration::from_secs(5)),
    )
    .on_completion(move |result| {
        tx.send(result).unwrap();
    });
    client.queue_outbound_call(call);
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());

    let client_dump = client.dump_running_rpcs(Default::default()).unwrap();
    assert_eq!(client_dump.outbound_connections.len(), 1);
    assert!(client_dump.inbound_connections.is_empty());
    assert_eq!(client_dump.outbound_connections[0].remote, addr);

    wait_for(Duration::from_secs(5), "server registration", || {
        inbound_count(&server) == 1
    });
    let server_dump = server.dump_running_rpcs(Default::default()).unwrap();
    assert_eq!(server_dump.inbound_connections.len(), 1);
    assert!(server_dump.outbound_connections.is_empty());

    client.shutdown();
    server.shutdown();
}
