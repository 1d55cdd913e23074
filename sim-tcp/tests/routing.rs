//! Integration tests for port binding, listeners and demultiplexing.

use std::time::Duration;

use sim_tcp::packet::{Protocol, MAX_TTL};
use sim_tcp::{
    Config, NodeAddr, Packet, Segment, SegmentKind, Simulator, SimulatorConfig, SocketError,
    SocketId, SocketState, TcpManager, TimerConfig,
};

const CLIENT: NodeAddr = 1;
const SERVER: NodeAddr = 5;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn two_nodes() -> Simulator {
    init_logging();
    let mut sim = Simulator::new(SimulatorConfig::default()).unwrap();
    sim.add_node(CLIENT, Config::default()).unwrap();
    sim.add_node(SERVER, Config::default()).unwrap();
    sim
}

/// Put a hand-built segment on the wire from the client node.
fn inject(sim: &mut Simulator, segment: &Segment, ttl: u8) {
    let bytes = segment.pack().unwrap();
    sim.with_node(CLIENT, |_, host| {
        host.send_packet(Packet::transport(CLIENT, SERVER, ttl, segment.seq, bytes));
    })
    .unwrap();
}

fn fins(sim: &Simulator) -> Vec<Segment> {
    sim.trace()
        .iter()
        .filter_map(|t| t.segment())
        .filter(|s| s.kind == SegmentKind::Fin)
        .collect()
}

#[test]
fn stray_segment_is_answered_with_a_single_fin() {
    for kind in [SegmentKind::Data, SegmentKind::Ack] {
        let mut sim = two_nodes();
        let stray = Segment {
            src_port: 4000,
            dst_port: 80,
            kind,
            window: 1000,
            seq: 42,
            payload: if kind == SegmentKind::Data { b"hello".to_vec() } else { Vec::new() },
        };
        inject(&mut sim, &stray, MAX_TTL);
        sim.run_for(Duration::from_secs(2));

        // The FIN comes back once; the client has no connection either, but
        // a FIN is never answered, so there is no ping-pong.
        let fins = fins(&sim);
        assert_eq!(fins.len(), 1, "{kind}");
        assert_eq!(fins[0].src_port, 80);
        assert_eq!(fins[0].dst_port, 4000);
        assert_eq!(sim.trace().len(), 2);
        assert_eq!(sim.pending_events(), 0);
    }
}

#[test]
fn packets_the_transport_does_not_own_are_ignored() {
    let mut sim = two_nodes();
    let stray = Segment::control(4000, 80, SegmentKind::Ack, 0, 1);
    inject(&mut sim, &stray, 0);
    sim.with_node(CLIENT, |_, host| {
        host.send_packet(Packet {
            src: CLIENT,
            dest: SERVER,
            ttl: MAX_TTL,
            protocol: Protocol::Ping,
            seq: 0,
            payload: b"ping".to_vec(),
        });
        host.send_packet(Packet::transport(CLIENT, SERVER, MAX_TTL, 0, vec![0xde, 0xad]));
    })
    .unwrap();
    sim.run_for(Duration::from_secs(1));
    assert!(fins(&sim).is_empty());
    assert_eq!(sim.trace().len(), 3);
}

#[test]
fn full_backlog_defers_connection_until_accept() {
    let mut sim = two_nodes();
    let listener = sim
        .with_node(SERVER, |m, _| {
            let s = m.socket();
            m.bind(s, 80).unwrap();
            m.listen(s, 1).unwrap();
            s
        })
        .unwrap();
    let (first, second) = sim
        .with_node(CLIENT, |m, host| {
            let a = m.socket();
            m.bind(a, 4000).unwrap();
            m.connect(a, SERVER, 80, host).unwrap();
            let b = m.socket();
            m.bind(b, 4001).unwrap();
            m.connect(b, SERVER, 80, host).unwrap();
            (a, b)
        })
        .unwrap();

    sim.run_for(Duration::from_millis(500));
    let client = sim.node(CLIENT).unwrap();
    assert!(client.is_connected(first));
    assert!(client.is_connection_pending(second));
    assert_eq!(sim.node(SERVER).unwrap().get(listener).unwrap().backlog_len(), 1);

    let child = sim.with_node(SERVER, |m, _| m.accept(listener)).flatten().unwrap();
    assert_eq!(
        sim.node(SERVER).unwrap().get(child).unwrap().remote(),
        Some((CLIENT, 4000))
    );

    // The second client's SYN retry finds room now.
    assert!(sim.run_until(Duration::from_secs(3), |s| {
        s.node(CLIENT).is_some_and(|m| m.is_connected(second))
    }));
    let child = sim.with_node(SERVER, |m, _| m.accept(listener)).flatten().unwrap();
    assert_eq!(
        sim.node(SERVER).unwrap().get(child).unwrap().remote(),
        Some((CLIENT, 4001))
    );
}

#[test]
fn socket_calls_reject_invalid_use() {
    let mut m = TcpManager::new(SERVER, Config::default()).unwrap();
    let a = m.socket();
    let b = m.socket();
    assert_ne!(a, b);
    assert_eq!(m.state(a), SocketState::Closed);

    assert_eq!(m.listen(a, 1), Err(SocketError::NotBound));
    m.bind(a, 80).unwrap();
    assert_eq!(m.bind(b, 80), Err(SocketError::PortInUse(80)));
    m.listen(a, 1).unwrap();
    assert!(m.is_listening(a));
    assert_eq!(m.listen(a, 1), Err(SocketError::InvalidState(SocketState::Listen)));
    assert_eq!(m.accept(a), None);
    assert_eq!(m.accept(b), None);
}

#[test]
fn connect_from_listener_is_rejected() {
    let mut sim = two_nodes();
    let result = sim
        .with_node(SERVER, |m, host| {
            let s = m.socket();
            m.bind(s, 80).unwrap();
            m.listen(s, 1).unwrap();
            m.connect(s, CLIENT, 4000, host)
        })
        .unwrap();
    assert_eq!(result, Err(SocketError::InvalidState(SocketState::Listen)));
}

#[test]
fn release_frees_port_and_resets_peers() {
    let mut sim = two_nodes();
    let listener = sim
        .with_node(SERVER, |m, _| {
            let s = m.socket();
            m.bind(s, 80).unwrap();
            m.listen(s, 2).unwrap();
            s
        })
        .unwrap();
    let client = sim
        .with_node(CLIENT, |m, host| {
            let s = m.socket();
            m.bind(s, 4000).unwrap();
            m.connect(s, SERVER, 80, host).unwrap();
            s
        })
        .unwrap();
    sim.run_for(Duration::from_millis(100));
    assert_eq!(sim.node(SERVER).unwrap().get(listener).unwrap().backlog_len(), 1);

    // Releasing the listener takes the un-accepted connection with it.
    sim.with_node(SERVER, |m, host| {
        m.release(listener, host);
        assert_eq!(m.state(listener), SocketState::Closed);
        assert_eq!(m.demux().connection_count(), 0);
        let again = m.socket();
        m.bind(again, 80).unwrap();
        assert_eq!(
            m.write(listener, b"x", host),
            Err(SocketError::UnknownSocket(listener))
        );
    })
    .unwrap();

    // The client's next DATA hits no connection and is answered with FIN.
    sim.with_node(CLIENT, |m, host| m.write(client, b"anyone there?", host))
        .unwrap()
        .unwrap();
    sim.run_for(Duration::from_millis(100));
    let client_sock = sim.node(CLIENT).unwrap().get(client).unwrap();
    assert!(client_sock.peer_closed());
    assert_eq!(client_sock.state(), SocketState::Shutdown);
}

#[test]
fn closing_a_pending_connect_releases_it() {
    let mut sim = two_nodes();
    let client = sim
        .with_node(CLIENT, |m, host| {
            let s = m.socket();
            m.bind(s, 4000).unwrap();
            m.connect(s, SERVER, 80, host).unwrap();
            m.close(s, host).unwrap();
            s
        })
        .unwrap();
    assert!(sim.node(CLIENT).unwrap().is_closed(client));

    // The stale SYN timer fires harmlessly and the port is free again.
    sim.run_for(Duration::from_secs(3));
    let syns = sim
        .trace()
        .iter()
        .filter_map(|t| t.segment())
        .filter(|s| s.kind == SegmentKind::Syn)
        .count();
    assert_eq!(syns, 1);
    sim.with_node(CLIENT, |m, _| {
        let s = m.socket();
        m.bind(s, 4000).unwrap();
    })
    .unwrap();
}

/// Listener on the server's port 80 plus one connected client on port 4000.
fn connected_pair(sim: &mut Simulator) -> (SocketId, SocketId) {
    let listener = sim
        .with_node(SERVER, |m, _| {
            let s = m.socket();
            m.bind(s, 80).unwrap();
            m.listen(s, 1).unwrap();
            s
        })
        .unwrap();
    let client = sim
        .with_node(CLIENT, |m, host| {
            let s = m.socket();
            m.bind(s, 4000).unwrap();
            m.connect(s, SERVER, 80, host).unwrap();
            s
        })
        .unwrap();
    assert!(sim.run_until(Duration::from_secs(1), |s| {
        s.node(CLIENT).is_some_and(|m| m.is_connected(client))
    }));
    (listener, client)
}

#[test]
fn closed_socket_cannot_reclaim_its_old_port() {
    init_logging();
    let config = Config {
        timers: TimerConfig {
            shutdown_check: Duration::from_millis(5),
            ..TimerConfig::default()
        },
        ..Config::default()
    };
    let mut sim = Simulator::new(SimulatorConfig::default()).unwrap();
    sim.add_node(CLIENT, config.clone()).unwrap();
    sim.add_node(SERVER, config).unwrap();
    let (_, old) = connected_pair(&mut sim);

    sim.with_node(CLIENT, |m, host| m.close(old, host).unwrap())
        .unwrap();
    assert!(sim.run_until(Duration::from_secs(1), |s| {
        s.node(CLIENT).is_some_and(|m| m.is_closed(old))
    }));

    sim.with_node(CLIENT, |m, host| {
        let owner = m.socket();
        m.bind(owner, 4000).unwrap();
        m.listen(owner, 1).unwrap();

        assert_eq!(m.listen(old, 1), Err(SocketError::NotBound));
        assert_eq!(m.connect(old, SERVER, 80, host), Err(SocketError::NotBound));
        assert_eq!(m.demux().listener(4000), Some(owner));
        assert!(m.is_listening(owner));
    })
    .unwrap();
}

#[test]
fn closed_connection_cannot_take_over_the_listener_port() {
    let mut sim = two_nodes();
    let (listener, client) = connected_pair(&mut sim);
    let child = sim.with_node(SERVER, |m, _| m.accept(listener)).flatten().unwrap();

    sim.with_node(CLIENT, |m, host| m.close(client, host).unwrap())
        .unwrap();
    sim.run_for(Duration::from_secs(3));

    sim.with_node(SERVER, |m, host| {
        assert!(m.is_closed(child));
        assert_eq!(m.listen(child, 1), Err(SocketError::NotBound));
        assert_eq!(m.connect(child, CLIENT, 5000, host), Err(SocketError::NotBound));
        assert_eq!(m.demux().listener(80), Some(listener));
        assert!(m.is_listening(listener));
    })
    .unwrap();
}

#[test]
fn accept_skips_connections_closed_while_queued() {
    let mut sim = two_nodes();
    let (listener, client) = connected_pair(&mut sim);

    // The peer closes before the application ever accepts.
    sim.with_node(CLIENT, |m, host| m.close(client, host).unwrap())
        .unwrap();
    sim.run_for(Duration::from_secs(3));

    let server = sim.node(SERVER).unwrap();
    assert_eq!(server.get(listener).unwrap().backlog_len(), 1);
    assert_eq!(sim.with_node(SERVER, |m, _| m.accept(listener)).flatten(), None);
    assert_eq!(sim.node(SERVER).unwrap().get(listener).unwrap().backlog_len(), 0);
}
