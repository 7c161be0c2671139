//! Commissioner, border router and leader wired together over an in-memory network.

#![allow(unused)]


use std::net::SocketAddr;
use std::time::{Duration, Instant};

use meshcop_relay::coap::{CoapMessage, Code, MessageType};
use meshcop_relay::commissioner::MAX_PENDING_REQUESTS;
use meshcop_relay::leader;
use meshcop_relay::relay;
use meshcop_relay::transport::MAX_DATAGRAM_LEN;
use meshcop_relay::{
    BorderRouter, Commissioner, CommissionerEvent, Config, DatagramTransport, Leader,
    MemoryNetwork, MemoryTransport, RelayConfig, SessionState, Tlv, TlvType,
};
use session_common::*;

const BORDER_AGENT: u16 = 19779;
const LEADER: u16 = 19780;
const RELAY_MESH_SIDE: u16 = 19781;
const COMMISSIONER: u16 = 49152;

fn relay_config() -> RelayConfig {
    RelayConfig::builder()
        .listen_addr(addr(BORDER_AGENT))
        .leader_addr(addr(LEADER))
        .passphrase("12SECRETPASSWORD34")
        .network_name("Test Network")
        .ext_pan_id("0001020304050607")
        .dtls(Config::builder().rng_seed(40).build().unwrap())
        .build()
        .unwrap()
}

fn start_relay(network: &MemoryNetwork) -> (relay::RelayHandle, meshcop_relay::Pskc) {
    let config = relay_config();
    let pskc = config.pskc().clone();
    let router = BorderRouter::new(
        config,
        network.bind(addr(BORDER_AGENT)).unwrap(),
        network.bind(addr(RELAY_MESH_SIDE)).unwrap(),
    )
    .unwrap();
    (relay::spawn(router).unwrap(), pskc)
}

fn connected_commissioner(
    network: &MemoryNetwork,
    pskc: &meshcop_relay::Pskc,
) -> Commissioner<MemoryTransport> {
    let config = std::sync::Arc::new(Config::builder().rng_seed(41).build().unwrap());
    let mut commissioner = Commissioner::new(
        config,
        pskc,
        network.bind(addr(COMMISSIONER)).unwrap(),
        addr(BORDER_AGENT),
    )
    .unwrap();
    commissioner.connect(Instant::now()).unwrap();
    wait_for(&mut commissioner, |c| c.is_connected().then_some(()));
    commissioner
}

/// Drive the commissioner until `f` yields, failing after a few seconds.
fn wait_for<T>(
    commissioner: &mut Commissioner<MemoryTransport>,
    mut f: impl FnMut(&mut Commissioner<MemoryTransport>) -> Option<T>,
) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        if let Some(v) = f(commissioner) {
            return v;
        }
        assert!(Instant::now() < deadline, "timed out waiting");
        commissioner
            .poll(&mut buf, Duration::from_millis(10))
            .expect("commissioner poll");
    }
}

fn next_event(commissioner: &mut Commissioner<MemoryTransport>) -> CommissionerEvent {
    wait_for(commissioner, |c| c.poll_event())
}

#[test]
fn petition_through_the_relay() {
    init_log();
    let network = MemoryNetwork::new();
    let leader_handle = leader::spawn(
        Leader::new().unwrap(),
        network.bind(addr(LEADER)).unwrap(),
    )
    .unwrap();
    let (relay_handle, pskc) = start_relay(&network);

    let mut commissioner = connected_commissioner(&network, &pskc);

    commissioner.petition("test-commissioner").unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 1 }
    );
    assert_eq!(commissioner.session_id(), Some(1));

    commissioner.keep_alive().unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 1 }
    );

    let channel = Tlv::u16(TlvType::CHANNEL, 15);
    let pan_id = Tlv::u16(TlvType::PAN_ID, 0xface);
    commissioner
        .set_active(&[channel.clone(), pan_id.clone()])
        .unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 1 }
    );

    commissioner.get_active(&[]).unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Dataset(vec![channel, pan_id.clone()])
    );

    commissioner.get_active(&[TlvType::PAN_ID]).unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Dataset(vec![pan_id])
    );

    let stats = relay_handle.shutdown().unwrap();
    assert_eq!(stats.forwarded, 5);
    assert_eq!(stats.replies, 5);
    assert_eq!(stats.dropped_unknown_uri, 0);

    let leader = leader_handle.shutdown().unwrap();
    assert_eq!(leader.commissioner_id(), Some("test-commissioner"));
    assert_eq!(leader.session_id(), 1);
}

#[test]
fn relay_rewrites_only_the_uri() {
    init_log();
    let network = MemoryNetwork::new();
    // Stand in for the leader to look at what the relay forwards.
    let leader = network.bind(addr(LEADER)).unwrap();
    let (relay_handle, pskc) = start_relay(&network);

    let mut commissioner = connected_commissioner(&network, &pskc);
    let token = commissioner.petition("observer").unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let (n, from) = leader
        .recv_from(&mut buf, Duration::from_secs(5))
        .unwrap()
        .expect("forwarded petition");
    assert_eq!(from, addr(RELAY_MESH_SIDE));

    let forwarded = CoapMessage::decode(&buf[..n]).unwrap();
    assert_eq!(forwarded.uri_path().unwrap(), "c/lp");
    assert_eq!(forwarded.message_type, MessageType::Confirmable);
    assert_eq!(forwarded.code, Code::POST);
    assert_eq!(forwarded.token, token);
    assert_eq!(forwarded.content_format(), Some(42));
    let tlvs = meshcop_relay::tlv::parse_tlvs(&forwarded.payload).unwrap();
    assert_eq!(tlvs, vec![Tlv::new(TlvType::COMMISSIONER_ID, b"observer").unwrap()]);

    // A reply is carried back byte for byte.
    let mut reply = CoapMessage::response_to(&forwarded, Code::CHANGED);
    reply.payload = meshcop_relay::tlv::encode_tlvs(&[
        Tlv::state(meshcop_relay::State::Accept),
        Tlv::u16(TlvType::COMMISSIONER_SESSION_ID, 77),
    ]);
    leader
        .send_to(&reply.encode().unwrap(), addr(RELAY_MESH_SIDE))
        .unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 77 }
    );

    relay_handle.shutdown().unwrap();
}

#[test]
fn every_petition_gets_a_new_session() {
    init_log();
    let network = MemoryNetwork::new();
    let leader_handle = leader::spawn(
        Leader::new().unwrap(),
        network.bind(addr(LEADER)).unwrap(),
    )
    .unwrap();
    let (relay_handle, pskc) = start_relay(&network);
    let mut commissioner = connected_commissioner(&network, &pskc);

    commissioner.petition("first").unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 1 }
    );

    commissioner.petition("second").unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 2 }
    );

    commissioner.keep_alive().unwrap();
    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Accepted { session_id: 2 }
    );

    relay_handle.shutdown().unwrap();
    let leader = leader_handle.shutdown().unwrap();
    assert_eq!(leader.commissioner_id(), Some("second"));
}

#[test]
fn unanswered_requests_are_given_up() {
    init_log();
    let network = MemoryNetwork::new();
    let leader = network.bind(addr(LEADER)).unwrap();
    let (relay_handle, pskc) = start_relay(&network);
    let mut commissioner = connected_commissioner(&network, &pskc);

    let sent = MAX_PENDING_REQUESTS + 4;
    for _ in 0..sent {
        commissioner.get_active(&[]).unwrap();
    }
    assert_eq!(commissioner.pending_requests(), MAX_PENDING_REQUESTS);

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut forwarded = Vec::new();
    for _ in 0..sent {
        let (n, _) = leader
            .recv_from(&mut buf, Duration::from_secs(5))
            .unwrap()
            .expect("forwarded request");
        forwarded.push(CoapMessage::decode(&buf[..n]).unwrap());
    }

    // The oldest request was dropped, its late reply means nothing.
    let answer = |request: &CoapMessage, channel: u16| {
        let mut reply = CoapMessage::response_to(request, Code::CHANGED);
        reply.payload = meshcop_relay::tlv::encode_tlvs(&[Tlv::u16(TlvType::CHANNEL, channel)]);
        leader
            .send_to(&reply.encode().unwrap(), addr(RELAY_MESH_SIDE))
            .unwrap();
    };
    answer(&forwarded[0], 11);
    answer(&forwarded[sent - 1], 26);

    assert_eq!(
        next_event(&mut commissioner),
        CommissionerEvent::Dataset(vec![Tlv::u16(TlvType::CHANNEL, 26)])
    );
    assert_eq!(commissioner.pending_requests(), MAX_PENDING_REQUESTS - 1);

    relay_handle.shutdown().unwrap();
}

#[test]
fn stray_hello_leaves_the_commissioner_connected() {
    init_log();
    let network = MemoryNetwork::new();
    let leader = network.bind(addr(LEADER)).unwrap();
    let config = relay_config();
    let pskc = config.pskc().clone();
    let mut router = BorderRouter::new(
        config,
        network.bind(addr(BORDER_AGENT)).unwrap(),
        network.bind(addr(RELAY_MESH_SIDE)).unwrap(),
    )
    .unwrap();

    let mut commissioner = Commissioner::new(
        std::sync::Arc::new(Config::builder().rng_seed(41).build().unwrap()),
        &pskc,
        network.bind(addr(COMMISSIONER)).unwrap(),
        addr(BORDER_AGENT),
    )
    .unwrap();
    commissioner.connect(Instant::now()).unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let deadline = Instant::now() + Duration::from_secs(10);
    while !(commissioner.is_connected() && router.session_state() == SessionState::Connected) {
        assert!(Instant::now() < deadline, "handshake timed out");
        router.poll(&mut buf, Duration::from_millis(5)).unwrap();
        commissioner.poll(&mut buf, Duration::from_millis(5)).unwrap();
    }

    // Someone else opens a handshake with the border agent.
    let stranger = network.bind(addr(6666)).unwrap();
    let mut other = Peer::client(seeded_config(42), pskc.as_bytes(), Instant::now());
    for hello in other.take_datagrams() {
        stranger.send_to(&hello, addr(BORDER_AGENT)).unwrap();
    }
    router.poll(&mut buf, Duration::from_millis(50)).unwrap();

    assert_eq!(router.session_state(), SessionState::Connected);
    assert_eq!(router.commissioner_addr(), Some(addr(COMMISSIONER)));
    let (_, from) = stranger
        .recv_from(&mut buf, Duration::from_secs(1))
        .unwrap()
        .expect("HelloVerifyRequest");
    assert_eq!(from, addr(BORDER_AGENT));

    // The commissioner's requests still reach the leader.
    commissioner.petition("still-me").unwrap();
    router.poll(&mut buf, Duration::from_millis(50)).unwrap();
    let (n, _) = leader
        .recv_from(&mut buf, Duration::from_secs(1))
        .unwrap()
        .expect("forwarded petition");
    assert_eq!(CoapMessage::decode(&buf[..n]).unwrap().uri_path().unwrap(), "c/lp");
}
