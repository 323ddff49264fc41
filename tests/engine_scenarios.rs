// tests/engine_scenarios.rs
//! End-to-end scenarios through the public API

use rtb_engine::events::{ErrorKind, Spot};
use rtb_engine::transport::WireBidRequest;
use rtb_engine::{BidResponse, Engine, EngineConfig, EngineError, Event, EventType, InboundMessage};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

fn engine_with(json: &str) -> Engine {
    let config = EngineConfig::from_json_str(json).expect("valid config");
    Engine::from_config(config).expect("engine starts")
}

fn bid_request(auction_id: &str, campaign: u64, tmax_ms: u64) -> InboundMessage {
    InboundMessage::BidRequest(WireBidRequest {
        auction_id: Some(auction_id.to_string()),
        campaign: Some(campaign),
        tmax_ms: Some(tmax_ms),
        spots: vec![Spot {
            id: "s1".into(),
            formats: vec!["300x250".into()],
            reserve_price: None,
        }],
        ..Default::default()
    })
}

#[cfg(unix)]
fn readable(fd: i32, timeout_ms: u16) -> bool {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;

    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(1) => fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)),
        _ => false,
    }
}

/// A campaign-filtered agent sees only its campaign, signalled through the engine fd.
#[cfg(unix)]
#[test]
fn campaign_filter_with_fd_readiness() {
    let file = {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(
            br#"{
                "engine": { "worker_threads": 1 },
                "agents": [ { "name": "camp42", "filter": "campaign=42" } ]
            }"#,
        )
        .unwrap();
        file
    };
    let engine = Engine::initialize(file.path()).unwrap();
    let agent = engine.create_bidding_agent("camp42").unwrap();
    let fd = engine.fd();
    assert!(fd >= 0);
    assert!(!readable(fd, 0), "nothing queued yet");

    assert_eq!(engine.inject(bid_request("other", 7, 1_000)).unwrap(), 0);
    assert!(!readable(fd, 0), "unmatched request must not wake the engine");

    assert_eq!(engine.inject(bid_request("mine", 42, 1_000)).unwrap(), 1);
    assert!(readable(fd, 1_000));
    assert!(readable(agent.fd(), 0));

    let delivery = agent.next_event().unwrap();
    assert_eq!(delivery.event().auction_id(), Some("mine"));
    agent.free_event(delivery).unwrap();
    assert!(!readable(fd, 0), "drained queue lowers readiness");

    assert_eq!(engine.stats().dispatch.requests_unmatched, 1);
}

/// Shutdown wakes every agent with exactly one ShutdownSignal.
#[test]
fn shutdown_signals_every_agent_once() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1 } }"#);
    let first = engine.create_bidding_agent("first").unwrap();
    let second = engine.create_bidding_agent("second").unwrap();
    engine.inject(bid_request("a1", 1, 1_000)).unwrap();

    let blocked = std::thread::spawn(move || {
        let delivery = second.next_event().unwrap();
        let ty = delivery.event_type();
        drop(delivery);
        let next = second.next_event().unwrap();
        (ty, next.event_type(), second.next_event().err())
    });

    std::thread::sleep(Duration::from_millis(50));
    engine.shutdown().unwrap();

    match first.next_event().unwrap().event() {
        Event::ShutdownSignal(signal) => assert_eq!(signal.discarded, 1),
        other => panic!("expected shutdown signal, got {:?}", other),
    }
    assert_eq!(first.next_event().unwrap_err(), EngineError::EngineClosed);

    // `second` took the bid request before shutdown, then observes the signal
    let (ty, next, after) = blocked.join().unwrap();
    assert_eq!(ty, EventType::BidRequest);
    assert_eq!(next, EventType::ShutdownSignal);
    assert_eq!(after, Some(EngineError::EngineClosed));
}

/// A response after the deadline is rejected and never reaches the exchange.
#[test]
fn late_response_is_stale() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1 } }"#);
    let agent = engine.create_bidding_agent("slow").unwrap();
    let outbound = engine.local_outbound();

    engine.inject(bid_request("late", 1, 5)).unwrap();
    let delivery = agent.next_event().unwrap();
    std::thread::sleep(Duration::from_millis(30));

    let err = agent
        .bid(BidResponse::single(delivery.event().auction_id().unwrap(), "s1", 1.0))
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleAuction { .. }));
    assert!(outbound.try_recv().is_err());
    assert_eq!(engine.stats().dispatch.responses_forwarded, 0);
}

/// Overflow is reported in-band ahead of the next accepted event.
#[test]
fn queue_overflow_is_reported() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1, "queue_capacity": 2 } }"#);
    let agent = engine.create_bidding_agent("small").unwrap();

    for i in 0..4 {
        engine.inject(bid_request(&format!("r{}", i), 1, 1_000)).unwrap();
    }
    for expected in ["r0", "r1"] {
        let delivery = agent.try_next_event().unwrap().unwrap();
        assert_eq!(delivery.event().auction_id(), Some(expected));
    }
    assert!(agent.try_next_event().unwrap().is_none());

    engine.inject(bid_request("r4", 1, 1_000)).unwrap();
    match agent.try_next_event().unwrap().unwrap().event() {
        Event::Error(e) => {
            assert_eq!(e.kind, ErrorKind::QueueOverflow);
            assert_eq!(e.dropped, 2);
        }
        other => panic!("expected overflow error, got {:?}", other),
    }
    let delivery = agent.try_next_event().unwrap().unwrap();
    assert_eq!(delivery.event().auction_id(), Some("r4"));
}

/// Bid requests over TCP reach the agent and the bid goes back on the same connection.
#[test]
fn tcp_exchange_round_trip() {
    let engine = engine_with(
        r#"{
            "engine": { "worker_threads": 1 },
            "exchanges": [ { "name": "mock", "mode": "listen", "address": "127.0.0.1:0" } ]
        }"#,
    );
    let agent = engine.create_bidding_agent_with_filter("tcp", "exchange=mock").unwrap();
    let addr = engine.local_addr("mock").unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"{\"type\":\"bid_request\",\"auction_id\":\"t1\",\"tmax_ms\":5000,\"spots\":[{\"id\":\"s1\"}]}\n")
        .unwrap();

    let delivery = agent
        .next_event_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("bid request over tcp");
    let request = delivery.event().as_bid_request().unwrap().clone();
    assert_eq!(request.exchange, "mock");
    agent.bid(BidResponse::single("t1", "s1", 2.5)).unwrap();

    let mut line = String::new();
    BufReader::new(stream.try_clone().unwrap()).read_line(&mut line).unwrap();
    let json: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(json["type"], "bid_response");
    assert_eq!(json["auction_id"], "t1");
    assert_eq!(json["bids"][0]["price"], 2.5);
}

/// Win notifications posted to the ad server reach the agent that bid.
#[test]
fn adserver_win_reaches_bidder() {
    let engine = engine_with(
        r#"{
            "engine": { "worker_threads": 1 },
            "adserver": { "address": "127.0.0.1:0" }
        }"#,
    );
    let bidder = engine.create_bidding_agent("bidder").unwrap();
    let bystander = engine.create_bidding_agent("bystander").unwrap();

    engine.inject(bid_request("w1", 1, 5_000)).unwrap();
    bidder.next_event().unwrap();
    bystander.next_event().unwrap();
    bidder.bid(BidResponse::single("w1", "s1", 1.0)).unwrap();
    bystander.bid(BidResponse::pass("w1")).unwrap();

    let body = r#"{"auction_id":"w1","spot_id":"s1","win_price":0.9}"#;
    let mut stream = TcpStream::connect(engine.adserver_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        stream,
        "POST /win HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 202"), "{}", response);
    assert!(response.ends_with(r#"{"routed":1}"#), "{}", response);

    let win = bidder.next_event_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(win.event_type(), EventType::WinNotification);
    assert!(bystander.try_next_event().unwrap().is_none());
}

/// An endpoint that cannot be bound fails initialization with a transport error.
#[test]
fn bind_conflict_fails_initialize() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let json = format!(
        r#"{{ "exchanges": [ {{ "name": "mock", "mode": "listen", "address": "{}" }} ] }}"#,
        taken.local_addr().unwrap()
    );
    let config = EngineConfig::from_json_str(&json).unwrap();
    assert!(matches!(Engine::from_config(config), Err(EngineError::Transport(_))));
}

/// Releasing from another thread unblocks a waiting consumer.
#[test]
fn release_unblocks_waiter() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1 } }"#);
    let agent = std::sync::Arc::new(engine.create_bidding_agent("waiter").unwrap());

    let waiter = {
        let agent = std::sync::Arc::clone(&agent);
        std::thread::spawn(move || agent.next_event().err())
    };
    std::thread::sleep(Duration::from_millis(50));
    engine.release_agent(agent.id()).unwrap();

    assert!(matches!(waiter.join().unwrap(), Some(EngineError::InvalidHandle(_))));
    assert!(matches!(engine.release_agent(agent.id()), Err(EngineError::InvalidHandle(_))));
}

/// A handle released through the engine can no longer bid.
#[test]
fn released_handle_cannot_bid() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1 } }"#);
    let agent = engine.create_bidding_agent("gone").unwrap();
    let outbound = engine.local_outbound();

    engine.inject(bid_request("r1", 1, 5_000)).unwrap();
    let delivery = agent.next_event().unwrap();
    engine.release_agent(agent.id()).unwrap();

    let err = agent.bid(BidResponse::single("r1", "s1", 1.0)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidHandle(_)));
    assert!(outbound.try_recv().is_err());
    agent.free_event(delivery).unwrap();
}

/// The same auction id live on two exchanges stays two auctions.
#[test]
fn auction_ids_are_scoped_by_exchange() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1 } }"#);
    let first = engine.create_bidding_agent_with_filter("first", "exchange=x1").unwrap();
    let second = engine.create_bidding_agent_with_filter("second", "exchange=x2").unwrap();
    let outbound = engine.local_outbound();

    for exchange in ["x1", "x2"] {
        let InboundMessage::BidRequest(mut wire) = bid_request("same", 1, 5_000) else {
            unreachable!()
        };
        wire.exchange = Some(exchange.to_string());
        assert_eq!(engine.inject(InboundMessage::BidRequest(wire)).unwrap(), 1);
    }

    for agent in [&first, &second] {
        let delivery = agent.next_event().unwrap();
        assert_eq!(delivery.event().auction_id(), Some("same"));
        agent.bid(BidResponse::single("same", "s1", 1.0)).unwrap();
    }
    assert_eq!(outbound.try_iter().count(), 2);
    assert_eq!(engine.stats().dispatch.requests_duplicate, 0);
}

/// A frame whose deadline cannot be represented is rejected, not fatal.
#[test]
fn out_of_range_tmax_is_rejected() {
    let engine = engine_with(r#"{ "engine": { "worker_threads": 1 } }"#);
    let _agent = engine.create_bidding_agent("any").unwrap();

    let err = engine.inject(bid_request("huge", 1, 10_000_000_000_000_000)).unwrap_err();
    assert!(matches!(err, EngineError::Protocol(_)));
    assert_eq!(engine.stats().dispatch.protocol_errors, 1);
    assert_eq!(engine.inject(bid_request("fine", 1, 1_000)).unwrap(), 1);
}
