//! End-to-end tests for data channels over real socket pairs

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rstest::rstest;
use sensor_channel::{
    CloseReason, EventFrame, ReadinessLoop, SendPolicy, SendStatus, Transport, MAX_PAYLOAD_LEN,
};
use sensor_hal::{SensorIdentity, SensorType};

const WAIT: Duration = Duration::from_secs(2);

fn collecting_transport(readiness: &ReadinessLoop) -> (Transport, mpsc::Receiver<EventFrame>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let transport = Transport::create(
        readiness,
        Arc::new(move |frame| {
            let _ = tx.lock().send(frame);
        }),
    )
    .unwrap();
    (transport, rx)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(MAX_PAYLOAD_LEN)]
fn test_frames_cross_the_channel(#[case] payload_len: usize) {
    let readiness = ReadinessLoop::start("it-frames").unwrap();
    let (transport, rx) = collecting_transport(&readiness);
    let sender = transport
        .take_send_endpoint()
        .unwrap()
        .into_sender(SendPolicy::default());

    let identity = SensorIdentity::local(3, SensorType::MAGNETIC_FIELD);
    let payload = vec![0xAB; payload_len];
    let frames: Vec<EventFrame> = (0..10)
        .map(|ts| EventFrame::new(identity, ts, &payload).unwrap())
        .collect();
    assert_eq!(sender.send(&frames).unwrap(), SendStatus::Flushed);

    for ts in 0..10 {
        let frame = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.timestamp, ts);
        assert_eq!(frame.identity(), identity);
        assert_eq!(frame.payload(), &payload[..]);
    }
}

#[test]
fn test_repeated_create_destroy_leaves_no_listeners() {
    let readiness = ReadinessLoop::start("it-churn").unwrap();
    for _ in 0..1000 {
        let transport = Transport::create(&readiness, Arc::new(|_| {})).unwrap();
        transport.destroy();
        transport.destroy();
    }
    assert_eq!(readiness.listener_count(), 0);
}

#[test]
fn test_dropping_transport_releases_listener() {
    let readiness = ReadinessLoop::start("it-drop").unwrap();
    {
        let _transport = Transport::create(&readiness, Arc::new(|_| {})).unwrap();
        assert_eq!(readiness.listener_count(), 1);
    }
    assert_eq!(readiness.listener_count(), 0);
}

#[test]
fn test_broker_side_close_tears_down_transport() {
    let readiness = ReadinessLoop::start("it-peer-close").unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let transport = Transport::create_with_close(
        &readiness,
        Arc::new(|_| {}),
        Arc::new(move |reason| {
            let _ = tx.lock().send(reason);
        }),
    )
    .unwrap();

    let sender = transport
        .take_send_endpoint()
        .unwrap()
        .into_sender(SendPolicy::default());
    drop(sender);

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), CloseReason::PeerClosed);
    assert!(wait_until(|| !transport.is_active()));
    assert_eq!(readiness.listener_count(), 0);

    // Explicit destroy after a peer close is a no-op
    transport.destroy();
}

#[test]
fn test_subscriber_close_is_seen_by_broker_watch() {
    let subscriber_loop = ReadinessLoop::start("it-subscriber").unwrap();
    let broker_loop = ReadinessLoop::start("it-broker").unwrap();
    let transport = Transport::create(&subscriber_loop, Arc::new(|_| {})).unwrap();
    let sender = transport
        .take_send_endpoint()
        .unwrap()
        .into_sender(SendPolicy::default());

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    broker_loop
        .register(
            sender.watch_handle().unwrap(),
            Arc::new(|_| {}),
            Arc::new(move |reason| {
                let _ = tx.lock().send(reason);
            }),
        )
        .unwrap();

    transport.destroy();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), CloseReason::PeerClosed);
    assert_eq!(broker_loop.listener_count(), 0);
}
