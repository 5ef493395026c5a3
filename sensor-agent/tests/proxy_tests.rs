//! Proxy tests against an in-process broker

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use rstest::rstest;
use sensor_agent::{AgentError, SensorUser, SubscriptionProxy, SubscriptionState};
use sensor_hal::{CompatibleBackend, HalBackend, HalEvent, SensorDescriptor, SensorIdentity, SensorType};
use sensor_service::{Broker, BrokerConfig, ClientRegistration};

const WAIT: Duration = Duration::from_secs(2);
const PERIOD_NS: i64 = 10_000_000;

fn accel() -> SensorIdentity {
    SensorIdentity::local(1, SensorType::ACCELEROMETER)
}

fn setup(pid: i32) -> (Arc<CompatibleBackend>, Broker, SubscriptionProxy) {
    let descriptor =
        SensorDescriptor::new(accel(), "acc", "test").with_sample_period(1_000_000, 1_000_000_000);
    let backend = Arc::new(CompatibleBackend::new(vec![descriptor]));
    let broker = Broker::start(BrokerConfig::default(), vec![backend.clone() as Arc<dyn HalBackend>]).unwrap();
    let session = broker.session(ClientRegistration::new(pid, 1000, pid as u32));
    let proxy = SubscriptionProxy::new(Arc::new(session)).unwrap();
    (backend, broker, proxy)
}

fn collecting_user() -> (SensorUser, Receiver<i64>) {
    let (tx, rx) = unbounded();
    let user = SensorUser::new(move |frame| {
        let _ = tx.send(frame.timestamp);
    });
    (user, rx)
}

fn start(proxy: &SubscriptionProxy, user: &SensorUser, period_ns: i64) {
    proxy.subscribe(accel(), user).unwrap();
    proxy.configure(accel(), user.id(), period_ns, 0).unwrap();
    proxy.activate(accel(), user.id()).unwrap();
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

#[test]
fn test_two_users_share_channel_and_activation() {
    let (backend, broker, proxy) = setup(500);
    let (first, first_rx) = collecting_user();
    let (second, second_rx) = collecting_user();

    start(&proxy, &first, PERIOD_NS);
    start(&proxy, &second, PERIOD_NS * 4);
    assert_eq!(backend.calls().enable_count(&accel()), 1);
    assert_eq!(broker.channel_count(), 1);

    backend.inject(HalEvent::new(accel(), 11, vec![0; 12]));
    assert_eq!(first_rx.recv_timeout(WAIT).unwrap(), 11);
    assert_eq!(second_rx.recv_timeout(WAIT).unwrap(), 11);

    proxy.deactivate(accel(), first.id()).unwrap();
    assert!(backend.is_enabled(&accel()));
    backend.inject(HalEvent::new(accel(), 12, vec![0; 12]));
    assert_eq!(second_rx.recv_timeout(WAIT).unwrap(), 12);
    assert!(first_rx.recv_timeout(Duration::from_millis(100)).is_err());

    proxy.deactivate(accel(), second.id()).unwrap();
    assert!(!backend.is_enabled(&accel()));
    assert_eq!(backend.calls().disable_count(&accel()), 1);

    proxy.unsubscribe(accel(), first.id()).unwrap();
    proxy.unsubscribe(accel(), second.id()).unwrap();
    assert!(!proxy.has_channel());
    assert!(wait_until(|| broker.channel_count() == 0));
}

#[test]
fn test_concurrent_users_enable_hardware_once() {
    let (backend, _broker, proxy) = setup(501);
    let proxy = Arc::new(proxy);
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let proxy = Arc::clone(&proxy);
            std::thread::spawn(move || {
                let user = SensorUser::new(|_| {});
                start(&proxy, &user, PERIOD_NS);
                user
            })
        })
        .collect();
    let users: Vec<SensorUser> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(backend.calls().enable_count(&accel()), 1);

    for user in &users {
        proxy.deactivate(accel(), user.id()).unwrap();
    }
    assert_eq!(backend.calls().disable_count(&accel()), 1);
    for user in &users {
        proxy.unsubscribe(accel(), user.id()).unwrap();
    }
    assert!(!proxy.has_channel());
}

#[test]
fn test_resubscribe_after_teardown_opens_new_channel() {
    let (backend, broker, proxy) = setup(502);
    let (user, rx) = collecting_user();
    start(&proxy, &user, PERIOD_NS);
    proxy.deactivate(accel(), user.id()).unwrap();
    proxy.unsubscribe(accel(), user.id()).unwrap();
    assert!(wait_until(|| broker.channel_count() == 0));

    start(&proxy, &user, PERIOD_NS);
    assert_eq!(broker.channel_count(), 1);
    backend.inject(HalEvent::new(accel(), 99, vec![1; 4]));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 99);
}

#[rstest]
#[case(SubscriptionState::Subscribed)]
#[case(SubscriptionState::Deactivating)]
fn test_unsubscribe_requires_deactivate(#[case] reached: SubscriptionState) {
    let (_, _broker, proxy) = setup(503);
    let user = SensorUser::new(|_| {});
    proxy.subscribe(accel(), &user).unwrap();
    if reached == SubscriptionState::Deactivating {
        proxy.deactivate(accel(), user.id()).unwrap();
    }
    assert_eq!(proxy.state_of(accel(), user.id()), reached);

    let result = proxy.unsubscribe(accel(), user.id());
    match reached {
        SubscriptionState::Deactivating => assert!(result.is_ok()),
        _ => assert!(matches!(result, Err(AgentError::NotDeactivated { .. }))),
    }
}

#[test]
fn test_mode_and_option_need_membership() {
    let (backend, _broker, proxy) = setup(504);
    let member = SensorUser::new(|_| {});
    let outsider = SensorUser::new(|_| {});
    proxy.subscribe(accel(), &member).unwrap();

    proxy.set_mode(accel(), member.id(), 2).unwrap();
    proxy.set_option(accel(), member.id(), 1).unwrap();
    assert!(matches!(
        proxy.set_option(accel(), outsider.id(), 1),
        Err(AgentError::NotSubscribed { .. })
    ));
    let calls = backend.calls();
    assert_eq!(calls.modes, vec![(accel(), 2)]);
    assert_eq!(calls.options, vec![(accel(), 1)]);
}
