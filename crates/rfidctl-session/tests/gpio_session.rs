//! End-to-end tests of a GPIO session over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rfidctl_core::{Error, SessionConfig, TransportError};
use rfidctl_session::gpio::{
    GpioEvent, GpioMessage, GpioProtocol, GpioRequest, GpioSession, PinConfiguration,
    PinDirection, PinId, PinLevel, PinScope, PinState,
};
use rfidctl_session::mock::{MemoryTransport, MemoryTransportHandle};
use rfidctl_session::{PendingRequest, RequestId, SessionListener, SessionState};
use rfidctl_sync::EventQueue;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;

const TIMEOUT_MS: u64 = 500;

type Session = GpioSession<MemoryTransport<GpioMessage>>;

#[derive(Debug, Clone)]
struct Closed {
    abandoned: Vec<PendingRequest<GpioRequest>>,
    cause: Option<String>,
}

#[derive(Default)]
struct Recorder {
    opened: AtomicUsize,
    opened_signal: Notify,
    closed: Mutex<Vec<Closed>>,
    closed_signal: Notify,
}

impl Recorder {
    fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn closed(&self) -> Vec<Closed> {
        self.closed.lock().unwrap().clone()
    }

    async fn wait_opened(&self) {
        if self.opened_count() == 0 {
            tokio::time::timeout(Duration::from_millis(TIMEOUT_MS), self.opened_signal.notified())
                .await
                .expect("opened callback");
        }
    }

    async fn wait_closed(&self) -> Closed {
        if self.closed().is_empty() {
            tokio::time::timeout(Duration::from_millis(TIMEOUT_MS), self.closed_signal.notified())
                .await
                .expect("closed callback");
        }
        self.closed()[0].clone()
    }
}

impl SessionListener<GpioRequest> for Recorder {
    fn opened(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.opened_signal.notify_one();
    }

    fn closed(&self, abandoned: &[PendingRequest<GpioRequest>], cause: Option<&Error>) {
        self.closed.lock().unwrap().push(Closed {
            abandoned: abandoned.to_vec(),
            cause: cause.map(ToString::to_string),
        });
        self.closed_signal.notify_one();
    }
}

struct Fixture {
    session: Session,
    device: MemoryTransportHandle<GpioMessage>,
    events: Arc<EventQueue<GpioEvent>>,
    recorder: Arc<Recorder>,
}

fn fixture() -> Fixture {
    let (transport, device) = MemoryTransport::new();
    let events = Arc::new(EventQueue::new());
    let session = GpioSession::new(
        SessionConfig::new("gpio-board:5084", TIMEOUT_MS),
        GpioProtocol,
        Arc::new(transport),
        Arc::clone(&events),
    )
    .unwrap();

    let recorder = Arc::new(Recorder::default());
    session.add_listener(recorder.clone());

    Fixture {
        session,
        device,
        events,
        recorder,
    }
}

fn input(id: u16) -> PinState {
    PinState {
        id: PinId(id),
        direction: PinDirection::Input,
        level: PinLevel::High,
    }
}

async fn next_request(device: &MemoryTransportHandle<GpioMessage>) -> RequestId {
    match device.next_sent(Duration::from_millis(TIMEOUT_MS)).await {
        Some(GpioMessage::Request { id, .. }) => id,
        other => panic!("expected a request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_open_and_close_notify_listener_once() {
    let f = fixture();

    f.session.open(&Handle::current()).await.unwrap();
    assert_eq!(f.session.state(), SessionState::Running);
    f.recorder.wait_opened().await;

    let info = f.session.info();
    assert!(info.channel.is_some());
    assert!(info.uptime().is_some());

    f.session.close().await.unwrap();

    assert_eq!(f.session.state(), SessionState::Closed);
    assert_eq!(f.recorder.opened_count(), 1);
    let closed = f.recorder.closed();
    assert_eq!(closed.len(), 1);
    assert!(closed[0].abandoned.is_empty());
    assert!(closed[0].cause.is_none());
    assert_eq!(f.device.open_channels(), 0);
}

#[tokio::test]
async fn test_requests_are_dispatched_one_at_a_time() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    let first = f.session.request_pin_state(PinScope::All, PinScope::None).unwrap();
    let second = f
        .session
        .request_pin_configuration(PinScope::All, PinScope::All)
        .unwrap();

    assert_eq!(next_request(&f.device).await, first);
    assert!(f.device.next_sent(Duration::from_millis(50)).await.is_none());
    assert_eq!(f.session.pending_requests().len(), 1);
    assert_eq!(f.session.executing_request().map(|p| p.id), Some(first));

    f.device
        .deliver(GpioMessage::State {
            id: first,
            pins: vec![input(1)],
        })
        .unwrap();

    assert_eq!(next_request(&f.device).await, second);
    let event = f.events.take(TIMEOUT_MS as i64).await.unwrap();
    assert_eq!(
        event,
        GpioEvent::State {
            request: first,
            pins: vec![input(1)],
        }
    );

    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_requests_queued_before_open_are_sent_after() {
    let f = fixture();
    let id = f.session.request_reset_pin_configuration().unwrap();
    assert_eq!(f.session.pending_requests().len(), 1);

    f.session.open(&Handle::current()).await.unwrap();

    assert_eq!(next_request(&f.device).await, id);
    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_with_request_in_flight_reports_it() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    let gpo = vec![PinState {
        id: PinId(2),
        direction: PinDirection::Output,
        level: PinLevel::High,
    }];
    let id = f.session.request_set_pin_state(gpo.clone()).unwrap();
    let queued = f.session.request_reset_pin_configuration().unwrap();
    next_request(&f.device).await;

    let started = Instant::now();
    f.session.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(TIMEOUT_MS));

    let closed = f.recorder.closed();
    assert_eq!(closed.len(), 1);
    assert!(closed[0].cause.is_none());
    assert_eq!(
        closed[0].abandoned,
        vec![
            PendingRequest {
                id,
                request: GpioRequest::SetState(gpo),
            },
            PendingRequest {
                id: queued,
                request: GpioRequest::ResetConfiguration,
            },
        ]
    );
}

#[tokio::test]
async fn test_response_is_trimmed_to_requested_pins() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    let id = f
        .session
        .request_pin_state(PinScope::only([1u16, 2]), PinScope::None)
        .unwrap();
    next_request(&f.device).await;
    f.device
        .deliver(GpioMessage::State {
            id,
            pins: vec![input(1), input(7), input(2)],
        })
        .unwrap();

    let event = f.events.take(TIMEOUT_MS as i64).await.unwrap();
    assert_eq!(
        event,
        GpioEvent::State {
            request: id,
            pins: vec![input(1), input(2)],
        }
    );

    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_pin_bank_mixup_ends_session() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    let id = f
        .session
        .request_pin_configuration(PinScope::None, PinScope::only([5u16]))
        .unwrap();
    next_request(&f.device).await;
    f.device
        .deliver(GpioMessage::Configuration {
            id,
            pins: vec![PinConfiguration {
                id: PinId(5),
                direction: PinDirection::Input,
                enabled: true,
            }],
        })
        .unwrap();

    let closed = f.recorder.wait_closed().await;
    assert!(closed.cause.unwrap().contains("violation"));
    assert_eq!(closed.abandoned.len(), 1);
    assert_eq!(closed.abandoned[0].id, id);

    f.session.close().await.unwrap();
    assert_eq!(f.session.state(), SessionState::Failed);
    assert_eq!(f.device.open_channels(), 0);
    assert!(f.events.is_empty());
}

#[tokio::test]
async fn test_response_to_unknown_request_ends_session() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    f.device
        .deliver(GpioMessage::Acknowledged {
            id: RequestId::new(99),
        })
        .unwrap();

    let closed = f.recorder.wait_closed().await;
    assert!(closed.cause.unwrap().contains("no request in flight"));
    f.session.close().await.unwrap();
    assert_eq!(f.session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_state_changes_jump_the_queue() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    let id = f.session.request_reset_pin_configuration().unwrap();
    next_request(&f.device).await;
    f.device.deliver(GpioMessage::Acknowledged { id }).unwrap();
    f.device.deliver(GpioMessage::KeepAlive).unwrap();
    f.device.deliver(GpioMessage::StateChanged(input(3))).unwrap();

    let deadline = Instant::now() + Duration::from_millis(TIMEOUT_MS);
    while f.events.len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        f.events.take(0).await.unwrap(),
        GpioEvent::StateChanged(input(3))
    );
    assert_eq!(
        f.events.take(0).await.unwrap(),
        GpioEvent::Acknowledged { request: id }
    );
    assert!(f.events.is_empty());

    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_close_reports_transport_cause() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();
    f.recorder.wait_opened().await;

    f.device
        .close_remotely(Some(TransportError::ConnectionLost("board reset".into())))
        .unwrap();

    let closed = f.recorder.wait_closed().await;
    assert!(closed.cause.unwrap().contains("board reset"));
    assert_eq!(f.session.state(), SessionState::Failed);
    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_clean_remote_close_has_no_cause() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();
    f.recorder.wait_opened().await;

    f.device.close_remotely(None).unwrap();

    let closed = f.recorder.wait_closed().await;
    assert!(closed.cause.is_none());
    assert_eq!(f.session.state(), SessionState::Closed);
    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_receive_failure_ends_session_and_closes_channel() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    f.device
        .fail(TransportError::Codec("truncated frame".into()))
        .unwrap();

    let closed = f.recorder.wait_closed().await;
    assert!(closed.cause.unwrap().contains("truncated frame"));
    assert_eq!(f.session.state(), SessionState::Failed);
    assert_eq!(f.device.open_channels(), 0);

    assert!(matches!(
        f.session.request_reset_pin_configuration(),
        Err(Error::InvalidState(_))
    ));
    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_send_ends_session_with_requests_abandoned() {
    let Fixture {
        session,
        device,
        recorder,
        ..
    } = fixture();
    session.open(&Handle::current()).await.unwrap();
    drop(device);

    let first = session.request_reset_pin_configuration().unwrap();
    let second = session.request_reset_pin_configuration().unwrap();

    let closed = recorder.wait_closed().await;
    let abandoned: Vec<_> = closed.abandoned.iter().map(|pending| pending.id).collect();
    assert_eq!(abandoned, vec![first, second]);
    assert!(closed.cause.unwrap().contains("Connection lost"));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.executing_request().is_none());
    assert!(session.pending_requests().is_empty());

    session.close().await.unwrap();
    assert_eq!(recorder.closed().len(), 1);
}

#[tokio::test]
async fn test_failed_send_of_queued_request_during_open_ends_session() {
    let Fixture {
        session,
        device,
        recorder,
        ..
    } = fixture();
    let queued = session.request_pin_state(PinScope::All, PinScope::None).unwrap();
    drop(device);

    session.open(&Handle::current()).await.unwrap();

    let closed = recorder.wait_closed().await;
    assert_eq!(closed.abandoned.len(), 1);
    assert_eq!(closed.abandoned[0].id, queued);
    assert!(closed.cause.is_some());
    assert_eq!(recorder.opened_count(), 1);
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_open_times_out_on_unresponsive_transport() {
    let f = fixture();
    f.device.set_responsive(false);

    let err = f.session.open(&Handle::current()).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(err.to_string().contains(&TIMEOUT_MS.to_string()));
    assert_eq!(f.session.state(), SessionState::Failed);
    assert_eq!(f.recorder.opened_count(), 0);
    assert!(f.recorder.closed().is_empty());
    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_open_fails_when_refused() {
    let f = fixture();
    f.device.set_refusing(true);

    let err = f.session.open(&Handle::current()).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Transport(TransportError::ConnectionRefused { .. })
    ));
    assert_eq!(f.session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_open_twice_is_rejected() {
    let f = fixture();
    f.session.open(&Handle::current()).await.unwrap();

    assert!(matches!(
        f.session.open(&Handle::current()).await,
        Err(Error::InvalidState(_))
    ));

    f.session.close().await.unwrap();
    assert!(matches!(
        f.session.open(&Handle::current()).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_close_before_open_only_drops_requests() {
    let f = fixture();
    f.session.request_reset_pin_configuration().unwrap();

    f.session.close().await.unwrap();

    assert_eq!(f.session.state(), SessionState::Created);
    assert!(f.session.pending_requests().is_empty());
    assert!(f.recorder.closed().is_empty());

    f.session.open(&Handle::current()).await.unwrap();
    assert_eq!(f.session.state(), SessionState::Running);
    f.session.close().await.unwrap();
}

#[tokio::test]
async fn test_removed_listener_is_not_called() {
    let f = fixture();
    let listener: Arc<dyn SessionListener<GpioRequest>> = f.recorder.clone();
    assert!(f.session.remove_listener(&listener));
    assert!(!f.session.remove_listener(&listener));

    f.session.open(&Handle::current()).await.unwrap();
    f.session.close().await.unwrap();

    assert_eq!(f.recorder.opened_count(), 0);
    assert!(f.recorder.closed().is_empty());
}
