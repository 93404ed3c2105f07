//! Characteristic operations, timeouts and notifications on a ready session

mod common;

use common::*;
use gattlink_core::gatt::uuids;
use gattlink_core::{
    CharacteristicId, ConnectionState, DisconnectRequest, GattStatus, LinkHandle,
    NotificationMode, NotificationRequest, OperationKind, OperationOptions, RadioEvent,
    SessionError, WriteRequest, WriteType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::sleep;

#[derive(Default)]
struct Outcomes {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Outcomes {
    fn options(self: &Arc<Self>) -> OperationOptions {
        let (s, f) = (self.clone(), self.clone());
        OperationOptions::new()
            .on_success(move || {
                s.succeeded.fetch_add(1, Ordering::SeqCst);
            })
            .on_failure(move || {
                f.failed.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

#[tokio::test(start_paused = true)]
async fn test_read_delivers_value() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let outcomes = Arc::new(Outcomes::default());

    session
        .read(battery_level(), outcomes.options())
        .expect("read");
    settle().await;
    assert_eq!(radio.calls().last(), Some(&Call::Read(battery_level())));
    assert_eq!(
        session.pending_operation(),
        Some(OperationKind::CharacteristicRead)
    );

    sleep(ms(40)).await;
    radio.emit(RadioEvent::CharacteristicRead {
        characteristic: battery_level(),
        status: GattStatus::SUCCESS,
        value: vec![87],
    });
    settle().await;

    let reads: Vec<_> = listener
        .seen()
        .into_iter()
        .filter(|s| matches!(s, Seen::Read { .. }))
        .collect();
    match reads.as_slice() {
        [Seen::Read {
            characteristic,
            value,
            success,
            elapsed,
        }] => {
            assert_eq!(*characteristic, battery_level());
            assert_eq!(value, &vec![87]);
            assert!(*success);
            assert!(*elapsed >= ms(40));
        }
        other => panic!("unexpected reads: {:?}", other),
    }
    assert_eq!(outcomes.succeeded(), 1);
    assert_eq!(outcomes.failed(), 0);
    assert_eq!(session.pending_operation(), None);
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(radio.disconnects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_status_disconnects() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session
        .read(battery_level(), OperationOptions::new())
        .expect("read");
    settle().await;
    radio.emit(RadioEvent::CharacteristicRead {
        characteristic: battery_level(),
        status: GattStatus(5),
        value: vec![1, 2, 3],
    });
    settle().await;

    assert_eq!(
        listener.count(|s| matches!(s, Seen::Read { success: false, value, .. } if value.is_empty())),
        1
    );
    assert_eq!(radio.disconnects(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_write_rejected_by_radio_fails_immediately_and_disconnects() {
    let radio = FakeRadio::new();
    radio.reject("write");
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let outcomes = Arc::new(Outcomes::default());

    session
        .write(WriteRequest::text(device_name(), "kitchen").options(outcomes.options()))
        .expect("write");
    settle().await;

    assert!(radio.calls().contains(&Call::Write(
        device_name(),
        b"kitchen".to_vec(),
        None
    )));
    let writes: Vec<_> = listener
        .seen()
        .into_iter()
        .filter(|s| matches!(s, Seen::Write { .. }))
        .collect();
    assert_eq!(
        writes,
        vec![Seen::Write {
            characteristic: device_name(),
            success: false,
            elapsed: ms(0),
        }]
    );
    assert_eq!(outcomes.failed(), 1);
    assert_eq!(radio.calls().last(), Some(&Call::Disconnect(LinkHandle(1))));
    assert_eq!(session.state(), ConnectionState::Disconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_write_passes_type_and_payload() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session
        .write(WriteRequest::u32_le(battery_level(), 0x0102_0304).write_type(WriteType::WithoutResponse))
        .expect("write");
    settle().await;
    assert_eq!(
        radio.calls().last(),
        Some(&Call::Write(
            battery_level(),
            vec![0x04, 0x03, 0x02, 0x01],
            Some(WriteType::WithoutResponse)
        ))
    );

    radio.emit(RadioEvent::CharacteristicWrite {
        characteristic: battery_level(),
        status: GattStatus::SUCCESS,
    });
    settle().await;
    assert_eq!(
        listener.count(|s| matches!(s, Seen::Write { success: true, .. })),
        1
    );
    assert_eq!(radio.disconnects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_completion_for_other_characteristic_is_ignored() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session
        .read(battery_level(), OperationOptions::new())
        .expect("read");
    settle().await;
    radio.emit(RadioEvent::CharacteristicRead {
        characteristic: device_name(),
        status: GattStatus::SUCCESS,
        value: b"name".to_vec(),
    });
    settle().await;

    assert_eq!(listener.count(|s| matches!(s, Seen::Read { .. })), 0);
    assert_eq!(
        session.pending_operation(),
        Some(OperationKind::CharacteristicRead)
    );
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_disconnects() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let outcomes = Arc::new(Outcomes::default());

    session
        .read(battery_level(), outcomes.options())
        .expect("read");
    settle().await;
    sleep(ms(4_900)).await;
    assert_eq!(listener.count(|s| matches!(s, Seen::Timeout { .. })), 0);

    sleep(ms(200)).await;
    assert_eq!(
        listener.count(|s| *s
            == Seen::Timeout {
                kind: OperationKind::CharacteristicRead,
                timeout: ms(5_000),
            }),
        1
    );
    assert_eq!(outcomes.failed(), 1);
    assert_eq!(radio.disconnects(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_listener_can_stay_connected_after_timeout() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    listener
        .stay_connected_on_timeout
        .store(true, Ordering::SeqCst);
    connect_ready(&session, &radio).await;

    session
        .read_rssi(OperationOptions::new().with_timeout(ms(1_000)))
        .expect("rssi");
    settle().await;
    sleep(ms(1_100)).await;

    assert_eq!(
        listener.count(|s| *s
            == Seen::Timeout {
                kind: OperationKind::ReadRemoteRssi,
                timeout: ms(1_000),
            }),
        1
    );
    assert_eq!(radio.disconnects(), 0);
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(session.pending_operation(), None);

    // A late reply finds nothing to complete
    radio.emit(RadioEvent::RssiRead {
        rssi: -70,
        status: GattStatus::SUCCESS,
    });
    settle().await;
    assert_eq!(listener.count(|s| matches!(s, Seen::Rssi { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_operation_supersedes_pending_one() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let superseded = Arc::new(Outcomes::default());

    session
        .read(battery_level(), superseded.options())
        .expect("read");
    session.read_rssi(OperationOptions::new()).expect("rssi");
    settle().await;
    assert_eq!(superseded.failed(), 1);
    assert_eq!(session.pending_operation(), Some(OperationKind::ReadRemoteRssi));

    radio.emit(RadioEvent::CharacteristicRead {
        characteristic: battery_level(),
        status: GattStatus::SUCCESS,
        value: vec![50],
    });
    radio.emit(RadioEvent::RssiRead {
        rssi: -60,
        status: GattStatus::SUCCESS,
    });
    settle().await;

    assert_eq!(listener.count(|s| matches!(s, Seen::Read { .. })), 0);
    assert_eq!(
        listener.count(|s| *s
            == Seen::Rssi {
                rssi: -60,
                success: true,
            }),
        1
    );
    assert_eq!(radio.disconnects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_characteristic_fails_without_radio_call() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let missing = CharacteristicId::new(uuids::BATTERY_SERVICE, uuids::MODEL_NUMBER);

    session.read(missing, OperationOptions::new()).expect("read");
    settle().await;

    assert_eq!(radio.count(|c| matches!(c, Call::Read(_))), 0);
    assert_eq!(
        listener.count(|s| matches!(s, Seen::Read { success: false, .. })),
        1
    );
    assert_eq!(radio.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_notification_writes_descriptor() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session
        .set_notification(NotificationRequest::new(
            battery_level(),
            NotificationMode::Notify,
        ))
        .expect("notify");
    settle().await;

    let calls = radio.calls();
    assert_eq!(
        calls[calls.len() - 2..].to_vec(),
        vec![
            Call::SetNotification(battery_level(), true),
            Call::WriteDescriptor(
                battery_level(),
                uuids::CLIENT_CHARACTERISTIC_CONFIG,
                vec![0x01, 0x00]
            ),
        ]
    );
    assert_eq!(
        listener.count(|s| matches!(s, Seen::SetNotification { .. })),
        0
    );

    // Writes to other descriptors do not complete the request
    radio.emit(RadioEvent::DescriptorWrite {
        characteristic: battery_level(),
        descriptor: uuids::from_short(0x2901),
        status: GattStatus::SUCCESS,
    });
    settle().await;
    assert_eq!(
        session.pending_operation(),
        Some(OperationKind::CharacteristicSetNotification)
    );

    radio.emit(RadioEvent::DescriptorWrite {
        characteristic: battery_level(),
        descriptor: uuids::CLIENT_CHARACTERISTIC_CONFIG,
        status: GattStatus::SUCCESS,
    });
    settle().await;
    assert_eq!(
        listener.seen().last(),
        Some(&Seen::SetNotification {
            characteristic: battery_level(),
            success: true,
        })
    );
    assert_eq!(session.pending_operation(), None);
}

#[tokio::test(start_paused = true)]
async fn test_disable_indications_writes_zero_descriptor() {
    let radio = FakeRadio::new();
    let (session, _listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session
        .set_notification(NotificationRequest::new(
            battery_level(),
            NotificationMode::Disable,
        ))
        .expect("disable");
    settle().await;

    assert!(radio
        .calls()
        .contains(&Call::SetNotification(battery_level(), false)));
    assert!(radio.calls().contains(&Call::WriteDescriptor(
        battery_level(),
        uuids::CLIENT_CHARACTERISTIC_CONFIG,
        vec![0x00, 0x00]
    )));
}

#[tokio::test(start_paused = true)]
async fn test_local_only_notification_completes_at_once() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let outcomes = Arc::new(Outcomes::default());

    session
        .set_notification(
            NotificationRequest::new(battery_level(), NotificationMode::Indicate)
                .local_only()
                .options(outcomes.options()),
        )
        .expect("indicate");
    settle().await;

    assert_eq!(
        radio.count(|c| matches!(c, Call::WriteDescriptor(..))),
        0
    );
    assert_eq!(outcomes.succeeded(), 1);
    assert_eq!(
        listener.count(|s| matches!(s, Seen::SetNotification { success: true, .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_notifications_reach_listeners() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    radio.emit(RadioEvent::CharacteristicChanged {
        characteristic: battery_level(),
        value: vec![42],
    });
    radio.emit(RadioEvent::CharacteristicChanged {
        characteristic: battery_level(),
        value: vec![41],
    });
    settle().await;

    let changes: Vec<_> = listener
        .seen()
        .into_iter()
        .filter_map(|s| match s {
            Seen::Changed { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![vec![42], vec![41]]);
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_listener_can_request_disconnect() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    listener.disconnect_after_read.store(true, Ordering::SeqCst);
    connect_ready(&session, &radio).await;

    session
        .read(battery_level(), OperationOptions::new())
        .expect("read");
    settle().await;
    radio.emit(RadioEvent::CharacteristicRead {
        characteristic: battery_level(),
        status: GattStatus::SUCCESS,
        value: vec![99],
    });
    settle().await;

    assert_eq!(
        listener.count(|s| matches!(s, Seen::Read { success: true, .. })),
        1
    );
    assert_eq!(radio.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rssi_rejected_by_radio() {
    let radio = FakeRadio::new();
    radio.reject("read_rssi");
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session.read_rssi(OperationOptions::new()).expect("rssi");
    settle().await;

    assert_eq!(
        listener.count(|s| *s
            == Seen::Rssi {
                rssi: 0,
                success: false,
            }),
        1
    );
    assert_eq!(radio.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_refreshes_services() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session
        .discover_services(OperationOptions::new())
        .expect("discover");
    settle().await;
    assert_eq!(session.state(), ConnectionState::DiscoveringServices);

    let fewer = vec![services()[1].clone()];
    radio.emit(RadioEvent::ServicesDiscovered {
        status: GattStatus::SUCCESS,
        services: fewer.clone(),
    });
    settle().await;

    assert_eq!(session.services(), fewer);
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(
        listener.seen().last(),
        Some(&Seen::ServicesDiscovered {
            count: 1,
            success: true,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_requests_need_a_connection() {
    let radio = FakeRadio::new();
    let (session, _listener) = session_with(&radio);

    assert_eq!(
        session.read(battery_level(), OperationOptions::new()),
        Err(SessionError::NotConnected)
    );
    assert_eq!(
        session.write(WriteRequest::new(battery_level(), vec![1])),
        Err(SessionError::NotConnected)
    );
    assert!(radio.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_requests_rejected_while_disconnecting() {
    let radio = FakeRadio::new();
    let (session, _listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    session.disconnect(DisconnectRequest::new()).expect("disconnect");
    settle().await;

    assert_eq!(
        session.read_rssi(OperationOptions::new()),
        Err(SessionError::Disconnecting)
    );
    assert_eq!(
        session.set_notification(NotificationRequest::new(
            battery_level(),
            NotificationMode::Notify
        )),
        Err(SessionError::Disconnecting)
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_operation_timeout_rejected() {
    let radio = FakeRadio::new();
    let (session, _listener) = session_with(&radio);
    connect_ready(&session, &radio).await;

    let result = session.read(
        battery_level(),
        OperationOptions::new().with_timeout(ms(0)),
    );
    assert!(matches!(result, Err(SessionError::InvalidRequest(_))));
    settle().await;
    assert_eq!(radio.count(|c| matches!(c, Call::Read(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_operation() {
    let radio = FakeRadio::new();
    let (session, listener) = session_with(&radio);
    connect_ready(&session, &radio).await;
    let outcomes = Arc::new(Outcomes::default());

    session
        .read(battery_level(), outcomes.options())
        .expect("read");
    settle().await;
    session.disconnect(DisconnectRequest::new()).expect("disconnect");
    settle().await;

    assert_eq!(outcomes.failed(), 1);
    assert_eq!(session.pending_operation(), None);

    // The cancelled read never times out
    sleep(ms(6_000)).await;
    assert_eq!(listener.count(|s| matches!(s, Seen::Timeout { .. })), 0);
}
