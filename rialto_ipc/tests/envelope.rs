// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use rialto_ipc::server::monitor::{MonitorClientDetails, MonitorEvent, MonitorMessage};
use rialto_ipc::wire::*;

#[test]
fn envelope_call() {
    let msg = MessageToServer::Call(MethodCall {
        serial_id: 17,
        service_name: "rialto.MediaPipeline".to_string(),
        method_name: "load".to_string(),
        body: vec![1, 2, 3, 4, 5],
    });

    let bytes = msg.serialize_alloc();
    let mut after = MessageToServer::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn envelope_monitor_register() {
    let msg = MessageToServer::MonitorRegister;

    let bytes = msg.serialize_alloc();
    let mut after = MessageToServer::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn envelope_reply() {
    let msg = MessageFromServer::Reply(MethodCallReply {
        reply_id: u64::MAX,
        body: vec![0; 13],
    });

    let bytes = msg.serialize_alloc();
    let mut after = MessageFromServer::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn envelope_error() {
    let msg = MessageFromServer::Error(MethodCallError {
        reply_id: 3,
        reason: "Unknown method 'frobnicate'".to_string(),
    });

    let bytes = msg.serialize_alloc();
    let mut after = MessageFromServer::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn envelope_event() {
    let msg = MessageFromServer::Event(EventFromServer {
        name: "rialto.PlaybackStateEvent".to_string(),
        body: b"state".to_vec(),
    });

    let bytes = msg.serialize_alloc();
    let mut after = MessageFromServer::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn envelope_with_empty_body_and_names() {
    let msg = MessageToServer::Call(MethodCall::default());

    let bytes = msg.serialize_alloc();
    let mut after = MessageToServer::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn unknown_discriminant_is_rejected() {
    let bytes = 99_u32.to_be_bytes();
    let mut msg = MessageToServer::default();
    assert!(msg.deserialize(&mut bytes.as_slice()).is_err());

    let mut msg = MessageFromServer::default();
    assert!(msg.deserialize(&mut bytes.as_slice()).is_err());
}

#[test]
fn short_envelope_is_rejected() {
    let msg = MessageToServer::Call(MethodCall {
        serial_id: 1,
        service_name: "svc".to_string(),
        method_name: "m".to_string(),
        body: vec![7; 32],
    });

    let bytes = msg.serialize_alloc();
    for cut in [1, 4, 9, bytes.len() - 1] {
        let mut after = MessageToServer::default();
        assert!(
            after.deserialize(&mut &bytes[..cut]).is_err(),
            "truncation at {cut} must not decode"
        );
    }
}

#[test]
fn monitor_roster_round_trip() {
    let msg = MonitorMessage {
        timestamp_real: 1_700_000_000_000_000,
        timestamp_mono: 123_456,
        event: MonitorEvent::CurrentClients(vec![
            (
                10_000,
                MonitorClientDetails {
                    pid: 4321,
                    uid: 0,
                    gid: 7,
                    socket_path: "/tmp/rialto-0".to_string(),
                },
            ),
            (10_001, MonitorClientDetails::default()),
        ]),
    };

    let bytes = msg.serialize_alloc();
    let mut after = MonitorMessage::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn monitor_call_round_trip() {
    let msg = MonitorMessage {
        timestamp_real: 1,
        timestamp_mono: 2,
        event: MonitorEvent::Call {
            client_id: 10_000,
            no_reply: true,
            call: MethodCall {
                serial_id: 9,
                service_name: "svc".to_string(),
                method_name: "fire".to_string(),
                body: vec![1, 2, 3],
            },
        },
    };

    let bytes = msg.serialize_alloc();
    let mut after = MonitorMessage::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn monitor_reply_error_event_round_trips() {
    for event in [
        MonitorEvent::Reply {
            target_client_id: 10_002,
            reply: MethodCallReply {
                reply_id: 5,
                body: vec![9; 7],
            },
        },
        MonitorEvent::Error {
            target_client_id: 10_003,
            error: MethodCallError {
                reply_id: 6,
                reason: "Timed out".to_string(),
            },
        },
        MonitorEvent::Event {
            target_client_id: 10_004,
            event: EventFromServer {
                name: "rialto.Tick".to_string(),
                body: vec![],
            },
        },
        MonitorEvent::ClientDisconnected { client_id: 10_005 },
    ] {
        let msg = MonitorMessage {
            timestamp_real: 10,
            timestamp_mono: 20,
            event,
        };

        let bytes = msg.serialize_alloc();
        let mut after = MonitorMessage::default();
        after.deserialize(&mut bytes.as_slice()).unwrap();

        assert_eq!(msg, after);
    }
}
