// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod common;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use rialto_ipc::{pipe, Channel, ClientController, ClientHandle, Server, MAX_MESSAGE_SIZE};

/// A server/channel pair joined by a socketpair, with the calculator
/// service exported to the client.
fn connected_pair() -> (Server, Arc<Calculator>, Channel, ClientHandle) {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Server::with_monitor_allowed(false).unwrap();
    let (server_end, client_end) = pipe::pipe().unwrap();

    let calculator = Arc::new(Calculator::default());
    let handle = server.add_client(&server_end, None).unwrap();
    handle.export_service(calculator.clone());

    let channel = Channel::from_socket(client_end).unwrap();
    (server, calculator, channel, handle)
}

#[test]
fn square_call_round_trip() {
    let (server, _calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let result: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

    let slot = result.clone();
    channel.call_method(
        &SQUARE,
        controller.clone(),
        &SquareRequest { x: 7 },
        Box::new(SquareResponse::default()),
        Box::new(move |response| {
            let response = response.as_any().downcast_ref::<SquareResponse>().unwrap();
            *slot.lock().unwrap() = Some(response.y);
        }),
    );

    assert!(pump(&server, &channel, Duration::from_secs(2), || result
        .lock()
        .unwrap()
        .is_some()));

    assert!(!controller.failed(), "{}", controller.error_text());
    assert_eq!(result.lock().unwrap().unwrap(), 49);
}

#[test]
fn replies_correlate_by_serial() {
    let (server, _calc, channel, _client) = connected_pair();

    let results: Arc<Mutex<Vec<(i32, i32)>>> = Arc::new(Mutex::new(Vec::new()));

    for x in 1..=5 {
        let slot = results.clone();
        channel.call_method(
            &SQUARE,
            Arc::new(ClientController::new()),
            &SquareRequest { x },
            Box::new(SquareResponse::default()),
            Box::new(move |response| {
                let response = response.as_any().downcast_ref::<SquareResponse>().unwrap();
                slot.lock().unwrap().push((x, response.y));
            }),
        );
    }

    assert!(pump(&server, &channel, Duration::from_secs(2), || results
        .lock()
        .unwrap()
        .len()
        == 5));

    for (x, y) in results.lock().unwrap().iter() {
        assert_eq!(*y, x * x);
    }
}

#[test]
fn fd_transfer_round_trip() {
    let (server, _calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let received: Arc<Mutex<Option<(RawFd, u32)>>> = Arc::new(Mutex::new(None));

    let slot = received.clone();
    channel.call_method(
        &OPEN_BLOB,
        controller.clone(),
        &EmptyMessage,
        Box::new(BlobResponse::default()),
        Box::new(move |response| {
            let response = response.as_any().downcast_ref::<BlobResponse>().unwrap();
            *slot.lock().unwrap() = Some((response.fd.expect("fd field unset"), response.size));
        }),
    );

    assert!(pump(&server, &channel, Duration::from_secs(2), || received
        .lock()
        .unwrap()
        .is_some()));
    assert!(!controller.failed(), "{}", controller.error_text());

    let (raw, size) = received.lock().unwrap().take().unwrap();
    assert_eq!(size, 3);

    // the received fd is a live dup of the server's memfd
    // SAFETY: ownership of the spliced fd passed to the completion, and from
    // there to this test.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: st is a plain out-buffer.
    assert_eq!(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) }, 0);
    assert_eq!(st.st_size, 3);

    let mut contents = [0_u8; 3];
    nix::sys::uio::pread(&fd, &mut contents, 0).unwrap();
    assert_eq!(&contents, b"abc");
}

#[test]
fn no_reply_method_completes_locally() {
    let (server, calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let completions = Arc::new(AtomicU32::new(0));

    let counter = completions.clone();
    channel.call_method(
        &POKE,
        controller.clone(),
        &EmptyMessage,
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // completion runs before any reply could possibly arrive
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(!controller.failed());

    assert!(pump(&server, &channel, Duration::from_secs(2), || calc
        .pokes
        .load(Ordering::SeqCst)
        == 1));

    // and it stays completed exactly once
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[test]
fn unanswered_call_times_out() {
    let (server, _calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let done = Arc::new(AtomicU32::new(0));

    let flag = done.clone();
    channel.call_method(
        &SLEEP_FOREVER,
        controller.clone(),
        &SquareRequest { x: 1 },
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // default per-call timeout is 3 seconds
    assert!(pump(&server, &channel, Duration::from_secs(5), || done
        .load(Ordering::SeqCst)
        == 1));

    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Timed out");
    assert!(channel.is_connected());
}

#[test]
fn unknown_service_and_method_fail_remotely() {
    let (server, _calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let done = Arc::new(AtomicU32::new(0));

    let flag = done.clone();
    channel.call_method(
        &rialto_ipc::MethodDescriptor::new("test.Nowhere", "square"),
        controller.clone(),
        &SquareRequest { x: 1 },
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(pump(&server, &channel, Duration::from_secs(2), || done
        .load(Ordering::SeqCst)
        == 1));
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Unknown service 'test.Nowhere'");

    let controller = Arc::new(ClientController::new());
    let flag = done.clone();
    channel.call_method(
        &rialto_ipc::MethodDescriptor::new(CALC_SERVICE, "cube"),
        controller.clone(),
        &SquareRequest { x: 1 },
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(pump(&server, &channel, Duration::from_secs(2), || done
        .load(Ordering::SeqCst)
        == 2));
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Unknown method 'cube'");
}

#[test]
fn oversized_call_fails_locally() {
    let (_server, _calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let done = Arc::new(AtomicU32::new(0));

    let flag = done.clone();
    channel.call_method(
        &SQUARE,
        controller.clone(),
        &BigRequest {
            data: vec![0; MAX_MESSAGE_SIZE + 1],
        },
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // rejected before anything touches the socket
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Method call too big");
}

#[test]
fn events_reach_all_handlers_in_subscription_order() {
    let (server, _calc, channel, client) = connected_pair();

    let seen: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));

    let slot = seen.clone();
    let first = channel.subscribe::<TickEvent, _>(move |event| {
        slot.lock().unwrap().push((1, event.seq));
    });
    let slot = seen.clone();
    let _second = channel.subscribe::<TickEvent, _>(move |event| {
        slot.lock().unwrap().push((2, event.seq));
    });

    assert!(client.send_event(&mut TickEvent { seq: 5 }));
    assert!(pump(&server, &channel, Duration::from_secs(2), || seen
        .lock()
        .unwrap()
        .len()
        == 2));
    assert_eq!(*seen.lock().unwrap(), vec![(1, 5), (2, 5)]);

    // unsubscribing the first handler leaves only the second
    assert!(channel.unsubscribe(first));
    assert!(client.send_event(&mut TickEvent { seq: 6 }));
    assert!(pump(&server, &channel, Duration::from_secs(2), || seen
        .lock()
        .unwrap()
        .len()
        == 3));
    assert_eq!(seen.lock().unwrap().last().unwrap(), &(2, 6));
}

#[test]
fn disconnect_is_idempotent() {
    let (_server, _calc, channel, _client) = connected_pair();

    assert!(channel.is_connected());
    channel.disconnect();
    assert!(!channel.is_connected());
    channel.disconnect();
    assert!(!channel.is_connected());

    // calls after disconnect fail locally
    let controller = Arc::new(ClientController::new());
    let done = Arc::new(AtomicU32::new(0));
    let flag = done.clone();
    channel.call_method(
        &SQUARE,
        controller.clone(),
        &SquareRequest { x: 2 },
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Not connected");
}

#[test]
fn channel_drop_fails_outstanding_calls() {
    let (server, _calc, channel, _client) = connected_pair();

    let controller = Arc::new(ClientController::new());
    let done = Arc::new(AtomicU32::new(0));

    let flag = done.clone();
    channel.call_method(
        &SLEEP_FOREVER,
        controller.clone(),
        &SquareRequest { x: 1 },
        Box::new(SquareResponse::default()),
        Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // let the call reach the server, then tear the channel down
    pump(&server, &channel, Duration::from_millis(50), || false);
    drop(channel);

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Channel destructed");
}

#[test]
fn server_side_disconnect_reaches_the_channel() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Server::with_monitor_allowed(false).unwrap();
    let (server_end, client_end) = pipe::pipe().unwrap();

    let dropped = Arc::new(AtomicU32::new(0));
    let flag = dropped.clone();
    let handle = server
        .add_client(
            &server_end,
            Some(Arc::new(move |_client: &rialto_ipc::ClientHandle| {
                flag.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    drop(server_end);

    let channel = Channel::from_socket(client_end).unwrap();

    handle.disconnect();
    assert!(pump(&server, &channel, Duration::from_secs(2), || {
        !channel.is_connected()
    }));

    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert!(!handle.is_connected());
}

#[test]
fn truncated_datagram_is_discarded_and_connection_survives() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Server::with_monitor_allowed(false).unwrap();
    let (server_end, client_end) = pipe::pipe().unwrap();

    let calculator = Arc::new(Calculator::default());
    let handle = server.add_client(&server_end, None).unwrap();
    handle.export_service(calculator);
    drop(server_end);

    // shove an over-limit datagram straight onto the socket, bypassing the
    // channel's own size check
    let junk = vec![0_u8; MAX_MESSAGE_SIZE + 1];
    // SAFETY: plain send on a fd owned by this test.
    let rc = unsafe {
        libc::send(
            client_end.as_raw_fd(),
            junk.as_ptr() as *const libc::c_void,
            junk.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    assert_eq!(rc as usize, junk.len());

    let channel = Channel::from_socket(client_end).unwrap();

    // the server drops the truncated message and keeps serving
    let controller = Arc::new(ClientController::new());
    let result: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    let slot = result.clone();
    channel.call_method(
        &SQUARE,
        controller.clone(),
        &SquareRequest { x: 3 },
        Box::new(SquareResponse::default()),
        Box::new(move |response| {
            let response = response.as_any().downcast_ref::<SquareResponse>().unwrap();
            *slot.lock().unwrap() = Some(response.y);
        }),
    );

    assert!(pump(&server, &channel, Duration::from_secs(2), || result
        .lock()
        .unwrap()
        .is_some()));
    assert!(!controller.failed(), "{}", controller.error_text());
    assert_eq!(result.lock().unwrap().unwrap(), 9);
}
