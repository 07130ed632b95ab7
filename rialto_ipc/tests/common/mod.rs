// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// A small calculator-style service used to exercise both endpoints from a
// single test process. Not every test uses every piece.
#![allow(dead_code)]

use std::any::Any;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rialto_ipc::wire::{self, DeserializeError};
use rialto_ipc::{
    Channel, IpcMessage, IpcService, MethodDescriptor, PendingReply, Server, ServerController,
};

pub const CALC_SERVICE: &str = "test.Calculator";

pub const SQUARE: MethodDescriptor = MethodDescriptor::new(CALC_SERVICE, "square");
pub const POKE: MethodDescriptor = MethodDescriptor::one_way(CALC_SERVICE, "poke");
pub const OPEN_BLOB: MethodDescriptor = MethodDescriptor::new(CALC_SERVICE, "openBlob");
pub const SLEEP_FOREVER: MethodDescriptor = MethodDescriptor::new(CALC_SERVICE, "sleepForever");

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SquareRequest {
    pub x: i32,
}

impl IpcMessage for SquareRequest {
    fn type_name(&self) -> &'static str {
        "test.SquareRequest"
    }

    fn serialize_alloc(&self) -> Vec<u8> {
        self.x.to_be_bytes().to_vec()
    }

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        wire::get_i32(&mut self.x, input)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SquareResponse {
    pub y: i32,
}

impl IpcMessage for SquareResponse {
    fn type_name(&self) -> &'static str {
        "test.SquareResponse"
    }

    fn serialize_alloc(&self) -> Vec<u8> {
        self.y.to_be_bytes().to_vec()
    }

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        wire::get_i32(&mut self.y, input)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Request with no fields at all.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EmptyMessage;

impl IpcMessage for EmptyMessage {
    fn type_name(&self) -> &'static str {
        "test.EmptyMessage"
    }

    fn serialize_alloc(&self) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(&mut self, _input: &mut &[u8]) -> Result<(), DeserializeError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Response whose `fd` field is transferred as a real file descriptor.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlobResponse {
    pub fd: Option<RawFd>,
    pub size: u32,
}

impl IpcMessage for BlobResponse {
    fn type_name(&self) -> &'static str {
        "test.BlobResponse"
    }

    fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self.fd {
            Some(fd) => {
                buf.extend_from_slice(&1_u32.to_be_bytes());
                buf.extend_from_slice(&fd.to_be_bytes());
            }
            None => buf.extend_from_slice(&0_u32.to_be_bytes()),
        }
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf
    }

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        let mut present = 0_u32;
        wire::get_u32(&mut present, input)?;
        self.fd = if present != 0 {
            let mut fd = 0_i32;
            wire::get_i32(&mut fd, input)?;
            Some(fd)
        } else {
            None
        };
        wire::get_u32(&mut self.size, input)?;
        Ok(())
    }

    fn fd_fields(&self) -> Vec<RawFd> {
        self.fd.into_iter().collect()
    }

    fn fd_fields_mut(&mut self) -> Vec<&mut RawFd> {
        self.fd.as_mut().into_iter().collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Event payload used by the subscription tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickEvent {
    pub seq: u32,
}

impl IpcMessage for TickEvent {
    fn type_name(&self) -> &'static str {
        "test.TickEvent"
    }

    fn serialize_alloc(&self) -> Vec<u8> {
        self.seq.to_be_bytes().to_vec()
    }

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        wire::get_u32(&mut self.seq, input)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opaque payload of caller-chosen size, for the message-size boundary.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BigRequest {
    pub data: Vec<u8>,
}

impl IpcMessage for BigRequest {
    fn type_name(&self) -> &'static str {
        "test.BigRequest"
    }

    fn serialize_alloc(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        let (bytes, rest) = input.split_at(input.len());
        self.data = bytes.to_vec();
        *input = rest;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The test service: squares integers, counts pokes, hands out memfds, and
/// parks calls forever so timeouts can be observed.
#[derive(Default)]
pub struct Calculator {
    pub pokes: AtomicU32,
    parked: Mutex<Vec<(ServerController, Box<dyn IpcMessage>, PendingReply)>>,
}

impl IpcService for Calculator {
    fn name(&self) -> &'static str {
        CALC_SERVICE
    }

    fn methods(&self) -> &[MethodDescriptor] {
        &[SQUARE, POKE, OPEN_BLOB, SLEEP_FOREVER]
    }

    fn new_request(&self, method: &MethodDescriptor) -> Box<dyn IpcMessage> {
        match method.name {
            "square" | "sleepForever" => Box::new(SquareRequest::default()),
            _ => Box::new(EmptyMessage),
        }
    }

    fn new_response(&self, method: &MethodDescriptor) -> Box<dyn IpcMessage> {
        match method.name {
            "openBlob" => Box::new(BlobResponse::default()),
            _ => Box::new(SquareResponse::default()),
        }
    }

    fn call_method(
        &self,
        method: &MethodDescriptor,
        mut controller: ServerController,
        request: Box<dyn IpcMessage>,
        mut response: Box<dyn IpcMessage>,
        reply: PendingReply,
    ) {
        match method.name {
            "square" => {
                let request = request.as_any().downcast_ref::<SquareRequest>().unwrap();
                let resp = response.as_any_mut().downcast_mut::<SquareResponse>().unwrap();
                resp.y = request.x * request.x;
                reply.complete(controller, response);
            }
            "poke" => {
                self.pokes.fetch_add(1, Ordering::SeqCst);
            }
            "openBlob" => {
                let blob = new_memfd_with(b"abc");
                let resp = response.as_any_mut().downcast_mut::<BlobResponse>().unwrap();
                resp.size = 3;
                resp.fd = Some(blob.as_raw_fd());
                reply.complete(controller, response);
                // our copy closes here; the client received its own dup
                drop(blob);
            }
            "sleepForever" => {
                self.parked
                    .lock()
                    .unwrap()
                    .push((controller, response, reply));
            }
            other => {
                controller.set_failed(format!("no handler for {other}"));
                reply.complete(controller, response);
            }
        }
    }
}

/// An anonymous in-memory file holding `contents`, offset left at EOF.
pub fn new_memfd_with(contents: &[u8]) -> OwnedFd {
    // SAFETY: memfd_create returns a fresh fd that we immediately own.
    let raw = unsafe { libc::memfd_create(c"test-blob".as_ptr(), libc::MFD_CLOEXEC) };
    assert!(raw >= 0, "memfd_create failed");
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    nix::unistd::write(&fd, contents).unwrap();
    fd
}

/// Tick both reactors until `done` reports true or `timeout` elapses.
pub fn pump(
    server: &Server,
    channel: &Channel,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        server.process();
        channel.process();
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
