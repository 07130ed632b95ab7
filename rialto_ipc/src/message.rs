// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::any::Any;
use std::os::fd::RawFd;

use crate::wire::DeserializeError;

/// A service payload the runtime can carry without knowing its schema.
///
/// The runtime needs four things from a message: a wire name (events are
/// dispatched by it), a byte codec, and a view of the fields that hold file
/// descriptors. Fd-carrying fields are modeled as `Option<RawFd>`: a `Some`
/// field is "present and set" and takes part in fd transfer, a `None` field
/// does not. Both fd accessors must report the same fields in declaration
/// order, because that order pairs them with the ancillary fd array.
///
/// Messages with no fd fields leave the defaults in place.
pub trait IpcMessage: Any + Send {
    /// Fully qualified wire name, e.g. `"rialto.PlaybackStateEvent"`.
    fn type_name(&self) -> &'static str;

    fn serialize_alloc(&self) -> Vec<u8>;

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError>;

    /// Raw values of every fd field that is present and set.
    fn fd_fields(&self) -> Vec<RawFd> {
        Vec::new()
    }

    /// Mutable slots for the same fields, in the same order. Used to splice
    /// received fds into a parsed message and to scrub outgoing replies.
    fn fd_fields_mut(&mut self) -> Vec<&mut RawFd> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Identifies one callable method of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Full name of the owning service, carried in every Call envelope.
    pub service_name: &'static str,
    pub name: &'static str,
    /// One-way method: the server never produces a Reply envelope and the
    /// client completes the call as soon as the datagram is sent.
    pub no_reply: bool,
}

impl MethodDescriptor {
    pub const fn new(service_name: &'static str, name: &'static str) -> Self {
        Self {
            service_name,
            name,
            no_reply: false,
        }
    }

    pub const fn one_way(service_name: &'static str, name: &'static str) -> Self {
        Self {
            service_name,
            name,
            no_reply: true,
        }
    }
}
