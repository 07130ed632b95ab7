// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Envelope codec. Each datagram carries exactly one envelope: a
//! [`MessageToServer`] on the way in, a [`MessageFromServer`] on the way
//! out. Integers are big-endian fixed width; strings and opaques are a u32
//! length followed by the raw bytes, padded to a 4-byte boundary. The body
//! carried inside an envelope is an opaque serialized service message whose
//! schema this module never inspects.

use std::fmt;

/// Returned when a buffer does not decode as the expected type. The inbound
/// paths treat this as "drop the message", never as fatal.
#[derive(Debug, PartialEq, Eq)]
pub struct DeserializeError;

impl std::error::Error for DeserializeError {}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid input to deserialize method")
    }
}

pub fn get_i32(dst: &mut i32, input: &mut &[u8]) -> Result<(), DeserializeError> {
    if input.len() < 4 {
        return Err(DeserializeError);
    }
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<i32>());
    *input = rest;
    *dst = i32::from_be_bytes(int_bytes.try_into().unwrap());
    Ok(())
}

pub fn get_u32(dst: &mut u32, input: &mut &[u8]) -> Result<(), DeserializeError> {
    if input.len() < 4 {
        return Err(DeserializeError);
    }
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    *dst = u32::from_be_bytes(int_bytes.try_into().unwrap());
    Ok(())
}

pub fn get_u64(dst: &mut u64, input: &mut &[u8]) -> Result<(), DeserializeError> {
    if input.len() < 8 {
        return Err(DeserializeError);
    }
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    *dst = u64::from_be_bytes(int_bytes.try_into().unwrap());
    Ok(())
}

pub fn get_bool(dst: &mut bool, input: &mut &[u8]) -> Result<(), DeserializeError> {
    let mut word = 0_u32;
    get_u32(&mut word, input)?;
    *dst = word != 0;
    Ok(())
}

/// Opaque byte array: u32 length, bytes, zero padding to a 4-byte boundary.
/// The length and padding are bounds-checked: the input arrives off the
/// socket and cannot be trusted to be well formed.
pub fn get_opaque(dst: &mut Vec<u8>, input: &mut &[u8]) -> Result<(), DeserializeError> {
    let mut len = 0_u32;
    get_u32(&mut len, input)?;

    let len = len as usize;
    let padded = len + ((4 - len % 4) % 4);
    if input.len() < padded {
        return Err(DeserializeError);
    }

    let (bytes, rest) = input.split_at(padded);
    *input = rest;
    dst.clear();
    dst.extend_from_slice(&bytes[..len]);
    Ok(())
}

pub fn get_string(dst: &mut String, input: &mut &[u8]) -> Result<(), DeserializeError> {
    let mut bytes = Vec::new();
    get_opaque(&mut bytes, input)?;
    *dst = String::from_utf8(bytes).map_err(|_| DeserializeError)?;
    Ok(())
}

pub fn put_opaque(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    let padding = (4 - bytes.len() % 4) % 4;
    buf.extend_from_slice(&[0_u8; 3][..padding]);
}

pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_opaque(buf, s.as_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, b: bool) {
    buf.extend_from_slice(&u32::from(b).to_be_bytes());
}

/// A method call as it travels to the server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MethodCall {
    /// Unique within the channel lifetime; assigned monotonically from 1.
    pub serial_id: u64,
    pub service_name: String,
    pub method_name: String,
    /// Serialized request message.
    pub body: Vec<u8>,
}

impl MethodCall {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.serial_id.to_be_bytes());
        put_string(&mut buf, &self.service_name);
        put_string(&mut buf, &self.method_name);
        put_opaque(&mut buf, &self.body);
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        get_u64(&mut self.serial_id, input)?;
        get_string(&mut self.service_name, input)?;
        get_string(&mut self.method_name, input)?;
        get_opaque(&mut self.body, input)?;
        Ok(())
    }
}

/// A successful reply. `reply_id` echoes the call's serial.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MethodCallReply {
    pub reply_id: u64,
    pub body: Vec<u8>,
}

impl MethodCallReply {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.reply_id.to_be_bytes());
        put_opaque(&mut buf, &self.body);
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        get_u64(&mut self.reply_id, input)?;
        get_opaque(&mut self.body, input)?;
        Ok(())
    }
}

/// A failed reply carrying a human-readable reason.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MethodCallError {
    pub reply_id: u64,
    pub reason: String,
}

impl MethodCallError {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.reply_id.to_be_bytes());
        put_string(&mut buf, &self.reason);
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        get_u64(&mut self.reply_id, input)?;
        get_string(&mut self.reason, input)?;
        Ok(())
    }
}

/// An asynchronous event, dispatched on the client by message type name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventFromServer {
    pub name: String,
    pub body: Vec<u8>,
}

impl EventFromServer {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, &self.name);
        put_opaque(&mut buf, &self.body);
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        get_string(&mut self.name, input)?;
        get_opaque(&mut self.body, input)?;
        Ok(())
    }
}

const TO_SERVER_CALL: u32 = 1;
const TO_SERVER_MONITOR_REGISTER: u32 = 2;

/// Everything a client may send. The monitor registration carries no fields;
/// its tap socket rides in the ancillary data of the same datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageToServer {
    Call(MethodCall),
    MonitorRegister,
}

impl Default for MessageToServer {
    fn default() -> Self {
        Self::Call(MethodCall::default())
    }
}

impl MessageToServer {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Call(call) => {
                buf.extend_from_slice(&TO_SERVER_CALL.to_be_bytes());
                buf.extend_from_slice(&call.serialize_alloc());
            }
            Self::MonitorRegister => {
                buf.extend_from_slice(&TO_SERVER_MONITOR_REGISTER.to_be_bytes());
            }
        }
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        let mut discriminant = 0_u32;
        get_u32(&mut discriminant, input)?;
        match discriminant {
            TO_SERVER_CALL => {
                let mut call = MethodCall::default();
                call.deserialize(input)?;
                *self = Self::Call(call);
            }
            TO_SERVER_MONITOR_REGISTER => *self = Self::MonitorRegister,
            _ => return Err(DeserializeError),
        }
        Ok(())
    }
}

const FROM_SERVER_REPLY: u32 = 1;
const FROM_SERVER_ERROR: u32 = 2;
const FROM_SERVER_EVENT: u32 = 3;

/// Everything a server may send back on a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFromServer {
    Reply(MethodCallReply),
    Error(MethodCallError),
    Event(EventFromServer),
}

impl Default for MessageFromServer {
    fn default() -> Self {
        Self::Reply(MethodCallReply::default())
    }
}

impl MessageFromServer {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Reply(reply) => {
                buf.extend_from_slice(&FROM_SERVER_REPLY.to_be_bytes());
                buf.extend_from_slice(&reply.serialize_alloc());
            }
            Self::Error(error) => {
                buf.extend_from_slice(&FROM_SERVER_ERROR.to_be_bytes());
                buf.extend_from_slice(&error.serialize_alloc());
            }
            Self::Event(event) => {
                buf.extend_from_slice(&FROM_SERVER_EVENT.to_be_bytes());
                buf.extend_from_slice(&event.serialize_alloc());
            }
        }
        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        let mut discriminant = 0_u32;
        get_u32(&mut discriminant, input)?;
        match discriminant {
            FROM_SERVER_REPLY => {
                let mut reply = MethodCallReply::default();
                reply.deserialize(input)?;
                *self = Self::Reply(reply);
            }
            FROM_SERVER_ERROR => {
                let mut error = MethodCallError::default();
                error.deserialize(input)?;
                *self = Self::Error(error);
            }
            FROM_SERVER_EVENT => {
                let mut event = EventFromServer::default();
                event.deserialize(input)?;
                *self = Self::Event(event);
            }
            _ => return Err(DeserializeError),
        }
        Ok(())
    }
}
