//! Agent protocol codec.
//!
//! The subset of the Stream Processing Offload Protocol the agent
//! needs: HELLO/DISCONNECT control frames, NOTIFY carrying named
//! messages with typed arguments, and ACK carrying variable-setting
//! actions. Frames arrive length-prefixed (u32, big-endian); inside a
//! frame all integers use the protocol's compact varint.

use bytes::{Buf, BufMut, BytesMut};
use connect_core::{Error, Result};

/// Largest frame either side may send; announced during HELLO.
pub const MAX_FRAME_SIZE: u32 = 16384;

/// Protocol version the agent speaks.
pub const VERSION: &str = "2.0";

const TYPE_HAPROXY_HELLO: u8 = 1;
const TYPE_HAPROXY_DISCONNECT: u8 = 2;
const TYPE_NOTIFY: u8 = 3;
const TYPE_AGENT_HELLO: u8 = 101;
const TYPE_AGENT_DISCONNECT: u8 = 102;
const TYPE_ACK: u8 = 103;

/// FIN flag; fragmentation is not supported, so it is always set.
const FLAG_FIN: u32 = 0x1;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Connection opening, from the proxy.
    HaproxyHello {
        /// Versions the proxy supports.
        supported_versions: String,
        /// Largest frame the proxy accepts.
        max_frame_size: u32,
        /// Whether this connection is only a health check.
        healthcheck: bool,
    },
    /// Connection opening reply, from the agent.
    AgentHello {
        /// Version selected by the agent.
        version: String,
        /// Largest frame the agent accepts.
        max_frame_size: u32,
        /// Advertised capabilities (none are used).
        capabilities: String,
    },
    /// Orderly close, from the proxy.
    HaproxyDisconnect {
        /// Numeric status.
        status_code: u32,
        /// Human-readable reason.
        message: String,
    },
    /// Orderly close reply, from the agent.
    AgentDisconnect {
        /// Numeric status.
        status_code: u32,
        /// Human-readable reason.
        message: String,
    },
    /// Event notification carrying messages to process.
    Notify {
        /// Stream the events belong to.
        stream_id: u64,
        /// Frame sequence within the stream.
        frame_id: u64,
        /// Messages, in order.
        messages: Vec<Message>,
    },
    /// Notification reply carrying actions.
    Ack {
        /// Mirrored from the NOTIFY.
        stream_id: u64,
        /// Mirrored from the NOTIFY.
        frame_id: u64,
        /// Actions for the proxy to apply.
        actions: Vec<Action>,
    },
}

/// A named message with typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message name (e.g. `check-intentions`).
    pub name: String,
    /// Arguments in declaration order.
    pub args: Vec<(String, TypedData)>,
}

impl Message {
    /// Look up an argument by name.
    pub fn arg(&self, name: &str) -> Option<&TypedData> {
        self.args
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Variable scopes for set/unset actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    /// Process-wide.
    Process,
    /// Per-session (what the reject rule reads).
    Session,
    /// Per-transaction.
    Transaction,
    /// Per-request.
    Request,
    /// Per-response.
    Response,
}

impl VarScope {
    fn to_byte(self) -> u8 {
        match self {
            Self::Process => 0,
            Self::Session => 1,
            Self::Transaction => 2,
            Self::Request => 3,
            Self::Response => 4,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Process,
            1 => Self::Session,
            2 => Self::Transaction,
            3 => Self::Request,
            4 => Self::Response,
            other => {
                return Err(Error::Protocol {
                    reason: format!("unknown variable scope {other}"),
                })
            }
        })
    }
}

/// An action the agent asks the proxy to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Set a variable.
    SetVar {
        /// Variable scope.
        scope: VarScope,
        /// Variable name (without the engine prefix).
        name: String,
        /// Value.
        value: TypedData,
    },
    /// Clear a variable.
    UnsetVar {
        /// Variable scope.
        scope: VarScope,
        /// Variable name.
        name: String,
    },
}

/// A typed protocol value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedData {
    /// Absent value.
    Null,
    /// Boolean, packed into the type byte.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    Uint32(u32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    Uint64(u64),
    /// IPv4 address (the `ip=src` argument).
    Ipv4(std::net::Ipv4Addr),
    /// IPv6 address.
    Ipv6(std::net::Ipv6Addr),
    /// Text.
    String(String),
    /// Raw bytes (e.g. a DER certificate).
    Binary(Vec<u8>),
}

const DATA_TYPE_NULL: u8 = 0;
const DATA_TYPE_BOOL: u8 = 1;
const DATA_TYPE_INT32: u8 = 2;
const DATA_TYPE_UINT32: u8 = 3;
const DATA_TYPE_INT64: u8 = 4;
const DATA_TYPE_UINT64: u8 = 5;
const DATA_TYPE_IPV4: u8 = 6;
const DATA_TYPE_IPV6: u8 = 7;
const DATA_TYPE_STRING: u8 = 8;
const DATA_TYPE_BINARY: u8 = 9;
const DATA_FLAG_TRUE: u8 = 0x10;

/// Encode a frame into its on-wire payload (without the length prefix).
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    match frame {
        Frame::HaproxyHello {
            supported_versions,
            max_frame_size,
            healthcheck,
        } => {
            put_header(&mut buf, TYPE_HAPROXY_HELLO, 0, 0);
            put_kv(&mut buf, "supported-versions", &TypedData::String(supported_versions.clone()));
            put_kv(&mut buf, "max-frame-size", &TypedData::Uint32(*max_frame_size));
            put_kv(&mut buf, "capabilities", &TypedData::String(String::new()));
            if *healthcheck {
                put_kv(&mut buf, "healthcheck", &TypedData::Bool(true));
            }
        }
        Frame::AgentHello {
            version,
            max_frame_size,
            capabilities,
        } => {
            put_header(&mut buf, TYPE_AGENT_HELLO, 0, 0);
            put_kv(&mut buf, "version", &TypedData::String(version.clone()));
            put_kv(&mut buf, "max-frame-size", &TypedData::Uint32(*max_frame_size));
            put_kv(&mut buf, "capabilities", &TypedData::String(capabilities.clone()));
        }
        Frame::HaproxyDisconnect {
            status_code,
            message,
        } => {
            put_header(&mut buf, TYPE_HAPROXY_DISCONNECT, 0, 0);
            put_kv(&mut buf, "status-code", &TypedData::Uint32(*status_code));
            put_kv(&mut buf, "message", &TypedData::String(message.clone()));
        }
        Frame::AgentDisconnect {
            status_code,
            message,
        } => {
            put_header(&mut buf, TYPE_AGENT_DISCONNECT, 0, 0);
            put_kv(&mut buf, "status-code", &TypedData::Uint32(*status_code));
            put_kv(&mut buf, "message", &TypedData::String(message.clone()));
        }
        Frame::Notify {
            stream_id,
            frame_id,
            messages,
        } => {
            put_header(&mut buf, TYPE_NOTIFY, *stream_id, *frame_id);
            for message in messages {
                put_string(&mut buf, &message.name);
                buf.put_u8(message.args.len() as u8);
                for (key, value) in &message.args {
                    put_string(&mut buf, key);
                    put_typed(&mut buf, value);
                }
            }
        }
        Frame::Ack {
            stream_id,
            frame_id,
            actions,
        } => {
            put_header(&mut buf, TYPE_ACK, *stream_id, *frame_id);
            for action in actions {
                match action {
                    Action::SetVar { scope, name, value } => {
                        buf.put_u8(1);
                        buf.put_u8(3); // nb-args
                        buf.put_u8(scope.to_byte());
                        put_string(&mut buf, name);
                        put_typed(&mut buf, value);
                    }
                    Action::UnsetVar { scope, name } => {
                        buf.put_u8(2);
                        buf.put_u8(2); // nb-args
                        buf.put_u8(scope.to_byte());
                        put_string(&mut buf, name);
                    }
                }
            }
        }
    }
    buf.to_vec()
}

/// Decode one frame payload.
pub fn decode_frame(payload: &[u8]) -> Result<Frame> {
    let mut buf = payload;
    let frame_type = get_u8(&mut buf)?;
    let _flags = get_u32(&mut buf)?;
    let stream_id = get_varint(&mut buf)?;
    let frame_id = get_varint(&mut buf)?;

    match frame_type {
        TYPE_HAPROXY_HELLO => {
            let kvs = get_kv_list(&mut buf)?;
            Ok(Frame::HaproxyHello {
                supported_versions: kv_string(&kvs, "supported-versions"),
                max_frame_size: kv_uint(&kvs, "max-frame-size").unwrap_or(MAX_FRAME_SIZE),
                healthcheck: matches!(
                    kvs.iter().find(|(k, _)| k == "healthcheck"),
                    Some((_, TypedData::Bool(true)))
                ),
            })
        }
        TYPE_AGENT_HELLO => {
            let kvs = get_kv_list(&mut buf)?;
            Ok(Frame::AgentHello {
                version: kv_string(&kvs, "version"),
                max_frame_size: kv_uint(&kvs, "max-frame-size").unwrap_or(MAX_FRAME_SIZE),
                capabilities: kv_string(&kvs, "capabilities"),
            })
        }
        TYPE_HAPROXY_DISCONNECT | TYPE_AGENT_DISCONNECT => {
            let kvs = get_kv_list(&mut buf)?;
            let status_code = kv_uint(&kvs, "status-code").unwrap_or(0);
            let message = kv_string(&kvs, "message");
            if frame_type == TYPE_HAPROXY_DISCONNECT {
                Ok(Frame::HaproxyDisconnect {
                    status_code,
                    message,
                })
            } else {
                Ok(Frame::AgentDisconnect {
                    status_code,
                    message,
                })
            }
        }
        TYPE_NOTIFY => {
            let mut messages = Vec::new();
            while !buf.is_empty() {
                let name = get_string(&mut buf)?;
                let nb_args = get_u8(&mut buf)?;
                let mut args = Vec::with_capacity(nb_args as usize);
                for _ in 0..nb_args {
                    let key = get_string(&mut buf)?;
                    let value = get_typed(&mut buf)?;
                    args.push((key, value));
                }
                messages.push(Message { name, args });
            }
            Ok(Frame::Notify {
                stream_id,
                frame_id,
                messages,
            })
        }
        TYPE_ACK => {
            let mut actions = Vec::new();
            while !buf.is_empty() {
                let action_type = get_u8(&mut buf)?;
                let _nb_args = get_u8(&mut buf)?;
                let scope = VarScope::from_byte(get_u8(&mut buf)?)?;
                let name = get_string(&mut buf)?;
                match action_type {
                    1 => {
                        let value = get_typed(&mut buf)?;
                        actions.push(Action::SetVar { scope, name, value });
                    }
                    2 => actions.push(Action::UnsetVar { scope, name }),
                    other => {
                        return Err(Error::Protocol {
                            reason: format!("unknown action type {other}"),
                        })
                    }
                }
            }
            Ok(Frame::Ack {
                stream_id,
                frame_id,
                actions,
            })
        }
        other => Err(Error::Protocol {
            reason: format!("unknown frame type {other}"),
        }),
    }
}

fn put_header(buf: &mut BytesMut, frame_type: u8, stream_id: u64, frame_id: u64) {
    buf.put_u8(frame_type);
    buf.put_u32(FLAG_FIN);
    put_varint(buf, stream_id);
    put_varint(buf, frame_id);
}

fn put_kv(buf: &mut BytesMut, key: &str, value: &TypedData) {
    put_string(buf, key);
    put_typed(buf, value);
}

fn put_typed(buf: &mut BytesMut, value: &TypedData) {
    match value {
        TypedData::Null => buf.put_u8(DATA_TYPE_NULL),
        TypedData::Bool(b) => {
            buf.put_u8(DATA_TYPE_BOOL | if *b { DATA_FLAG_TRUE } else { 0 })
        }
        TypedData::Int32(v) => {
            buf.put_u8(DATA_TYPE_INT32);
            put_varint(buf, *v as i64 as u64);
        }
        TypedData::Uint32(v) => {
            buf.put_u8(DATA_TYPE_UINT32);
            put_varint(buf, u64::from(*v));
        }
        TypedData::Int64(v) => {
            buf.put_u8(DATA_TYPE_INT64);
            put_varint(buf, *v as u64);
        }
        TypedData::Uint64(v) => {
            buf.put_u8(DATA_TYPE_UINT64);
            put_varint(buf, *v);
        }
        TypedData::Ipv4(addr) => {
            buf.put_u8(DATA_TYPE_IPV4);
            buf.put_slice(&addr.octets());
        }
        TypedData::Ipv6(addr) => {
            buf.put_u8(DATA_TYPE_IPV6);
            buf.put_slice(&addr.octets());
        }
        TypedData::String(s) => {
            buf.put_u8(DATA_TYPE_STRING);
            put_string(buf, s);
        }
        TypedData::Binary(b) => {
            buf.put_u8(DATA_TYPE_BINARY);
            put_varint(buf, b.len() as u64);
            buf.put_slice(b);
        }
    }
}

fn get_typed(buf: &mut &[u8]) -> Result<TypedData> {
    let type_byte = get_u8(buf)?;
    match type_byte & 0x0F {
        DATA_TYPE_NULL => Ok(TypedData::Null),
        DATA_TYPE_BOOL => Ok(TypedData::Bool(type_byte & DATA_FLAG_TRUE != 0)),
        DATA_TYPE_INT32 => Ok(TypedData::Int32(get_varint(buf)? as i64 as i32)),
        DATA_TYPE_UINT32 => Ok(TypedData::Uint32(get_varint(buf)? as u32)),
        DATA_TYPE_INT64 => Ok(TypedData::Int64(get_varint(buf)? as i64)),
        DATA_TYPE_UINT64 => Ok(TypedData::Uint64(get_varint(buf)?)),
        DATA_TYPE_IPV4 => {
            let octets: [u8; 4] = take(buf, 4)?.try_into().expect("length checked");
            Ok(TypedData::Ipv4(octets.into()))
        }
        DATA_TYPE_IPV6 => {
            let octets: [u8; 16] = take(buf, 16)?.try_into().expect("length checked");
            Ok(TypedData::Ipv6(octets.into()))
        }
        DATA_TYPE_STRING => Ok(TypedData::String(get_string(buf)?)),
        DATA_TYPE_BINARY => {
            let len = get_varint(buf)? as usize;
            let bytes = take(buf, len)?;
            Ok(TypedData::Binary(bytes.to_vec()))
        }
        other => Err(Error::Protocol {
            reason: format!("unknown data type {other}"),
        }),
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    let len = get_varint(buf)? as usize;
    let bytes = take(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Protocol {
        reason: "invalid utf-8 in string".to_string(),
    })
}

fn get_kv_list(buf: &mut &[u8]) -> Result<Vec<(String, TypedData)>> {
    let mut kvs = Vec::new();
    while !buf.is_empty() {
        let key = get_string(buf)?;
        let value = get_typed(buf)?;
        kvs.push((key, value));
    }
    Ok(kvs)
}

fn kv_string(kvs: &[(String, TypedData)], key: &str) -> String {
    match kvs.iter().find(|(k, _)| k == key) {
        Some((_, TypedData::String(s))) => s.clone(),
        _ => String::new(),
    }
}

fn kv_uint(kvs: &[(String, TypedData)], key: &str) -> Option<u32> {
    match kvs.iter().find(|(k, _)| k == key) {
        Some((_, TypedData::Uint32(v))) => Some(*v),
        Some((_, TypedData::Uint64(v))) => Some(*v as u32),
        Some((_, TypedData::Int32(v))) if *v >= 0 => Some(*v as u32),
        Some((_, TypedData::Int64(v))) if *v >= 0 => Some(*v as u32),
        _ => None,
    }
}

/// Protocol varint: one byte below 240, then a 4-bit tail with
/// 7-bit continuations, each offset-compensated.
fn put_varint(buf: &mut BytesMut, mut value: u64) {
    if value < 240 {
        buf.put_u8(value as u8);
        return;
    }
    buf.put_u8((value as u8) | 0xF0);
    value = (value - 240) >> 4;
    while value >= 128 {
        buf.put_u8((value as u8) | 0x80);
        value = (value - 128) >> 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Result<u64> {
    let first = get_u8(buf)?;
    let mut value = u64::from(first);
    if value < 240 {
        return Ok(value);
    }
    let mut shift = 4;
    loop {
        // A valid 64-bit value never needs a shift beyond 60.
        if shift > 60 {
            return Err(Error::Protocol {
                reason: "varint too long".to_string(),
            });
        }
        let byte = get_u8(buf)?;
        value = value.wrapping_add(u64::from(byte) << shift);
        shift += 7;
        if byte < 128 {
            return Ok(value);
        }
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(truncated());
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn truncated() -> Error {
    Error::Protocol {
        reason: "truncated frame".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        let values = [
            0u64,
            1,
            239,
            240,
            241,
            2287,
            2288,
            16384,
            1 << 20,
            1 << 32,
            u64::MAX >> 1,
        ];
        for value in values {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            let mut slice: &[u8] = &buf;
            assert_eq!(get_varint(&mut slice).expect("decode"), value, "{value}");
            assert!(slice.is_empty(), "{value} left trailing bytes");
        }
    }

    #[test]
    fn varint_small_values_are_one_byte() {
        for value in [0u64, 100, 239] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), 1);
        }
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 240);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn typed_data_roundtrip() {
        let values = [
            TypedData::Null,
            TypedData::Bool(true),
            TypedData::Bool(false),
            TypedData::Int32(-42),
            TypedData::Uint32(7),
            TypedData::Int64(-1),
            TypedData::Uint64(1 << 40),
            TypedData::Ipv4(std::net::Ipv4Addr::new(10, 0, 0, 1)),
            TypedData::Ipv6(std::net::Ipv6Addr::LOCALHOST),
            TypedData::String("spiffe://dc1/svc/web".to_string()),
            TypedData::Binary(vec![0x30, 0x82, 0x01, 0x00]),
        ];
        for value in values {
            let mut buf = BytesMut::new();
            put_typed(&mut buf, &value);
            let mut slice: &[u8] = &buf;
            assert_eq!(get_typed(&mut slice).expect("decode"), value);
        }
    }

    #[test]
    fn hello_frame_roundtrip() {
        let frame = Frame::HaproxyHello {
            supported_versions: "2.0".to_string(),
            max_frame_size: 16384,
            healthcheck: true,
        };
        let encoded = encode_frame(&frame);
        assert_eq!(decode_frame(&encoded).expect("decode"), frame);
    }

    #[test]
    fn notify_ack_roundtrip() {
        let notify = Frame::Notify {
            stream_id: 3,
            frame_id: 7,
            messages: vec![Message {
                name: "check-intentions".to_string(),
                args: vec![
                    ("ip".to_string(), TypedData::String("10.0.0.1".to_string())),
                    ("cert".to_string(), TypedData::Binary(vec![1, 2, 3])),
                ],
            }],
        };
        let decoded = decode_frame(&encode_frame(&notify)).expect("decode");
        assert_eq!(decoded, notify);

        let ack = Frame::Ack {
            stream_id: 3,
            frame_id: 7,
            actions: vec![
                Action::SetVar {
                    scope: VarScope::Session,
                    name: "auth".to_string(),
                    value: TypedData::Int32(1),
                },
                Action::SetVar {
                    scope: VarScope::Session,
                    name: "source_app".to_string(),
                    value: TypedData::String("web".to_string()),
                },
            ],
        };
        assert_eq!(decode_frame(&encode_frame(&ack)).expect("decode"), ack);
    }

    #[test]
    fn truncated_frames_error_out() {
        let frame = Frame::Notify {
            stream_id: 1,
            frame_id: 1,
            messages: vec![Message {
                name: "check-intentions".to_string(),
                args: vec![("cert".to_string(), TypedData::Binary(vec![1; 64]))],
            }],
        };
        let encoded = encode_frame(&frame);
        for len in [0, 1, 5, encoded.len() - 1] {
            assert!(decode_frame(&encoded[..len]).is_err(), "len {len}");
        }
    }
}
