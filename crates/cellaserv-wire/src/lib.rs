// Wire protocol for the cellaserv broker: length-prefixed protobuf messages.
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message as _;

mod codec;

pub use codec::{read_frame, read_message, write_frame};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame too large: {length} bytes (cap {cap})")]
    FrameTooLarge { length: usize, cap: usize },
    #[error("truncated frame")]
    Truncated,
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Envelope carried in every frame: a tag plus the tag-specific payload blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub content: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Register = 1,
    Request = 2,
    Reply = 3,
    Subscribe = 4,
    Publish = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Register {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub identification: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub service_name: String,
    #[prost(string, tag = "3")]
    pub service_identification: String,
    #[prost(string, tag = "4")]
    pub method: String,
    #[prost(bytes = "bytes", tag = "5")]
    pub data: Bytes,
}

/// Reply to a request. Exactly one of `data` and `error` is present.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub data: Option<Bytes>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<reply::Error>,
}

pub mod reply {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Error {
        #[prost(enumeration = "ErrorType", tag = "1")]
        pub r#type: i32,
        #[prost(string, tag = "2")]
        pub what: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ErrorType {
        Timeout = 1,
        NoSuchService = 2,
        Custom = 3,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscribe {
    #[prost(string, tag = "1")]
    pub event: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Publish {
    #[prost(string, tag = "1")]
    pub event: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

/// Decoded view of a message, one variant per tag.
#[derive(Debug, Clone)]
pub enum Payload {
    Register(Register),
    Request(Request),
    Reply(Reply),
    Subscribe(Subscribe),
    Publish(Publish),
}

/// Decode the tag-specific payload of an envelope.
///
/// ```
/// use cellaserv_wire::{decode_payload, Message, MessageType, Payload, Subscribe};
/// use prost::Message as _;
///
/// let sub = Subscribe { event: "match.start".into() };
/// let msg = Message {
///     r#type: MessageType::Subscribe as i32,
///     content: sub.encode_to_vec().into(),
/// };
/// match decode_payload(&msg).expect("payload") {
///     Payload::Subscribe(decoded) => assert_eq!(decoded.event, "match.start"),
///     other => panic!("unexpected payload: {other:?}"),
/// }
/// ```
pub fn decode_payload(message: &Message) -> Result<Payload> {
    let r#type = MessageType::try_from(message.r#type)
        .map_err(|_| Error::UnknownMessageType(message.r#type))?;
    let payload = match r#type {
        MessageType::Register => Payload::Register(Register::decode(message.content.clone())?),
        MessageType::Request => Payload::Request(Request::decode(message.content.clone())?),
        MessageType::Reply => Payload::Reply(Reply::decode(message.content.clone())?),
        MessageType::Subscribe => Payload::Subscribe(Subscribe::decode(message.content.clone())?),
        MessageType::Publish => Payload::Publish(Publish::decode(message.content.clone())?),
    };
    Ok(payload)
}

// Build a complete frame (length prefix included) for a typed payload.
fn frame_payload<M: prost::Message>(r#type: MessageType, payload: &M) -> Bytes {
    let message = Message {
        r#type: r#type as i32,
        content: payload.encode_to_vec().into(),
    };
    frame_raw(&message.encode_to_vec())
}

/// Wrap already-encoded envelope bytes in a length prefix. Used by the
/// broker's forwarding paths to resend a message without re-encoding it.
pub fn frame_raw(message_bytes: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + message_bytes.len());
    buf.put_u32(message_bytes.len() as u32);
    buf.extend_from_slice(message_bytes);
    buf.freeze()
}

pub fn encode_register(register: &Register) -> Bytes {
    frame_payload(MessageType::Register, register)
}

pub fn encode_request(request: &Request) -> Bytes {
    frame_payload(MessageType::Request, request)
}

pub fn encode_reply(reply: &Reply) -> Bytes {
    frame_payload(MessageType::Reply, reply)
}

pub fn encode_subscribe(subscribe: &Subscribe) -> Bytes {
    frame_payload(MessageType::Subscribe, subscribe)
}

pub fn encode_publish(publish: &Publish) -> Bytes {
    frame_payload(MessageType::Publish, publish)
}

impl Reply {
    /// Successful reply carrying opaque result bytes.
    pub fn ok(id: u64, data: Bytes) -> Self {
        Self {
            id,
            data: Some(data),
            error: None,
        }
    }

    /// Error reply of the given kind.
    pub fn error(id: u64, r#type: reply::ErrorType, what: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: Some(reply::Error {
                r#type: r#type as i32,
                what: what.into(),
            }),
        }
    }
}
