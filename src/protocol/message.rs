//! Typed RTMP messages
//!
//! Decodes assembled chunk-stream messages into the control, command, data,
//! and media variants the ingest path cares about, and builds the AMF0
//! responses a publisher expects (`_result`, `onStatus`, protocol control).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use super::chunk::RawMessage;
use crate::amf::{self, AmfValue};
use crate::error::{AmfError, Error};

/// A decoded RTMP message
#[derive(Debug, Clone)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort(u32),
    Ack(u32),
    UserControl(Bytes),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
    Command {
        name: String,
        transaction_id: f64,
        object: AmfValue,
        args: Vec<AmfValue>,
    },
    Data(Vec<AmfValue>),
    Audio { timestamp: u32, payload: Bytes },
    Video { timestamp: u32, payload: Bytes },
    Unknown { type_id: u8 },
}

impl RtmpMessage {
    /// Decode an assembled message. Unknown types decode to
    /// [`RtmpMessage::Unknown`] rather than failing the connection.
    pub fn decode(raw: RawMessage) -> Result<Self, Error> {
        let mut payload = raw.payload;
        let message = match raw.type_id {
            MSG_SET_CHUNK_SIZE => RtmpMessage::SetChunkSize(read_u32(&mut payload)?),
            MSG_ABORT => RtmpMessage::Abort(read_u32(&mut payload)?),
            MSG_ACK => RtmpMessage::Ack(read_u32(&mut payload)?),
            MSG_USER_CONTROL => RtmpMessage::UserControl(payload),
            MSG_WINDOW_ACK_SIZE => RtmpMessage::WindowAckSize(read_u32(&mut payload)?),
            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32(&mut payload)?;
                let limit_type = if payload.has_remaining() { payload.get_u8() } else { 2 };
                RtmpMessage::SetPeerBandwidth { size, limit_type }
            }
            MSG_COMMAND_AMF0 => decode_command(&mut payload)?,
            MSG_DATA_AMF0 => RtmpMessage::Data(amf::decode_all(&mut payload)?),
            // AMF3 command/data payloads start with a format selector byte
            // and then fall back to AMF0 encoding in practice
            MSG_COMMAND_AMF3 => {
                if payload.has_remaining() {
                    payload.advance(1);
                }
                decode_command(&mut payload)?
            }
            MSG_DATA_AMF3 => {
                if payload.has_remaining() {
                    payload.advance(1);
                }
                RtmpMessage::Data(amf::decode_all(&mut payload)?)
            }
            MSG_AUDIO => RtmpMessage::Audio {
                timestamp: raw.timestamp,
                payload,
            },
            MSG_VIDEO => RtmpMessage::Video {
                timestamp: raw.timestamp,
                payload,
            },
            other => RtmpMessage::Unknown { type_id: other },
        };
        Ok(message)
    }
}

fn decode_command(payload: &mut Bytes) -> Result<RtmpMessage, Error> {
    let mut values = amf::decode_all(payload)?;
    if values.is_empty() {
        return Err(AmfError::UnexpectedEof.into());
    }

    let mut rest = values.split_off(1);
    let name = match values.into_iter().next() {
        Some(AmfValue::String(s)) => s,
        _ => return Err(AmfError::UnexpectedEof.into()),
    };

    let transaction_id = if !rest.is_empty() {
        rest.remove(0).as_number().unwrap_or(0.0)
    } else {
        0.0
    };
    let object = if !rest.is_empty() {
        rest.remove(0)
    } else {
        AmfValue::Null
    };

    Ok(RtmpMessage::Command {
        name,
        transaction_id,
        object,
        args: rest,
    })
}

fn read_u32(payload: &mut Bytes) -> Result<u32, Error> {
    if payload.remaining() < 4 {
        return Err(AmfError::UnexpectedEof.into());
    }
    Ok(payload.get_u32())
}

/// Parameters extracted from the `connect` command
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub app: String,
    pub tc_url: Option<String>,
    pub flash_ver: Option<String>,
}

impl ConnectParams {
    pub fn from_object(object: &AmfValue) -> Self {
        Self {
            app: object.get_str("app").unwrap_or_default().to_string(),
            tc_url: object.get_str("tcUrl").map(str::to_string),
            flash_ver: object.get_str("flashVer").map(str::to_string),
        }
    }
}

/// Parameters extracted from the `publish` command
#[derive(Debug, Clone)]
pub struct PublishParams {
    /// Publishing name with any query tail stripped
    pub stream_key: String,
    /// Value of the `token` query parameter, when present
    pub token: Option<String>,
    /// `live`, `record`, or `append`; only `live` is accepted
    pub publish_type: String,
}

impl PublishParams {
    /// Split `streamKey?token=...` into its parts.
    pub fn parse(publishing_name: &str, publish_type: &str) -> Self {
        let (stream_key, query) = match publishing_name.split_once('?') {
            Some((key, query)) => (key, Some(query)),
            None => (publishing_name, None),
        };

        let token = query.and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("token="))
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        });

        Self {
            stream_key: stream_key.to_string(),
            token,
            publish_type: publish_type.to_string(),
        }
    }
}

/// A message ready to hand to the chunk writer
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub csid: u32,
    pub type_id: u8,
    pub message_stream_id: u32,
    pub payload: Bytes,
}

/// `Set Chunk Size` protocol control
pub fn set_chunk_size(size: u32) -> OutboundMessage {
    control(MSG_SET_CHUNK_SIZE, size)
}

/// `Window Acknowledgement Size` protocol control
pub fn window_ack_size(size: u32) -> OutboundMessage {
    control(MSG_WINDOW_ACK_SIZE, size)
}

/// `Acknowledgement` protocol control
pub fn acknowledgement(sequence: u32) -> OutboundMessage {
    control(MSG_ACK, sequence)
}

/// `Set Peer Bandwidth` protocol control (dynamic limit)
pub fn set_peer_bandwidth(size: u32) -> OutboundMessage {
    let mut payload = BytesMut::with_capacity(5);
    payload.put_u32(size);
    payload.put_u8(2);
    OutboundMessage {
        csid: CSID_PROTOCOL_CONTROL,
        type_id: MSG_SET_PEER_BANDWIDTH,
        message_stream_id: 0,
        payload: payload.freeze(),
    }
}

/// `Stream Begin` user control event
pub fn stream_begin(stream_id: u32) -> OutboundMessage {
    let mut payload = BytesMut::with_capacity(6);
    payload.put_u16(0);
    payload.put_u32(stream_id);
    OutboundMessage {
        csid: CSID_PROTOCOL_CONTROL,
        type_id: MSG_USER_CONTROL,
        message_stream_id: 0,
        payload: payload.freeze(),
    }
}

/// `_result` for a successful `connect`
pub fn connect_result(transaction_id: f64) -> OutboundMessage {
    let properties = AmfValue::object([
        ("fmsVer", AmfValue::from("FMS/3,5,7,7009")),
        ("capabilities", AmfValue::from(31.0)),
    ]);
    let information = AmfValue::object([
        ("level", AmfValue::from("status")),
        ("code", AmfValue::from("NetConnection.Connect.Success")),
        ("description", AmfValue::from("Connection succeeded.")),
        ("objectEncoding", AmfValue::from(0.0)),
    ]);
    command_message(0, &[
        AmfValue::from("_result"),
        AmfValue::Number(transaction_id),
        properties,
        information,
    ])
}

/// `_error` response for a rejected `connect`
pub fn connect_error(transaction_id: f64, description: &str) -> OutboundMessage {
    let information = AmfValue::object([
        ("level", AmfValue::from("error")),
        ("code", AmfValue::from("NetConnection.Connect.Rejected")),
        ("description", AmfValue::from(description)),
    ]);
    command_message(0, &[
        AmfValue::from("_error"),
        AmfValue::Number(transaction_id),
        AmfValue::Null,
        information,
    ])
}

/// Generic `_result` with a null body (releaseStream, FCPublish)
pub fn simple_result(transaction_id: f64) -> OutboundMessage {
    command_message(0, &[
        AmfValue::from("_result"),
        AmfValue::Number(transaction_id),
        AmfValue::Null,
    ])
}

/// `_result` for `createStream`, allocating the publish stream id
pub fn create_stream_result(transaction_id: f64) -> OutboundMessage {
    command_message(0, &[
        AmfValue::from("_result"),
        AmfValue::Number(transaction_id),
        AmfValue::Null,
        AmfValue::Number(PUBLISH_STREAM_ID as f64),
    ])
}

/// `onStatus` event on the publish stream
pub fn on_status(level: &str, code: &str, description: &str) -> OutboundMessage {
    let info = AmfValue::object([
        ("level", AmfValue::from(level)),
        ("code", AmfValue::from(code)),
        ("description", AmfValue::from(description)),
    ]);
    command_message(PUBLISH_STREAM_ID, &[
        AmfValue::from("onStatus"),
        AmfValue::Number(0.0),
        AmfValue::Null,
        info,
    ])
}

/// `NetStream.Publish.Start` status
pub fn publish_start(stream_key: &str) -> OutboundMessage {
    on_status(
        "status",
        "NetStream.Publish.Start",
        &format!("{stream_key} is now published."),
    )
}

/// `NetStream.Publish.BadName` status used for auth and admission failures
pub fn publish_bad_name(description: &str) -> OutboundMessage {
    on_status("error", "NetStream.Publish.BadName", description)
}

fn command_message(stream_id: u32, values: &[AmfValue]) -> OutboundMessage {
    let mut payload = BytesMut::new();
    for value in values {
        amf::encode_value(&mut payload, value);
    }
    OutboundMessage {
        csid: CSID_COMMAND,
        type_id: MSG_COMMAND_AMF0,
        message_stream_id: stream_id,
        payload: payload.freeze(),
    }
}

fn control(type_id: u8, value: u32) -> OutboundMessage {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32(value);
    OutboundMessage {
        csid: CSID_PROTOCOL_CONTROL,
        type_id,
        message_stream_id: 0,
        payload: payload.freeze(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(type_id: u8, timestamp: u32, payload: Bytes) -> RawMessage {
        RawMessage {
            type_id,
            message_stream_id: 0,
            timestamp,
            payload,
        }
    }

    #[test]
    fn test_decode_set_chunk_size() {
        let msg = RtmpMessage::decode(raw(
            MSG_SET_CHUNK_SIZE,
            0,
            Bytes::from_static(&[0x00, 0x00, 0x10, 0x00]),
        ))
        .unwrap();
        assert!(matches!(msg, RtmpMessage::SetChunkSize(4096)));
    }

    #[test]
    fn test_decode_connect_command() {
        let out = connect_result(1.0); // any command payload works as input
        let msg = RtmpMessage::decode(raw(MSG_COMMAND_AMF0, 0, out.payload)).unwrap();
        match msg {
            RtmpMessage::Command {
                name,
                transaction_id,
                object,
                args,
            } => {
                assert_eq!(name, "_result");
                assert_eq!(transaction_id, 1.0);
                assert_eq!(object.get_str("fmsVer"), Some("FMS/3,5,7,7009"));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_media_passthrough() {
        let msg = RtmpMessage::decode(raw(MSG_VIDEO, 1234, Bytes::from_static(&[0x17, 0x01])))
            .unwrap();
        match msg {
            RtmpMessage::Video { timestamp, payload } => {
                assert_eq!(timestamp, 1234);
                assert_eq!(payload.len(), 2);
            }
            other => panic!("expected video, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_tolerated() {
        let msg = RtmpMessage::decode(raw(99, 0, Bytes::new())).unwrap();
        assert!(matches!(msg, RtmpMessage::Unknown { type_id: 99 }));
    }

    #[test]
    fn test_publish_params_with_token() {
        let params = PublishParams::parse("live1?token=abc123", "live");
        assert_eq!(params.stream_key, "live1");
        assert_eq!(params.token.as_deref(), Some("abc123"));
        assert_eq!(params.publish_type, "live");
    }

    #[test]
    fn test_publish_params_without_token() {
        let params = PublishParams::parse("live1", "live");
        assert_eq!(params.stream_key, "live1");
        assert!(params.token.is_none());
    }

    #[test]
    fn test_publish_params_multi_query() {
        let params = PublishParams::parse("live1?foo=bar&token=xyz", "live");
        assert_eq!(params.stream_key, "live1");
        assert_eq!(params.token.as_deref(), Some("xyz"));

        let empty = PublishParams::parse("live1?token=", "live");
        assert!(empty.token.is_none());
    }

    #[test]
    fn test_connect_params_from_object() {
        let object = AmfValue::object([
            ("app", AmfValue::from("live")),
            ("tcUrl", AmfValue::from("rtmp://example/live")),
        ]);
        let params = ConnectParams::from_object(&object);
        assert_eq!(params.app, "live");
        assert_eq!(params.tc_url.as_deref(), Some("rtmp://example/live"));
        assert!(params.flash_ver.is_none());
    }

    #[test]
    fn test_publish_start_status_shape() {
        let out = publish_start("live1");
        assert_eq!(out.type_id, MSG_COMMAND_AMF0);
        assert_eq!(out.message_stream_id, PUBLISH_STREAM_ID);

        let msg = RtmpMessage::decode(raw(MSG_COMMAND_AMF0, 0, out.payload)).unwrap();
        match msg {
            RtmpMessage::Command { name, args, .. } => {
                assert_eq!(name, "onStatus");
                let info = &args[0];
                assert_eq!(info.get_str("code"), Some("NetStream.Publish.Start"));
                assert_eq!(info.get_str("level"), Some("status"));
            }
            other => panic!("expected onStatus, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_name_status_is_error_level() {
        let out = publish_bad_name("authentication failed");
        let msg = RtmpMessage::decode(raw(MSG_COMMAND_AMF0, 0, out.payload)).unwrap();
        match msg {
            RtmpMessage::Command { args, .. } => {
                let info = &args[0];
                assert_eq!(info.get_str("level"), Some("error"));
                assert_eq!(info.get_str("code"), Some("NetStream.Publish.BadName"));
            }
            other => panic!("expected onStatus, got {other:?}"),
        }
    }

    #[test]
    fn test_create_stream_result_allocates_stream_one() {
        let out = create_stream_result(4.0);
        let msg = RtmpMessage::decode(raw(MSG_COMMAND_AMF0, 0, out.payload)).unwrap();
        match msg {
            RtmpMessage::Command { name, transaction_id, args, .. } => {
                assert_eq!(name, "_result");
                assert_eq!(transaction_id, 4.0);
                assert_eq!(args[0].as_number(), Some(1.0));
            }
            other => panic!("expected _result, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_control_fails() {
        let result = RtmpMessage::decode(raw(MSG_WINDOW_ACK_SIZE, 0, Bytes::from_static(&[0, 1])));
        assert!(result.is_err());
    }
}
