//! RTMP protocol constants

/// Protocol version carried in C0/S0
pub const RTMP_VERSION: u8 = 3;

/// Size of the C1/C2/S1/S2 handshake packets
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size both sides start with, per the RTMP specification
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Largest chunk size we accept from or announce to a peer
pub const MAX_CHUNK_SIZE: u32 = 65536;

/// Largest assembled message accepted before the connection is dropped
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default window acknowledgement size
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Default peer bandwidth
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

/// Timestamp value signalling an extended timestamp field
pub const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

// Message type ids
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACK: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

// Chunk stream ids used for server-originated messages
pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;

/// Message stream id handed out by createStream
pub const PUBLISH_STREAM_ID: u32 = 1;
