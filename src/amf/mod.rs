//! AMF0 value model and codec
//!
//! RTMP command messages (`connect`, `createStream`, `publish`, status
//! responses) and `@setDataFrame` metadata are AMF0-encoded. Only AMF0 is
//! spoken here; peers that switch to AMF3 mid-stream are not supported.

pub mod amf0;
pub mod value;

pub use amf0::{decode_all, decode_value, encode_value};
pub use value::AmfValue;
