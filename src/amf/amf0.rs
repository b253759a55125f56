//! AMF0 encoder and decoder
//!
//! Reference: AMF0 File Format Specification.
//!
//! Type markers handled here:
//! ```text
//! 0x00 Number        IEEE 754 double
//! 0x01 Boolean
//! 0x02 String        UTF-8, u16 length prefix
//! 0x03 Object        key-value pairs until "" + 0x09
//! 0x05 Null
//! 0x06 Undefined
//! 0x08 ECMA Array    u32 count, then object-style pairs
//! 0x09 Object End
//! 0x0A Strict Array  u32 count, dense values
//! 0x0B Date          double millis + i16 timezone (discarded)
//! 0x0C Long String   UTF-8, u32 length prefix
//! ```
//!
//! Decoding is lenient where real encoders are sloppy: OBS omits the object
//! end marker on the last object of a message, and some encoders emit
//! markers we do not model (those decode as `Undefined`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Nesting limit guarding against malicious deeply-nested payloads
const MAX_DEPTH: usize = 32;

/// Decode a single AMF0 value from the buffer.
pub fn decode_value(buf: &mut Bytes) -> Result<AmfValue, AmfError> {
    decode_at_depth(buf, 0)
}

/// Decode values until the buffer is exhausted.
///
/// Command messages are a flat sequence: command name, transaction id, then
/// the command object and optional arguments.
pub fn decode_all(buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(decode_at_depth(buf, 0)?);
    }
    Ok(values)
}

fn decode_at_depth(buf: &mut Bytes, depth: usize) -> Result<AmfValue, AmfError> {
    if depth > MAX_DEPTH {
        return Err(AmfError::NestingTooDeep);
    }
    if buf.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }

    match buf.get_u8() {
        MARKER_NUMBER => {
            ensure(buf, 8)?;
            Ok(AmfValue::Number(buf.get_f64()))
        }
        MARKER_BOOLEAN => {
            ensure(buf, 1)?;
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => Ok(AmfValue::String(read_short_string(buf)?)),
        MARKER_LONG_STRING => {
            ensure(buf, 4)?;
            let len = buf.get_u32() as usize;
            ensure(buf, len)?;
            let raw = buf.copy_to_bytes(len);
            String::from_utf8(raw.to_vec())
                .map(AmfValue::String)
                .map_err(|_| AmfError::InvalidUtf8)
        }
        MARKER_OBJECT => Ok(AmfValue::Object(read_properties(buf, depth)?)),
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        MARKER_ECMA_ARRAY => {
            // The leading count is advisory; pairs still end with the
            // empty-key terminator.
            ensure(buf, 4)?;
            let _count = buf.get_u32();
            Ok(AmfValue::EcmaArray(read_properties(buf, depth)?))
        }
        MARKER_STRICT_ARRAY => {
            ensure(buf, 4)?;
            let count = buf.get_u32() as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_at_depth(buf, depth + 1)?);
            }
            Ok(AmfValue::Array(items))
        }
        MARKER_DATE => {
            ensure(buf, 10)?;
            let millis = buf.get_f64();
            let _timezone = buf.get_i16();
            Ok(AmfValue::Date(millis))
        }
        // Unknown markers decode as Undefined so one exotic field does not
        // sink the whole command.
        _ => Ok(AmfValue::Undefined),
    }
}

fn read_properties(
    buf: &mut Bytes,
    depth: usize,
) -> Result<HashMap<String, AmfValue>, AmfError> {
    let mut properties = HashMap::new();

    loop {
        let key = read_short_string(buf)?;
        if key.is_empty() {
            if buf.is_empty() {
                // OBS omits the trailing end marker on the final object
                break;
            }
            let marker = buf.get_u8();
            if marker == MARKER_OBJECT_END {
                break;
            }
            return Err(AmfError::InvalidObjectEnd);
        }
        let value = decode_at_depth(buf, depth + 1)?;
        properties.insert(key, value);
    }

    Ok(properties)
}

fn read_short_string(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), AmfError> {
    if buf.remaining() < needed {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

/// Encode a single AMF0 value into the buffer.
pub fn encode_value(buf: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        AmfValue::String(s) => {
            if s.len() > u16::MAX as usize {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
            } else {
                buf.put_u8(MARKER_STRING);
                buf.put_u16(s.len() as u16);
            }
            buf.put_slice(s.as_bytes());
        }
        AmfValue::Object(props) => {
            buf.put_u8(MARKER_OBJECT);
            write_properties(buf, props);
        }
        AmfValue::EcmaArray(props) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(props.len() as u32);
            write_properties(buf, props);
        }
        AmfValue::Array(items) => {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
        AmfValue::Date(millis) => {
            buf.put_u8(MARKER_DATE);
            buf.put_f64(*millis);
            buf.put_i16(0);
        }
        AmfValue::Null => buf.put_u8(MARKER_NULL),
        AmfValue::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

fn write_properties(buf: &mut BytesMut, props: &HashMap<String, AmfValue>) {
    for (key, value) in props {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        encode_value(buf, value);
    }
    // Empty key + end marker
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}
