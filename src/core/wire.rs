//! # Wire Codec
//!
//! Primitive encode/decode for message payloads.
//!
//! All multi-byte integers are little-endian. Strings carry a `u16` byte
//! length followed by UTF-8 bytes. Identifiers are 16 raw bytes. Floating
//! values use a 32-bit fixed-point form with 1/256 precision:
//!
//! ```text
//! bit 31      sign
//! bits 0..30  round(|v| * 256)
//! ```
//!
//! Reads are bounds-checked and fail with [`ProtocolError::Underrun`]; the
//! writer appends to a growable buffer and only fails when a value cannot be
//! represented on the wire.

use bytes::{BufMut, BytesMut};

use crate::core::identifier::Identifier;
use crate::core::vector::Vector3;
use crate::error::{ProtocolError, Result};

/// Sign bit of an encoded fixed-point value
const FIXED_SIGN_BIT: u32 = 0x8000_0000;

/// Scale between a fixed-point magnitude and its floating value
const FIXED_SCALE: f64 = 256.0;

/// Largest magnitude that survives encoding (exclusive)
pub const FIXED_MAX_MAGNITUDE: f64 = (FIXED_SIGN_BIT as f64) / FIXED_SCALE;

/// Encodes a floating value as fixed-point
///
/// # Errors
/// Returns `ProtocolError::InvalidValue` for non-finite values and for values
/// whose scaled magnitude would spill into the sign bit.
pub fn encode_fixed(value: f64) -> Result<u32> {
    if !value.is_finite() {
        return Err(ProtocolError::InvalidValue(format!(
            "fixed-point value must be finite, got {value}"
        )));
    }

    let scaled = (value.abs() * FIXED_SCALE).round();
    if scaled >= FIXED_SIGN_BIT as f64 {
        return Err(ProtocolError::InvalidValue(format!(
            "fixed-point value {value} out of range (|v| < {FIXED_MAX_MAGNITUDE})"
        )));
    }

    let mut raw = scaled as u32;
    if value < 0.0 {
        raw |= FIXED_SIGN_BIT;
    }
    Ok(raw)
}

/// Decodes a fixed-point value
pub fn decode_fixed(raw: u32) -> f64 {
    let magnitude = f64::from(raw & !FIXED_SIGN_BIT) / FIXED_SCALE;
    if raw & FIXED_SIGN_BIT != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Bounds-checked reader over a message payload
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current read offset
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(ProtocolError::Underrun {
                needed: count,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a fixed-point double
    pub fn read_fixed(&mut self) -> Result<f64> {
        Ok(decode_fixed(self.read_u32()?))
    }

    /// Reads three consecutive fixed-point doubles
    pub fn read_vector(&mut self) -> Result<Vector3> {
        let x = self.read_fixed()?;
        let y = self.read_fixed()?;
        let z = self.read_fixed()?;
        Ok(Vector3::new(x, y, z))
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// The declared length must be strictly below `max_len`.
    pub fn read_string(&mut self, max_len: usize) -> Result<String> {
        let declared = usize::from(self.read_u16()?);
        if declared >= max_len {
            return Err(ProtocolError::LengthExceeded {
                declared,
                max: max_len,
            });
        }

        if declared == 0 {
            return Ok(String::new());
        }

        let bytes = self.take(declared)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::InvalidValue(format!("string is not UTF-8: {e}")))
    }

    /// Reads exactly `len` raw bytes
    pub fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a fixed-size array
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a 16-byte identifier
    pub fn read_identifier(&mut self) -> Result<Identifier> {
        Ok(Identifier::from_bytes(self.read_array::<16>()?))
    }
}

/// Appending writer for message payloads
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    /// Writes a fixed-point double
    pub fn write_fixed(&mut self, value: f64) -> Result<()> {
        let raw = encode_fixed(value)?;
        self.write_u32(raw);
        Ok(())
    }

    pub fn write_vector(&mut self, vector: &Vector3) -> Result<()> {
        self.write_fixed(vector.x)?;
        self.write_fixed(vector.y)?;
        self.write_fixed(vector.z)
    }

    /// Writes a length-prefixed string that a peer reading with the same
    /// `max_len` will accept.
    pub fn write_string(&mut self, value: &str, max_len: usize) -> Result<()> {
        let len = value.len();
        if len >= max_len || len > usize::from(u16::MAX) {
            return Err(ProtocolError::LengthExceeded {
                declared: len,
                max: max_len.min(usize::from(u16::MAX) + 1),
            });
        }
        self.write_u16(len as u16);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_block(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn write_identifier(&mut self, id: &Identifier) {
        self.buf.put_slice(id.as_bytes());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let mut w = WireWriter::new();
        w.write_u16(0x1234);
        w.write_u32(0xAABB_CCDD);
        assert_eq!(w.as_slice(), &[0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA]);

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xAABB_CCDD);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn fixed_point_layout() {
        assert_eq!(encode_fixed(1.0).unwrap(), 256);
        assert_eq!(encode_fixed(-1.0).unwrap(), 0x8000_0100);
        assert_eq!(encode_fixed(0.5).unwrap(), 128);
        assert_eq!(encode_fixed(-0.0).unwrap(), 0);
        assert_eq!(decode_fixed(0x8000_0080), -0.5);
    }

    #[test]
    fn fixed_point_precision() {
        for value in [0.0, 3.14159, -2.71828, 1234.567, -8_000_000.25, 0.001] {
            let back = decode_fixed(encode_fixed(value).unwrap());
            assert!((back - value).abs() <= 1.0 / 512.0, "{value} -> {back}");
        }
    }

    #[test]
    fn fixed_point_rejects_out_of_range() {
        assert!(encode_fixed(FIXED_MAX_MAGNITUDE).is_err());
        assert!(encode_fixed(-FIXED_MAX_MAGNITUDE).is_err());
        assert!(encode_fixed(f64::NAN).is_err());
        assert!(encode_fixed(f64::INFINITY).is_err());
        assert!(encode_fixed(FIXED_MAX_MAGNITUDE - 1.0).is_ok());
    }

    #[test]
    fn string_bounds() {
        let mut w = WireWriter::new();
        w.write_string("alice", 16).unwrap();
        w.write_string("", 16).unwrap();
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.read_string(16).unwrap(), "alice");
        assert_eq!(r.read_string(16).unwrap(), "");

        // declared length equal to the limit is rejected
        let mut raw = WireWriter::new();
        raw.write_u16(16);
        raw.write_block(&[b'a'; 16]);
        let mut r = WireReader::new(raw.as_slice());
        assert!(matches!(
            r.read_string(16),
            Err(ProtocolError::LengthExceeded { declared: 16, max: 16 })
        ));

        let mut w = WireWriter::new();
        assert!(w.write_string(&"x".repeat(16), 16).is_err());
        assert!(w.is_empty());
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let raw = [2u8, 0, 0xFF, 0xFE];
        let mut r = WireReader::new(&raw);
        assert!(matches!(r.read_string(8), Err(ProtocolError::InvalidValue(_))));
    }

    #[test]
    fn underrun_reports_sizes() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert!(matches!(
            r.read_u32(),
            Err(ProtocolError::Underrun { needed: 4, available: 3 })
        ));
        // failed read does not consume
        assert_eq!(r.read_u8().unwrap(), 1);

        let mut r = WireReader::new(&[5, 0, b'a']);
        assert!(matches!(r.read_string(32), Err(ProtocolError::Underrun { .. })));
    }

    #[test]
    fn identifier_is_raw_copy() {
        let bytes: [u8; 16] = std::array::from_fn(|i| i as u8);
        let id = Identifier::from_bytes(bytes);
        let mut w = WireWriter::new();
        w.write_identifier(&id);
        assert_eq!(w.as_slice(), &bytes);
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.read_identifier().unwrap(), id);
    }

    #[test]
    fn vector_is_three_fixed_values() {
        let v = Vector3::new(1.0, -2.0, 0.5);
        let mut w = WireWriter::new();
        w.write_vector(&v).unwrap();
        assert_eq!(w.len(), 12);
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.read_vector().unwrap(), v);
    }
}
