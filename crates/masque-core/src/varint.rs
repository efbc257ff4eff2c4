//! QUIC variable-length integer encoding (RFC 9000 §16), used to frame
//! capsules and their context-id prefix.

use bytes::{Buf, BufMut};

use crate::error::{CoreError, InvalidArgumentSnafu};

/// Largest value representable in the 8-byte encoding (62 bits).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes `encode_varint` would emit for `value`.
pub fn encoded_len(value: u64) -> usize {
	if value <= 0x3f {
		1
	} else if value <= 0x3fff {
		2
	} else if value <= 0x3fff_ffff {
		4
	} else {
		8
	}
}

/// Appends `value` to `dst` using the shortest self-describing encoding.
pub fn encode_varint(value: u64, dst: &mut impl BufMut) -> Result<(), CoreError> {
	if value <= 0x3f {
		dst.put_u8(value as u8);
	} else if value <= 0x3fff {
		dst.put_u16((value as u16) | 0x4000);
	} else if value <= 0x3fff_ffff {
		dst.put_u32((value as u32) | 0x8000_0000);
	} else if value <= MAX_VARINT {
		dst.put_u64(value | 0xc000_0000_0000_0000);
	} else {
		return InvalidArgumentSnafu {
			message: format!("{value} exceeds the 62-bit varint range"),
		}
		.fail();
	}
	Ok(())
}

/// Reads a varint from the front of `src` without requiring the whole value
/// to already be buffered; returns `Ok(None)` if `src` doesn't yet hold
/// enough bytes, never consuming a partial prefix in that case.
pub fn decode_varint(src: &mut impl Buf) -> Option<(u64, usize)> {
	if !src.has_remaining() {
		return None;
	}
	let first = src.chunk()[0];
	let tag = first >> 6;
	let len = 1usize << tag;
	if src.remaining() < len {
		return None;
	}

	let mut value = (first & 0x3f) as u64;
	let mut buf = [0u8; 8];
	src.copy_to_slice(&mut buf[..1]);
	for _ in 1..len {
		value = (value << 8) | src.get_u8() as u64;
	}
	Some((value, len))
}

#[cfg(test)]
mod test {
	use bytes::{Bytes, BytesMut};

	use super::*;

	#[test]
	fn round_trip_all_lengths() {
		for value in [0u64, 0x3f, 0x40, 0x3fff, 0x4000, 0x3fff_ffff, 0x4000_0000, MAX_VARINT] {
			let mut buf = BytesMut::new();
			encode_varint(value, &mut buf).unwrap();
			assert_eq!(buf.len(), encoded_len(value));
			let mut src = Bytes::from(buf.freeze());
			let (decoded, consumed) = decode_varint(&mut src).unwrap();
			assert_eq!(decoded, value);
			assert_eq!(consumed, encoded_len(value));
		}
	}

	#[test]
	fn short_buffer_reports_none() {
		let mut buf = BytesMut::new();
		encode_varint(0x4000, &mut buf).unwrap();
		let mut truncated = Bytes::from(buf.freeze().slice(0..1));
		assert!(decode_varint(&mut truncated).is_none());
	}

	#[test]
	fn rejects_value_above_62_bits() {
		let mut buf = BytesMut::new();
		assert!(encode_varint(MAX_VARINT + 1, &mut buf).is_err());
	}
}
