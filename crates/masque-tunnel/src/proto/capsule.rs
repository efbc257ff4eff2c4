//! MASQUE capsule codec: `varint type | varint length | payload[length]`,
//! with per-type payload grammars from
//! draft-ietf-masque-connect-ip and RFC 9298's DATA capsule.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use masque_core::varint::{decode_varint, encode_varint, encoded_len};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::error::{
	CapsuleError, EmptyAddressRequestSnafu, ShortBodySnafu, TruncatedHeaderSnafu, UnknownIpVersionSnafu, UnsortedRangesSnafu, ZeroRequestIdSnafu,
};

pub const TYPE_DATA: u64 = 0x00;
pub const TYPE_ADDRESS_ASSIGN: u64 = 0x01;
pub const TYPE_ADDRESS_REQUEST: u64 = 0x02;
pub const TYPE_ROUTE_ADVERTISEMENT: u64 = 0x03;

/// One entry of an ADDRESS_ASSIGN or ADDRESS_REQUEST capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
	pub request_id: u64,
	pub ip: IpAddr,
	pub prefix_len: u8,
}

/// One entry of a ROUTE_ADVERTISEMENT capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
	pub start: IpAddr,
	pub end: IpAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Capsule {
	Data(Bytes),
	AddressAssign(Vec<Address>),
	AddressRequest(Vec<Address>),
	RouteAdvertisement(Vec<Range>),
	Unknown(u64),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CapsuleCodec;

fn ip_version_byte(addr: IpAddr) -> u8 {
	match addr {
		IpAddr::V4(_) => 4,
		IpAddr::V6(_) => 6,
	}
}

fn decode_ip(version: u8, src: &mut impl Buf) -> Result<IpAddr, CapsuleError> {
	match version {
		4 => {
			ensure!(src.remaining() >= 4, ShortBodySnafu);
			let mut octets = [0u8; 4];
			src.copy_to_slice(&mut octets);
			Ok(IpAddr::V4(Ipv4Addr::from(octets)))
		}
		6 => {
			ensure!(src.remaining() >= 16, ShortBodySnafu);
			let mut octets = [0u8; 16];
			src.copy_to_slice(&mut octets);
			Ok(IpAddr::V6(Ipv6Addr::from(octets)))
		}
		other => UnknownIpVersionSnafu { value: other }.fail(),
	}
}

fn encode_ip(addr: IpAddr, dst: &mut impl BufMut) {
	match addr {
		IpAddr::V4(v4) => dst.put_slice(&v4.octets()),
		IpAddr::V6(v6) => dst.put_slice(&v6.octets()),
	}
}

fn decode_address(src: &mut impl Buf) -> Result<Address, CapsuleError> {
	let (request_id, _) = decode_varint(src).ok_or_else(|| TruncatedHeaderSnafu.build())?;
	ensure!(src.remaining() >= 1, ShortBodySnafu);
	let version = src.get_u8();
	let ip = decode_ip(version, src)?;
	ensure!(src.remaining() >= 1, ShortBodySnafu);
	let prefix_len = src.get_u8();
	Ok(Address { request_id, ip, prefix_len })
}

fn encode_address(addr: &Address, dst: &mut BytesMut) {
	let body_len = match addr.ip {
		IpAddr::V4(_) => 4,
		IpAddr::V6(_) => 16,
	};
	dst.reserve(encoded_len(addr.request_id) + 1 + body_len + 1);
	// infallible: request_id is always below MAX_VARINT in practice (a u64
	// counter of assigned addresses never approaches 2^62).
	encode_varint(addr.request_id, dst).expect("request_id fits in a varint");
	dst.put_u8(ip_version_byte(addr.ip));
	encode_ip(addr.ip, dst);
	dst.put_u8(addr.prefix_len);
}

fn decode_range(src: &mut impl Buf) -> Result<Range, CapsuleError> {
	ensure!(src.remaining() >= 1, ShortBodySnafu);
	let version = src.get_u8();
	let start = decode_ip(version, src)?;
	let end = decode_ip(version, src)?;
	ensure!(src.remaining() >= 1, ShortBodySnafu);
	let protocol = src.get_u8();
	ensure!(protocol == 4 || protocol == 6, UnknownIpVersionSnafu { value: protocol });
	Ok(Range { start, end })
}

fn encode_range(range: &Range, dst: &mut BytesMut) {
	let body_len = match range.start {
		IpAddr::V4(_) => 4,
		IpAddr::V6(_) => 16,
	};
	dst.reserve(1 + 2 * body_len + 1);
	dst.put_u8(ip_version_byte(range.start));
	encode_ip(range.start, dst);
	encode_ip(range.end, dst);
	dst.put_u8(ip_version_byte(range.start));
}

fn ranges_sorted(ranges: &[Range]) -> bool {
	ranges.windows(2).all(|pair| {
		let (a, b) = (pair[0], pair[1]);
		let a_v4 = matches!(a.start, IpAddr::V4(_));
		let b_v4 = matches!(b.start, IpAddr::V4(_));
		if a_v4 != b_v4 {
			return a_v4;
		}
		a.end < b.start
	})
}

#[cfg(feature = "decode")]
impl Decoder for CapsuleCodec {
	type Error = CapsuleError;
	type Item = Capsule;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		let (cap_type, type_len, length, length_len) = {
			let mut peek = &src[..];
			let Some((cap_type, type_len)) = decode_varint(&mut peek) else {
				return Ok(None);
			};
			let Some((length, length_len)) = decode_varint(&mut peek) else {
				return Ok(None);
			};
			(cap_type, type_len, length, length_len)
		};
		let header_len = type_len + length_len;
		let total_len = header_len + length as usize;
		if src.len() < total_len {
			return Ok(None);
		}
		src.advance(header_len);
		let mut payload = src.split_to(length as usize);

		match cap_type {
			TYPE_DATA => {
				let (ctx_id, _) = decode_varint(&mut payload).ok_or_else(|| TruncatedHeaderSnafu.build())?;
				// Non-zero context-ids are reserved; the caller (ingress
				// datagram/body path) is responsible for dropping them. The
				// codec itself still parses the capsule so callers can log
				// and discard rather than desyncing the stream.
				let _ = ctx_id;
				Ok(Some(Capsule::Data(payload.freeze())))
			}
			TYPE_ADDRESS_ASSIGN => {
				let mut addresses = Vec::new();
				while payload.has_remaining() {
					addresses.push(decode_address(&mut payload)?);
				}
				Ok(Some(Capsule::AddressAssign(addresses)))
			}
			TYPE_ADDRESS_REQUEST => {
				let mut addresses = Vec::new();
				while payload.has_remaining() {
					let addr = decode_address(&mut payload)?;
					ensure!(addr.request_id != 0, ZeroRequestIdSnafu);
					addresses.push(addr);
				}
				ensure!(!addresses.is_empty(), EmptyAddressRequestSnafu);
				Ok(Some(Capsule::AddressRequest(addresses)))
			}
			TYPE_ROUTE_ADVERTISEMENT => {
				let mut ranges = Vec::new();
				while payload.has_remaining() {
					ranges.push(decode_range(&mut payload)?);
				}
				ensure!(ranges_sorted(&ranges), UnsortedRangesSnafu);
				Ok(Some(Capsule::RouteAdvertisement(ranges)))
			}
			other => Ok(Some(Capsule::Unknown(other))),
		}
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) => crate::proto::error::BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

#[cfg(feature = "encode")]
impl Encoder<Capsule> for CapsuleCodec {
	type Error = CapsuleError;

	fn encode(&mut self, item: Capsule, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let mut body = BytesMut::new();
		let cap_type = match &item {
			Capsule::Data(data) => {
				encode_varint(0, &mut body).expect("context-id 0 fits in a varint");
				body.extend_from_slice(data);
				TYPE_DATA
			}
			Capsule::AddressAssign(addresses) => {
				for addr in addresses {
					encode_address(addr, &mut body);
				}
				TYPE_ADDRESS_ASSIGN
			}
			Capsule::AddressRequest(addresses) => {
				for addr in addresses {
					encode_address(addr, &mut body);
				}
				TYPE_ADDRESS_REQUEST
			}
			Capsule::RouteAdvertisement(ranges) => {
				for range in ranges {
					encode_range(range, &mut body);
				}
				TYPE_ROUTE_ADVERTISEMENT
			}
			Capsule::Unknown(cap_type) => *cap_type,
		};

		dst.reserve(encoded_len(cap_type) + encoded_len(body.len() as u64) + body.len());
		encode_varint(cap_type, dst)?;
		encode_varint(body.len() as u64, dst)?;
		dst.extend_from_slice(&body);
		Ok(())
	}
}

#[cfg(all(test, feature = "encode", feature = "decode"))]
mod test {
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::*;

	#[test_log::test(tokio::test)]
	async fn round_trip_all_variants() -> eyre::Result<()> {
		let vars = vec![
			Capsule::Data(Bytes::from_static(b"hello")),
			Capsule::AddressAssign(vec![Address {
				request_id: 1,
				ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
				prefix_len: 32,
			}]),
			Capsule::AddressRequest(vec![Address {
				request_id: 7,
				ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
				prefix_len: 0,
			}]),
			Capsule::RouteAdvertisement(vec![Range {
				start: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
				end: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
			}]),
			Capsule::Unknown(0xff),
		];

		let buffer = Vec::with_capacity(256);
		let mut writer = FramedWrite::new(buffer, CapsuleCodec);
		for var in &vars {
			writer.send(var.clone()).await?;
		}

		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), CapsuleCodec);
		for var in &vars {
			let frame = reader.next().await.unwrap()?;
			if matches!(var, Capsule::Unknown(_)) {
				assert_eq!(&frame, var);
			} else {
				assert_eq!(&frame, var);
			}
		}
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn truncated_length_waits_for_more_bytes() -> eyre::Result<()> {
		let buffer = Vec::with_capacity(64);
		let mut writer = FramedWrite::new(buffer, CapsuleCodec);
		writer.send(Capsule::Data(Bytes::from_static(b"payload"))).await?;
		let mut full = writer.into_inner();

		let full_len = full.len();
		let mut tail = full.split_off(full_len / 2);
		let mut head = full;
		{
			let mut reader = FramedRead::new(head.as_slice(), CapsuleCodec);
			assert!(matches!(reader.next().await.unwrap().unwrap_err(), CapsuleError::BytesRemaining));
		}
		head.append(&mut tail);
		let mut reader = FramedRead::new(head.as_slice(), CapsuleCodec);
		assert_eq!(reader.next().await.unwrap()?, Capsule::Data(Bytes::from_static(b"payload")));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn address_request_rejects_zero_request_id() {
		let mut body = BytesMut::new();
		encode_address(
			&Address {
				request_id: 0,
				ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
				prefix_len: 0,
			},
			&mut body,
		);
		let mut dst = BytesMut::new();
		encode_varint(TYPE_ADDRESS_REQUEST, &mut dst).unwrap();
		encode_varint(body.len() as u64, &mut dst).unwrap();
		dst.extend_from_slice(&body);

		let mut codec = CapsuleCodec;
		assert!(matches!(codec.decode(&mut dst), Err(CapsuleError::ZeroRequestId { .. })));
	}

	#[test_log::test(tokio::test)]
	async fn route_advertisement_rejects_unsorted_ranges() {
		let mut body = BytesMut::new();
		encode_range(
			&Range {
				start: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
				end: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 20)),
			},
			&mut body,
		);
		encode_range(
			&Range {
				start: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
				end: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
			},
			&mut body,
		);
		let mut dst = BytesMut::new();
		encode_varint(TYPE_ROUTE_ADVERTISEMENT, &mut dst).unwrap();
		encode_varint(body.len() as u64, &mut dst).unwrap();
		dst.extend_from_slice(&body);

		let mut codec = CapsuleCodec;
		assert!(matches!(codec.decode(&mut dst), Err(CapsuleError::UnsortedRanges { .. })));
	}

	#[test_log::test(tokio::test)]
	async fn single_range_is_trivially_sorted() -> eyre::Result<()> {
		let capsule = Capsule::RouteAdvertisement(vec![Range {
			start: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			end: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
		}]);
		let buffer = Vec::with_capacity(64);
		let mut writer = FramedWrite::new(buffer, CapsuleCodec);
		writer.send(capsule.clone()).await?;
		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), CapsuleCodec);
		assert_eq!(reader.next().await.unwrap()?, capsule);
		Ok(())
	}
}
