//! Minimal raw IP packet inspection: just enough to classify a TUN-provided
//! frame by destination address for `SharedTun` dispatch, and to pull the
//! UDP payload offset out of a packet the client is about to tunnel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{CoreError, ParseErrorSnafu};

/// IP version read from the first nibble of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
	V4,
	V6,
}

/// Source/destination addresses of a raw IPv4 or IPv6 packet, read without
/// allocating or validating anything beyond what's needed to route it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketAddrs {
	pub version: IpVersion,
	pub src: IpAddr,
	pub dst: IpAddr,
}

/// Reads the version nibble plus source/destination addresses from a raw IP
/// packet. Does not validate checksums, options, or total length beyond what
/// is needed to read the fixed address fields.
pub fn parse_addrs(packet: &[u8]) -> Result<PacketAddrs, CoreError> {
	let first = *packet.first().ok_or_else(|| {
		ParseErrorSnafu {
			what: "ip packet",
			message: "empty packet",
		}
		.build()
	})?;
	match first >> 4 {
		4 => {
			if packet.len() < 20 {
				return ParseErrorSnafu {
					what: "ipv4 header",
					message: "packet shorter than a minimal IPv4 header",
				}
				.fail();
			}
			let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
			let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
			Ok(PacketAddrs {
				version: IpVersion::V4,
				src: IpAddr::V4(src),
				dst: IpAddr::V4(dst),
			})
		}
		6 => {
			if packet.len() < 40 {
				return ParseErrorSnafu {
					what: "ipv6 header",
					message: "packet shorter than a fixed IPv6 header",
				}
				.fail();
			}
			let mut src_octets = [0u8; 16];
			let mut dst_octets = [0u8; 16];
			src_octets.copy_from_slice(&packet[8..24]);
			dst_octets.copy_from_slice(&packet[24..40]);
			Ok(PacketAddrs {
				version: IpVersion::V6,
				src: IpAddr::V6(Ipv6Addr::from(src_octets)),
				dst: IpAddr::V6(Ipv6Addr::from(dst_octets)),
			})
		}
		other => ParseErrorSnafu {
			what: "ip packet",
			message: format!("unknown IP version nibble {other}"),
		}
		.fail(),
	}
}

/// Returns the byte offset of a UDP payload within a raw IPv4 packet,
/// assuming no IP options (the client only ever synthesizes packets it
/// constructs itself, so this is safe to assume rather than walk options).
pub fn ipv4_udp_payload_offset(packet: &[u8]) -> Result<usize, CoreError> {
	if packet.len() < 28 {
		return ParseErrorSnafu {
			what: "ipv4+udp header",
			message: "packet too short for IPv4 + UDP headers",
		}
		.fail();
	}
	let ihl = (packet[0] & 0x0f) as usize * 4;
	if packet.len() < ihl + 8 {
		return ParseErrorSnafu {
			what: "ipv4+udp header",
			message: "packet shorter than its own IHL plus a UDP header",
		}
		.fail();
	}
	Ok(ihl + 8)
}

#[cfg(test)]
mod test {
	use super::*;

	fn minimal_ipv4(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
		let mut packet = vec![0u8; 28];
		packet[0] = 0x45;
		packet[9] = 17; // UDP
		packet[12..16].copy_from_slice(&src.octets());
		packet[16..20].copy_from_slice(&dst.octets());
		packet
	}

	#[test]
	fn parses_ipv4_addrs() {
		let packet = minimal_ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(8, 8, 8, 8));
		let addrs = parse_addrs(&packet).unwrap();
		assert_eq!(addrs.version, IpVersion::V4);
		assert_eq!(addrs.dst, IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
	}

	#[test]
	fn udp_offset_accounts_for_ihl() {
		let packet = minimal_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
		assert_eq!(ipv4_udp_payload_offset(&packet).unwrap(), 28);
	}

	#[test]
	fn rejects_truncated_packet() {
		assert!(parse_addrs(&[0x45]).is_err());
	}
}
