//! Thin packet source/sink over an OS TUN device. Not present in the
//! teacher at all — the TUN device is a new collaborator this system needs
//! that the SOCKS5 proxy never did.

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::AsyncDevice;

use crate::error::{CoreError, TransportErrorSnafu};

/// Packet source/sink backing `SharedTun` (server) and the per-transaction
/// TUN devices the client creates for CONNECT-UDP/CONNECT-IP hops.
pub trait TunDevice: Send + Sync {
	fn read_packet(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, CoreError>> + Send;
	fn write_packet(&mut self, packet: &[u8]) -> impl Future<Output = Result<(), CoreError>> + Send;
}

/// `tun`-crate-backed adapter. One `/31` or `/24`-scale point-to-point or
/// shared network per device, matching §4.3/§4.5's subnet requirements.
pub struct AsyncTun {
	device: AsyncDevice,
}

impl AsyncTun {
	/// Creates a TUN device with `address` as its local endpoint and
	/// `netmask` describing the attached subnet (a `/31` for a client hop,
	/// up to a `/24` for the server's shared TUN).
	pub fn create(name: &str, address: Ipv4Addr, netmask: Ipv4Addr, mtu: u16) -> Result<Self, CoreError> {
		let mut config = tun::Configuration::default();
		config.tun_name(name).address(address).netmask(netmask).mtu(mtu).up();

		let device = tun::create_as_async(&config).map_err(|source| {
			TransportErrorSnafu {
				message: format!("failed to create TUN device {name}: {source}"),
			}
			.build()
		})?;
		Ok(Self { device })
	}
}

impl TunDevice for AsyncTun {
	async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, CoreError> {
		self.device.read(buf).await.map_err(|source| {
			TransportErrorSnafu {
				message: format!("TUN read failed: {source}"),
			}
			.build()
		})
	}

	async fn write_packet(&mut self, packet: &[u8]) -> Result<(), CoreError> {
		self.device.write_all(packet).await.map_err(|source| {
			TransportErrorSnafu {
				message: format!("TUN write failed: {source}"),
			}
			.build()
		})
	}
}
