//! The shared TUN router (spec §4.5): one OS TUN device backing every
//! CONNECT-IP stream on the server. Virtual IPs are handed out from an
//! atomic counter; incoming packets are classified by destination address
//! and handed to whichever stream registered that address.

use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use arc_swap::ArcSwap;
use bytes::Bytes;
use masque_core::{
	error::{CoreError, InvalidArgumentSnafu, TransportErrorSnafu},
	packet::parse_addrs,
	tun::TunDevice,
	warn,
};
use portable_atomic::AtomicU8;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex as AsyncMutex;

/// Registered per CONNECT-IP stream; receives packets the shared TUN read
/// loop classifies as destined for that stream's assigned address.
pub trait TunCallback: Send + Sync {
	fn on_packet(&self, packet: Bytes);
}

/// One OS TUN device shared by every IP-mode stream on the server. `D` is
/// the concrete packet source/sink (`masque_core::tun::AsyncTun` in
/// production, an in-memory fake in tests).
pub struct SharedTun<D: TunDevice> {
	device: AsyncMutex<D>,
	subnet_base: Ipv4Addr,
	/// Number of host bits available under the configured netmask; the
	/// counter below must stay below `1 << host_bits`.
	host_bits: u32,
	subnet_counter: AtomicU8,
	callbacks: ArcSwap<HashMap<Ipv4Addr, Arc<dyn TunCallback>>>,
}

impl<D: TunDevice> SharedTun<D> {
	/// `netmask` must describe a prefix of at most /24 (spec §6: "must be a
	/// `.0/N` with `N <= 24`") so a single `u8` counter can enumerate every
	/// host address; violating this is fatal at startup (spec §4.6).
	pub fn new(device: D, subnet_base: Ipv4Addr, prefix_len: u32) -> Result<Self, CoreError> {
		if prefix_len > 24 {
			return InvalidArgumentSnafu {
				message: format!("tuntap-network prefix /{prefix_len} is narrower than the required /24 minimum"),
			}
			.fail();
		}
		Ok(Self {
			device: AsyncMutex::new(device),
			subnet_base,
			host_bits: 32 - prefix_len,
			subnet_counter: AtomicU8::new(1),
			callbacks: ArcSwap::from_pointee(HashMap::new()),
		})
	}

	/// Allocates the next virtual IP and binds `cb` to it atomically. IPs
	/// never repeat during the device's lifetime (spec §3 invariant).
	pub fn register_transaction(&self, cb: Arc<dyn TunCallback>) -> Result<Ipv4Addr, CoreError> {
		let host = self.subnet_counter.fetch_add(1, Ordering::Relaxed);
		if (host as u32) >= (1u32 << self.host_bits) {
			return InvalidArgumentSnafu {
				message: "shared TUN subnet exhausted".to_string(),
			}
			.fail();
		}
		let base = u32::from(self.subnet_base);
		let assigned = Ipv4Addr::from(base | host as u32);

		self.callbacks.rcu(|current| {
			let mut next = (**current).clone();
			next.insert(assigned, cb.clone());
			next
		});
		Ok(assigned)
	}

	/// Removes a stream's callback on transaction teardown.
	pub fn unregister(&self, ip: Ipv4Addr) {
		self.callbacks.rcu(|current| {
			let mut next = (**current).clone();
			next.remove(&ip);
			next
		});
	}

	/// Writes a full IP frame to the TUN unchanged (callers own
	/// source-address correctness, per spec §4.5).
	pub async fn write_packet(&self, packet: &[u8]) -> Result<(), CoreError> {
		self.device.lock().await.write_packet(packet).await
	}

	/// Reads and dispatches one packet from the TUN. Intended to be driven
	/// in a loop by the caller (typically an `AppContext`-tracked task); an
	/// unmapped destination is logged and dropped rather than treated as an
	/// error, per spec §4.6.
	pub async fn pump_once(&self, scratch: &mut [u8]) -> Result<(), CoreError> {
		let n = self.device.lock().await.read_packet(scratch).await?;
		let packet = Bytes::copy_from_slice(&scratch[..n]);
		let addrs = match parse_addrs(&packet) {
			Ok(addrs) => addrs,
			Err(err) => {
				warn!(target: "[shared-tun]", "dropping unparseable packet from TUN: {err}");
				return Ok(());
			}
		};
		let std::net::IpAddr::V4(dst) = addrs.dst else {
			warn!(target: "[shared-tun]", "dropping non-IPv4 packet from TUN");
			return Ok(());
		};
		match self.callbacks.load().get(&dst) {
			Some(cb) => cb.on_packet(packet),
			None => warn!(target: "[shared-tun]", "no stream registered for destination {dst}, dropping"),
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use std::{collections::VecDeque, sync::Mutex as StdMutex};

	use super::*;

	struct FakeTun {
		to_read: StdMutex<VecDeque<Vec<u8>>>,
		written: Arc<StdMutex<Vec<Vec<u8>>>>,
	}

	impl TunDevice for FakeTun {
		async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, CoreError> {
			let packet = self.to_read.lock().unwrap().pop_front().expect("test fed no more packets");
			buf[..packet.len()].copy_from_slice(&packet);
			Ok(packet.len())
		}

		async fn write_packet(&mut self, packet: &[u8]) -> Result<(), CoreError> {
			self.written.lock().unwrap().push(packet.to_vec());
			Ok(())
		}
	}

	fn minimal_ipv4(dst: Ipv4Addr) -> Vec<u8> {
		let mut packet = vec![0u8; 28];
		packet[0] = 0x45;
		packet[9] = 17;
		packet[16..20].copy_from_slice(&dst.octets());
		packet
	}

	struct RecordingCallback(Arc<StdMutex<Vec<Bytes>>>);
	impl TunCallback for RecordingCallback {
		fn on_packet(&self, packet: Bytes) {
			self.0.lock().unwrap().push(packet);
		}
	}

	#[tokio::test]
	async fn assigns_sequential_ips_under_24_subnet() {
		let tun = FakeTun {
			to_read: StdMutex::new(VecDeque::new()),
			written: Arc::new(StdMutex::new(Vec::new())),
		};
		let shared = SharedTun::new(tun, Ipv4Addr::new(192, 168, 0, 0), 24).unwrap();
		let received = Arc::new(StdMutex::new(Vec::new()));
		let ip1 = shared.register_transaction(Arc::new(RecordingCallback(received.clone()))).unwrap();
		let ip2 = shared.register_transaction(Arc::new(RecordingCallback(received.clone()))).unwrap();
		assert_eq!(ip1, Ipv4Addr::new(192, 168, 0, 1));
		assert_eq!(ip2, Ipv4Addr::new(192, 168, 0, 2));
	}

	#[tokio::test]
	async fn rejects_mask_wider_than_slash_24() {
		let tun = FakeTun {
			to_read: StdMutex::new(VecDeque::new()),
			written: Arc::new(StdMutex::new(Vec::new())),
		};
		assert!(SharedTun::new(tun, Ipv4Addr::new(10, 0, 0, 0), 25).is_err());
	}

	#[tokio::test]
	async fn dispatches_packet_to_registered_callback_by_destination() {
		let assigned_ip = Ipv4Addr::new(192, 168, 0, 1);
		let tun = FakeTun {
			to_read: StdMutex::new(VecDeque::from([minimal_ipv4(assigned_ip)])),
			written: Arc::new(StdMutex::new(Vec::new())),
		};
		let shared = SharedTun::new(tun, Ipv4Addr::new(192, 168, 0, 0), 24).unwrap();
		let received = Arc::new(StdMutex::new(Vec::new()));
		let registered_ip = shared.register_transaction(Arc::new(RecordingCallback(received.clone()))).unwrap();
		assert_eq!(registered_ip, assigned_ip);

		let mut scratch = [0u8; 1500];
		shared.pump_once(&mut scratch).await.unwrap();
		assert_eq!(received.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn unmapped_destination_is_dropped_not_errored() {
		let tun = FakeTun {
			to_read: StdMutex::new(VecDeque::from([minimal_ipv4(Ipv4Addr::new(192, 168, 0, 99))])),
			written: Arc::new(StdMutex::new(Vec::new())),
		};
		let shared = SharedTun::new(tun, Ipv4Addr::new(192, 168, 0, 0), 24).unwrap();
		let mut scratch = [0u8; 1500];
		assert!(shared.pump_once(&mut scratch).await.is_ok());
	}
}
