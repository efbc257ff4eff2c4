//! Client-side per-transaction TUN wiring (SPEC_FULL.md §4 addendum): the
//! CONNECT-UDP vs CONNECT-IP asymmetry in *when* a hop's TUN device can be
//! created, grounded in the original `ConnectUDPClient`/`ConnectIPClient`
//! split referenced from the distilled spec.
//!
//! CONNECT-UDP already knows its point-to-point peer from CLI configuration,
//! so the TUN is created the moment the transaction opens. CONNECT-IP does
//! not know its address until the server's ADDRESS_ASSIGN capsule arrives,
//! so TUN creation is deferred to that callback.

use std::{net::Ipv4Addr, sync::Arc};

use masque_core::{error::CoreError, tun::TunDevice};

/// Invoked once per transaction the client opens (spec §4.2
/// `NewTransactionCallback`), letting upper layers such as this wiring bind
/// per-stream state.
pub trait NewTransactionCallback: Send + Sync {
	fn on_new_transaction(&self, stream_id: u64);
}

/// Builds a concrete [`TunDevice`]; kept as a trait so tests can substitute
/// an in-memory fake instead of touching a real kernel TUN interface.
pub trait TunFactory<D: TunDevice>: Send + Sync {
	fn create(&self, name: &str, local: Ipv4Addr, netmask: Ipv4Addr, mtu: u16) -> Result<D, CoreError>;
}

/// Derives the `/31` point-to-point subnet for hop `index` from a base
/// network (e.g. `--tuntap-ip`): `(local, peer)`, two addresses apart.
pub fn point_to_point_subnet(base: Ipv4Addr, index: u8) -> (Ipv4Addr, Ipv4Addr) {
	let base = u32::from(base).wrapping_add((index as u32) * 2);
	(Ipv4Addr::from(base), Ipv4Addr::from(base + 1))
}

/// CONNECT-UDP hop wiring: the TUN device is created immediately, before
/// any data flows, because the destination UDP host/port (hence the TUN's
/// point-to-point peer) is already known from client CLI configuration.
pub struct ConnectUdpTunSpawner<D: TunDevice> {
	factory: Arc<dyn TunFactory<D>>,
	tuntap_ip: Ipv4Addr,
	mtu: u16,
}

impl<D: TunDevice> ConnectUdpTunSpawner<D> {
	pub fn new(factory: Arc<dyn TunFactory<D>>, tuntap_ip: Ipv4Addr, mtu: u16) -> Self {
		Self { factory, tuntap_ip, mtu }
	}

	/// Creates the hop's TUN device; `hop_index` picks this hop's `/31` out
	/// of the configured `--tuntap-ip` network.
	pub fn spawn(&self, name: &str, hop_index: u8) -> Result<D, CoreError> {
		let (local, peer) = point_to_point_subnet(self.tuntap_ip, hop_index);
		let _ = peer;
		self.factory.create(name, local, Ipv4Addr::new(255, 255, 255, 254), self.mtu)
	}
}

/// CONNECT-IP hop wiring: TUN creation is deferred until the client decodes
/// the server's ADDRESS_ASSIGN capsule (a `received-address` callback
/// distinct from `NewTransactionCallback`); until then the transaction has
/// no TUN device and no read callback attached.
pub struct ConnectIpTunSpawner<D: TunDevice> {
	factory: Arc<dyn TunFactory<D>>,
	mtu: u16,
}

impl<D: TunDevice> ConnectIpTunSpawner<D> {
	pub fn new(factory: Arc<dyn TunFactory<D>>, mtu: u16) -> Self {
		Self { factory, mtu }
	}

	/// Fires once an ADDRESS_ASSIGN capsule names this stream's address.
	pub fn on_address_assigned(&self, name: &str, assigned: Ipv4Addr) -> Result<D, CoreError> {
		self.factory.create(name, assigned, Ipv4Addr::new(255, 255, 255, 0), self.mtu)
	}
}

#[cfg(test)]
mod test {
	use std::sync::Mutex;

	use super::*;

	struct FakeTun {
		local: Ipv4Addr,
	}

	impl TunDevice for FakeTun {
		async fn read_packet(&mut self, _buf: &mut [u8]) -> Result<usize, CoreError> {
			std::future::pending().await
		}

		async fn write_packet(&mut self, _packet: &[u8]) -> Result<(), CoreError> {
			Ok(())
		}
	}

	struct RecordingFactory {
		calls: Mutex<Vec<(String, Ipv4Addr, Ipv4Addr, u16)>>,
	}

	impl TunFactory<FakeTun> for RecordingFactory {
		fn create(&self, name: &str, local: Ipv4Addr, netmask: Ipv4Addr, mtu: u16) -> Result<FakeTun, CoreError> {
			self.calls.lock().unwrap().push((name.to_string(), local, netmask, mtu));
			Ok(FakeTun { local })
		}
	}

	#[test]
	fn point_to_point_subnet_advances_by_two_per_hop() {
		let base = Ipv4Addr::new(10, 200, 0, 0);
		assert_eq!(point_to_point_subnet(base, 0), (Ipv4Addr::new(10, 200, 0, 0), Ipv4Addr::new(10, 200, 0, 1)));
		assert_eq!(point_to_point_subnet(base, 1), (Ipv4Addr::new(10, 200, 0, 2), Ipv4Addr::new(10, 200, 0, 3)));
	}

	#[test]
	fn connect_udp_spawner_creates_tun_from_hop_index() {
		let factory = Arc::new(RecordingFactory { calls: Mutex::new(Vec::new()) });
		let spawner = ConnectUdpTunSpawner::new(factory.clone(), Ipv4Addr::new(10, 200, 0, 0), 1500);
		let tun = spawner.spawn("tun-hop0", 0).unwrap();
		assert_eq!(tun.local, Ipv4Addr::new(10, 200, 0, 0));
		assert_eq!(factory.calls.lock().unwrap().len(), 1);
	}

	#[test]
	fn connect_ip_spawner_waits_for_assigned_address() {
		let factory = Arc::new(RecordingFactory { calls: Mutex::new(Vec::new()) });
		let spawner = ConnectIpTunSpawner::new(factory.clone(), 1500);
		assert!(factory.calls.lock().unwrap().is_empty());
		let tun = spawner.on_address_assigned("tun-ip0", Ipv4Addr::new(192, 168, 0, 7)).unwrap();
		assert_eq!(tun.local, Ipv4Addr::new(192, 168, 0, 7));
		assert_eq!(factory.calls.lock().unwrap().len(), 1);
	}
}
