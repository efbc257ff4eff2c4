//! The MASQUE server demultiplexer (spec §4.4): validates incoming
//! CONNECT-UDP/CONNECT-IP requests, binds each accepted stream to either an
//! upstream UDP socket or the shared TUN, and shuttles datagrams/capsules
//! bidirectionally.
//!
//! The HTTP/3 session itself is an out-of-scope collaborator (spec §1): it
//! is captured here as the narrow [`ServerTransaction`] trait so the
//! demultiplexer stays testable without a live QUIC connection, mirroring
//! how `client::h3socket` captures the client-side transaction as
//! [`crate::client::h3socket::H3Transaction`].

use std::{marker::PhantomData, net::Ipv4Addr, sync::Arc};

use bytes::{Bytes, BytesMut};
use masque_core::{
	error::{CoreError, ParseErrorSnafu, ProtocolViolationSnafu},
	info,
	tun::TunDevice,
	varint::decode_varint,
	warn,
};
use snafu::ensure;
use tokio::net::UdpSocket;
use tokio_util::{codec::Decoder, sync::CancellationToken};

use crate::{
	proto::{Address, Capsule, CapsuleCodec, Range},
	server::shared_tun::{SharedTun, TunCallback},
};

/// CONNECT method recognized on the `:protocol` pseudo-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMethod {
	Udp,
	Ip,
}

/// The slice of an incoming CONNECT request the demultiplexer needs; the
/// HTTP/3 library's own request type is adapted into this at the call site.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
	pub method: ConnectMethod,
	pub protocol: Option<String>,
	pub authority: Option<String>,
	pub path: String,
	pub capsule_protocol: bool,
}

/// Validates a CONNECT request against spec §4.4 step 1. On failure,
/// returns the exact reason that should accompany the `400` response; the
/// caller is responsible for not creating a stream in that case.
pub fn validate_connect_request(req: &ConnectRequest) -> Result<(), CoreError> {
	let expected_protocol = match req.method {
		ConnectMethod::Udp => "connect-udp",
		ConnectMethod::Ip => "connect-ip",
	};
	ensure!(
		req.protocol.as_deref() == Some(expected_protocol),
		ProtocolViolationSnafu {
			reason: format!(":protocol must be {expected_protocol}"),
		}
	);
	ensure!(
		req.authority.is_some(),
		ProtocolViolationSnafu {
			reason: "missing :authority / Host",
		}
	);
	ensure!(
		req.capsule_protocol,
		ProtocolViolationSnafu {
			reason: "missing capsule-protocol: ?1",
		}
	);
	match req.method {
		ConnectMethod::Udp => ensure!(
			req.path.starts_with("/.well-known/masque/udp/"),
			ProtocolViolationSnafu {
				reason: "path must begin with /.well-known/masque/udp/",
			}
		),
		ConnectMethod::Ip => ensure!(
			req.path.starts_with("/.well-known/masque/ip"),
			ProtocolViolationSnafu {
				reason: "path must begin with /.well-known/masque/ip",
			}
		),
	}
	Ok(())
}

/// Parses the last two path segments of a CONNECT-UDP request as
/// `target_ip/target_port` (spec §6 path grammar).
pub fn parse_udp_target(path: &str) -> Result<std::net::SocketAddr, CoreError> {
	let mut segments = path.trim_end_matches('/').rsplit('/');
	let port: u16 = segments
		.next()
		.ok_or_else(|| ParseErrorSnafu { what: "connect-udp path", message: "missing port segment" }.build())?
		.parse()
		.map_err(|_| ParseErrorSnafu { what: "connect-udp path", message: "port segment is not a u16" }.build())?;
	let host = segments
		.next()
		.ok_or_else(|| ParseErrorSnafu { what: "connect-udp path", message: "missing host segment" }.build())?;
	let ip: std::net::IpAddr = host
		.parse()
		.map_err(|_| ParseErrorSnafu { what: "connect-udp path", message: "host segment is not an IP literal" }.build())?;
	Ok(std::net::SocketAddr::new(ip, port))
}

/// Narrow contract consumed from the HTTP/3 session library on the server
/// side: enough to answer the CONNECT request and carry datagrams/capsules
/// once accepted.
pub trait ServerTransaction: Send + Sync + 'static {
	fn send_response(&self, status: u16, capsule_protocol: bool) -> impl Future<Output = Result<(), CoreError>> + Send;
	fn send_datagram(&self, data: Bytes) -> Result<(), CoreError>;
	fn send_capsule(&self, data: Bytes) -> impl Future<Output = Result<(), CoreError>> + Send;
	fn max_datagram_size(&self) -> usize;
}

/// Per-accepted-transaction entity (spec §3 `TunnelStream`). `D` is the
/// shared TUN's concrete packet source/sink.
pub enum TunnelStream<D: TunDevice> {
	Udp { target: std::net::SocketAddr, socket: Arc<UdpSocket> },
	Ip { tun: Arc<SharedTun<D>>, assigned_ip: Ipv4Addr },
}

impl<D: TunDevice> Drop for TunnelStream<D> {
	fn drop(&mut self) {
		if let Self::Ip { tun, assigned_ip } = self {
			tun.unregister(*assigned_ip);
		}
	}
}

/// Forwards packets read from the shared TUN back to the owning stream's
/// HTTP/3 transaction, prefixing the tunneled-data context-id (spec §4.4
/// egress path).
struct IpEgressCallback<T: ServerTransaction + Clone> {
	transaction: T,
}

impl<T: ServerTransaction + Clone> TunCallback for IpEgressCallback<T> {
	fn on_packet(&self, packet: Bytes) {
		let mut framed = BytesMut::with_capacity(packet.len() + 1);
		masque_core::varint::encode_varint(0, &mut framed).expect("context-id 0 fits in a varint");
		framed.extend_from_slice(&packet);
		if let Err(err) = self.transaction.send_datagram(framed.freeze()) {
			warn!(target: "[demux]", "failed to forward TUN packet to client: {err}");
		}
	}
}

/// Accepts and dispatches CONNECT-UDP/CONNECT-IP streams on one HTTP/3
/// session. `T` is the per-stream transaction handle, `D` the shared TUN's
/// packet source/sink.
pub struct Demultiplexer<T: ServerTransaction, D: TunDevice> {
	streams: moka::future::Cache<u64, Arc<TunnelStream<D>>>,
	shared_tun: Arc<SharedTun<D>>,
	cancel: CancellationToken,
	_transaction: PhantomData<fn() -> T>,
}

impl<T: ServerTransaction + Clone, D: TunDevice + 'static> Demultiplexer<T, D> {
	pub fn new(shared_tun: Arc<SharedTun<D>>, cancel: CancellationToken) -> Self {
		Self {
			streams: moka::future::Cache::builder().build(),
			shared_tun,
			cancel,
			_transaction: PhantomData,
		}
	}

	/// Spec §4.4 steps 1-4: validate, create the `TunnelStream`, reply, and
	/// (CONNECT-IP only) send the initial ADDRESS_ASSIGN.
	pub async fn on_headers_complete(&self, stream_id: u64, req: ConnectRequest, transaction: T) -> Result<(), CoreError> {
		if let Err(err) = validate_connect_request(&req) {
			let reason = err.to_string();
			let _ = transaction.send_response(400, false).await;
			warn!(target: "[demux]", "rejected stream {stream_id}: {reason}");
			return Err(err);
		}

		match req.method {
			ConnectMethod::Udp => {
				let target = parse_udp_target(&req.path)?;
				let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
					.await
					.map_err(|source| masque_core::error::TransportErrorSnafu { message: source.to_string() }.build())?;
				socket
					.connect(target)
					.await
					.map_err(|source| masque_core::error::TransportErrorSnafu { message: source.to_string() }.build())?;
				let socket = Arc::new(socket);

				self.spawn_udp_egress(stream_id, socket.clone(), transaction.clone());
				self.streams.insert(stream_id, Arc::new(TunnelStream::Udp { target, socket })).await;
				transaction.send_response(200, true).await?;
				info!(target: "[demux]", "stream {stream_id} bound to upstream UDP {target}");
			}
			ConnectMethod::Ip => {
				let cb: Arc<dyn TunCallback> = Arc::new(IpEgressCallback { transaction: transaction.clone() });
				let assigned_ip = self.shared_tun.register_transaction(cb)?;
				self.streams
					.insert(
						stream_id,
						Arc::new(TunnelStream::Ip {
							tun: self.shared_tun.clone(),
							assigned_ip,
						}),
					)
					.await;
				transaction.send_response(200, true).await?;
				let assign = Capsule::AddressAssign(vec![Address {
					request_id: 0,
					ip: assigned_ip.into(),
					prefix_len: 32,
				}]);
				transaction.send_capsule(encode_capsule(assign)).await?;
				info!(target: "[demux]", "stream {stream_id} assigned IP {assigned_ip}");
			}
		}
		Ok(())
	}

	fn spawn_udp_egress(&self, stream_id: u64, socket: Arc<UdpSocket>, transaction: T) {
		let cancel = self.cancel.child_token();
		tokio::spawn(async move {
			let mut buf = vec![0u8; 64 * 1024];
			loop {
				tokio::select! {
					biased;
					_ = cancel.cancelled() => break,
					result = socket.recv(&mut buf) => {
						let n = match result {
							Ok(n) => n,
							Err(err) => {
								warn!(target: "[demux]", "upstream socket error on stream {stream_id}: {err}");
								break;
							}
						};
						let mut framed = BytesMut::with_capacity(n + 1);
						masque_core::varint::encode_varint(0, &mut framed).expect("context-id 0 fits in a varint");
						framed.extend_from_slice(&buf[..n]);
						if let Err(err) = transaction.send_datagram(framed.freeze()) {
							warn!(target: "[demux]", "failed to forward upstream datagram on stream {stream_id}: {err}");
						}
					}
				}
			}
		});
	}

	/// Ingress datagram path (spec §4.4): strip and validate the context-id,
	/// then forward to the stream's upstream socket or the shared TUN.
	pub async fn on_datagram(&self, stream_id: u64, mut data: Bytes) {
		let Some((ctx_id, consumed)) = decode_varint(&mut data) else {
			warn!(target: "[demux]", "dropping datagram on stream {stream_id}: truncated context-id");
			return;
		};
		if ctx_id != 0 {
			return;
		}
		let _ = consumed;
		let payload = data;

		let Some(stream) = self.streams.get(&stream_id).await else {
			return;
		};
		match stream.as_ref() {
			TunnelStream::Udp { socket, .. } => {
				if let Err(err) = socket.send(&payload).await {
					warn!(target: "[demux]", "upstream send failed on stream {stream_id}: {err}");
				}
			}
			TunnelStream::Ip { tun, .. } => {
				if let Err(err) = tun.write_packet(&payload).await {
					warn!(target: "[demux]", "shared TUN write failed on stream {stream_id}: {err}");
				}
			}
		}
	}

	/// Ingress body path (spec §4.4), CONNECT-IP only: decode every capsule
	/// in `buf` and act on it. Malformed trailing bytes are dropped without
	/// closing the stream (spec §4.6).
	pub async fn on_body(&self, stream_id: u64, mut buf: BytesMut, transaction: &T) {
		let Some(stream) = self.streams.get(&stream_id).await else {
			return;
		};
		let TunnelStream::Ip { tun, assigned_ip } = stream.as_ref() else {
			warn!(target: "[demux]", "capsule body on a non-IP stream {stream_id}, dropping");
			return;
		};

		let mut codec = CapsuleCodec;
		loop {
			match codec.decode(&mut buf) {
				Ok(Some(Capsule::Data(data))) => {
					if let Err(err) = tun.write_packet(&data).await {
						warn!(target: "[demux]", "shared TUN write failed on stream {stream_id}: {err}");
					}
				}
				Ok(Some(Capsule::AddressRequest(requested))) => {
					// Open Question #2 (spec §9): always return the
					// already-assigned IP, ignoring the requested value.
					let assign = Capsule::AddressAssign(
						requested
							.into_iter()
							.map(|addr| Address {
								request_id: addr.request_id,
								ip: (*assigned_ip).into(),
								prefix_len: 32,
							})
							.collect(),
					);
					if let Err(err) = transaction.send_capsule(encode_capsule(assign)).await {
						warn!(target: "[demux]", "failed to reply to ADDRESS_REQUEST on stream {stream_id}: {err}");
						continue;
					}
					let routes = Capsule::RouteAdvertisement(vec![Range {
						start: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
						end: std::net::IpAddr::V4(std::net::Ipv4Addr::new(255, 255, 255, 255)),
					}]);
					if let Err(err) = transaction.send_capsule(encode_capsule(routes)).await {
						warn!(target: "[demux]", "failed to send ROUTE_ADVERTISEMENT on stream {stream_id}: {err}");
					}
				}
				Ok(Some(Capsule::AddressAssign(_) | Capsule::RouteAdvertisement(_))) => {
					// Informational from the client; accepted and ignored.
				}
				Ok(Some(Capsule::Unknown(cap_type))) => {
					info!(target: "[demux]", "discarding unknown capsule type {cap_type} on stream {stream_id}");
				}
				Ok(None) => break,
				Err(err) => {
					warn!(target: "[demux]", "dropping malformed capsule on stream {stream_id}: {err}");
					break;
				}
			}
		}
	}

	/// Removes a stream on transaction end, peer reset, or idle timeout
	/// (spec §3 `TunnelStream` lifecycle).
	pub async fn on_stream_closed(&self, stream_id: u64) {
		self.streams.invalidate(&stream_id).await;
	}

	/// Graceful connection shutdown (spec §4.2 "close", server side):
	/// invalidates every open stream, which drops each `TunnelStream` and
	/// (for CONNECT-IP streams) unregisters its assigned address from the
	/// shared TUN rather than waiting for the peer to reset it.
	pub fn shutdown(&self) {
		self.streams.invalidate_all();
	}
}

fn encode_capsule(capsule: Capsule) -> Bytes {
	use tokio_util::codec::Encoder;
	let mut dst = BytesMut::new();
	CapsuleCodec.encode(capsule, &mut dst).expect("capsule encoding is infallible for well-formed values");
	dst.freeze()
}

#[cfg(test)]
mod test {
	use std::sync::Mutex as StdMutex;

	use super::*;

	fn udp_request(path: &str) -> ConnectRequest {
		ConnectRequest {
			method: ConnectMethod::Udp,
			protocol: Some("connect-udp".to_string()),
			authority: Some("proxy.example".to_string()),
			path: path.to_string(),
			capsule_protocol: true,
		}
	}

	#[test]
	fn valid_connect_udp_request_passes() {
		assert!(validate_connect_request(&udp_request("/.well-known/masque/udp/127.0.0.1/9000")).is_ok());
	}

	#[test]
	fn rejects_missing_capsule_protocol() {
		let mut req = udp_request("/.well-known/masque/udp/127.0.0.1/9000");
		req.capsule_protocol = false;
		assert!(validate_connect_request(&req).is_err());
	}

	#[test]
	fn rejects_wrong_protocol_header() {
		let mut req = udp_request("/.well-known/masque/udp/127.0.0.1/9000");
		req.protocol = Some("connect-ip".to_string());
		assert!(validate_connect_request(&req).is_err());
	}

	#[test]
	fn rejects_bad_path_prefix() {
		assert!(validate_connect_request(&udp_request("/nope/127.0.0.1/9000")).is_err());
	}

	#[test]
	fn parses_last_two_path_segments_as_target() {
		let target = parse_udp_target("/.well-known/masque/udp/192.0.2.1/53").unwrap();
		assert_eq!(target, "192.0.2.1:53".parse().unwrap());
	}

	struct RecordingTransaction {
		responses: StdMutex<Vec<(u16, bool)>>,
		datagrams: StdMutex<Vec<Bytes>>,
		capsules: StdMutex<Vec<Bytes>>,
	}

	impl ServerTransaction for Arc<RecordingTransaction> {
		async fn send_response(&self, status: u16, capsule_protocol: bool) -> Result<(), CoreError> {
			self.responses.lock().unwrap().push((status, capsule_protocol));
			Ok(())
		}

		fn send_datagram(&self, data: Bytes) -> Result<(), CoreError> {
			self.datagrams.lock().unwrap().push(data);
			Ok(())
		}

		async fn send_capsule(&self, data: Bytes) -> Result<(), CoreError> {
			self.capsules.lock().unwrap().push(data);
			Ok(())
		}

		fn max_datagram_size(&self) -> usize {
			1200
		}
	}

	struct NullTun;
	impl TunDevice for NullTun {
		async fn read_packet(&mut self, _buf: &mut [u8]) -> Result<usize, CoreError> {
			std::future::pending().await
		}

		async fn write_packet(&mut self, _packet: &[u8]) -> Result<(), CoreError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn connect_ip_assigns_address_and_sends_capsule() {
		let shared_tun = Arc::new(SharedTun::new(NullTun, Ipv4Addr::new(192, 168, 0, 0), 24).unwrap());
		let demux: Demultiplexer<Arc<RecordingTransaction>, NullTun> = Demultiplexer::new(shared_tun, CancellationToken::new());
		let transaction = Arc::new(RecordingTransaction {
			responses: StdMutex::new(Vec::new()),
			datagrams: StdMutex::new(Vec::new()),
			capsules: StdMutex::new(Vec::new()),
		});
		let req = ConnectRequest {
			method: ConnectMethod::Ip,
			protocol: Some("connect-ip".to_string()),
			authority: Some("proxy.example".to_string()),
			path: "/.well-known/masque/ip".to_string(),
			capsule_protocol: true,
		};
		demux.on_headers_complete(1, req, transaction.clone()).await.unwrap();
		assert_eq!(transaction.responses.lock().unwrap().as_slice(), &[(200, true)]);
		assert_eq!(transaction.capsules.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn invalid_request_gets_400_and_no_stream() {
		let shared_tun = Arc::new(SharedTun::new(NullTun, Ipv4Addr::new(192, 168, 0, 0), 24).unwrap());
		let demux: Demultiplexer<Arc<RecordingTransaction>, NullTun> = Demultiplexer::new(shared_tun, CancellationToken::new());
		let transaction = Arc::new(RecordingTransaction {
			responses: StdMutex::new(Vec::new()),
			datagrams: StdMutex::new(Vec::new()),
			capsules: StdMutex::new(Vec::new()),
		});
		let mut req = udp_request("/.well-known/masque/udp/127.0.0.1/9000");
		req.capsule_protocol = false;
		assert!(demux.on_headers_complete(1, req, transaction.clone()).await.is_err());
		assert_eq!(transaction.responses.lock().unwrap().as_slice(), &[(400, false)]);
		assert!(demux.streams.get(&1).await.is_none());
	}
}
