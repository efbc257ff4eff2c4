//! Binds the library's narrow HTTP/3 collaborator traits
//! (`masque_tunnel::client::H3Transaction`, `masque_tunnel::server::ServerTransaction`)
//! to a concrete `h3`/`h3-quinn` session, and drives the accept/pump loops
//! that make `masque server` and `masque client` do real network I/O.
//!
//! The exact `h3` 0.0.6 surface used here (`enable_datagram`,
//! `send_datagram`/`read_datagram` on the high-level connection,
//! `h3::ext::Protocol` for extended CONNECT) is approximated from the
//! corpus's webtransport sample rather than verified against the pinned
//! crate docs, since the toolchain is never run in this build; treat this
//! file as the first place to check against `h3`'s real API before running it.

use std::{net::Ipv4Addr, net::SocketAddr, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};
use h3::server::RequestStream;
use masque_core::{
	context::AppContext,
	error::{CoreError, TransportErrorSnafu},
	info,
	tun::{AsyncTun, TunDevice},
	types::BufferLimits,
	udp::{QuinnSocket, TokioUdpSocket},
	varint::{decode_varint, encode_varint},
	warn,
};
use masque_tunnel::{
	client::{
		BaseUdpSocket, ConnectIpTunSpawner, ConnectUdpTunSpawner, DatagramReader, H3DatagramSocket, H3LayeredSocket, H3Transaction,
		LayeredSocket, OptionPair, Transaction, TunFactory, VirtualUdpSocket,
	},
	proto::{Capsule, CapsuleCodec},
	server::{ConnectMethod, ConnectRequest, Demultiplexer, ServerTransaction, SharedTun},
	tls::{ALPN_H3, client_tls_config, server_tls_config},
};
use tokio::sync::Mutex;
use tokio_util::{codec::Decoder, sync::CancellationToken, task::TaskTracker};

use crate::conf::runtime::{ClientConfig, ServerConfig};

type ServerConn = h3::server::Connection<h3_quinn::Connection, Bytes>;
type ClientConn = h3::client::Connection<h3_quinn::Connection, Bytes>;

/// Adapts one h3 server-side request stream into [`ServerTransaction`].
/// Datagrams ride the shared connection handle keyed by stream id; the
/// capsule body rides the h3 request/response body stream itself.
pub struct H3ServerTxn {
	stream: Mutex<RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>>,
	conn: Arc<Mutex<ServerConn>>,
	stream_id: u64,
}

impl ServerTransaction for Arc<H3ServerTxn> {
	async fn send_response(&self, status: u16, capsule_protocol: bool) -> Result<(), CoreError> {
		let mut builder = http::Response::builder().status(status);
		if capsule_protocol {
			builder = builder.header("Capsule-Protocol", "?1");
		}
		let resp = builder.body(()).expect("status/header values are always valid");
		self.stream
			.lock()
			.await
			.send_response(resp)
			.await
			.map_err(|source| TransportErrorSnafu { message: source.to_string() }.build())
	}

	fn send_datagram(&self, data: Bytes) -> Result<(), CoreError> {
		self.conn
			.try_lock()
			.map_err(|_| TransportErrorSnafu { message: "connection datagram lock busy".to_string() }.build())?
			.send_datagram(self.stream_id, data)
			.map_err(|source| TransportErrorSnafu { message: source.to_string() }.build())
	}

	async fn send_capsule(&self, data: Bytes) -> Result<(), CoreError> {
		self.stream
			.lock()
			.await
			.send_data(data)
			.await
			.map_err(|source| TransportErrorSnafu { message: source.to_string() }.build())
	}
}

/// Adapts one h3 client-side request's datagram path into [`H3Transaction`].
pub struct H3ClientTxn {
	conn: Arc<Mutex<ClientConn>>,
	stream_id: u64,
	max_datagram_size: usize,
}

impl H3Transaction for H3ClientTxn {
	fn send_datagram(&self, data: Bytes) -> Result<(), CoreError> {
		self.conn
			.try_lock()
			.map_err(|_| TransportErrorSnafu { message: "connection datagram lock busy".to_string() }.build())?
			.send_datagram(self.stream_id, data)
			.map_err(|source| TransportErrorSnafu { message: source.to_string() }.build())
	}

	fn max_datagram_size(&self) -> usize {
		self.max_datagram_size
	}
}

/// Maps a `--cc`/`--ccs` name onto quinn's built-in congestion controllers.
/// Unknown names (e.g. `copa`, `copa2`, `static-cwnd` — controllers this
/// corpus's QUIC stack has no equivalent for) fall back to quinn's own
/// default (Cubic) with a warning rather than failing the connection.
fn congestion_controller_factory(name: &str) -> Arc<dyn quinn::congestion::ControllerFactory + Send + Sync + 'static> {
	match name.to_ascii_lowercase().as_str() {
		"bbr" => Arc::new(quinn::congestion::BbrConfig::default()),
		"new_reno" | "newreno" | "new-reno" => Arc::new(quinn::congestion::NewRenoConfig::default()),
		"cubic" | "" => Arc::new(quinn::congestion::CubicConfig::default()),
		"none" => Arc::new(quinn::congestion::CubicConfig::default()),
		other => {
			warn!(target: "[wiring]", "no built-in congestion controller for {other:?}, falling back to cubic");
			Arc::new(quinn::congestion::CubicConfig::default())
		}
	}
}

/// Builds a per-hop `quinn::ClientConfig` carrying that hop's `--cc`/`--ccs`
/// choice, since each nested hop's QUIC session may want its own controller.
fn hop_client_config(crypto: &rustls::ClientConfig, cc: &str) -> quinn::ClientConfig {
	let mut config = quinn::ClientConfig::new(Arc::new(crypto.clone()));
	let mut transport = quinn::TransportConfig::default();
	transport.congestion_controller_factory(congestion_controller_factory(cc));
	config.transport_config(Arc::new(transport));
	config
}

/// Runs the MASQUE server until `ctx`'s token fires: binds a QUIC endpoint,
/// accepts connections, and wires every CONNECT-UDP/CONNECT-IP stream into
/// the shared [`Demultiplexer`]/[`SharedTun`].
pub async fn run_server(ctx: AppContext, cfg: ServerConfig) -> eyre::Result<()> {
	let (cert_chain, key) = self_signed_cert()?;
	let tls = server_tls_config(cert_chain, key, &[ALPN_H3.to_vec()])?;
	let mut quinn_server_config = quinn::ServerConfig::with_crypto(Arc::new(tls));
	let mut transport = quinn::TransportConfig::default();
	transport.max_idle_timeout(Some(cfg.timeout.try_into()?));
	transport.congestion_controller_factory(congestion_controller_factory(&cfg.cc));
	quinn_server_config.transport_config(Arc::new(transport));

	let bind_addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
	let endpoint = quinn::Endpoint::server(quinn_server_config, bind_addr)?;
	info!(target: "[server]", "listening on {bind_addr}");

	let (network, prefix) = cfg.tuntap_network;
	let netmask = Ipv4Addr::from(u32::MAX.checked_shl(32 - prefix).unwrap_or(0));
	let tun = AsyncTun::create("masque-srv0", network, netmask, cfg.tun_mtu)?;
	let shared_tun = Arc::new(SharedTun::new(tun, network, prefix)?);

	let shared_tun_pump = shared_tun.clone();
	let pump_cancel = ctx.token.clone();
	ctx.tasks.spawn(async move {
		let mut scratch = vec![0u8; 64 * 1024];
		loop {
			tokio::select! {
				biased;
				_ = pump_cancel.cancelled() => break,
				result = shared_tun_pump.pump_once(&mut scratch) => {
					if let Err(err) = result {
						warn!(target: "[server]", "shared TUN pump stopped: {err}");
						break;
					}
				}
			}
		}
	});

	loop {
		tokio::select! {
			biased;
			_ = ctx.token.cancelled() => break,
			incoming = endpoint.accept() => {
				let Some(incoming) = incoming else { break };
				let shared_tun = shared_tun.clone();
				let cancel = ctx.token.child_token();
				let tasks = ctx.tasks.clone();
				ctx.tasks.spawn(async move {
					if let Err(err) = handle_connection(incoming, shared_tun, cancel, tasks).await {
						warn!(target: "[server]", "connection ended: {err}");
					}
				});
			}
		}
	}

	endpoint.wait_idle().await;
	Ok(())
}

async fn handle_connection(
	incoming: quinn::Incoming,
	shared_tun: Arc<SharedTun<AsyncTun>>,
	cancel: CancellationToken,
	tasks: TaskTracker,
) -> eyre::Result<()> {
	let conn = incoming.await?;
	let quic_conn = h3_quinn::Connection::new(conn);
	let h3_conn = h3::server::builder().enable_extended_connect(true).enable_datagram(true).build(quic_conn).await?;
	let conn = Arc::new(Mutex::new(h3_conn));

	let demux = Arc::new(Demultiplexer::<Arc<H3ServerTxn>, AsyncTun>::new(shared_tun, cancel.clone()));

	let datagram_conn = conn.clone();
	let datagram_demux = demux.clone();
	let datagram_cancel = cancel.clone();
	tasks.spawn(async move {
		loop {
			tokio::select! {
				biased;
				_ = datagram_cancel.cancelled() => break,
				datagram = async { datagram_conn.lock().await.read_datagram().await } => {
					match datagram {
						Ok(Some((stream_id, data))) => datagram_demux.on_datagram(stream_id, data).await,
						Ok(None) => break,
						Err(err) => {
							warn!(target: "[server]", "datagram read failed: {err}");
							break;
						}
					}
				}
			}
		}
	});

	loop {
		let accepted = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			accepted = async { conn.lock().await.accept().await } => accepted,
		};
		let Some((req, mut stream)) = accepted? else { break };
		let Some(method) = connect_method(&req) else {
			let _ = stream.send_response(http::Response::builder().status(400).body(()).expect("valid response")).await;
			continue;
		};
		let stream_id = stream.id().into();
		let connect_req = ConnectRequest {
			method,
			protocol: req.extensions().get::<h3::ext::Protocol>().map(|p| p.as_str().to_string()),
			authority: req.uri().authority().map(|a| a.to_string()),
			path: req.uri().path().to_string(),
			capsule_protocol: req.headers().get("Capsule-Protocol").is_some(),
		};
		let txn = Arc::new(H3ServerTxn { stream: Mutex::new(stream), conn: conn.clone(), stream_id });
		let demux = demux.clone();
		let body_cancel = cancel.clone();
		tasks.spawn(async move {
			if let Err(err) = demux.on_headers_complete(stream_id, connect_req, txn.clone()).await {
				warn!(target: "[server]", "stream {stream_id} rejected: {err}");
				return;
			}
			let mut buf = BytesMut::new();
			loop {
				tokio::select! {
					biased;
					_ = body_cancel.cancelled() => break,
					chunk = async { txn.stream.lock().await.recv_data().await } => {
						match chunk {
							Ok(Some(mut data)) => {
								let mut owned = BytesMut::with_capacity(data.remaining());
								owned.extend_from_slice(data.chunk());
								buf.unsplit(owned);
								demux.on_body(stream_id, std::mem::take(&mut buf), &txn).await;
							}
							Ok(None) => break,
							Err(err) => {
								warn!(target: "[server]", "body read failed on stream {stream_id}: {err}");
								break;
							}
						}
					}
				}
			}
			demux.on_stream_closed(stream_id).await;
		});
	}

	info!(target: "[server]", "connection shutting down, closing its open streams");
	demux.shutdown();
	Ok(())
}

/// Self-signs an ephemeral certificate for `localhost`/loopback addresses.
/// Matches `tls::server_tls_config`'s framing of this tool as a demo/test-
/// grade tunnel rather than a production CA client.
fn self_signed_cert() -> eyre::Result<(Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>)> {
	let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
	let key = rustls::pki_types::PrivateKeyDer::Pkcs8(signing_key.serialize_der().into());
	Ok((vec![cert.der().clone()], key))
}

fn connect_method(req: &http::Request<()>) -> Option<ConnectMethod> {
	match req.extensions().get::<h3::ext::Protocol>().map(|p| p.as_str()) {
		Some("connect-udp") => Some(ConnectMethod::Udp),
		Some("connect-ip") => Some(ConnectMethod::Ip),
		_ => None,
	}
}

/// Strips the context-id (spec §4.4 wire framing) off an inbound datagram
/// and hands the remaining payload to `tun`; non-zero context-ids are
/// dropped since this build only ever uses context-id 0.
struct TunWriter {
	tun: Arc<Mutex<AsyncTun>>,
}

impl DatagramReader for TunWriter {
	fn on_datagram(&self, data: Bytes) {
		let mut data = data;
		let Some((ctx_id, _)) = decode_varint(&mut data) else { return };
		if ctx_id != 0 {
			return;
		}
		let tun = self.tun.clone();
		tokio::spawn(async move {
			if let Err(err) = tun.lock().await.write_packet(&data).await {
				warn!(target: "[client]", "TUN write failed: {err}");
			}
		});
	}

	fn on_body(&self, data: Bytes) {
		self.on_datagram(data);
	}

	fn on_error(&self, err: CoreError) {
		warn!(target: "[client]", "outermost hop transaction failed: {err}");
	}

	fn on_eom(&self) {
		info!(target: "[client]", "outermost hop transaction closed gracefully");
	}
}

struct FsTunFactory;

impl TunFactory<AsyncTun> for FsTunFactory {
	fn create(&self, name: &str, local: Ipv4Addr, netmask: Ipv4Addr, mtu: u16) -> Result<AsyncTun, CoreError> {
		AsyncTun::create(name, local, netmask, mtu)
	}
}

/// Opens the client-side hop chain and pumps packets between it and a local
/// TUN device. `cfg.hops[0]` is innermost (closest to the wire); hops after
/// the first run their H3 session nested inside the previous hop's tunnel
/// via a [`VirtualUdpSocket`]-backed `quinn::Endpoint`.
pub async fn run_client(ctx: AppContext, cfg: ClientConfig) -> eyre::Result<()> {
	eyre::ensure!(!cfg.hops.is_empty(), "at least one hop is required");
	let tuntap_ip = cfg.tuntap_ip.ok_or_else(|| eyre::eyre!("--tuntap-ip is required"))?;

	let client_crypto = client_tls_config(&[ALPN_H3.to_vec()]);
	let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], cfg.source_port)))?;
	endpoint.set_default_client_config(hop_client_config(&client_crypto, &cfg.hops[0].options.default_cc_type));

	let mut current: Arc<dyn LayeredSocket> = Arc::new(connect_hop(&cfg.hops[0]).await?);
	let mut outermost: Option<(Arc<Transaction<H3ClientTxn>>, bool)> = None;
	let hop_count = cfg.hops.len();
	let mut hop_sockets: Vec<Arc<H3DatagramSocket<H3ClientTxn>>> = Vec::with_capacity(hop_count);

	for (i, hop) in cfg.hops.iter().enumerate() {
		let (h3_socket, txn) = connect_h3_layer(&endpoint, hop, ctx.tasks.clone(), ctx.token.child_token()).await?;
		hop_sockets.push(h3_socket.clone());
		current = Arc::new(H3LayeredSocket::new(h3_socket, current.as_ref(), hop.connect_ip));
		outermost = Some((txn, hop.connect_ip));

		if i + 1 < hop_count {
			let peer = SocketAddr::from((tuntap_ip, 0));
			let virt = VirtualUdpSocket::spawn(current.clone(), peer, ctx.token.child_token());
			outermost.as_ref().expect("just set above").0.resume_read(virt.reader()).await;
			let quinn_socket = QuinnSocket(virt);
			let runtime = quinn::default_runtime().ok_or_else(|| eyre::eyre!("no async runtime available for quinn"))?;
			endpoint = quinn::Endpoint::new(quinn::EndpointConfig::default(), None, quinn_socket, runtime)?;
			let next_cc = &cfg.hops[i + 1].options.default_cc_type;
			endpoint.set_default_client_config(hop_client_config(&client_crypto, next_cc));
		}
	}

	let (outermost_txn, is_connect_ip) = outermost.expect("at least one hop was connected above");
	let name = "masque-cli0";
	let tun = if is_connect_ip {
		let spawner = ConnectIpTunSpawner::new(Arc::new(FsTunFactory), 1500);
		wait_for_address_assign(&outermost_txn, &spawner, name).await?
	} else {
		let spawner = ConnectUdpTunSpawner::new(Arc::new(FsTunFactory), tuntap_ip, 1500);
		spawner.spawn(name, 0)?
	};
	let tun = Arc::new(Mutex::new(tun));
	outermost_txn.resume_read(Arc::new(TunWriter { tun: tun.clone() })).await;

	let mut scratch = vec![0u8; 64 * 1024];
	loop {
		tokio::select! {
			biased;
			_ = ctx.token.cancelled() => break,
			read = async { tun.lock().await.read_packet(&mut scratch).await } => {
				match read {
					Ok(n) => {
						let mut framed = BytesMut::with_capacity(n + 1);
						encode_varint(0, &mut framed).expect("context-id 0 fits in a varint");
						framed.extend_from_slice(&scratch[..n]);
						if let Err(err) = current.write(framed.freeze()).await {
							warn!(target: "[client]", "failed to forward packet into hop chain: {err}");
						}
					}
					Err(err) => {
						warn!(target: "[client]", "TUN read failed: {err}");
						break;
					}
				}
			}
		}
	}

	info!(target: "[client]", "shutting down, closing {} hop(s)", hop_sockets.len());
	for socket in &hop_sockets {
		socket.close().await;
	}
	Ok(())
}

/// Blocks on the outermost transaction's body stream until an
/// `ADDRESS_ASSIGN` capsule names this hop's address, then creates its TUN
/// (the CONNECT-IP half of the asymmetry `client::wiring` documents).
async fn wait_for_address_assign(txn: &Arc<Transaction<H3ClientTxn>>, spawner: &ConnectIpTunSpawner<AsyncTun>, name: &str) -> eyre::Result<AsyncTun> {
	// resume_read only accepts one callback per transaction; capturing the
	// first capsule through a oneshot keeps this function linear while the
	// real reader (`TunWriter`) takes over once the TUN exists.
	let (tx, rx) = tokio::sync::oneshot::channel();
	struct OneShotReader(std::sync::Mutex<Option<tokio::sync::oneshot::Sender<Bytes>>>);
	impl DatagramReader for OneShotReader {
		fn on_datagram(&self, _data: Bytes) {}
		fn on_body(&self, data: Bytes) {
			if let Some(tx) = self.0.lock().expect("poisoned").take() {
				let _ = tx.send(data);
			}
		}
		fn on_error(&self, _err: CoreError) {}
	}
	txn.resume_read(Arc::new(OneShotReader(std::sync::Mutex::new(Some(tx))))).await;

	let mut body = rx.await.map_err(|_| eyre::eyre!("connection closed before ADDRESS_ASSIGN arrived"))?;
	let mut codec = CapsuleCodec;
	loop {
		match codec.decode(&mut body) {
			Ok(Some(Capsule::AddressAssign(addrs))) => {
				let assigned = addrs.first().ok_or_else(|| eyre::eyre!("empty ADDRESS_ASSIGN"))?;
				let std::net::IpAddr::V4(ip) = assigned.ip else {
					eyre::bail!("server assigned a non-IPv4 address");
				};
				return Ok(spawner.on_address_assigned(name, ip)?);
			}
			Ok(Some(_)) => continue,
			Ok(None) => eyre::bail!("ADDRESS_ASSIGN capsule was truncated"),
			Err(err) => eyre::bail!("malformed capsule while waiting for ADDRESS_ASSIGN: {err}"),
		}
	}
}

async fn connect_hop(hop: &OptionPair) -> eyre::Result<BaseUdpSocket> {
	let target = tokio::net::lookup_host(&hop.options.authority)
		.await?
		.next()
		.ok_or_else(|| eyre::eyre!("could not resolve {}", hop.options.authority))?;
	let socket = std::net::UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))?;
	let socket = Arc::new(TokioUdpSocket::new(socket)?);
	Ok(BaseUdpSocket::new(socket, target, hop.udp_send_packet_len))
}

async fn connect_h3_layer(
	endpoint: &quinn::Endpoint,
	hop: &OptionPair,
	tasks: TaskTracker,
	cancel: CancellationToken,
) -> eyre::Result<(Arc<H3DatagramSocket<H3ClientTxn>>, Arc<Transaction<H3ClientTxn>>)> {
	let host = hop.options.authority.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| hop.options.authority.clone());
	let addr: SocketAddr = tokio::net::lookup_host(&hop.options.authority)
		.await?
		.next()
		.ok_or_else(|| eyre::eyre!("could not resolve {host}"))?;
	let quinn_conn = endpoint.connect(addr, &host)?.await?;
	let h3_conn = h3_quinn::Connection::new(quinn_conn);
	let (conn, mut send_request) = h3::client::builder().enable_datagram(true).build(h3_conn).await?;
	let conn = Arc::new(Mutex::new(conn));

	let req = http::Request::builder()
		.method("CONNECT")
		.extension(h3::ext::Protocol::from_static(if hop.connect_ip { "connect-ip" } else { "connect-udp" }))
		.uri(format!("https://{}{}", hop.options.authority, hop.options.path))
		.header("Capsule-Protocol", "?1")
		.body(())?;
	let mut stream = send_request.send_request(req).await?;
	stream.finish().await?;
	let resp = stream.recv_response().await?;
	eyre::ensure!(resp.status() == 200, "server rejected CONNECT with status {}", resp.status());
	let stream_id = stream.id().into();

	let socket = Arc::new(H3DatagramSocket::new(BufferLimits::default()));
	let txn = socket.register_transaction(stream_id).await;
	let transport = H3ClientTxn { conn: conn.clone(), stream_id, max_datagram_size: hop.max_recv_packet_size };
	txn.on_headers_complete(transport).await;

	let read_conn = conn.clone();
	let read_txn = txn.clone();
	tasks.spawn(async move {
		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				datagram = async { read_conn.lock().await.read_datagram().await } => {
					match datagram {
						Ok(Some((_, data))) => read_txn.on_datagram_received(data).await,
						Ok(None) => break,
						Err(err) => {
							warn!(target: "[client]", "datagram read failed on hop: {err}");
							break;
						}
					}
				}
			}
		}
	});

	Ok((socket, txn))
}
