//! The layered MASQUE socket chain: stacks hops bottom-up so the outermost
//! socket's writes descend through every inner tunnel down to the wire.

use std::{
	io::{IoSliceMut, Result as IoResult},
	net::{Ipv4Addr, SocketAddr},
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use bytes::Bytes;
use masque_core::{
	info,
	udp::{AbstractUdpSocket, RecvMeta, Transmit, UdpPoller, UdpPollHelper},
	warn,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::h3socket::{DatagramReader, H3DatagramSocket, H3Transaction};

/// `H3DatagramOptions` (data model §3): the subset of options a hop's H3
/// session is opened with.
#[derive(Debug, Clone)]
pub struct H3DatagramOptions {
	pub mode: Mode,
	pub transactions: usize,
	pub txn_timeout: Duration,
	pub connect_timeout: Duration,
	pub authority: String,
	pub path: String,
	pub target_address: Option<SocketAddr>,
	pub max_recv_packet_size: usize,
	pub max_send_size: usize,
	pub frame_per_packet: bool,
	/// `default_cc_type` (data model §3): the QUIC congestion controller this
	/// hop's transport should use. Interpretation is left to the collaborator
	/// that owns the QUIC transport (spec §1) — this layer only carries it.
	pub default_cc_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Client,
	Server,
}

/// One entry of the bottom-up hop list (§3 `OptionPair`).
#[derive(Debug, Clone)]
pub struct OptionPair {
	pub connect_ip: bool,
	pub options: H3DatagramOptions,
	pub udp_send_packet_len: usize,
	pub max_recv_packet_size: usize,
}

/// H3 datagram framing overhead budgeted per hop: a context-id varint (at
/// most 8 bytes, almost always 1) plus HTTP/3 datagram/quarter-stream-id
/// framing, conservatively rounded up.
const H3_OVERHEAD_BYTES: usize = 16;
/// Extra allowance a CONNECT-IP hop reserves for the IPv4 header it wraps.
const CONNECT_IP_HEADER_BYTES: usize = 20;

/// Any socket-shaped layer in the chain: the base UDP socket, or another
/// H3-layered socket stacked on top of it.
pub trait LayeredSocket: Send + Sync {
	fn write(&self, buf: Bytes) -> futures_util::future::BoxFuture<'_, Result<usize, masque_core::CoreError>>;
	/// Maximum application payload this layer can carry after subtracting
	/// its own framing overhead.
	fn max_send_size(&self) -> usize;
}

/// The innermost layer: a bare UDP socket talking directly to the wire.
pub struct BaseUdpSocket {
	socket: Arc<dyn AbstractUdpSocket>,
	target: SocketAddr,
	max_send_size: usize,
}

impl BaseUdpSocket {
	pub fn new(socket: Arc<dyn AbstractUdpSocket>, target: SocketAddr, max_send_size: usize) -> Self {
		Self { socket, target, max_send_size }
	}
}

impl LayeredSocket for BaseUdpSocket {
	fn write(&self, buf: Bytes) -> futures_util::future::BoxFuture<'_, Result<usize, masque_core::CoreError>> {
		let target = self.target;
		Box::pin(async move {
			self.socket
				.send_to(&buf, target)
				.await
				.map_err(|source| masque_core::error::TransportErrorSnafu { message: source.to_string() }.build())
		})
	}

	fn max_send_size(&self) -> usize {
		self.max_send_size
	}
}

/// One H3-layered hop: its datagram socket and the inner layer its writes
/// descend into once the underlying transaction is ready.
pub struct H3LayeredSocket<T: H3Transaction> {
	h3: Arc<H3DatagramSocket<T>>,
	inner_max_send: usize,
	is_connect_ip: bool,
}

impl<T: H3Transaction> H3LayeredSocket<T> {
	pub fn new(h3: Arc<H3DatagramSocket<T>>, inner: &dyn LayeredSocket, is_connect_ip: bool) -> Self {
		Self {
			h3,
			inner_max_send: inner.max_send_size(),
			is_connect_ip,
		}
	}
}

impl<T: H3Transaction> LayeredSocket for H3LayeredSocket<T> {
	fn write(&self, buf: Bytes) -> futures_util::future::BoxFuture<'_, Result<usize, masque_core::CoreError>> {
		Box::pin(async move { self.h3.write(None, buf).await })
	}

	fn max_send_size(&self) -> usize {
		let overhead = H3_OVERHEAD_BYTES + if self.is_connect_ip { CONNECT_IP_HEADER_BYTES } else { 0 };
		self.inner_max_send.saturating_sub(overhead)
	}
}

/// Bridges an inner [`LayeredSocket`] into something a QUIC endpoint can
/// treat as its transport: outbound packets are queued and drained by a
/// background task into the inner layer's (async) `write`; inbound
/// datagrams arrive from the inner H3 transaction's read side and are
/// queued for `poll_recv`.
#[derive(Debug)]
pub struct VirtualUdpSocket {
	peer: SocketAddr,
	outbound: mpsc::Sender<Bytes>,
	inbound: std::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
	inbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl VirtualUdpSocket {
	/// `peer` is a synthetic address used only for quinn's bookkeeping — the
	/// real destination is whatever the inner layer's transaction targets.
	pub fn spawn(inner: Arc<dyn LayeredSocket>, peer: SocketAddr, cancel: CancellationToken) -> Arc<Self> {
		let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(64);
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					biased;
					_ = cancel.cancelled() => break,
					maybe = outbound_rx.recv() => {
						let Some(packet) = maybe else { break };
						if let Err(err) = inner.write(packet).await {
							warn!(target: "[layered]", "hop write failed: {err}");
						}
					}
				}
			}
		});

		Arc::new(Self {
			peer,
			outbound: outbound_tx,
			inbound: std::sync::Mutex::new(inbound_rx),
			inbound_tx,
		})
	}

	/// Registered as the inner transaction's datagram callback so inbound
	/// traffic reaches [`Self::poll_recv`].
	pub fn reader(self: &Arc<Self>) -> Arc<dyn DatagramReader> {
		self.clone() as Arc<dyn DatagramReader>
	}
}

impl DatagramReader for VirtualUdpSocket {
	fn on_datagram(&self, data: Bytes) {
		let _ = self.inbound_tx.send(data);
	}

	fn on_error(&self, err: masque_core::CoreError) {
		warn!(target: "[layered]", "inner hop reported an error: {err}");
	}
}

impl AbstractUdpSocket for VirtualUdpSocket {
	fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
		Box::pin(UdpPollHelper::new(move || {
			let tx = self.outbound.clone();
			async move { tx.reserve().await.map(drop).map_err(|_| std::io::Error::other("hop channel closed")) }
		}))
	}

	fn try_send(&self, transmit: &Transmit) -> IoResult<()> {
		self.outbound
			.try_send(Bytes::copy_from_slice(transmit.contents))
			.map_err(|_| std::io::Error::from(std::io::ErrorKind::WouldBlock))
	}

	fn poll_recv(&self, cx: &mut Context, bufs: &mut [IoSliceMut<'_>], meta: &mut [RecvMeta]) -> Poll<IoResult<usize>> {
		let mut rx = self.inbound.lock().expect("inbound receiver mutex poisoned");
		match rx.poll_recv(cx) {
			Poll::Ready(Some(packet)) => {
				let n = packet.len().min(bufs[0].len());
				bufs[0][..n].copy_from_slice(&packet[..n]);
				meta[0] = RecvMeta::default();
				meta[0].addr = self.peer;
				meta[0].len = n;
				Poll::Ready(Ok(1))
			}
			Poll::Ready(None) => Poll::Ready(Err(std::io::Error::other("hop channel closed"))),
			Poll::Pending => Poll::Pending,
		}
	}

	fn local_addr(&self) -> IoResult<SocketAddr> {
		Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
	}
}

/// Builds the chain for hops `H_0..H_{n-1}` (innermost first), returning the
/// outermost layer along with its effective MTU budget.
pub fn build_chain(base: Arc<dyn LayeredSocket>, hops: &[OptionPair], layer_at: impl Fn(usize, &dyn LayeredSocket, bool) -> Arc<dyn LayeredSocket>) -> Arc<dyn LayeredSocket> {
	let mut current = base;
	for (i, hop) in hops.iter().enumerate() {
		let outermost = i == hops.len() - 1;
		info!(target: "[layered]", "stacking hop {i} (connect-ip={}, outermost={outermost})", hop.connect_ip);
		current = layer_at(i, current.as_ref(), hop.connect_ip);
	}
	current
}
