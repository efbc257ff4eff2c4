//! The H3 datagram tunneling socket: a UDP-socket-shaped facade whose
//! writes/reads are funneled through an HTTP/3 transaction. The HTTP/3
//! session itself is treated as an out-of-scope collaborator (per the
//! module's purpose, just "a session offering transactions with
//! header/body/datagram send and receive") — captured here as the narrow
//! `H3Transaction` trait so the state machine below stays testable without
//! a live QUIC connection.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use masque_core::{
	error::{CoreError, InvalidArgumentSnafu, MessageTooLargeSnafu, NoBufferSnafu, NotConnectedSnafu, NotFoundSnafu},
	info,
	types::BufferLimits,
	warn,
};
use tokio::sync::Mutex;

/// State machine per underlying transaction (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
	Created,
	HeadersSent,
	HeadersComplete,
	Ready,
	Closed,
}

/// Callback invoked as datagrams/body chunks/errors arrive for a stream.
/// Plain datagram readers only ever see `on_datagram`; CONNECT-IP capsule
/// readers also receive `on_body`.
pub trait DatagramReader: Send + Sync {
	fn on_datagram(&self, data: Bytes);
	fn on_body(&self, data: Bytes) {
		let _ = data;
	}
	fn on_error(&self, err: CoreError);
	/// Graceful end-of-stream (spec §4.2 "close"): the session is shutting
	/// down cleanly, as opposed to [`Self::on_error`]'s failure path. No-op
	/// by default since most readers only care about the data they're owed.
	fn on_eom(&self) {}
}

/// Narrow contract consumed from the HTTP/3 session library.
pub trait H3Transaction: Send + Sync + 'static {
	fn send_datagram(&self, data: Bytes) -> Result<(), CoreError>;
	fn max_datagram_size(&self) -> usize;
}

struct Buffers {
	write_buf: VecDeque<Bytes>,
	read_buf: VecDeque<Bytes>,
	body_buf: VecDeque<Bytes>,
}

/// Per-transaction handler: `(options, upstream_session, transaction,
/// write_buffer, read_buffer, body_buffer, read_callback)` from spec §3.
pub struct Transaction<T: H3Transaction> {
	pub stream_id: u64,
	limits: BufferLimits,
	state: Mutex<TxnState>,
	transport: Mutex<Option<T>>,
	buffers: Mutex<Buffers>,
	reader: Mutex<Option<Arc<dyn DatagramReader>>>,
}

impl<T: H3Transaction> Transaction<T> {
	pub fn new(stream_id: u64, limits: BufferLimits) -> Self {
		Self {
			stream_id,
			limits,
			state: Mutex::new(TxnState::Created),
			transport: Mutex::new(None),
			buffers: Mutex::new(Buffers {
				write_buf: VecDeque::new(),
				read_buf: VecDeque::new(),
				body_buf: VecDeque::new(),
			}),
			reader: Mutex::new(None),
		}
	}

	pub async fn state(&self) -> TxnState {
		*self.state.lock().await
	}

	pub async fn mark_headers_sent(&self) {
		*self.state.lock().await = TxnState::HeadersSent;
	}

	/// Fires on `on_headers_complete(200)`: attaches the live transport and
	/// drains the write buffer in order. Resolves Open Question #1 —
	/// partial progress under backpressure is preserved rather than
	/// silently dropped: a send reporting `NoBuffer` pushes its payload
	/// back to the front of the queue and stops the drain.
	pub async fn on_headers_complete(&self, transport: T) {
		*self.state.lock().await = TxnState::Ready;
		*self.transport.lock().await = Some(transport);
		self.drain_write_buffer().await;
	}

	pub async fn mark_rejected(&self) {
		*self.state.lock().await = TxnState::Closed;
	}

	async fn drain_write_buffer(&self) {
		let transport_guard = self.transport.lock().await;
		let Some(transport) = transport_guard.as_ref() else {
			return;
		};
		let mut buffers = self.buffers.lock().await;
		loop {
			let Some(payload) = buffers.write_buf.pop_front() else {
				break;
			};
			match transport.send_datagram(payload.clone()) {
				Ok(()) => {}
				Err(CoreError::NoBuffer { .. }) => {
					buffers.write_buf.push_front(payload);
					break;
				}
				Err(err) => {
					warn!(target: "[H3]", "dropping buffered datagram on stream {}: {err}", self.stream_id);
				}
			}
		}
	}

	/// `write(stream, address, buf)` from spec §4.2. `address` is not used
	/// by this transport-agnostic layer (the underlying transaction already
	/// pins the destination); callers that need per-packet addressing wrap
	/// payloads themselves before calling this.
	pub async fn write(&self, buf: Bytes) -> Result<usize, CoreError> {
		if buf.is_empty() {
			return InvalidArgumentSnafu { message: "empty datagram" }.fail();
		}
		let state = *self.state.lock().await;
		if state == TxnState::Closed {
			return NotConnectedSnafu.fail();
		}

		let transport_guard = self.transport.lock().await;
		match transport_guard.as_ref() {
			None => {
				drop(transport_guard);
				let mut buffers = self.buffers.lock().await;
				if buffers.write_buf.len() >= self.limits.snd_buf_pkts {
					return NoBufferSnafu.fail();
				}
				let len = buf.len();
				buffers.write_buf.push_back(buf);
				Ok(len)
			}
			Some(transport) => {
				let limit = transport.max_datagram_size();
				if buf.len() > limit {
					return MessageTooLargeSnafu { len: buf.len(), limit }.fail();
				}
				let len = buf.len();
				transport.send_datagram(buf)?;
				Ok(len)
			}
		}
	}

	/// `resumeRead(stream, cb)`: binds the callback and synchronously
	/// drains body then read buffers into it, in arrival order.
	pub async fn resume_read(&self, cb: Arc<dyn DatagramReader>) {
		let mut buffers = self.buffers.lock().await;
		for body in buffers.body_buf.drain(..) {
			cb.on_body(body);
		}
		for datagram in buffers.read_buf.drain(..) {
			cb.on_datagram(datagram);
		}
		*self.reader.lock().await = Some(cb);
	}

	pub async fn pause_read(&self) {
		*self.reader.lock().await = None;
	}

	/// Ingress hook: the HTTP/3 session delivers a received datagram here.
	pub async fn on_datagram_received(&self, data: Bytes) {
		let reader = self.reader.lock().await;
		if let Some(cb) = reader.as_ref() {
			cb.on_datagram(data);
			return;
		}
		drop(reader);
		let mut buffers = self.buffers.lock().await;
		if buffers.read_buf.len() >= self.limits.rcv_buf_pkts {
			warn!(target: "[H3]", "read buffer full on stream {}, dropping datagram", self.stream_id);
			return;
		}
		buffers.read_buf.push_back(data);
	}

	/// Ingress hook: a body chunk (capsule bytes) arrived.
	pub async fn on_body_received(&self, data: Bytes) {
		let reader = self.reader.lock().await;
		if let Some(cb) = reader.as_ref() {
			cb.on_body(data);
			return;
		}
		drop(reader);
		self.buffers.lock().await.body_buf.push_back(data);
	}

	pub async fn on_error(&self, err: CoreError) {
		*self.state.lock().await = TxnState::Closed;
		if let Some(cb) = self.reader.lock().await.as_ref() {
			cb.on_error(err);
		}
	}

	/// Graceful close (spec §4.2 "close"): sends EOM to the registered
	/// reader, distinct from [`Self::on_error`]'s failure signal. Leaves any
	/// buffered writes to drain naturally — the caller decides whether to
	/// wait on them before dropping the transaction.
	pub async fn close(&self) {
		*self.state.lock().await = TxnState::Closed;
		if let Some(cb) = self.reader.lock().await.as_ref() {
			cb.on_eom();
		}
	}
}

/// The socket-shaped facade over a set of parallel transactions on one
/// HTTP/3 session. The first opened stream is the *default stream* —
/// writes that don't name a stream go to it (spec §4.2).
pub struct H3DatagramSocket<T: H3Transaction> {
	transactions: Mutex<VecDeque<Arc<Transaction<T>>>>,
	default_stream: Mutex<Option<u64>>,
	limits: BufferLimits,
}

impl<T: H3Transaction> H3DatagramSocket<T> {
	pub fn new(limits: BufferLimits) -> Self {
		Self {
			transactions: Mutex::new(VecDeque::new()),
			default_stream: Mutex::new(None),
			limits,
		}
	}

	pub async fn register_transaction(&self, stream_id: u64) -> Arc<Transaction<T>> {
		let txn = Arc::new(Transaction::new(stream_id, self.limits));
		let mut transactions = self.transactions.lock().await;
		if transactions.is_empty() {
			*self.default_stream.lock().await = Some(stream_id);
		}
		transactions.push_back(txn.clone());
		info!(target: "[H3]", "registered transaction on stream {stream_id}");
		txn
	}

	async fn find(&self, stream_id: u64) -> Option<Arc<Transaction<T>>> {
		self.transactions.lock().await.iter().find(|txn| txn.stream_id == stream_id).cloned()
	}

	pub async fn write(&self, stream_id: Option<u64>, buf: Bytes) -> Result<usize, CoreError> {
		let stream_id = match stream_id {
			Some(id) => id,
			None => self.default_stream.lock().await.ok_or_else(|| NotConnectedSnafu.build())?,
		};
		let txn = self.find(stream_id).await.ok_or_else(|| NotFoundSnafu { stream_id }.build())?;
		txn.write(buf).await
	}

	pub async fn resume_read(&self, stream_id: u64, cb: Arc<dyn DatagramReader>) -> Result<(), CoreError> {
		let txn = self.find(stream_id).await.ok_or_else(|| NotFoundSnafu { stream_id }.build())?;
		txn.resume_read(cb).await;
		Ok(())
	}

	/// Sends EOM on every open transaction and marks the session
	/// close-when-idle; outstanding writes are left to drain naturally.
	pub async fn close(&self) {
		for txn in self.transactions.lock().await.iter() {
			txn.close().await;
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct RecordingTransport {
		sent: std::sync::Mutex<Vec<Bytes>>,
		fail_after: Option<usize>,
		attempts: AtomicUsize,
	}

	impl H3Transaction for Arc<RecordingTransport> {
		fn send_datagram(&self, data: Bytes) -> Result<(), CoreError> {
			let n = self.attempts.fetch_add(1, Ordering::SeqCst);
			if self.fail_after == Some(n) {
				return masque_core::error::NoBufferSnafu.fail();
			}
			self.sent.lock().unwrap().push(data);
			Ok(())
		}

		fn max_datagram_size(&self) -> usize {
			1200
		}
	}

	#[tokio::test]
	async fn pre_connect_writes_flush_in_order_on_headers_complete() {
		let txn: Transaction<Arc<RecordingTransport>> = Transaction::new(0, BufferLimits::default());
		for i in 0..5u8 {
			txn.write(Bytes::from(vec![i])).await.unwrap();
		}
		let transport = Arc::new(RecordingTransport {
			sent: std::sync::Mutex::new(Vec::new()),
			fail_after: None,
			attempts: AtomicUsize::new(0),
		});
		txn.on_headers_complete(transport.clone()).await;
		let sent = transport.sent.lock().unwrap().clone();
		assert_eq!(sent, (0..5u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn backpressure_preserves_undelivered_payloads() {
		let limits = BufferLimits {
			snd_buf_pkts: 3,
			..BufferLimits::default()
		};
		let txn: Transaction<Arc<RecordingTransport>> = Transaction::new(0, limits);
		for i in 0..3u8 {
			txn.write(Bytes::from(vec![i])).await.unwrap();
		}
		assert!(matches!(txn.write(Bytes::from(vec![9])).await, Err(CoreError::NoBuffer { .. })));

		let transport = Arc::new(RecordingTransport {
			sent: std::sync::Mutex::new(Vec::new()),
			fail_after: Some(1),
			attempts: AtomicUsize::new(0),
		});
		txn.on_headers_complete(transport.clone()).await;
		// First send succeeds, second fails with NoBuffer and is preserved.
		let sent = transport.sent.lock().unwrap().clone();
		assert_eq!(sent, vec![Bytes::from(vec![0u8])]);
	}

	struct RecordingReader {
		errors: std::sync::Mutex<Vec<CoreError>>,
		eoms: AtomicUsize,
	}

	impl DatagramReader for RecordingReader {
		fn on_datagram(&self, _data: Bytes) {}

		fn on_error(&self, err: CoreError) {
			self.errors.lock().unwrap().push(err);
		}

		fn on_eom(&self) {
			self.eoms.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	async fn close_sends_eom_not_error() {
		let txn: Transaction<Arc<RecordingTransport>> = Transaction::new(0, BufferLimits::default());
		let reader = Arc::new(RecordingReader {
			errors: std::sync::Mutex::new(Vec::new()),
			eoms: AtomicUsize::new(0),
		});
		txn.resume_read(reader.clone()).await;

		txn.close().await;

		assert_eq!(reader.eoms.load(Ordering::SeqCst), 1);
		assert!(reader.errors.lock().unwrap().is_empty());
		assert_eq!(txn.state().await, TxnState::Closed);
	}

	#[tokio::test]
	async fn socket_close_closes_every_transaction() {
		let socket: H3DatagramSocket<Arc<RecordingTransport>> = H3DatagramSocket::new(BufferLimits::default());
		let txn_a = socket.register_transaction(0).await;
		let txn_b = socket.register_transaction(1).await;
		let reader_a = Arc::new(RecordingReader {
			errors: std::sync::Mutex::new(Vec::new()),
			eoms: AtomicUsize::new(0),
		});
		let reader_b = Arc::new(RecordingReader {
			errors: std::sync::Mutex::new(Vec::new()),
			eoms: AtomicUsize::new(0),
		});
		txn_a.resume_read(reader_a.clone()).await;
		txn_b.resume_read(reader_b.clone()).await;

		socket.close().await;

		assert_eq!(reader_a.eoms.load(Ordering::SeqCst), 1);
		assert_eq!(reader_b.eoms.load(Ordering::SeqCst), 1);
		assert!(reader_a.errors.lock().unwrap().is_empty());
		assert!(reader_b.errors.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn read_buffer_bounded_by_rcv_buf_pkts() {
		let limits = BufferLimits {
			rcv_buf_pkts: 2,
			..BufferLimits::default()
		};
		let txn: Transaction<Arc<RecordingTransport>> = Transaction::new(0, limits);
		for i in 0..5u8 {
			txn.on_datagram_received(Bytes::from(vec![i])).await;
		}
		assert_eq!(txn.buffers.lock().await.read_buf.len(), 2);
	}
}
