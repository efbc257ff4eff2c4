use std::backtrace::Backtrace;

use snafu::Snafu;

/// Error kinds shared by the H3 datagram socket and the server demultiplexer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoreError {
	#[snafu(display("invalid argument: {message}"))]
	InvalidArgument { message: String, backtrace: Backtrace },

	#[snafu(display("write attempted before connect()"))]
	NotConnected { backtrace: Backtrace },

	#[snafu(display("unknown stream id {stream_id}"))]
	NotFound { stream_id: u64, backtrace: Backtrace },

	#[snafu(display("datagram of {len} bytes exceeds the transport limit of {limit}"))]
	MessageTooLarge { len: usize, limit: usize, backtrace: Backtrace },

	#[snafu(display("send queue full"))]
	NoBuffer { backtrace: Backtrace },

	#[snafu(display("failed to parse {what}: {message}"))]
	ParseError { what: String, message: String, backtrace: Backtrace },

	#[snafu(display("transport error: {message}"))]
	TransportError { message: String, backtrace: Backtrace },

	#[snafu(display("protocol violation: {reason}"))]
	ProtocolViolation { reason: String, backtrace: Backtrace },
}
