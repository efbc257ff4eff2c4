use std::backtrace::Backtrace;

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CapsuleError {
	#[snafu(display("truncated varint in capsule header"))]
	TruncatedHeader { backtrace: Backtrace },

	// Caller should yield
	BytesRemaining,

	#[snafu(display("capsule body shorter than its declared length"))]
	ShortBody { backtrace: Backtrace },

	#[snafu(display("ADDRESS_REQUEST capsule carried no address entries"))]
	EmptyAddressRequest { backtrace: Backtrace },

	#[snafu(display("ADDRESS_REQUEST entry had request_id == 0"))]
	ZeroRequestId { backtrace: Backtrace },

	#[snafu(display("unsupported IP version byte {value}"))]
	UnknownIpVersion { value: u8, backtrace: Backtrace },

	#[snafu(display("ROUTE_ADVERTISEMENT ranges are not sorted by (family, version, end<next.start)"))]
	UnsortedRanges { backtrace: Backtrace },

	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for CapsuleError {
	#[inline(always)]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}
