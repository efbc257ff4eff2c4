use std::time::Duration;

/// Process-wide configuration, replacing what were independent global
/// mutable values in the original sample. Built once at startup and shared
/// via `Arc` into every component that needs it.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
	/// First TUN device number to allocate; subsequent per-stream or
	/// per-client TUN devices increment from here.
	pub first_tun_number: usize,
	/// Read-side socket buffer size applied to the server's upstream UDP
	/// sockets and the client's layered-socket base UDP socket.
	pub datagram_read_buf_size: usize,
	/// Write-side socket buffer size, same scope as `datagram_read_buf_size`.
	pub datagram_write_buf_size: usize,
	/// Placeholder target port CONNECT-IP's layered socket binds toward when
	/// no real UDP destination applies (renamed from the original's
	/// `LayeredConnectIPSocket::MASQUE_UDP_PORT`).
	pub connect_ip_port: u16,
}

impl Default for ProcessConfig {
	fn default() -> Self {
		Self {
			first_tun_number: 0,
			datagram_read_buf_size: 16 * 1024,
			datagram_write_buf_size: 16 * 1024,
			connect_ip_port: 1,
		}
	}
}

/// Per-handler buffer capacities on the H3 datagram socket (`sndBufPkts` /
/// `rcvBufPkts` in the original).
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
	pub snd_buf_pkts: usize,
	pub rcv_buf_pkts: usize,
}

impl Default for BufferLimits {
	fn default() -> Self {
		Self {
			snd_buf_pkts: 100,
			rcv_buf_pkts: 100,
		}
	}
}

/// Hop-level timeouts shared by client transaction setup.
#[derive(Debug, Clone, Copy)]
pub struct HopTimeouts {
	pub txn_timeout: Duration,
	pub connect_timeout: Duration,
}

impl Default for HopTimeouts {
	fn default() -> Self {
		Self {
			txn_timeout: Duration::from_secs(10),
			connect_timeout: Duration::from_secs(10),
		}
	}
}
