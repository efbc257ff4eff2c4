use std::{net::Ipv4Addr, path::PathBuf};

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
	/// Set a custom config file (YAML or TOML, detected by extension)
	#[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Set working directory
	#[arg(short = 'D', long, value_name = "PATH")]
	pub work_dir: Option<PathBuf>,

	/// Show current version
	#[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
	pub version: bool,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Run the MASQUE server: accepts CONNECT-UDP/CONNECT-IP requests over HTTP/3
	Server(ServerArgs),

	/// Run the MASQUE client: opens a (possibly chained) tunnel through one or more hops
	Client(ClientArgs),

	/// Validate a configuration without connecting
	Test {
		/// lists resolved configuration values
		#[arg(short, long)]
		list: bool,
	},

	/// Initialize a new default configuration file
	Init {
		/// Specify the configuration file format (yaml or toml)
		#[arg(short, long, value_enum, default_value = "yaml")]
		format: ConfigFormat,
	},
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ConfigFormat {
	Yaml,
	Toml,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServerArgs {
	/// UDP port to listen for QUIC connections on
	#[arg(long)]
	pub port: Option<u16>,

	/// Idle timeout applied to accepted connections
	#[arg(long, value_parser = humantime::parse_duration)]
	pub timeout: Option<std::time::Duration>,

	/// `<network>/<prefix>` the shared CONNECT-IP TUN hands addresses out of, prefix <= 24
	#[arg(long, value_name = "IP/PREFIX")]
	pub tuntap_network: Option<String>,

	/// QUIC congestion controller: bbr or cubic
	#[arg(long)]
	pub cc: Option<String>,

	/// Send one HTTP/3 datagram per received UDP/IP packet rather than coalescing
	#[arg(long, action = ArgAction::SetTrue)]
	pub frame_per_packet: bool,

	/// Maximum UDP payload the server will send in one outbound datagram
	#[arg(long)]
	pub udp_send_packet_len: Option<usize>,

	/// Maximum datagram size the server is willing to receive
	#[arg(long)]
	pub max_recv_packet_size: Option<usize>,

	/// qlog output directory; when set, SIGTERM is not installed so QUIC can flush its own qlog on exit
	#[arg(long)]
	pub qlog: Option<PathBuf>,

	/// Read-side buffer size in packets
	#[arg(long)]
	pub datagram_read_buf: Option<usize>,

	/// Write-side buffer size in packets
	#[arg(long)]
	pub datagram_write_buf: Option<usize>,

	/// MTU assigned to the shared TUN device
	#[arg(long)]
	pub tun_mtu: Option<u16>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ClientArgs {
	/// Per-hop mode, innermost first: connect-udp or connect-ip
	#[arg(long, value_delimiter = ',')]
	pub modes: Vec<String>,

	/// Per-hop server host, innermost first
	#[arg(long, value_delimiter = ',')]
	pub hosts: Vec<String>,

	/// Per-hop server port, innermost first
	#[arg(long, value_delimiter = ',')]
	pub ports: Vec<u16>,

	/// Per-hop HTTP/3 request path, innermost first
	#[arg(long, value_delimiter = ',')]
	pub paths: Vec<String>,

	/// Per-hop max outbound UDP payload
	#[arg(long = "udp-send-packet-lens", value_delimiter = ',')]
	pub udp_send_packet_lens: Vec<usize>,

	/// Per-hop max inbound datagram size
	#[arg(long = "max-recv-packet-sizes", value_delimiter = ',')]
	pub max_recv_packet_sizes: Vec<usize>,

	/// Per-hop QUIC congestion controller
	#[arg(long = "ccs", value_delimiter = ',')]
	pub ccs: Vec<String>,

	/// Per-hop datagram coalescing choice
	#[arg(long = "frame-per-packets", value_delimiter = ',')]
	pub frame_per_packets: Vec<bool>,

	/// Number of parallel transactions to open per hop
	#[arg(long, default_value_t = 1)]
	pub num_transactions: usize,

	/// `/31` point-to-point subnet base for the outermost CONNECT-UDP hop's TUN device
	#[arg(long)]
	pub tuntap_ip: Option<Ipv4Addr>,

	/// Local UDP source port the outermost CONNECT-UDP hop binds
	#[arg(long, default_value_t = 51337)]
	pub source_port: u16,
}
