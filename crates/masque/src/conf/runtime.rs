use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use masque_tunnel::client::{H3DatagramOptions, Mode, OptionPair};

use super::persistent::{ClientOpt, HopOpt, ModeConfig, PersistentConfig, ServerOpt};
use crate::cli::{ClientArgs, ServerArgs};

pub struct Config {
	pub server: ServerConfig,
	pub client: ClientConfig,
}

impl Config {
	pub fn from_persist(persist: PersistentConfig, server_cli: Option<&ServerArgs>, client_cli: Option<&ClientArgs>) -> eyre::Result<Self> {
		Ok(Self {
			server: ServerConfig::from_persist(persist.server, server_cli)?,
			client: ClientConfig::from_persist(persist.client, client_cli)?,
		})
	}
}

pub struct ServerConfig {
	pub port: u16,
	pub timeout: Duration,
	pub tuntap_network: (Ipv4Addr, u32),
	pub cc: String,
	pub frame_per_packet: bool,
	pub udp_send_packet_len: usize,
	pub max_recv_packet_size: usize,
	pub qlog: Option<PathBuf>,
	pub datagram_read_buf: usize,
	pub datagram_write_buf: usize,
	pub tun_mtu: u16,
}

impl ServerConfig {
	pub fn from_persist(opt: ServerOpt, cli: Option<&ServerArgs>) -> eyre::Result<Self> {
		let network_spec = cli.and_then(|c| c.tuntap_network.clone()).unwrap_or(opt.tuntap_network);
		let tuntap_network = parse_network(&network_spec)?;
		Ok(Self {
			port: cli.and_then(|c| c.port).unwrap_or(opt.port),
			timeout: cli.and_then(|c| c.timeout).unwrap_or(opt.timeout),
			tuntap_network,
			cc: cli.and_then(|c| c.cc.clone()).unwrap_or(opt.cc),
			frame_per_packet: cli.map(|c| c.frame_per_packet).unwrap_or(opt.frame_per_packet),
			udp_send_packet_len: cli.and_then(|c| c.udp_send_packet_len).unwrap_or(opt.udp_send_packet_len),
			max_recv_packet_size: cli.and_then(|c| c.max_recv_packet_size).unwrap_or(opt.max_recv_packet_size),
			qlog: cli.and_then(|c| c.qlog.clone()).or(opt.qlog),
			datagram_read_buf: cli.and_then(|c| c.datagram_read_buf).unwrap_or(opt.datagram_read_buf),
			datagram_write_buf: cli.and_then(|c| c.datagram_write_buf).unwrap_or(opt.datagram_write_buf),
			tun_mtu: cli.and_then(|c| c.tun_mtu).unwrap_or(opt.tun_mtu),
		})
	}
}

fn parse_network(spec: &str) -> eyre::Result<(Ipv4Addr, u32)> {
	let (addr, prefix) = spec
		.split_once('/')
		.ok_or_else(|| eyre::eyre!("tuntap-network must be CIDR form <ip>/<prefix>, got {spec:?}"))?;
	Ok((addr.parse()?, prefix.parse()?))
}

pub struct ClientConfig {
	pub hops: Vec<OptionPair>,
	pub num_transactions: usize,
	pub tuntap_ip: Option<Ipv4Addr>,
	pub source_port: u16,
}

impl ClientConfig {
	pub fn from_persist(opt: ClientOpt, cli: Option<&ClientArgs>) -> eyre::Result<Self> {
		let hops = match cli {
			Some(cli) if !cli.hosts.is_empty() => hops_from_cli(cli)?,
			_ => opt.hops.iter().map(hop_from_persist).collect(),
		};
		Ok(Self {
			hops,
			num_transactions: cli.map(|c| c.num_transactions).filter(|&n| n != 0).unwrap_or(opt.num_transactions),
			tuntap_ip: cli.and_then(|c| c.tuntap_ip).or(opt.tuntap_ip),
			source_port: cli.map(|c| c.source_port).unwrap_or(opt.source_port),
		})
	}
}

fn hop_from_persist(hop: &HopOpt) -> OptionPair {
	OptionPair {
		connect_ip: matches!(hop.mode, ModeConfig::ConnectIp),
		options: H3DatagramOptions {
			mode: Mode::Client,
			transactions: 1,
			txn_timeout: Duration::from_secs(10),
			connect_timeout: Duration::from_secs(10),
			authority: format!("{}:{}", hop.host, hop.port),
			path: hop.path.clone(),
			target_address: None,
			max_recv_packet_size: hop.max_recv_packet_size,
			max_send_size: hop.udp_send_packet_len,
			frame_per_packet: hop.frame_per_packet,
			default_cc_type: hop.cc.clone(),
		},
		udp_send_packet_len: hop.udp_send_packet_len,
		max_recv_packet_size: hop.max_recv_packet_size,
	}
}

fn hops_from_cli(cli: &ClientArgs) -> eyre::Result<Vec<OptionPair>> {
	let n = cli.hosts.len();
	eyre::ensure!(
		cli.modes.len() == n && cli.ports.len() == n && cli.paths.len() == n,
		"client hop option arrays must all have the same length ({n} hosts)"
	);
	(0..n)
		.map(|i| {
			let connect_ip = match cli.modes[i].as_str() {
				"connect-udp" => false,
				"connect-ip" => true,
				other => eyre::bail!("unknown hop mode {other:?}, expected connect-udp or connect-ip"),
			};
			Ok(OptionPair {
				connect_ip,
				options: H3DatagramOptions {
					mode: Mode::Client,
					transactions: 1,
					txn_timeout: Duration::from_secs(10),
					connect_timeout: Duration::from_secs(10),
					authority: format!("{}:{}", cli.hosts[i], cli.ports[i]),
					path: cli.paths[i].clone(),
					target_address: None,
					max_recv_packet_size: cli.max_recv_packet_sizes.get(i).copied().unwrap_or(1500),
					max_send_size: cli.udp_send_packet_lens.get(i).copied().unwrap_or(1350),
					frame_per_packet: cli.frame_per_packets.get(i).copied().unwrap_or(false),
					default_cc_type: cli.ccs.get(i).cloned().unwrap_or_else(|| "cubic".to_string()),
				},
				udp_send_packet_len: cli.udp_send_packet_lens.get(i).copied().unwrap_or(1350),
				max_recv_packet_size: cli.max_recv_packet_sizes.get(i).copied().unwrap_or(1500),
			})
		})
		.collect()
}
