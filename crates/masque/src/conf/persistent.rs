use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub server: ServerOpt,
	pub client: ClientOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ServerOpt {
	#[educe(Default = 9443)]
	pub port: u16,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub timeout: Duration,

	#[educe(Default(expression = "10.8.0.0/24".to_string()))]
	pub tuntap_network: String,

	#[educe(Default(expression = "cubic".to_string()))]
	pub cc: String,

	#[educe(Default = false)]
	pub frame_per_packet: bool,

	#[educe(Default = 1350)]
	pub udp_send_packet_len: usize,

	#[educe(Default = 1500)]
	pub max_recv_packet_size: usize,

	#[educe(Default = None)]
	pub qlog: Option<PathBuf>,

	#[educe(Default = 100)]
	pub datagram_read_buf: usize,

	#[educe(Default = 100)]
	pub datagram_write_buf: usize,

	#[educe(Default = 1500)]
	pub tun_mtu: u16,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ClientOpt {
	#[educe(Default(expression = vec![HopOpt::default()]))]
	pub hops: Vec<HopOpt>,

	#[educe(Default = 1)]
	pub num_transactions: usize,

	#[educe(Default = None)]
	pub tuntap_ip: Option<Ipv4Addr>,

	#[educe(Default = 51337)]
	pub source_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Educe)]
#[educe(Default)]
pub struct HopOpt {
	#[educe(Default = ModeConfig::ConnectUdp)]
	pub mode: ModeConfig,

	#[educe(Default(expression = "127.0.0.1".to_string()))]
	pub host: String,

	#[educe(Default = 9443)]
	pub port: u16,

	#[educe(Default(expression = "/.well-known/masque/udp".to_string()))]
	pub path: String,

	#[educe(Default = 1350)]
	pub udp_send_packet_len: usize,

	#[educe(Default = 1500)]
	pub max_recv_packet_size: usize,

	#[educe(Default(expression = "cubic".to_string()))]
	pub cc: String,

	#[educe(Default = false)]
	pub frame_per_packet: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Educe)]
#[educe(Default)]
pub enum ModeConfig {
	#[educe(Default)]
	ConnectUdp,
	ConnectIp,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &PathBuf, format: &str) -> eyre::Result<()> {
		use std::{fs, io::Write};

		match format.to_lowercase().as_str() {
			"yaml" => {
				let yaml_content = serde_yaml::to_string(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(yaml_content.as_bytes())?;
			}
			"toml" => {
				let toml_content = toml::to_string_pretty(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(toml_content.as_bytes())?;
			}
			_ => return Err(eyre::eyre!("Unsupported file format: {}", format)),
		}

		Ok(())
	}

	/// Layers a config file (if given) under `MASQUE_`-prefixed environment
	/// variables; CLI flags are applied on top by the caller after
	/// extraction (spec §6 addendum).
	pub fn load(config_path: Option<PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::new();

		if let Some(config_path) = &config_path {
			match config_path.extension().and_then(|ext| ext.to_str()) {
				Some("toml") => figment = figment.merge(Toml::file(config_path)),
				Some("yaml" | "yml") => figment = figment.merge(Yaml::file(config_path)),
				_ => figment = figment.merge(Toml::file(config_path)),
			}
		} else {
			let toml_path = std::path::Path::new("masque.toml");
			if toml_path.exists() {
				figment = figment.merge(Toml::file(toml_path));
			}
			let yaml_path = std::path::Path::new("masque.yaml");
			if yaml_path.exists() {
				figment = figment.merge(Yaml::file(yaml_path));
			}
		}

		figment = figment.merge(Env::prefixed("MASQUE_"));

		let config: PersistentConfig = figment.extract()?;
		Ok(config)
	}
}
