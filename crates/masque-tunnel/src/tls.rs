//! Client and server TLS configuration. The default certificate verifier
//! accepts any certificate presented by the peer — this tool is a
//! demo/test-grade tunnel, not a production CA client, and that default is
//! never silently promoted without the caller opting in.

use std::sync::Arc;

use rustls::{
	DigitallySignedStruct, SignatureScheme,
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::CryptoProvider,
	pki_types::{CertificateDer, ServerName, UnixTime},
};

pub const ALPN_H3: &[u8] = b"h3";

/// Accepts every certificate without checking chain, name, or expiry.
/// Grounded in the original sample's `AlwaysAcceptCertificateVerifier`.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}

/// Builds a client TLS config with the permissive verifier above and `h3`
/// negotiated via ALPN. Used for every hop of the layered socket chain.
pub fn client_tls_config(alpn: &[Vec<u8>]) -> rustls::ClientConfig {
	let provider = CryptoProvider::get_default().expect("a default crypto provider is installed at process startup").clone();

	let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(&[&rustls::version::TLS13])
		.expect("TLS 1.3 is supported by the installed crypto provider")
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
		.with_no_client_auth();
	config.alpn_protocols = alpn.to_vec();
	config
}

/// Builds a server TLS config from a certificate chain and private key
/// (self-signed is fine; the client side never validates it by default).
pub fn server_tls_config(
	cert_chain: Vec<CertificateDer<'static>>,
	key: rustls::pki_types::PrivateKeyDer<'static>,
	alpn: &[Vec<u8>],
) -> Result<rustls::ServerConfig, rustls::Error> {
	let mut config = rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
	config.alpn_protocols = alpn.to_vec();
	config.max_early_data_size = u32::MAX;
	Ok(config)
}
