//! Channel establishment over TCP, TLS and websockets.

mod stream;
#[cfg(feature = "websocket")]
mod websocket;

pub(crate) use stream::{AsyncReadWrite, MqttStream};
#[cfg(feature = "websocket")]
pub use websocket::{HandshakeRequest, HandshakeTransform};

use crate::{connection::SessionConfig, Error};
use std::time::Duration;
use tokio::net::TcpStream;

/// Read-side buffer capacity of a fresh channel.
const READ_CAPACITY: usize = 8 * 1024;

/// Opens the configured transport and returns a packet stream ready for
/// Connect.
pub(crate) async fn open(config: &SessionConfig) -> Result<MqttStream, Error> {
	if config.websockets {
		#[cfg(feature = "websocket")]
		{
			return websocket::open(config).await;
		}
		#[cfg(not(feature = "websocket"))]
		{
			return Err(Error::WebsocketsDisabled);
		}
	}

	let tcp = tcp_connect(config).await?;

	if config.tls {
		#[cfg(feature = "tls")]
		{
			let stream = tls::handshake(&config.host, tcp).await?;
			return Ok(MqttStream::new(Box::new(stream), READ_CAPACITY));
		}
		#[cfg(not(feature = "tls"))]
		{
			return Err(Error::Config("built without tls support"));
		}
	}

	Ok(MqttStream::new(Box::new(tcp), READ_CAPACITY))
}

pub(crate) async fn tcp_connect(config: &SessionConfig) -> Result<TcpStream, Error> {
	let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
	stream.set_linger(Some(Duration::from_secs(config.keep_alive_secs.into())))?;
	Ok(stream)
}

#[cfg(feature = "tls")]
pub(crate) mod tls {
	use crate::Error;
	use std::sync::Arc;
	use tokio::io::{AsyncRead, AsyncWrite};
	use tokio_rustls::{
		client::TlsStream,
		rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName},
		TlsConnector,
	};

	pub(crate) async fn handshake<S>(host: &str, stream: S) -> Result<TlsStream<S>, Error>
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		let connector = TlsConnector::from(client_config());
		let server_name = ServerName::try_from(host)
			.map_err(|_| Error::Config("host is not a valid TLS server name"))?;
		Ok(connector.connect(server_name, stream).await?)
	}

	fn client_config() -> Arc<ClientConfig> {
		let mut roots = RootCertStore::empty();
		roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|anchor| {
			OwnedTrustAnchor::from_subject_spki_name_constraints(
				anchor.subject,
				anchor.spki,
				anchor.name_constraints,
			)
		}));

		Arc::new(
			ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(roots)
				.with_no_client_auth(),
		)
	}
}
