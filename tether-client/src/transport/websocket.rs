//! MQTT over websockets.
//!
//! The protocol rides in binary websocket messages; [`WsByteStream`] adapts
//! the message stream back into the ordered byte stream the packet layer
//! expects. Outbound bytes are chunked to [`MESSAGE_CAPACITY`], so a large
//! publish spans several messages.

use super::{MqttStream, READ_CAPACITY};
use crate::{connection::SessionConfig, options::ProxyOptions, Error};
use base64ct::{Base64, Encoding};
use bytes::BytesMut;
use futures_util::{Sink, Stream};
use std::{
	cmp, io,
	pin::Pin,
	task::{ready, Context, Poll},
};
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
	net::TcpStream,
};
use tokio_tungstenite::{
	client_async,
	tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
	WebSocketStream,
};
use tracing::debug;

/// The upgrade request sent to start a websocket connection.
pub type HandshakeRequest = tokio_tungstenite::tungstenite::handshake::client::Request;

/// Edits the upgrade request before it is sent, e.g. to add signing
/// headers.
pub type HandshakeTransform = std::sync::Arc<dyn Fn(&mut HandshakeRequest) + Send + Sync>;

/// Payload budget of one outbound websocket message.
const MESSAGE_CAPACITY: usize = 4 * 1024;

pub(crate) async fn open(config: &SessionConfig) -> Result<MqttStream, Error> {
	let tcp = match &config.http_proxy {
		Some(proxy) => tunnel(proxy, &config.host, config.port).await?,
		None => super::tcp_connect(config).await?,
	};

	let scheme = if config.tls { "wss" } else { "ws" };
	let mut request = format!("{scheme}://{}:{}/mqtt", config.host, config.port)
		.into_client_request()
		.map_err(to_io_error)?;
	request.headers_mut().insert(
		"Sec-WebSocket-Protocol",
		HeaderValue::from_static("mqtt"),
	);
	if let Some(transform) = &config.ws_transform {
		transform(&mut request);
	}

	if config.tls {
		#[cfg(feature = "tls")]
		{
			let tls = super::tls::handshake(&config.host, tcp).await?;
			let (socket, _response) = client_async(request, tls).await.map_err(to_io_error)?;
			return Ok(MqttStream::new(
				Box::new(WsByteStream::new(socket)),
				READ_CAPACITY,
			));
		}
		#[cfg(not(feature = "tls"))]
		{
			return Err(Error::Config("built without tls support"));
		}
	}

	let (socket, _response) = client_async(request, tcp).await.map_err(to_io_error)?;
	Ok(MqttStream::new(
		Box::new(WsByteStream::new(socket)),
		READ_CAPACITY,
	))
}

fn to_io_error(error: tokio_tungstenite::tungstenite::Error) -> Error {
	Error::from(io::Error::new(io::ErrorKind::Other, error))
}

/// Establishes a CONNECT tunnel through an HTTP proxy.
async fn tunnel(proxy: &ProxyOptions, host: &str, port: u16) -> Result<TcpStream, Error> {
	debug!(proxy = %proxy.host, "tunnelling through HTTP proxy");
	let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

	let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
	if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
		let token = Base64::encode_string(format!("{username}:{password}").as_bytes());
		request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
	}
	request.push_str("\r\n");
	stream.write_all(request.as_bytes()).await?;

	// Read up to the blank line ending the response head. The proxy sends
	// nothing further until we do, so over-reading is not a concern.
	let mut response = BytesMut::with_capacity(1024);
	loop {
		if 0 == stream.read_buf(&mut response).await? {
			return Err(proxy_error("proxy closed the connection during CONNECT"));
		}
		if response.windows(4).any(|window| window == b"\r\n\r\n") {
			break;
		}
		if response.len() > 8 * 1024 {
			return Err(proxy_error("oversized proxy response"));
		}
	}

	let head = std::str::from_utf8(&response)
		.map_err(|_| proxy_error("proxy response is not valid UTF-8"))?;
	let status = head.split_whitespace().nth(1);
	if status != Some("200") {
		return Err(proxy_error("proxy refused the CONNECT request"));
	}

	Ok(stream)
}

fn proxy_error(message: &'static str) -> Error {
	Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, message))
}

/// Presents a binary-message websocket as a plain byte stream.
pub(crate) struct WsByteStream<S> {
	inner: WebSocketStream<S>,
	/// Bytes of received messages not yet claimed by a read.
	read_buffer: BytesMut,
}

impl<S> WsByteStream<S> {
	pub fn new(inner: WebSocketStream<S>) -> Self {
		Self {
			inner,
			read_buffer: BytesMut::new(),
		}
	}
}

impl<S> AsyncRead for WsByteStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		loop {
			if !self.read_buffer.is_empty() {
				let n = cmp::min(buf.remaining(), self.read_buffer.len());
				buf.put_slice(&self.read_buffer.split_to(n));
				return Poll::Ready(Ok(()));
			}

			let message = ready!(Pin::new(&mut self.inner).poll_next(cx));
			match message {
				Some(Ok(Message::Binary(data))) => {
					self.read_buffer.extend_from_slice(&data);
				}
				// Pings are answered by tungstenite on the next write.
				Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
				Some(Ok(Message::Text(_))) => {
					return Poll::Ready(Err(io::Error::new(
						io::ErrorKind::InvalidData,
						"unexpected text message on an MQTT websocket",
					)));
				}
				// A close frame or a vanished peer both read as EOF.
				Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
				Some(Err(error)) => {
					return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, error)));
				}
			}
		}
	}
}

impl<S> AsyncWrite for WsByteStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		ready!(Pin::new(&mut self.inner).poll_ready(cx))
			.map_err(|error| io::Error::new(io::ErrorKind::BrokenPipe, error))?;

		let chunk = &buf[..cmp::min(buf.len(), MESSAGE_CAPACITY)];
		Pin::new(&mut self.inner)
			.start_send(Message::Binary(chunk.to_vec()))
			.map_err(|error| io::Error::new(io::ErrorKind::BrokenPipe, error))?;

		Poll::Ready(Ok(chunk.len()))
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner)
			.poll_flush(cx)
			.map_err(|error| io::Error::new(io::ErrorKind::BrokenPipe, error))
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner)
			.poll_close(cx)
			.map_err(|error| io::Error::new(io::ErrorKind::BrokenPipe, error))
	}
}
