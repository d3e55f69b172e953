//! A scripted broker for driving the client from the other end of the
//! socket.
#![allow(dead_code)]

use bytes::BytesMut;
use std::{io::Cursor, time::Duration};
use tether_client::{Client, ConnectOptions, Connection};
use tether_protocol::{
	frame::Frame,
	packets::{self, DecodeError},
	Packet,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	sync::mpsc,
	time::timeout,
};

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct MockBroker {
	listener: TcpListener,
}

impl MockBroker {
	pub async fn bind() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		Self { listener }
	}

	pub fn port(&self) -> u16 {
		self.listener.local_addr().unwrap().port()
	}

	pub async fn accept(&self) -> BrokerSession {
		let (stream, _) = timeout(WAIT, self.listener.accept())
			.await
			.expect("timed out waiting for the client to connect")
			.unwrap();
		BrokerSession {
			stream,
			buffer: BytesMut::with_capacity(8 * 1024),
		}
	}
}

pub struct BrokerSession {
	stream: TcpStream,
	buffer: BytesMut,
}

impl BrokerSession {
	pub async fn read_packet(&mut self) -> Packet {
		loop {
			let mut cursor = Cursor::new(&self.buffer[..]);
			match Frame::check(&mut cursor) {
				Ok(length) => {
					let bytes = self.buffer.split_to(length).freeze();
					return Packet::decode(&Frame::parse(bytes).unwrap()).unwrap();
				}
				Err(DecodeError::Incomplete) => {}
				Err(error) => panic!("client sent a malformed frame: {error}"),
			}

			let read = timeout(WAIT, self.stream.read_buf(&mut self.buffer))
				.await
				.expect("timed out waiting for a packet from the client")
				.unwrap();
			assert!(read > 0, "client closed the connection mid-read");
		}
	}

	pub async fn send(&mut self, packet: Packet) {
		let mut buf = BytesMut::new();
		packet.encode(&mut buf).unwrap();
		self.stream.write_all(&buf).await.unwrap();
	}

	pub async fn expect_connect(&mut self) -> packets::Connect {
		match self.read_packet().await {
			Packet::Connect(connect) => *connect,
			other => panic!("expected Connect, got {other:?}"),
		}
	}

	pub async fn expect_publish(&mut self) -> packets::Publish {
		match self.read_packet().await {
			Packet::Publish(publish) => *publish,
			other => panic!("expected Publish, got {other:?}"),
		}
	}

	pub async fn expect_subscribe(&mut self) -> packets::Subscribe {
		match self.read_packet().await {
			Packet::Subscribe(subscribe) => *subscribe,
			other => panic!("expected Subscribe, got {other:?}"),
		}
	}

	pub async fn expect_unsubscribe(&mut self) -> packets::Unsubscribe {
		match self.read_packet().await {
			Packet::Unsubscribe(unsubscribe) => *unsubscribe,
			other => panic!("expected Unsubscribe, got {other:?}"),
		}
	}

	pub async fn expect_disconnect(&mut self) {
		match self.read_packet().await {
			Packet::Disconnect => {}
			other => panic!("expected Disconnect, got {other:?}"),
		}
	}

	/// Answers the client's Connect with ConnAck.
	pub async fn handshake(&mut self, session_present: bool) -> packets::Connect {
		let connect = self.expect_connect().await;
		self.send(
			packets::ConnAck {
				session_present,
				return_code: packets::ConnAck::ACCEPTED,
			}
			.into(),
		)
		.await;
		connect
	}
}

/// Connect options pointed at the mock broker, with tests in mind: short
/// keep-alive, clean session.
pub fn local_options(port: u16) -> ConnectOptions {
	ConnectOptions {
		host: "127.0.0.1".into(),
		port,
		client_id: "tether-test".into(),
		keep_alive_secs: 60,
		..Default::default()
	}
}

/// Opens `connection` against the broker and completes the handshake.
pub async fn establish(
	connection: &Connection,
	broker: &MockBroker,
	options: ConnectOptions,
) -> BrokerSession {
	let (tx, mut rx) = mpsc::unbounded_channel();
	connection
		.connect(options, move |result| {
			let _ = tx.send(result);
		})
		.unwrap();

	let mut session = broker.accept().await;
	session.handshake(false).await;
	recv(&mut rx).await.unwrap();
	session
}

pub fn new_connection() -> Connection {
	Client::from_current().connection()
}

/// Waits for the next callback relayed through `rx`.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
	timeout(WAIT, rx.recv())
		.await
		.expect("timed out waiting for a callback")
		.expect("callback channel closed")
}
