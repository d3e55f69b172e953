//! The connection's I/O worker task.
//!
//! One worker runs per connect-to-disconnect lifecycle. It owns everything
//! single-threaded about the connection: the active stream, the ongoing
//! request set, the subscription tree, the ping state and the reconnect
//! schedule. User threads reach it only through the synced region and the
//! command channel.

use super::{
	backoff::Backoff,
	core::{Command, CommandRx, ConnectionCore, ConnectionState, SessionConfig},
	request::{Ack, Request, RequestKind},
};
use crate::{
	topic_tree::{Subscription, TopicTree},
	transport::{self, MqttStream},
	Error, Publication,
};
use bytes::BytesMut;
use std::{
	collections::{HashMap, HashSet},
	future::poll_fn,
	sync::Arc,
	time::Duration,
};
use tether_protocol::{
	packets::{self, ConnAck},
	Packet, PacketId,
};
use tokio::time::{self, Instant};
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, trace, warn};

/// Everything scheduled on the worker's timer wheel.
#[derive(Clone, Copy, Debug)]
enum Timer {
	/// Expiry of the ongoing request with this id.
	Request(PacketId),
	/// ConnAck did not arrive in time.
	ConnAck,
	/// PingResp did not arrive in time.
	Ping,
	/// The connection has been up long enough to forget past failures.
	BackoffReset,
}

/// Outcome of encoding one pending request.
enum SendOutcome {
	/// An acknowledgement is expected.
	Ongoing,
	/// Nothing further expected from the broker.
	Complete,
	/// Previously attempted and not eligible for re-sending.
	Abandon,
	Failed(Error),
}

enum Flow {
	/// Schedule another attempt after the hold-off.
	Retry,
	/// The state machine reached Disconnected; the worker is done.
	Exit,
}

pub(crate) struct Worker {
	tree: TopicTree,
	backoff: Backoff,
	/// Requests sent on the current channel, awaiting their ack.
	ongoing: HashSet<PacketId>,
	/// Inbound QoS 2 publications held until PubRel.
	incoming: HashMap<PacketId, Publication>,
	waiting_on_ping_response: bool,
	ping_timeout_key: Option<tokio_util::time::delay_queue::Key>,
}

/// Entry point of the worker task. The `Arc` this takes is the pin that
/// keeps the connection alive until the state machine reaches Disconnected.
pub(crate) async fn run(conn: Arc<ConnectionCore>, mut commands: CommandRx) {
	let config = conn.session_config();
	let mut worker = Worker {
		tree: TopicTree::new(),
		backoff: Backoff::new(config.reconnect_min, config.reconnect_max),
		ongoing: HashSet::new(),
		incoming: HashMap::new(),
		waiting_on_ping_response: false,
		ping_timeout_key: None,
	};

	loop {
		let config = conn.session_config();
		worker
			.backoff
			.configure(config.reconnect_min, config.reconnect_max);

		let shutdown_error = match transport::open(&config).await {
			Ok(stream) => {
				if conn.state() == ConnectionState::Disconnecting {
					// The user disconnected while the channel was being
					// set up; close it without sending Connect.
					None
				} else {
					worker
						.run_session(&conn, &mut commands, stream, &config)
						.await
				}
			}
			Err(error) => {
				debug!(error = %error, "failed to open channel");
				Some(error)
			}
		};

		match worker.handle_channel_loss(&conn, &config, shutdown_error) {
			Flow::Exit => break,
			Flow::Retry => {
				let delay = worker.backoff.next_delay();
				debug!(delay_secs = delay.as_secs(), "waiting before reconnect attempt");

				let sleep = time::sleep(delay);
				tokio::pin!(sleep);
				loop {
					tokio::select! {
						_ = &mut sleep => break,
						command = commands.recv() => match command {
							Some(Command::Disconnect) | None => {
								debug!("reconnect abandoned by user disconnect");
								// There is no channel to lose; this applies
								// the clean-session rule and completes the
								// disconnect.
								if let Flow::Exit =
									worker.handle_channel_loss(&conn, &config, None)
								{
									return;
								}
								break;
							}
							// Work stays queued until the channel is back.
							Some(Command::Dispatch) => {}
						},
					}
				}
			}
		}
	}
}

impl Worker {
	/// Runs one channel from Connect to its shutdown. Returns the error the
	/// channel died with, or `None` for an orderly close (user disconnect
	/// or peer hangup; the state machine tells those apart).
	async fn run_session(
		&mut self,
		conn: &Arc<ConnectionCore>,
		commands: &mut CommandRx,
		mut stream: MqttStream,
		config: &SessionConfig,
	) -> Option<Error> {
		let connect = packets::Connect {
			client_id: config.client_id.clone(),
			keep_alive: config.keep_alive_secs,
			clean_session: config.clean_session,
			will: config.will.clone(),
			credentials: config.credentials.clone(),
		};

		debug!(host = %config.host, port = config.port, "channel open, sending Connect");
		if let Err(error) = stream.write_packet(&connect.into()).await {
			return Some(error);
		}

		let mut timers: DelayQueue<Timer> = DelayQueue::new();
		let mut connack_key = Some(timers.insert(Timer::ConnAck, config.ping_timeout));

		// Pings fire one second ahead of the keep-alive deadline, and the
		// schedule is pushed back by any other outbound packet.
		let ping_period =
			Duration::from_secs(u64::from(config.keep_alive_secs.saturating_sub(1)).max(1));
		let mut ping_interval = time::interval_at(Instant::now() + ping_period, ping_period);

		let mut established = false;

		enum Event {
			Command(Option<Command>),
			Packet(Result<Option<Packet>, Error>),
			Timer(Timer),
			PingDue,
		}

		loop {
			// An empty timer queue resolves to `None`, which disables the
			// branch for this round.
			let event = tokio::select! {
				command = commands.recv() => Event::Command(command),
				packet = stream.read_packet() => Event::Packet(packet),
				Some(expired) = poll_fn(|cx| timers.poll_expired(cx)) => {
					Event::Timer(expired.into_inner())
				}
				_ = ping_interval.tick(), if established => Event::PingDue,
			};

			match event {
				Event::Command(Some(Command::Dispatch)) => {
					if established {
						match self.drive_pending(conn, config, &mut stream, &mut timers).await {
							Ok(true) => ping_interval.reset(),
							Ok(false) => {}
							Err(error) => return Some(error),
						}
					}
				}
				Event::Command(Some(Command::Disconnect)) | Event::Command(None) => {
					debug!("closing channel for user disconnect");
					if let Err(error) = stream.write_packet(&Packet::Disconnect).await {
						return Some(error);
					}
					return None;
				}
				Event::Packet(Err(error)) => return Some(error),
				Event::Packet(Ok(None)) => {
					warn!("connection closed by peer");
					return None;
				}
				Event::Packet(Ok(Some(packet))) => {
					trace!(packet = ?packet, "read from stream");
					match packet {
						Packet::ConnAck(ack) => {
							if established {
								return Some(Error::ProtocolViolation(
									"second ConnAck on one channel".into(),
								));
							}
							if let Some(key) = connack_key.take() {
								timers.try_remove(&key);
							}
							if ack.return_code != ConnAck::ACCEPTED {
								warn!(code = ack.return_code, "broker refused the connection");
								return Some(Error::ConnectionRefused(ack.return_code));
							}

							established = true;
							let previous = conn.set_connected();
							match previous {
								ConnectionState::Connecting => {
									info!(
										session_present = ack.session_present,
										"connection established"
									);
									if let Some(callback) = conn.take_connect_callback() {
										callback(Ok(ack));
									}
								}
								ConnectionState::Reconnecting => {
									info!(
										session_present = ack.session_present,
										"session resumed"
									);
									timers.insert(
										Timer::BackoffReset,
										self.backoff.stability_window(),
									);
									if let Some(handler) = conn.resumption_handler() {
										handler(ack);
									}
								}
								// The user disconnected while the broker
								// was considering us; the Disconnect
								// command is already queued.
								_ => {}
							}

							ping_interval.reset();
							match self.drive_pending(conn, config, &mut stream, &mut timers).await
							{
								Ok(true) => ping_interval.reset(),
								Ok(false) => {}
								Err(error) => return Some(error),
							}
						}
						Packet::Publish(publish) => {
							if let Err(error) =
								self.handle_publish(conn, *publish, &mut stream).await
							{
								return Some(error);
							}
						}
						Packet::PubAck(ack) => {
							self.complete_request(conn, &mut timers, ack.id, Ack::Done)
						}
						Packet::PubRec(rec) => {
							let id = rec.id;
							let known = {
								let mut synced = conn.lock_synced();
								match synced.outstanding.get_mut(&id) {
									Some(request) => {
										if let RequestKind::Publish { released, .. } =
											&mut request.kind
										{
											*released = true;
											true
										} else {
											false
										}
									}
									None => false,
								}
							};
							if known {
								if let Err(error) =
									stream.write_packet(&packets::PubRel { id }.into()).await
								{
									return Some(error);
								}
							} else {
								warn!(id = id.get(), "PubRec for unknown request, dropping");
							}
						}
						Packet::PubComp(comp) => {
							self.complete_request(conn, &mut timers, comp.id, Ack::Done)
						}
						Packet::PubRel(rel) => {
							let id = rel.id;
							match self.incoming.remove(&id) {
								Some(publication) => self.dispatch(conn, &publication),
								None => warn!(id = id.get(), "PubRel for unknown Publish"),
							}
							if let Err(error) =
								stream.write_packet(&packets::PubComp { id }.into()).await
							{
								return Some(error);
							}
						}
						Packet::SubAck(ack) => self.complete_request(
							conn,
							&mut timers,
							ack.id,
							Ack::SubAck(ack.returns),
						),
						Packet::UnsubAck(ack) => {
							self.complete_request(conn, &mut timers, ack.id, Ack::Done)
						}
						Packet::PingResp => {
							if !self.waiting_on_ping_response {
								warn!("unsolicited PingResp");
							}
							self.waiting_on_ping_response = false;
							if let Some(key) = self.ping_timeout_key.take() {
								timers.try_remove(&key);
							}
						}
						Packet::Connect(_)
						| Packet::Subscribe(_)
						| Packet::Unsubscribe(_)
						| Packet::PingReq
						| Packet::Disconnect => {
							return Some(Error::ProtocolViolation(
								"broker sent a client-to-server packet".into(),
							));
						}
					}
				}
				Event::Timer(Timer::Request(id)) => {
					warn!(id = id.get(), "request timed out");
					self.ongoing.remove(&id);
					let request = {
						let mut synced = conn.lock_synced();
						synced.outstanding.remove(&id)
					};
					if let Some(mut request) = request {
						request.timeout_key = None;
						request.finish(Err(Error::Timeout));
					}
				}
				Event::Timer(Timer::ConnAck) => {
					connack_key = None;
					if !established {
						error!("ConnAck timeout");
						return Some(Error::Timeout);
					}
				}
				Event::Timer(Timer::Ping) => {
					self.ping_timeout_key = None;
					if self.waiting_on_ping_response {
						self.waiting_on_ping_response = false;
						error!("ping timeout");
						return Some(Error::Timeout);
					}
				}
				Event::Timer(Timer::BackoffReset) => {
					trace!("connection stable, resetting reconnect hold-off");
					self.backoff.reset();
				}
				Event::PingDue => {
					if !self.waiting_on_ping_response {
						let _ = conn.submit(true, |_| RequestKind::Ping);
						match self.drive_pending(conn, config, &mut stream, &mut timers).await {
							Ok(true) => ping_interval.reset(),
							Ok(false) => {}
							Err(error) => return Some(error),
						}
					}
				}
			}
		}
	}

	/// Sends queued requests until the queue runs dry or the state machine
	/// leaves Connected. Returns whether anything was written.
	async fn drive_pending(
		&mut self,
		conn: &Arc<ConnectionCore>,
		config: &SessionConfig,
		stream: &mut MqttStream,
		timers: &mut DelayQueue<Timer>,
	) -> Result<bool, Error> {
		let mut wrote = false;
		let mut buf = BytesMut::new();

		loop {
			buf.clear();

			// Pick the next request and encode it under the lock; the
			// actual write happens with the lock released.
			let (id, outcome, is_ping) = {
				let mut synced = conn.lock_synced();
				if synced.state != ConnectionState::Connected {
					break;
				}
				let Some(id) = synced.pending.pop_front() else {
					break;
				};
				let Some(request) = synced.outstanding.get_mut(&id) else {
					continue;
				};

				let outcome = self.prepare_send(request, &mut buf);
				let is_ping = matches!(request.kind, RequestKind::Ping);

				match &outcome {
					SendOutcome::Ongoing => {
						self.ongoing.insert(id);
						// Armed at send submission; the transport's write
						// completion is not reliable enough to anchor on.
						if let Some(timeout) = config.operation_timeout {
							let key = timers.insert(Timer::Request(id), timeout);
							request.timeout_key = Some(key);
						}
					}
					SendOutcome::Complete => {
						self.ongoing.insert(id);
					}
					SendOutcome::Abandon | SendOutcome::Failed(_) => {}
				}
				(id, outcome, is_ping)
			};

			match outcome {
				SendOutcome::Abandon => {
					self.finish_detached(conn, id, Err(Error::NotConnected));
					continue;
				}
				SendOutcome::Failed(error) => {
					warn!(id = id.get(), error = %error, "failed to encode request");
					self.finish_detached(conn, id, Err(error));
					continue;
				}
				SendOutcome::Ongoing => {
					if !buf.is_empty() {
						stream.write(&mut buf).await?;
						wrote = true;
					}
				}
				SendOutcome::Complete => {
					if !buf.is_empty() {
						stream.write(&mut buf).await?;
						wrote = true;
					}
					self.ongoing.remove(&id);
					self.finish_detached(conn, id, Ok(Ack::Done));

					if is_ping {
						self.waiting_on_ping_response = true;
						self.ping_timeout_key =
							Some(timers.insert(Timer::Ping, config.ping_timeout));
					}
				}
			}
		}

		Ok(wrote)
	}

	/// Removes `id` from the outstanding table and fires its completion.
	fn finish_detached(&mut self, conn: &Arc<ConnectionCore>, id: PacketId, result: Result<Ack, Error>) {
		let request = {
			let mut synced = conn.lock_synced();
			synced.outstanding.remove(&id)
		};
		if let Some(request) = request {
			request.finish(result);
		}
	}

	/// Encodes one request into `buf`, applying its side effects on the
	/// subscription tree. Runs on the worker with the synced lock held; no
	/// I/O happens here.
	fn prepare_send(&mut self, request: &mut Request, buf: &mut BytesMut) -> SendOutcome {
		if request.attempts > 0 && request.abandon_on_reconnect {
			return SendOutcome::Abandon;
		}
		request.attempts += 1;
		let first_attempt = request.attempts == 1;
		let id = request.id;

		match &mut request.kind {
			RequestKind::Publish { message, released, .. } => {
				// A QoS 2 publish that already got its PubRec resumes from
				// the release step.
				if *released {
					if let Err(error) = (packets::PubRel { id }).encode(buf) {
						return SendOutcome::Failed(error.into());
					}
					return SendOutcome::Ongoing;
				}

				if !first_attempt {
					if let packets::Publish::AtLeastOnce { duplicate, .. }
					| packets::Publish::ExactlyOnce { duplicate, .. } = message
					{
						*duplicate = true;
					}
				}
				if let Err(error) = message.encode(buf) {
					return SendOutcome::Failed(error.into());
				}
				match message.qos() {
					tether_protocol::QoS::AtMostOnce => SendOutcome::Complete,
					_ => SendOutcome::Ongoing,
				}
			}
			RequestKind::Subscribe {
				topics, committed, ..
			} => {
				let packet = packets::Subscribe {
					id,
					filters: topics
						.iter()
						.map(|topic| (topic.filter.clone(), topic.qos))
						.collect(),
				};

				if !*committed {
					let mut transaction = self.tree.transaction();
					for topic in topics.iter() {
						transaction.insert(Subscription {
							filter: topic.filter.clone(),
							qos: topic.qos,
							handler: Some(Arc::clone(&topic.on_publish)),
							local: false,
						});
					}
					if let Err(error) = packet.encode(buf) {
						// Dropping the transaction rolls the tree back.
						return SendOutcome::Failed(error.into());
					}
					transaction.commit();
					*committed = true;
				} else if let Err(error) = packet.encode(buf) {
					return SendOutcome::Failed(error.into());
				}

				SendOutcome::Ongoing
			}
			RequestKind::SubscribeLocal { topic, .. } => {
				self.tree.insert(Subscription {
					filter: topic.filter.clone(),
					qos: topic.qos,
					handler: Some(Arc::clone(&topic.on_publish)),
					local: true,
				});
				SendOutcome::Complete
			}
			RequestKind::Unsubscribe {
				filters,
				wire_needed,
				..
			} => {
				match *wire_needed {
					None => {
						let mut transaction = self.tree.transaction();
						let mut remote = false;
						for filter in filters.iter() {
							match transaction.remove(filter) {
								Some(subscription) => remote |= !subscription.local,
								// Unknown filter: let the broker decide.
								None => remote = true,
							}
						}
						if remote {
							let packet = packets::Unsubscribe {
								id,
								filters: filters.clone(),
							};
							if let Err(error) = packet.encode(buf) {
								return SendOutcome::Failed(error.into());
							}
						}
						transaction.commit();
						*wire_needed = Some(remote);
						if remote {
							SendOutcome::Ongoing
						} else {
							SendOutcome::Complete
						}
					}
					Some(true) => {
						let packet = packets::Unsubscribe {
							id,
							filters: filters.clone(),
						};
						if let Err(error) = packet.encode(buf) {
							return SendOutcome::Failed(error.into());
						}
						SendOutcome::Ongoing
					}
					Some(false) => SendOutcome::Complete,
				}
			}
			RequestKind::Resubscribe { filters, .. } => {
				if first_attempt {
					*filters = self.tree.remote_filters();
				}
				if filters.is_empty() {
					return SendOutcome::Complete;
				}
				let packet = packets::Subscribe {
					id,
					filters: filters.clone(),
				};
				if let Err(error) = packet.encode(buf) {
					return SendOutcome::Failed(error.into());
				}
				SendOutcome::Ongoing
			}
			RequestKind::Ping => {
				if let Err(error) = packets::PingReq.encode(buf) {
					return SendOutcome::Failed(error.into());
				}
				SendOutcome::Complete
			}
		}
	}

	/// Completes an ongoing request from a broker acknowledgement.
	///
	/// An id with no ongoing request is a protocol violation or an ack that
	/// lost the race against its timeout; either way it is logged and
	/// dropped.
	fn complete_request(
		&mut self,
		conn: &Arc<ConnectionCore>,
		timers: &mut DelayQueue<Timer>,
		id: PacketId,
		ack: Ack,
	) {
		if !self.ongoing.remove(&id) {
			warn!(id = id.get(), "acknowledgement for unknown request, dropping");
			return;
		}

		let request = {
			let mut synced = conn.lock_synced();
			synced.outstanding.remove(&id)
		};
		let Some(mut request) = request else {
			warn!(id = id.get(), "ongoing request missing from outstanding table");
			return;
		};

		if let Some(key) = request.timeout_key.take() {
			timers.try_remove(&key);
		}
		request.finish(Ok(ack));
	}

	/// Routes an inbound Publish and produces the QoS acknowledgement.
	async fn handle_publish(
		&mut self,
		conn: &Arc<ConnectionCore>,
		publish: packets::Publish,
		stream: &mut MqttStream,
	) -> Result<(), Error> {
		let publication = Publication {
			retain: publish.retain(),
			duplicate: publish.duplicate(),
			qos: publish.qos(),
			topic: publish.topic().to_topic_buf(),
			payload: publish.payload().clone(),
		};

		match publish {
			packets::Publish::AtMostOnce { .. } => self.dispatch(conn, &publication),
			packets::Publish::AtLeastOnce { id, .. } => {
				self.dispatch(conn, &publication);
				stream.write_packet(&packets::PubAck { id }.into()).await?;
			}
			packets::Publish::ExactlyOnce { id, .. } => {
				// Held back until PubRel so the handler runs exactly once.
				self.incoming.insert(id, publication);
				stream.write_packet(&packets::PubRec { id }.into()).await?;
			}
		}

		Ok(())
	}

	fn dispatch(&self, conn: &Arc<ConnectionCore>, publication: &Publication) {
		conn.publish_to_any_handler(publication);
		let dispatched = self.tree.dispatch(publication);
		trace!(
			topic = %publication.topic,
			handlers = dispatched,
			"dispatched publication"
		);
	}

	/// The one transition point for every way a channel can end: broker
	/// hangup, timeout, transport failure, user disconnect or a failed
	/// connect attempt. Applies the clean-session rule, moves the state
	/// machine and fires the lifecycle callbacks.
	fn handle_channel_loss(
		&mut self,
		conn: &Arc<ConnectionCore>,
		config: &SessionConfig,
		error: Option<Error>,
	) -> Flow {
		self.waiting_on_ping_response = false;
		self.ping_timeout_key = None;

		let (previous, cancelled) = {
			let mut synced = conn.lock_synced();

			let cancelled: Vec<Request> = if config.clean_session {
				// The session dies with the channel; so does every request
				// riding on it.
				self.incoming.clear();
				let ids: Vec<PacketId> = self
					.ongoing
					.drain()
					.chain(synced.pending.drain(..))
					.collect();
				ids.into_iter()
					.filter_map(|id| synced.outstanding.remove(&id))
					.collect()
			} else {
				// Acks for these will never arrive; re-drive them on the
				// next channel.
				for id in std::mem::take(&mut self.ongoing) {
					if let Some(request) = synced.outstanding.get_mut(&id) {
						request.timeout_key = None;
					}
					synced.pending.push_back(id);
				}
				Vec::new()
			};

			let previous = synced.state;
			match previous {
				ConnectionState::Connected => {
					debug!("channel lost while connected, switching to Reconnecting");
					synced.state = ConnectionState::Reconnecting;
				}
				ConnectionState::Connecting | ConnectionState::Disconnecting => {
					synced.state = ConnectionState::Disconnected;
					synced.worker_tx = None;
				}
				ConnectionState::Reconnecting | ConnectionState::Disconnected => {}
			}

			(previous, cancelled)
		};

		for request in cancelled {
			request.finish(Err(Error::CancelledForCleanSession));
		}

		let error = error.unwrap_or(Error::UnexpectedHangup);
		match previous {
			ConnectionState::Reconnecting => {
				trace!("reconnect attempt failed, scheduling the next");
				Flow::Retry
			}
			ConnectionState::Connected => {
				info!(error = %error, "connection interrupted");
				if let Some(handler) = conn.interruption_handler() {
					handler(error);
				}

				// The user may have called disconnect from the handler.
				let stopped = {
					let mut synced = conn.lock_synced();
					if synced.state == ConnectionState::Disconnecting {
						synced.state = ConnectionState::Disconnected;
						synced.worker_tx = None;
						true
					} else {
						false
					}
				};
				if stopped {
					debug!("disconnect requested from the interruption handler");
					conn.fire_disconnect();
					Flow::Exit
				} else {
					Flow::Retry
				}
			}
			ConnectionState::Disconnecting => {
				info!("disconnect complete");
				conn.fire_disconnect();
				Flow::Exit
			}
			ConnectionState::Connecting => {
				info!(error = %error, "connection attempt failed");
				if let Some(callback) = conn.take_connect_callback() {
					callback(Err(error));
				}
				Flow::Exit
			}
			ConnectionState::Disconnected => Flow::Exit,
		}
	}
}
