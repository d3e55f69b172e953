//! Per-operation behavior: QoS 2 handshakes, local subscriptions,
//! unsubscribe and resubscribe, configuration guards.

mod support;

use std::time::Duration;
use support::{establish, local_options, new_connection, recv, MockBroker};
use tether_client::{Error, QoS, TopicSubscription};
use tether_protocol::{packets, Packet, PacketId};
use tokio::sync::mpsc;

#[tokio::test]
async fn qos2_publish_runs_the_four_way_handshake() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	let (tx, mut rx) = mpsc::unbounded_channel();
	let id = connection
		.publish("e/o", QoS::ExactlyOnce, false, "once", move |id, result| {
			let _ = tx.send((id, result));
		})
		.unwrap();

	let publish = session.expect_publish().await;
	assert_eq!(publish.qos(), tether_protocol::QoS::ExactlyOnce);
	assert_eq!(publish.id(), Some(id));

	session.send(packets::PubRec { id }.into()).await;

	// The client releases; the request is still in flight.
	match session.read_packet().await {
		Packet::PubRel(rel) => assert_eq!(rel.id, id),
		other => panic!("expected PubRel, got {other:?}"),
	}
	assert!(rx.try_recv().is_err());

	session.send(packets::PubComp { id }.into()).await;
	let (_, result) = recv(&mut rx).await;
	result.unwrap();
}

#[tokio::test]
async fn inbound_qos2_delivers_exactly_once_on_release() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	let (suback_tx, mut suback_rx) = mpsc::unbounded_channel();
	let (publish_tx, mut publish_rx) = mpsc::unbounded_channel();
	connection
		.subscribe(
			"q2/#",
			QoS::ExactlyOnce,
			move |publication| {
				let _ = publish_tx.send(publication.clone());
			},
			move |_, result| {
				let _ = suback_tx.send(result);
			},
		)
		.unwrap();
	let subscribe = session.expect_subscribe().await;
	session
		.send(
			packets::SubAck {
				id: subscribe.id,
				returns: vec![Ok(tether_protocol::QoS::ExactlyOnce)],
			}
			.into(),
		)
		.await;
	recv(&mut suback_rx).await.unwrap();

	let id = PacketId::new(21).unwrap();
	session
		.send(
			packets::Publish::ExactlyOnce {
				id,
				retain: false,
				duplicate: false,
				topic: "q2/a".try_into().unwrap(),
				payload: bytes::Bytes::from_static(b"exactly"),
			}
			.into(),
		)
		.await;

	// Receipt is acknowledged, but nothing is delivered yet.
	match session.read_packet().await {
		Packet::PubRec(rec) => assert_eq!(rec.id, id),
		other => panic!("expected PubRec, got {other:?}"),
	}
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(publish_rx.try_recv().is_err());

	// The release delivers it, exactly once.
	session.send(packets::PubRel { id }.into()).await;
	let publication = recv(&mut publish_rx).await;
	assert_eq!(publication.payload.as_ref(), b"exactly");

	match session.read_packet().await {
		Packet::PubComp(comp) => assert_eq!(comp.id, id),
		other => panic!("expected PubComp, got {other:?}"),
	}
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(publish_rx.try_recv().is_err());
}

#[tokio::test]
async fn local_subscription_never_touches_the_wire() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	let (done_tx, mut done_rx) = mpsc::unbounded_channel();
	let (publish_tx, mut publish_rx) = mpsc::unbounded_channel();
	connection
		.subscribe_local(
			"x/#",
			move |publication| {
				let _ = publish_tx.send(publication.topic.to_string());
			},
			move |_, result| {
				let _ = done_tx.send(result);
			},
		)
		.unwrap();
	recv(&mut done_rx).await.unwrap();

	// A publication matched by the local filter is routed to the handler,
	// even though the broker never saw a Subscribe.
	session
		.send(
			packets::Publish::AtMostOnce {
				retain: false,
				topic: "x/y".try_into().unwrap(),
				payload: bytes::Bytes::from_static(b"local"),
			}
			.into(),
		)
		.await;
	assert_eq!(recv(&mut publish_rx).await, "x/y");

	// Unsubscribing a local filter is also wire-free.
	let (done_tx, mut done_rx) = mpsc::unbounded_channel();
	connection
		.unsubscribe("x/#", move |_, result| {
			let _ = done_tx.send(result);
		})
		.unwrap();
	recv(&mut done_rx).await.unwrap();

	// Prove the socket stayed quiet: the next packet the broker sees is
	// the Disconnect, not a Subscribe or Unsubscribe.
	let (tx, mut rx) = mpsc::unbounded_channel();
	connection
		.disconnect(move || {
			let _ = tx.send(());
		})
		.unwrap();
	session.expect_disconnect().await;
	recv(&mut rx).await;
}

#[tokio::test]
async fn unsubscribe_remote_awaits_unsuback() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	let (suback_tx, mut suback_rx) = mpsc::unbounded_channel();
	connection
		.subscribe("a/b", QoS::AtLeastOnce, |_| {}, move |_, result| {
			let _ = suback_tx.send(result);
		})
		.unwrap();
	let subscribe = session.expect_subscribe().await;
	session
		.send(
			packets::SubAck {
				id: subscribe.id,
				returns: vec![Ok(tether_protocol::QoS::AtLeastOnce)],
			}
			.into(),
		)
		.await;
	recv(&mut suback_rx).await.unwrap();

	let (done_tx, mut done_rx) = mpsc::unbounded_channel();
	let id = connection
		.unsubscribe("a/b", move |id, result| {
			let _ = done_tx.send((id, result));
		})
		.unwrap();

	let unsubscribe = session.expect_unsubscribe().await;
	assert_eq!(unsubscribe.id, id);
	assert_eq!(unsubscribe.filters[0].as_str(), "a/b");

	// Not complete until the broker confirms.
	assert!(done_rx.try_recv().is_err());
	session.send(packets::UnsubAck { id }.into()).await;
	let (completed, result) = recv(&mut done_rx).await;
	assert_eq!(completed, id);
	result.unwrap();
}

#[tokio::test]
async fn subscribe_multiple_carries_every_filter() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	let (suback_tx, mut suback_rx) = mpsc::unbounded_channel();
	let topics = vec![
		TopicSubscription::new("m/1".try_into().unwrap(), QoS::AtMostOnce, |_| {}),
		TopicSubscription::new("m/2".try_into().unwrap(), QoS::AtLeastOnce, |_| {}),
		TopicSubscription::new("m/#".try_into().unwrap(), QoS::ExactlyOnce, |_| {}),
	];
	let id = connection
		.subscribe_multiple(topics, move |_, result| {
			let _ = suback_tx.send(result);
		})
		.unwrap();

	let subscribe = session.expect_subscribe().await;
	assert_eq!(subscribe.id, id);
	let filters: Vec<_> = subscribe
		.filters
		.iter()
		.map(|(filter, qos)| (filter.as_str(), *qos))
		.collect();
	assert_eq!(
		filters,
		[
			("m/1", tether_protocol::QoS::AtMostOnce),
			("m/2", tether_protocol::QoS::AtLeastOnce),
			("m/#", tether_protocol::QoS::ExactlyOnce),
		]
	);

	session
		.send(
			packets::SubAck {
				id,
				returns: vec![
					Ok(tether_protocol::QoS::AtMostOnce),
					Ok(tether_protocol::QoS::AtLeastOnce),
					Err(packets::SubscriptionRefused),
				],
			}
			.into(),
		)
		.await;

	let granted = recv(&mut suback_rx).await.unwrap();
	assert_eq!(granted.len(), 3);
	assert_eq!(granted[0].0.as_str(), "m/1");
	assert!(granted[2].1.is_err());
}

#[tokio::test]
async fn resubscribe_existing_batches_live_filters() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	for filter in ["rs/1", "rs/2"] {
		let (suback_tx, mut suback_rx) = mpsc::unbounded_channel();
		connection
			.subscribe(filter, QoS::AtLeastOnce, |_| {}, move |_, result| {
				let _ = suback_tx.send(result);
			})
			.unwrap();
		let subscribe = session.expect_subscribe().await;
		session
			.send(
				packets::SubAck {
					id: subscribe.id,
					returns: vec![Ok(tether_protocol::QoS::AtLeastOnce)],
				}
				.into(),
			)
			.await;
		recv(&mut suback_rx).await.unwrap();
	}

	// A local subscription must not leak into the batch.
	let (done_tx, mut done_rx) = mpsc::unbounded_channel();
	connection
		.subscribe_local("rs/local", |_| {}, move |_, result| {
			let _ = done_tx.send(result);
		})
		.unwrap();
	recv(&mut done_rx).await.unwrap();

	let (suback_tx, mut suback_rx) = mpsc::unbounded_channel();
	let id = connection
		.resubscribe_existing(move |_, result| {
			let _ = suback_tx.send(result);
		})
		.unwrap();

	let subscribe = session.expect_subscribe().await;
	assert_eq!(subscribe.id, id);
	let mut filters: Vec<_> = subscribe
		.filters
		.iter()
		.map(|(filter, _)| filter.to_string())
		.collect();
	filters.sort();
	assert_eq!(filters, ["rs/1", "rs/2"]);

	session
		.send(
			packets::SubAck {
				id,
				returns: vec![
					Ok(tether_protocol::QoS::AtLeastOnce),
					Ok(tether_protocol::QoS::AtLeastOnce),
				],
			}
			.into(),
		)
		.await;
	let granted = recv(&mut suback_rx).await.unwrap();
	assert_eq!(granted.len(), 2);
}

#[tokio::test]
async fn any_publish_handler_sees_unmatched_topics() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();

	let (any_tx, mut any_rx) = mpsc::unbounded_channel();
	connection
		.set_on_any_publish(move |publication| {
			let _ = any_tx.send(publication.topic.to_string());
		})
		.unwrap();

	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	// Registering the tap is refused on a live connection.
	assert!(matches!(
		connection.set_on_any_publish(|_| {}),
		Err(Error::InvalidState)
	));

	session
		.send(
			packets::Publish::AtMostOnce {
				retain: false,
				topic: "nobody/subscribed".try_into().unwrap(),
				payload: bytes::Bytes::from_static(b"?"),
			}
			.into(),
		)
		.await;
	assert_eq!(recv(&mut any_rx).await, "nobody/subscribed");
}

#[tokio::test]
async fn invalid_topics_fail_synchronously() {
	let connection = new_connection();

	assert!(matches!(
		connection.publish("bad/+/topic", QoS::AtMostOnce, false, "", |_, _| {}),
		Err(Error::InvalidTopic(_))
	));
	assert!(matches!(
		connection.subscribe("bad/#/filter", QoS::AtMostOnce, |_| {}, |_, _| {}),
		Err(Error::InvalidFilter(_))
	));
	assert!(matches!(
		connection.set_will("also/#", QoS::AtMostOnce, false, ""),
		Err(Error::InvalidTopic(_))
	));
}

#[tokio::test]
async fn qos0_publish_completes_without_an_ack() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();
	let mut session = establish(&connection, &broker, local_options(broker.port())).await;

	let (tx, mut rx) = mpsc::unbounded_channel();
	connection
		.publish("fire/forget", QoS::AtMostOnce, false, "now", move |id, result| {
			let _ = tx.send((id, result));
		})
		.unwrap();

	let publish = session.expect_publish().await;
	assert_eq!(publish.qos(), tether_protocol::QoS::AtMostOnce);
	assert_eq!(publish.id(), None);

	recv(&mut rx).await.1.unwrap();
}

#[tokio::test]
async fn will_and_login_ride_in_connect() {
	let broker = MockBroker::bind().await;
	let connection = new_connection();

	connection
		.set_will("status/gone", QoS::AtLeastOnce, true, "offline")
		.unwrap();
	connection.set_login("user", Some("secret")).unwrap();

	let (tx, mut rx) = mpsc::unbounded_channel();
	connection
		.connect(local_options(broker.port()), move |result| {
			let _ = tx.send(result);
		})
		.unwrap();

	let mut session = broker.accept().await;
	let connect = session.handshake(false).await;
	recv(&mut rx).await.unwrap();

	let will = connect.will.expect("will present");
	assert_eq!(will.topic.as_str(), "status/gone");
	assert_eq!(will.qos, tether_protocol::QoS::AtLeastOnce);
	assert!(will.retain);
	assert_eq!(will.payload.as_ref(), b"offline");

	let credentials = connect.credentials.expect("credentials present");
	assert_eq!(credentials.username, "user");
	assert_eq!(credentials.password.as_deref(), Some("secret"));
}
