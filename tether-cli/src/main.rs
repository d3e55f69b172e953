use clap::{Parser, Subcommand, ValueEnum};
use std::process;
use tether_client::{Client, ConnectOptions, QoS};
use tokio::sync::oneshot;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	setup_tracing()?;

	let arguments = Arguments::parse();
	let options = connect_options(&arguments);
	let qos = arguments.qos.into();

	let client = Client::from_current();
	let connection = client.connection();

	// Bridge the connect callback into this task.
	let (connected_tx, connected_rx) = oneshot::channel();
	connection.connect(options, move |result| {
		let _ = connected_tx.send(result);
	})?;
	let ack = connected_rx.await??;
	tracing::debug!(session_present = ack.session_present, "connected");

	match arguments.command {
		Commands::Sub { topic } => {
			let (suback_tx, suback_rx) = oneshot::channel();
			connection.subscribe(
				topic.as_str(),
				qos,
				|publication| {
					let payload = String::from_utf8_lossy(&publication.payload);
					println!("{}: {payload}", publication.topic);
				},
				move |_, result| {
					let _ = suback_tx.send(result);
				},
			)?;

			match suback_rx.await? {
				Ok(Ok(granted)) => tracing::debug!(?granted, "subscribed"),
				Ok(Err(refused)) => {
					return Err(Box::new(refused_error(refused)) as Box<dyn std::error::Error>)
				}
				Err(error) => return Err(error.into()),
			}

			// Print messages until interrupted.
			tokio::signal::ctrl_c().await?;
		}
		Commands::Pub {
			topic,
			payload,
			retain,
		} => {
			let (done_tx, done_rx) = oneshot::channel();
			connection.publish(topic.as_str(), qos, retain, payload, move |_, result| {
				let _ = done_tx.send(result);
			})?;
			done_rx.await??;
		}
	}

	let (disconnected_tx, disconnected_rx) = oneshot::channel();
	connection.disconnect(move || {
		let _ = disconnected_tx.send(());
	})?;
	let _ = disconnected_rx.await;

	Ok(())
}

fn refused_error(refused: tether_client::SubscriptionRefused) -> std::io::Error {
	std::io::Error::new(
		std::io::ErrorKind::PermissionDenied,
		format!("broker refused the subscription: {refused:?}"),
	)
}

fn setup_tracing() -> Result<(), SetGlobalDefaultError> {
	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::ERROR.into())
		.with_env_var("TETHER_LOG")
		.try_from_env();

	let subscriber = tracing_subscriber::fmt()
		.with_target(false)
		.with_env_filter(filter.unwrap_or_default())
		.finish();

	tracing::subscriber::set_global_default(subscriber)
}

fn connect_options(arguments: &Arguments) -> ConnectOptions {
	ConnectOptions {
		host: arguments.host.clone(),
		port: arguments.port,
		client_id: arguments
			.id
			.clone()
			.unwrap_or_else(|| format!("tether-cli:{}", process::id())),
		clean_session: !arguments.persistent_session,
		keep_alive_secs: arguments.keep_alive,
		tls: arguments.tls,
		..Default::default()
	}
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Arguments {
	#[command(subcommand)]
	command: Commands,

	/// MQTT broker to connect to.
	#[arg(
		long,
		short = 'H',
		global = true,
		default_value = "localhost",
		env = "TETHER_HOST"
	)]
	host: String,

	#[arg(long, short, global = true, default_value = "1883", env = "TETHER_PORT")]
	port: u16,

	/// Connect over TLS.
	#[arg(long, global = true)]
	tls: bool,

	/// Client id to present to the broker.
	#[arg(long, short = 'i', global = true, env = "TETHER_ID")]
	id: Option<String>,

	/// Keep-alive interval, in seconds.
	#[arg(short = 'k', long, global = true, default_value = "60")]
	keep_alive: u16,

	/// Ask the broker to keep session state across connections.
	#[arg(short = 'c', long, global = true)]
	persistent_session: bool,

	#[arg(long, value_enum, global = true, default_value = "qos0")]
	qos: InputQoS,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Subscribe to a topic filter and print matching messages.
	Sub {
		#[arg(default_value = "#")]
		topic: String,
	},
	/// Publish a message.
	Pub {
		topic: String,
		payload: String,

		/// Ask the broker to retain the message.
		#[arg(long)]
		retain: bool,
	},
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputQoS {
	Qos0,
	Qos1,
	Qos2,
}

impl From<InputQoS> for QoS {
	fn from(value: InputQoS) -> Self {
		match value {
			InputQoS::Qos0 => QoS::AtMostOnce,
			InputQoS::Qos1 => QoS::AtLeastOnce,
			InputQoS::Qos2 => QoS::ExactlyOnce,
		}
	}
}
