//! Courier command line client.
//!
//! `courier publish` sends sample messages to a destination and
//! `courier subscribe` prints matching deliveries until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use courier_client::{
    AckMode, ClientError, ConnectOptions, Connection, ErrorStream, Message, SubscriptionEvent,
    SubscriptionOptions, TcpConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CourierConfig;
use logging::CourierLogFormatter;

#[cfg(feature = "tls")]
use courier_client::Endpoint;
#[cfg(feature = "tls")]
use courier_session::{make_client_config, TlsClientConfig};

/// Courier publish/subscribe client
#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Courier publish/subscribe client")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "courier.yaml")]
    config: PathBuf,

    /// Server URL, e.g. tcp://localhost:8585
    #[arg(long)]
    url: Option<String>,

    /// User name
    #[arg(long)]
    username: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// Client identifier
    #[arg(long)]
    client_id: Option<String>,

    /// Heartbeat interval, e.g. 10s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to CA certificate file (PEM format) for tls:// URLs
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Path to client certificate file (PEM format)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to client private key file (PEM format)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Server name for TLS SNI
    #[arg(long)]
    tls_sni: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish sample messages
    Publish {
        /// Destination of the messages
        #[arg(long, default_value = "sample")]
        dest: String,

        /// Text carried in each message
        #[arg(long, default_value = "hello, world")]
        text: String,

        /// Number of messages to publish
        #[arg(long, default_value_t = 1)]
        count: u64,

        /// Delay between messages, e.g. 1s
        #[arg(long, default_value = "1s")]
        interval: humantime::Duration,
    },

    /// Print deliveries until interrupted
    Subscribe {
        /// Matcher, e.g. {"type":"example"}
        #[arg(long, default_value = "{}")]
        matcher: String,

        /// Durable name
        #[arg(long)]
        durable: Option<String>,

        /// Acknowledgment mode
        #[arg(long, value_enum, default_value = "auto")]
        ack: AckArg,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AckArg {
    Auto,
    Client,
    None,
}

impl From<AckArg> for AckMode {
    fn from(arg: AckArg) -> Self {
        match arg {
            AckArg::Auto => AckMode::Auto,
            AckArg::Client => AckMode::Client,
            AckArg::None => AckMode::None,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("courier={}", args.log_level).parse()?)
        .add_directive(format!("courier_client={}", args.log_level).parse()?)
        .add_directive(format!("courier_session={}", args.log_level).parse()?)
        .add_directive(format!("courier_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(CourierLogFormatter::new("courier".to_string()))
        .init();

    info!("Starting courier v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CourierConfig::load_from_file(&args.config)?;
    apply_args(&mut config, &args);

    let connector = build_connector(&config, &args)?;
    let options = config.to_connect_options();
    let (connection, errors) = Connection::connect_with(Arc::new(connector), options)
        .await
        .with_context(|| format!("failed to connect to {}", config.url))?;
    info!(
        client_id = %connection.client_id().unwrap_or_default(),
        "Connected to {}", config.url
    );

    let result = match args.command {
        Command::Publish {
            dest,
            text,
            count,
            interval,
        } => publish(&connection, &dest, &text, count, interval.into()).await,
        Command::Subscribe {
            matcher,
            durable,
            ack,
        } => subscribe(&connection, errors, &matcher, durable.as_deref(), ack.into()).await,
    };

    connection.disconnect().await;
    result
}

fn apply_args(config: &mut CourierConfig, args: &Args) {
    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if args.username.is_some() {
        config.username = args.username.clone();
    }
    if args.password.is_some() {
        config.password = args.password.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(interval) = args.heartbeat_interval {
        config.heartbeat_interval = interval.into();
        config.heartbeat_timeout = config.heartbeat_timeout.max(config.heartbeat_interval * 3);
    }
    if args.no_reconnect {
        config.auto_reconnect = false;
    }
    if let Some(ca) = &args.tls_ca {
        config.tls.ca_file = Some(ca.display().to_string());
    }
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        config.tls.cert_file = Some(cert.display().to_string());
        config.tls.key_file = Some(key.display().to_string());
    }
    if args.tls_sni.is_some() {
        config.tls.server_name = args.tls_sni.clone();
    }
}

#[cfg(feature = "tls")]
fn build_connector(config: &CourierConfig, _args: &Args) -> Result<TcpConnector> {
    let endpoint = Endpoint::parse(&config.url).context("invalid server URL")?;
    let mut connector = TcpConnector::new(endpoint.clone());
    if !endpoint.secure {
        return Ok(connector);
    }

    let ca_file = config
        .tls
        .ca_file
        .as_ref()
        .context("tls:// URL requires a CA certificate (--tls-ca)")?;
    let ca_pem = std::fs::read_to_string(ca_file)
        .with_context(|| format!("failed to read CA certificate {}", ca_file))?;

    let identity = match (&config.tls.cert_file, &config.tls.key_file) {
        (Some(cert), Some(key)) => Some((
            std::fs::read_to_string(cert)
                .with_context(|| format!("failed to read certificate {}", cert))?,
            std::fs::read_to_string(key).with_context(|| format!("failed to read key {}", key))?,
        )),
        _ => None,
    };
    let client_config = make_client_config(
        &ca_pem,
        identity
            .as_ref()
            .map(|(cert, key)| (cert.as_str(), key.as_str())),
    )?;

    connector = connector.with_tls(TlsClientConfig {
        client_config: Arc::new(client_config),
        server_name: config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| endpoint.host.clone()),
    });
    Ok(connector)
}

#[cfg(not(feature = "tls"))]
fn build_connector(config: &CourierConfig, args: &Args) -> Result<TcpConnector> {
    if config.url.starts_with("tls://") || args.tls_ca.is_some() {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }
    TcpConnector::from_url(&config.url).context("invalid server URL")
}

/// Publish `count` sample messages, `interval` apart
async fn publish(
    connection: &Connection,
    dest: &str,
    text: &str,
    count: u64,
    interval: std::time::Duration,
) -> Result<()> {
    for n in 1..=count {
        let message = Message::new()
            .with_destination(dest)
            .with("type", "example")
            .with("text", text)
            .with("long", n as i64)
            .with("time", chrono::Utc::now());

        match connection.publish(message.clone()).await {
            Ok(()) => info!(component = "publish", "Published {}", message),
            Err(e @ ClientError::PublishUncertain) | Err(e @ ClientError::NotConnected) => {
                warn!(component = "publish", "Message {} not confirmed: {}", n, e)
            }
            Err(e) => return Err(e).context("publish failed"),
        }

        if n < count {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

/// Print deliveries and connection errors until Ctrl-C
async fn subscribe(
    connection: &Connection,
    mut errors: ErrorStream,
    matcher: &str,
    durable: Option<&str>,
    ack_mode: AckMode,
) -> Result<()> {
    let options = SubscriptionOptions::with_ack_mode(ack_mode);
    let mut stream = connection
        .subscribe_with_options(matcher, durable, options)
        .await
        .context("subscribe failed")?;
    info!(component = "subscribe", matcher, "Subscribed, waiting for messages");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(component = "subscribe", "Interrupted, shutting down");
                return Ok(());
            }
            event = stream.recv() => match event {
                Some(SubscriptionEvent::Message(delivery)) => {
                    println!("{}", delivery.message);
                    if delivery.ack_token().is_some() {
                        if let Err(e) = connection.acknowledge(&delivery).await {
                            warn!(component = "subscribe", "Acknowledge failed: {}", e);
                        }
                    }
                }
                Some(SubscriptionEvent::Subscribed { identity }) => {
                    info!(component = "subscribe", %identity, "Subscription active");
                }
                Some(SubscriptionEvent::Failed(e)) => {
                    return Err(e).context("subscription failed");
                }
                None => {
                    info!(component = "subscribe", "Subscription closed");
                    return Ok(());
                }
            },
            error = errors.recv() => match error {
                Some(e) if e.is_fatal() => return Err(e).context("connection failed"),
                Some(e) => error!(component = "subscribe", state = %connection.state(), "Connection error: {}", e),
                None => return Ok(()),
            },
        }
    }
}
