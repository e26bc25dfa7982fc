//! Kafka Message Publisher CLI
//!
//! Runs one engine command per invocation and prints its `CommandResult` as
//! JSON on stdout. Logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_publisher_core::config::{BrokerConfig, ConfigStore, SaslMechanism, SecurityProtocol};
use kafka_publisher_core::{CommandDispatcher, CommandResult, ConnectionTestState};

/// Publish, read and administer Kafka topics from the command line.
#[derive(Parser)]
#[command(name = "kafka-publisher")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file [default: platform config dir].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the saved configuration.
    GetConfig {
        /// Include the SASL password in the output.
        #[arg(long)]
        show_secrets: bool,
    },
    /// Update and save the configuration.
    SaveConfig(ConfigArgs),
    /// Check that the configured broker accepts a connection.
    TestConnection {
        /// Seconds to wait, 1 to 60.
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Send one message to the configured topic.
    Send {
        /// Message body.
        message: String,
    },
    /// Create a topic.
    CreateTopic {
        name: String,

        #[arg(short, long)]
        partitions: Option<i32>,

        #[arg(short, long)]
        replication_factor: Option<i16>,
    },
    /// Read messages from a topic.
    Consume {
        /// Topic to read [default: the configured topic].
        #[arg(short, long)]
        topic: Option<String>,

        /// First offset to read.
        #[arg(short, long)]
        offset: Option<i64>,

        /// Maximum number of messages.
        #[arg(short = 'n', long)]
        max_messages: Option<usize>,
    },
}

/// Fields to change; anything omitted keeps its saved value.
#[derive(Args, Default)]
struct ConfigArgs {
    /// Start from a JSON document instead of the saved configuration.
    #[arg(long)]
    from_file: Option<PathBuf>,

    #[arg(long)]
    broker: Option<String>,

    #[arg(long)]
    topic: Option<String>,

    #[arg(long)]
    client_id: Option<String>,

    /// PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL.
    #[arg(long, value_parser = parse_security_protocol)]
    security_protocol: Option<SecurityProtocol>,

    /// PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512.
    #[arg(long, value_parser = parse_sasl_mechanism)]
    sasl_mechanism: Option<SaslMechanism>,

    #[arg(long)]
    sasl_username: Option<String>,

    #[arg(long)]
    sasl_password: Option<String>,

    #[arg(long)]
    ssl_ca_cert_path: Option<String>,

    #[arg(long)]
    ssl_client_cert_path: Option<String>,

    #[arg(long)]
    ssl_client_key_path: Option<String>,

    /// Accept any broker certificate (INSECURE).
    #[arg(long)]
    ssl_skip_verification: Option<bool>,
}

impl ConfigArgs {
    fn apply(self, config: &mut BrokerConfig) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }
        set!(
            broker,
            topic,
            client_id,
            security_protocol,
            sasl_mechanism,
            sasl_username,
            sasl_password,
            ssl_ca_cert_path,
            ssl_client_cert_path,
            ssl_client_key_path,
            ssl_skip_verification
        );
    }
}

/// Parse an enum from its configuration-file spelling.
fn parse_wire_name<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_uppercase()))
        .map_err(|_| format!("unknown value '{value}'"))
}

fn parse_security_protocol(value: &str) -> Result<SecurityProtocol, String> {
    parse_wire_name(value)
}

fn parse_sasl_mechanism(value: &str) -> Result<SaslMechanism, String> {
    parse_wire_name(value)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose, cli.log_json);

    let store = match cli.config {
        Some(path) => ConfigStore::open(path),
        None => ConfigStore::default_location()?,
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %store.path().display(),
        "starting kafka publisher"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let ok = runtime.block_on(run(CommandDispatcher::new(store), cli.command))?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn setup_tracing(verbose: u8, json: bool) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Run one command and print its result. Returns whether it succeeded.
async fn run(dispatcher: CommandDispatcher, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::GetConfig { show_secrets } => {
            let mut config = dispatcher.get_config().await;
            if !show_secrets && !config.sasl_password.is_empty() {
                config.sasl_password = "********".to_string();
            }
            print(&CommandResult::Ok(config))
        }
        Command::SaveConfig(args) => {
            let mut config = match &args.from_file {
                Some(path) => {
                    let raw = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_slice(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => dispatcher.get_config().await,
            };
            args.apply(&mut config);
            print(&dispatcher.save_config(config).await)
        }
        Command::TestConnection { timeout } => {
            let test = dispatcher.start_connection_test(timeout);
            let mut states = test.subscribe();

            let interrupted = tokio::select! {
                () = ctrl_c() => true,
                _ = states.wait_for(ConnectionTestState::is_terminal) => false,
            };
            if interrupted {
                warn!("interrupted, cancelling connection test");
                test.cancel();
            }

            let result = match test.wait().await {
                ConnectionTestState::Connected => CommandResult::Ok(true),
                ConnectionTestState::TimedOut => {
                    CommandResult::Err("connection test timed out".to_string())
                }
                ConnectionTestState::Cancelled => {
                    CommandResult::Err("connection test cancelled".to_string())
                }
                ConnectionTestState::Failed(reason) => CommandResult::Err(reason),
                state => CommandResult::Err(format!("connection test ended in state {state:?}")),
            };
            print(&result)
        }
        Command::Send { message } => print(&dispatcher.send_message(&message).await),
        Command::CreateTopic {
            name,
            partitions,
            replication_factor,
        } => print(
            &dispatcher
                .create_topic(&name, partitions, replication_factor)
                .await,
        ),
        Command::Consume {
            topic,
            offset,
            max_messages,
        } => print(
            &dispatcher
                .consume_messages(topic.as_deref(), offset, max_messages)
                .await,
        ),
    }
}

fn print<T: Serialize>(result: &CommandResult<T>) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(result.is_ok())
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl+c");
        std::future::pending::<()>().await;
    }
}
