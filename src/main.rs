//! cast-mirror - Cast mirroring session sender
//!
//! Negotiates audio/video streams with a cast receiver over the WebRTC
//! namespace and streams synthetic media to it.

mod channel;
mod config;
mod media;
mod mirroring;
mod observer;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use channel::websocket::CastSocket;
use channel::DisconnectReason;
use config::Config;
use media::{RawEncoderFactory, SyntheticCapture, UdpTransportProvider};
use mirroring::collaborators::Collaborators;
use mirroring::messages::offer_message;
use mirroring::offer::{CastMode, OfferBuilder};
use mirroring::setup::ReceiverSetupQuerier;
use mirroring::{Session, SessionParameters, SessionType};
use observer::{LoggingRemoter, TracingObserver};

#[derive(Parser)]
#[command(name = "cast-mirror")]
#[command(about = "Mirror audio/video to a cast receiver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mirroring session against a receiver
    Mirror {
        /// WebSocket URL of the cast message relay
        #[arg(short, long)]
        channel: String,

        /// Receiver IP address (media is sent here)
        #[arg(short, long)]
        address: IpAddr,

        /// audio, video or both
        #[arg(short, long, default_value = "both")]
        session_type: SessionType,

        /// Receiver model name, e.g. "Chromecast Ultra"
        #[arg(short, long, default_value = "Chromecast")]
        model: String,

        /// Pin every playout delay bound to this value
        #[arg(long)]
        playout_delay_ms: Option<u64>,

        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Switch to remoting as soon as the receiver reports a sink
        #[arg(long)]
        remoting: bool,
    },

    /// Print the OFFER message a session would send (dry run)
    Offer {
        /// audio, video or both
        #[arg(short, long, default_value = "both")]
        session_type: SessionType,

        /// Build a remoting offer instead of a mirroring one
        #[arg(long)]
        remoting: bool,
    },

    /// Query a receiver's friendly name and build version
    SetupInfo {
        /// Receiver IP address
        #[arg(short, long)]
        address: IpAddr,
    },

    /// Show configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Mirror {
            channel,
            address,
            session_type,
            model,
            playout_delay_ms,
            duration,
            remoting,
        } => {
            let params = SessionParameters {
                receiver_address: address,
                session_type,
                receiver_model_name: model,
                target_playout_delay: playout_delay_ms.map(Duration::from_millis),
            };
            run_mirror(&channel, params, duration.map(Duration::from_secs), remoting).await?;
        }
        Commands::Offer {
            session_type,
            remoting,
        } => {
            print_offer(session_type, remoting)?;
        }
        Commands::SetupInfo { address } => {
            let querier = ReceiverSetupQuerier::new(address);
            let info = querier.query().await?;
            println!("Name:  {}", info.friendly_name);
            println!("Build: {}", info.build_version);
        }
        Commands::Config { init } => {
            show_config(init)?;
        }
    }

    Ok(())
}

async fn run_mirror(
    url: &str,
    params: SessionParameters,
    duration: Option<Duration>,
    remoting: bool,
) -> Result<()> {
    let config = Config::load().context("Failed to load config")?;

    let observer = TracingObserver::new();
    let errors = observer.errors();
    let (remoter, mut sink_rx) = LoggingRemoter::new();
    let collaborators = Collaborators {
        observer: Box::new(observer),
        capture: Box::new(SyntheticCapture::default()),
        encoders: Box::new(RawEncoderFactory),
        transport: Box::new(UdpTransportProvider),
        remoter: Box::new(remoter),
    };

    let mut socket = CastSocket::connect(url).await?;
    let (outbound_tx, mut outbound_rx) = mpsc::channel(32);
    let (session, handle) = Session::new(
        params,
        config.mirror_settings(),
        config.session_options(),
        collaborators,
        outbound_tx,
    );
    let task = tokio::spawn(session.run());

    if remoting {
        let handle = handle.clone();
        tokio::spawn(async move {
            while sink_rx.changed().await.is_ok() {
                if sink_rx.borrow_and_update().is_some() {
                    tracing::info!("Requesting remoting");
                    handle.request_remoting();
                    return;
                }
            }
        });
    }

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    println!("Mirroring to {}... (Ctrl-C to stop)", url);

    tokio::select! {
        reason = channel::pump(&mut socket, &handle, &mut outbound_rx) => {
            match reason? {
                DisconnectReason::SessionStopped => {}
                DisconnectReason::Closed(None) => tracing::warn!("Cast channel closed by relay"),
                DisconnectReason::Closed(Some(e)) => tracing::warn!("Cast channel failed: {:#}", e),
            }
        }
        _ = deadline => {
            tracing::info!("Duration elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down...");
        }
    }

    tracing::debug!("Stopping session in state {:?}", handle.state());
    handle.stop();
    if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
        tracing::warn!("Session did not stop within 5s");
    }
    socket.close().await;

    let last_error = errors.lock().ok().and_then(|e| *e);
    if let Some(error) = last_error {
        bail!("Session ended with error {}: {}", error.code(), error);
    }
    Ok(())
}

fn print_offer(session_type: SessionType, remoting: bool) -> Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let params = SessionParameters {
        receiver_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        session_type,
        receiver_model_name: String::new(),
        target_playout_delay: None,
    };
    let settings = config.mirror_settings();
    let options = config.session_options();
    let mode = if remoting {
        CastMode::Remoting
    } else {
        CastMode::Mirroring
    };

    let offer = OfferBuilder::new(&params, &settings, options.hardware, options.features)
        .build(mode)
        .context("Failed to build offer")?;
    let message = offer_message(1, offer.document);
    let body: serde_json::Value =
        serde_json::from_str(&message.data).context("Offer is not JSON")?;

    println!("namespace: {}", message.namespace);
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn show_config(init: bool) -> Result<()> {
    let path = Config::config_path()?;
    if init {
        if path.exists() {
            println!("Config already exists at {}", path.display());
        } else {
            let written = Config::default().save()?;
            println!("Wrote default config to {}", written.display());
        }
        return Ok(());
    }

    let config = Config::load()?;
    println!("# {}", path.display());
    print!("{}", config.to_toml()?);
    Ok(())
}
