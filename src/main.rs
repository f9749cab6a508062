use crate::assets::{SERVER_PORT, TARGET_OS};
use crate::channel::{ByteChannel, connect_socket, open_accessory};
use crate::config::{
    CodecKind, PtsMode, SessionConfig, TransportConfig, app_name, app_version, default_address,
};
use crate::decoder::DecoderCapability;
use crate::display::{NullTarget, RenderTarget, YuvFileTarget};
use crate::pipeline::{DecodeFeedSession, SessionReport};
use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgMatches, Command};
use log::{error, info};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

pub mod assets;
pub mod channel;
pub mod config;
pub mod decoder;
pub mod display;
pub mod error;
pub mod pipeline;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Load session settings from a JSON file; flags override it."),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("IP")
                .help("Address of the streaming server."),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Port of the streaming server."),
        )
        .arg(
            Arg::new("accessory")
                .long("accessory")
                .value_name("PATH")
                .conflicts_with_all(["address", "port"])
                .help("Read from a USB accessory device node instead of a socket."),
        )
        .arg(
            Arg::new("codec")
                .long("codec")
                .value_name("CODEC")
                .ignore_case(true)
                .value_parser(["avc", "h264", "hevc", "h265"])
                .help("Video codec of the incoming stream."),
        )
        .arg(
            Arg::new("pts")
                .long("pts")
                .value_name("MODE")
                .ignore_case(true)
                .value_parser(["paced", "monotonic"])
                .help("How presentation timestamps are assigned."),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .value_name("FILE")
                .help("Write decoded frames to FILE as raw YUV420p."),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    match run(&matches) {
        Ok(report) if report.is_clean() => {}
        Ok(_) => process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            process::exit(2);
        }
    }
}

fn run(matches: &ArgMatches) -> Result<SessionReport> {
    let config = session_config(matches)?;
    info!(
        "{} {} ({}): {}",
        app_name(),
        app_version(),
        TARGET_OS,
        config.transport
    );

    let target: Box<dyn RenderTarget> = match matches.get_one::<String>("dump") {
        Some(path) => Box::new(YuvFileTarget::create(Path::new(path))?),
        None => Box::new(NullTarget::new()),
    };
    let decoder = video_decoder()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let report = runtime.block_on(async move {
        let channel: Arc<dyn ByteChannel> = match &config.transport {
            TransportConfig::Socket { address, port } => {
                Arc::new(connect_socket(SocketAddr::new(*address, *port)).await?)
            }
            TransportConfig::Accessory { path } => Arc::new(open_accessory(path)?),
        };

        let session = DecodeFeedSession::new(config, channel, decoder, target);
        let handle = session.handle();

        // first SIGINT/SIGTERM drains the session, a second one exits immediately
        ctrlc::set_handler(move || {
            if handle.is_cancelled() {
                process::exit(130);
            }
            handle.cancel();
        })
        .context("Error setting Ctrl-C handler")?;

        Ok::<_, anyhow::Error>(session.run().await)
    });

    // an accessory read may still be parked on a blocking thread
    runtime.shutdown_timeout(Duration::from_secs(1));
    report
}

/// Build the session configuration from an optional JSON file plus flags.
fn session_config(matches: &ArgMatches) -> Result<SessionConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SessionConfig::from_json_file(Path::new(path))?,
        None => SessionConfig::default(),
    };

    if let Some(path) = matches.get_one::<String>("accessory") {
        config.transport = TransportConfig::Accessory {
            path: PathBuf::from(path),
        };
    } else if matches.contains_id("address") || matches.contains_id("port") {
        let (mut address, mut port) = match config.transport {
            TransportConfig::Socket { address, port } => (address, port),
            TransportConfig::Accessory { .. } => (default_address(), SERVER_PORT),
        };
        if let Some(raw) = matches.get_one::<String>("address") {
            address = raw
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid server address '{}'", raw))?;
        }
        if let Some(p) = matches.get_one::<u16>("port") {
            port = *p;
        }
        config.transport = TransportConfig::Socket { address, port };
    }

    if let Some(name) = matches.get_one::<String>("codec") {
        config.codec =
            CodecKind::parse(name).ok_or_else(|| anyhow!("Unsupported codec '{}'", name))?;
    }

    match matches.get_one::<String>("pts").map(|m| m.to_lowercase()) {
        Some(mode) if mode == "monotonic" => config.pts_mode = PtsMode::Monotonic,
        Some(_) if config.pts_mode == PtsMode::Monotonic => config.pts_mode = PtsMode::default(),
        _ => {}
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "ffmpeg")]
fn video_decoder() -> Result<Box<dyn DecoderCapability>> {
    Ok(Box::new(decoder::FfmpegDecoder::new()))
}

#[cfg(not(feature = "ffmpeg"))]
fn video_decoder() -> Result<Box<dyn DecoderCapability>> {
    Err(anyhow!(
        "{} was built without a video decoder, enable the `ffmpeg` feature",
        app_name()
    ))
}
