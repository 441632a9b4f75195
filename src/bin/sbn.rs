use clap::{App, Arg};
use sbn::config::EngineConfig;
use sbn::events::EventId;
use sbn::{Engine, LocalBus, TransportRegistry};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("sbn")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Software Bus Network - links this CPU's software bus to its peers")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Engine configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("peer-file")
                .short("p")
                .long("peer-file")
                .value_name("FILE")
                .help("Peer file to load instead of the configured paths")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cpu-id")
                .long("cpu-id")
                .value_name("ID")
                .help("Processor id of this CPU")
                .takes_value(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("CPU id must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("cpu-name")
                .long("cpu-name")
                .value_name("NAME")
                .help("Name of this CPU as written in the peer file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let default_level = if matches.is_present("verbose") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = match matches.value_of("config") {
        Some(path) => EngineConfig::load(path.as_ref())?,
        None => EngineConfig::default(),
    };
    if let Some(path) = matches.value_of("peer-file") {
        config.volatile_peer_file = Some(PathBuf::from(path));
        config.nonvolatile_peer_file = None;
    }
    if let Some(id) = matches.value_of("cpu-id") {
        config.cpu_id = id.parse()?;
    }
    if let Some(name) = matches.value_of("cpu-name") {
        config.cpu_name = name.to_string();
    }

    let loop_delay = Duration::from_millis(config.main_loop_delay_ms);
    let mut engine = match Engine::from_peer_file(config, LocalBus::new(), TransportRegistry::with_defaults()) {
        Ok(engine) => engine,
        Err(e) => {
            error!(eid = %EventId::Init, "initialization failed: {e}");
            return Err(e.into());
        }
    };

    let started = Instant::now();
    let mut interval = time::interval(loop_delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.tick(started.elapsed().as_secs());
            }
            _ = tokio::signal::ctrl_c() => {
                info!(eid = %EventId::Init, "interrupt received");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}
