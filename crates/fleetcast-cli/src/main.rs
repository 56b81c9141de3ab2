//! `fleetcast` – real-time vehicle telemetry fan-out service.
//!
//! ```text
//! fleetcast           run the service
//! fleetcast init      write a default config file and exit
//! fleetcast config    print the effective configuration and exit
//! ```
//!
//! Startup order: tracing, config, bus, stream source, pipeline, listener,
//! simulators, serve.  Any failure before serving is fatal and exits
//! non-zero.  Ctrl-C cancels the process-wide token and every worker is
//! joined before exit.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use fleetcast_gateway::{
    CommandDispatcher, ConnectionRegistry, GatewayServer, HttpVehicleDirectory, InMemoryVehicleDirectory,
    RegistryConfig, VehicleDirectory,
};
use fleetcast_middleware::{FanoutBus, IngestConfig, LocalBus, MemoryStream, RecordProducer, StreamSource};
use fleetcast_runtime::{DeviceSimulator, Pipeline, PipelineConfig, SimulatorConfig};
use fleetcast_types::StartupError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::{BusBackend, Config, DirectoryBackend, StreamBackend};

#[tokio::main]
async fn main() -> ExitCode {
    let _tracing = fleetcast_runtime::init_tracing("fleetcast");

    let command = std::env::args().nth(1);
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match command.as_deref() {
        None | Some("run") => {}
        Some("init") => return init_config(),
        Some("config") => {
            println!("{:#?}", cfg);
            return ExitCode::SUCCESS;
        }
        Some(other) => {
            eprintln!("{} `{}`. Try `fleetcast`, `fleetcast init` or `fleetcast config`.", "Unknown command".red(), other);
            return ExitCode::FAILURE;
        }
    }

    print_banner();
    println!("  Config: {}", config::config_path().display().to_string().bold());

    let cancel = CancellationToken::new();
    let ctrlc_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        ctrlc_token.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    match run(cfg, cancel).await {
        Ok(()) => {
            println!("{}", "  ✓ fleetcast stopped.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            eprintln!("{}: {}", "Startup failed".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config, cancel: CancellationToken) -> Result<(), StartupError> {
    let bus = connect_bus(&cfg).await?;
    let (source, producer) = open_stream(&cfg).await?;

    let registry = ConnectionRegistry::new(RegistryConfig {
        viewer_queue: cfg.gateway.viewer_queue,
        write_timeout: cfg.gateway.write_timeout(),
    });
    let pipeline = Pipeline::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        PipelineConfig {
            ingest: IngestConfig {
                max_wait: cfg.stream.max_wait(),
                channel: cfg.bus.telemetry_channel.clone(),
            },
            queue_capacity: cfg.gateway.broadcast_queue,
            overflow: cfg.gateway.overflow,
            ..PipelineConfig::default()
        },
    )
    .start(source, cancel.clone())
    .await?;

    let server = GatewayServer::new(
        Arc::clone(&registry),
        CommandDispatcher::with_channel(Arc::clone(&bus), cfg.bus.command_channel.clone()),
        vehicle_directory(&cfg),
        cancel.clone(),
    )
    .with_port(cfg.gateway.port)
    .with_lookup_timeout(cfg.vehicles.lookup_timeout());

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            pipeline.shutdown().await;
            return Err(e);
        }
    };

    let simulators = spawn_simulators(&cfg, producer, &bus, &cancel);
    println!(
        "  {} on port {} ({} simulated vehicle(s))",
        "Serving".green().bold(),
        cfg.gateway.port.to_string().bold(),
        simulators.len()
    );

    if let Err(e) = server.serve(listener).await {
        error!(error = %e, "gateway server failed");
    }

    // The server also returns on its own failure; make sure everyone stops.
    cancel.cancel();
    registry.close_all();
    for handle in simulators {
        if let Err(e) = handle.await {
            error!(error = %e, "simulator task failed");
        }
    }
    let stats = pipeline.shutdown().await;
    info!(
        published = stats.published,
        decode_errors = stats.decode_errors,
        publish_errors = stats.publish_errors,
        read_errors = stats.read_errors,
        "fleetcast shut down"
    );
    Ok(())
}

async fn connect_bus(cfg: &Config) -> Result<Arc<dyn FanoutBus>, StartupError> {
    match cfg.bus.backend {
        BusBackend::Memory => {
            info!("using in-process fan-out bus");
            Ok(Arc::new(LocalBus::default()))
        }
        #[cfg(feature = "redis")]
        BusBackend::Redis => {
            let bus = fleetcast_middleware::redis_bus::RedisBus::connect(&cfg.bus.redis_url).await?;
            info!(url = %config::redact_url(&cfg.bus.redis_url), "connected to redis");
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        BusBackend::Redis => Err(StartupError::Unsupported("redis")),
    }
}

type StreamEnds = (Box<dyn StreamSource>, Arc<dyn RecordProducer>);

async fn open_stream(cfg: &Config) -> Result<StreamEnds, StartupError> {
    match cfg.stream.backend {
        StreamBackend::Memory => {
            info!("using in-memory telemetry stream");
            let (producer, source) = MemoryStream::new();
            Ok((Box::new(source), Arc::new(producer)))
        }
        #[cfg(feature = "kafka")]
        StreamBackend::Kafka => {
            use fleetcast_middleware::kafka::{KafkaProducer, KafkaSource};
            let brokers = cfg.stream.bootstrap_servers();
            let source = KafkaSource::connect(&brokers, &cfg.stream.topic, &cfg.stream.group_id).await?;
            let producer = KafkaProducer::new(&brokers, &cfg.stream.topic)?;
            info!(brokers = %brokers, topic = %cfg.stream.topic, group = %cfg.stream.group_id, "connected to kafka");
            Ok((Box::new(source), Arc::new(producer)))
        }
        #[cfg(not(feature = "kafka"))]
        StreamBackend::Kafka => Err(StartupError::Unsupported("kafka")),
    }
}

fn vehicle_directory(cfg: &Config) -> Arc<dyn VehicleDirectory> {
    match cfg.vehicles.backend {
        DirectoryBackend::Memory => {
            info!(vehicles = cfg.vehicles.seed.len(), "using in-memory vehicle directory");
            Arc::new(InMemoryVehicleDirectory::new(cfg.vehicles.seed.clone()))
        }
        DirectoryBackend::Http => {
            info!(base_url = %cfg.vehicles.base_url, "using vehicle record service");
            Arc::new(HttpVehicleDirectory::new(cfg.vehicles.base_url.clone()))
        }
    }
}

fn spawn_simulators(
    cfg: &Config,
    producer: Arc<dyn RecordProducer>,
    bus: &Arc<dyn FanoutBus>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<u64>> {
    cfg.simulator
        .vins
        .iter()
        .map(|vin| {
            let sim_cfg = SimulatorConfig {
                interval: cfg.simulator.interval(),
                command_channel: cfg.bus.command_channel.clone(),
                ..SimulatorConfig::new(vin.clone())
            };
            let sim = DeviceSimulator::new(sim_cfg, Arc::clone(&producer), Arc::clone(bus));
            tokio::spawn(sim.run(cancel.clone()))
        })
        .collect()
}

fn init_config() -> ExitCode {
    let path = config::config_path();
    if path.exists() {
        println!("  Config already exists at {}", path.display().to_string().bold());
        return ExitCode::SUCCESS;
    }
    match config::save_to(&Config::default(), &path) {
        Ok(()) => {
            println!("  {} Config written to {}", "✓".green().bold(), path.display().to_string().bold());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Error saving config".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_banner() {
    println!();
    println!("  {} {}", "fleetcast".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Real-time vehicle telemetry fan-out");
    println!();
}
