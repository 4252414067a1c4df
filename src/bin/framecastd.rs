//! framecastd - capture-to-publish daemon
//!
//! This daemon:
//! 1. Opens the configuration store (creating defaults on first run)
//! 2. Connects to the MQTT bus
//! 3. Brings up every enumerated frame source and its encoding workers
//! 4. Publishes one "Image" message per captured frame
//! 5. Restarts the capture session on stalls or configuration changes
//!
//! The real vendor driver is linked by the deployment; this build wires the
//! synthetic `stub://` driver so the pipeline can run end-to-end anywhere.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use framecast::{
    MqttBus, PixelFormat, ShutdownToken, Supervisor, SyntheticDriver, SyntheticSourceSpec,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture frames and publish them to the message bus")]
struct Args {
    /// Path to the configuration file. Created with defaults if missing.
    #[arg(long, env = "FRAMECAST_CONFIG", default_value = "framecast.toml")]
    config: PathBuf,

    /// Instance name: bus client identity and default topic prefix.
    #[arg(long, env = "FRAMECAST_INSTANCE", default_value = "framecast")]
    instance: String,

    /// Number of synthetic stub sources to expose.
    #[arg(long, env = "FRAMECAST_STUB_SOURCES", default_value_t = 1)]
    stub_sources: usize,

    /// Frame rate of each stub source.
    #[arg(long, env = "FRAMECAST_STUB_FPS", default_value_t = 10)]
    stub_fps: u32,

    /// Pixel format the stub sources report.
    #[arg(long, env = "FRAMECAST_STUB_FORMAT", value_enum, default_value = "mono8")]
    stub_format: StubFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StubFormat {
    Mono8,
    BayerRg8,
}

impl From<StubFormat> for PixelFormat {
    fn from(format: StubFormat) -> Self {
        match format {
            StubFormat::Mono8 => PixelFormat::Mono8,
            StubFormat::BayerRg8 => PixelFormat::BayerRg8,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let token = ShutdownToken::new();
    {
        let token = token.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            token.cancel();
        })?;
    }

    let interval = Duration::from_secs(1)
        .checked_div(args.stub_fps.max(1))
        .unwrap_or(Duration::from_millis(100));
    let specs = (0..args.stub_sources.max(1))
        .map(|index| SyntheticSourceSpec {
            id: format!("stub://camera-{}", index),
            frame_interval: interval,
            pixel_format: args.stub_format.into(),
            ..SyntheticSourceSpec::default()
        })
        .collect();
    let driver = Arc::new(SyntheticDriver::new(specs));

    let instance = args.instance.clone();
    let bus_connector: framecast::BusConnector =
        Box::new(move |store: &mut framecast::ConfigStore| {
            let bus = MqttBus::initialize(store, &instance)?;
            Ok(Arc::new(bus) as Arc<dyn framecast::MessageBus>)
        });

    log::info!(
        "framecastd starting (config {}, instance {})",
        args.config.display(),
        args.instance
    );
    Supervisor::new(driver, bus_connector, args.config, token).run()
}
