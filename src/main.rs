use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use edgecam::camera::backend::StaticPermission;
use edgecam::camera::types::FrameSize;
use edgecam::pipeline::{Pipeline, PipelineDeps, SurfaceKind};
use edgecam::processing::mode::ProcessingMode;
use edgecam::settings::{AppSettings, SettingsStore};
use edgecam::stream::viewer::RemoteViewer;
use edgecam::stream::wire::WireFormat;
use edgecam::ui;

#[derive(Parser)]
#[command(name = "edgecam")]
#[command(about = "Live camera edge detection with GPU preview and WebSocket streaming")]
#[command(version)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = "edgecam.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Per-run overrides; never written back to the settings file.
#[derive(clap::Args)]
struct Overrides {
    /// Camera to open (see `edgecam devices`)
    #[arg(short, long)]
    device: Option<String>,

    /// Capture size, e.g. 1280x720
    #[arg(short, long, value_parser = parse_size)]
    size: Option<FrameSize>,

    #[arg(long)]
    fps: Option<f32>,

    /// Start with edge detection off
    #[arg(long)]
    raw: bool,

    /// Stream server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Send frames as base64 data URIs in text messages
    #[arg(long)]
    data_uri: bool,

    #[arg(long)]
    no_stream: bool,

    #[arg(long)]
    no_render: bool,

    /// Render into memory instead of a GPU surface
    #[arg(long)]
    headless: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    Devices,

    /// Watch a remote stream, reconnecting until interrupted
    View {
        /// Server URL; the configured viewer URL when omitted
        url: Option<String>,
    },
}

fn parse_size(s: &str) -> Result<FrameSize, String> {
    FrameSize::parse(s).ok_or_else(|| format!("'{s}' is not WIDTHxHEIGHT"))
}

impl Overrides {
    fn apply(&self, mut settings: AppSettings) -> AppSettings {
        if let Some(device) = &self.device {
            settings.device_id = Some(device.clone());
        }
        if let Some(size) = self.size {
            settings.width = size.width;
            settings.height = size.height;
        }
        if let Some(fps) = self.fps {
            settings.fps = fps;
        }
        if self.raw {
            settings.mode = ProcessingMode::Raw;
        }
        if let Some(port) = self.port {
            settings.stream_port = port;
        }
        if self.data_uri {
            settings.wire_format = WireFormat::DataUri;
        }
        if self.no_stream {
            settings.stream = false;
        }
        if self.no_render {
            settings.render = false;
        }
        settings
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    edgecam::init_tracing();

    let cli = Cli::parse();
    let store = Arc::new(SettingsStore::new(cli.config.clone()));
    let settings = cli.overrides.apply(store.settings());

    match cli.command {
        Some(Commands::Devices) => list_devices(),
        Some(Commands::View { url }) => view(settings, url),
        None => run(store, settings, cli.overrides.headless),
    }
}

fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let backend = edgecam::create_camera_backend();
    for device in backend.enumerate_devices()? {
        let state = if device.is_connected { "" } else { " (disconnected)" };
        println!("{}  {}{state}", device.id, device.name);
    }
    Ok(())
}

fn view(settings: AppSettings, url: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = settings.viewer_config();
    if let Some(url) = url {
        config.url = url;
    }
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let viewer = RemoteViewer::new(config);
        let mut states = viewer.subscribe();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                info!("viewer {}", *states.borrow_and_update());
            }
        });
        Arc::clone(&viewer)
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        let stats = viewer.stats();
        info!(
            frames = stats.frames,
            attempts = stats.attempts,
            decode_errors = stats.decode_errors,
            "viewer stopped"
        );
    });
    Ok(())
}

fn run(
    store: Arc<SettingsStore>,
    settings: AppSettings,
    headless: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let _guard = runtime.enter();
    store.start_debounce_task();

    let (handle, events) = ui::channel();
    let surface = if !settings.render {
        SurfaceKind::Disabled
    } else if headless {
        SurfaceKind::Headless(Default::default())
    } else {
        SurfaceKind::Gpu
    };

    let mut pipeline = Pipeline::start(
        settings,
        PipelineDeps {
            backend: edgecam::create_camera_backend(),
            permission: Arc::new(StaticPermission::from_env()),
            surface,
            store: Some(Arc::clone(&store)),
            on_status: Some(handle.status_callback()),
            on_fps: Some(handle.fps_sink()),
        },
    )?;
    if let Some(addr) = pipeline.stream_addr() {
        info!(%addr, "streaming frames");
    }

    if let Err(e) = pipeline.start_capture() {
        warn!("capture not started: {e}");
    }

    ui::spawn_input_reader(BufReader::new(io::stdin()), handle)?;
    let result = ui::run(&pipeline, events, &mut io::stdout());

    pipeline.shutdown();
    result?;
    Ok(())
}
