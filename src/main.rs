use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use hexagon_light::light::{self, LightCommand, LightView};
use hexagon_light::*;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bluetooth address or platform id of the light
    #[arg(short, long)]
    address: String,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 15)]
    connect_timeout: u64,

    /// How long to wait for a status reply, in seconds
    #[arg(long, default_value_t = 2)]
    status_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the known scene names
    Scenes,
    #[command(flatten)]
    Light(LightAction),
}

/// Commands that talk to the light
#[derive(Subcommand)]
enum LightAction {
    /// Print the current state
    Status,
    /// Turn the light on
    On,
    /// Turn the light off
    Off,
    /// Set brightness
    Brightness {
        /// Brightness level (0-100)
        #[arg(short, long, default_value_t = 100)]
        level: u8,
    },
    /// Set custom RGB color
    Color {
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 255)]
        red: u8,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 255)]
        green: u8,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 255)]
        blue: u8,
    },
    /// Activate a scene by name (see `scenes`)
    Scene {
        /// Scene name, e.g. "space-time" or "Neon Lights"
        name: String,
        /// Scene speed (0-255)
        #[arg(short, long)]
        speed: Option<u8>,
    },
    /// Activate a scene by its numeric code
    SceneCode {
        /// Scene code (0-65535)
        code: u16,
        /// Scene speed (0-255)
        #[arg(short, long)]
        speed: Option<u8>,
    },
    /// Keep the connection open and print every state change
    Watch {
        /// Seconds between status refreshes
        #[arg(short, long, default_value_t = 60)]
        interval: u64,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("hexagon_light=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let action = match cli.command.unwrap_or(Commands::Light(LightAction::Status)) {
        Commands::Scenes => {
            for name in scenes::effect_list() {
                println!("{name}");
            }
            return Ok(());
        }
        Commands::Light(action) => action,
    };

    let config = SessionConfig {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        status_timeout: Duration::from_secs(cli.status_timeout),
        ..SessionConfig::default()
    };

    let transport = match BtleplugTransport::new().await {
        Ok(transport) => transport.bounded_by(config.connect_timeout),
        Err(e) => {
            error!("Failed to initialize Bluetooth: {}", e);
            return Err(e.into());
        }
    };
    let device = Arc::new(DeviceSession::with_config(transport, cli.address, config));

    match action {
        LightAction::Status => {
            device.refresh().await?;
            print_state(&device.state());
        }
        LightAction::On => device.turn_on().await?,
        LightAction::Off => device.turn_off().await?,
        LightAction::Brightness { level } => {
            // Brightness changes are only visible while the light is on
            light::turn_on(
                &device,
                &LightCommand {
                    brightness: Some(light::percent_to_level(level)),
                    ..Default::default()
                },
            )
            .await?;
        }
        LightAction::Color { red, green, blue } => {
            light::turn_on(
                &device,
                &LightCommand {
                    rgb: Some((red, green, blue)),
                    ..Default::default()
                },
            )
            .await?;
        }
        LightAction::Scene { name, speed } => {
            device.turn_on().await?;
            device.set_scene_by_name(&name, speed).await?;
        }
        LightAction::SceneCode { code, speed } => {
            device.turn_on().await?;
            device.set_scene(code, speed).await?;
        }
        LightAction::Watch { interval } => watch(device.clone(), interval).await?,
    }

    device.stop().await;
    Ok(())
}

fn print_state(state: &DeviceState) {
    let view = LightView::from_state(state);
    println!(
        "power: {}",
        match state.is_on {
            Some(true) => "on",
            Some(false) => "off",
            None => "unknown",
        }
    );
    match state.brightness_percent {
        Some(percent) => println!("brightness: {percent}%"),
        None => println!("brightness: unknown"),
    }
    if let Some((r, g, b)) = view.rgb {
        println!("color: {r},{g},{b}");
    }
    if let Some(effect) = view.effect {
        println!("effect: {effect}");
    }
}

/// Refreshes periodically and prints the state after every change until Ctrl-C
#[instrument(skip(device))]
async fn watch(device: Arc<DeviceSession<BtleplugTransport>>, interval: u64) -> Result<()> {
    let printer = device.clone();
    let listener = device.register_listener(move || print_state(&printer.state()));

    let period = Duration::from_secs(interval.max(1));
    info!("Refreshing every {:?}, press Ctrl-C to stop", period);

    let coordinator = RefreshCoordinator::new(device.clone()).with_interval(period);
    coordinator.first_refresh().await?;
    coordinator.start();

    tokio::signal::ctrl_c().await?;
    info!("Stopping");
    listener.unregister();
    coordinator.shutdown().await;
    Ok(())
}
