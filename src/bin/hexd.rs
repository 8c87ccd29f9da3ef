use color_eyre::eyre::Result;
use hexagon_light::*;
use std::{env, io};
use tracing_subscriber::EnvFilter;

/// Reads one line from stdin without blocking the runtime; `None` on EOF
async fn read_line() -> Result<Option<String>> {
    let line = tokio::task::spawn_blocking(|| {
        let mut input = String::new();
        io::stdin().read_line(&mut input).map(|n| (n > 0).then_some(input))
    })
    .await??;
    Ok(line)
}

fn parse_rgb(arg: &str) -> Option<(u8, u8, u8)> {
    let rgb: Vec<u8> = arg
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<_>>()?;
    match rgb[..] {
        [r, g, b] => Some((r, g, b)),
        _ => None,
    }
}

fn parse_scene(arg: &str) -> Option<(&str, Option<u8>)> {
    let mut parts = arg.splitn(2, ',');
    let name = parts.next()?.trim();
    let speed = match parts.next() {
        Some(speed) => Some(speed.trim().parse().ok()?),
        None => None,
    };
    (!name.is_empty()).then_some((name, speed))
}

async fn execute(
    device: &DeviceSession<BtleplugTransport>,
    line: &str,
) -> std::result::Result<(), String> {
    let (command, arg) = match line.split_once(':') {
        Some((command, arg)) => (command, Some(arg)),
        None => (line, None),
    };

    let result = match (command, arg) {
        ("power_on", _) => device.turn_on().await,
        ("power_off", _) => device.turn_off().await,
        ("set_color", Some(arg)) => {
            let (r, g, b) = parse_rgb(arg)
                .ok_or("Invalid color format. Use R,G,B (e.g., 255,0,0 for red)")?;
            device.set_rgb(r, g, b).await
        }
        ("set_brightness", Some(arg)) => match arg.trim().parse::<u8>() {
            Ok(brightness) if brightness <= 100 => device.set_brightness_percent(brightness).await,
            _ => return Err("Brightness must be between 0 and 100".into()),
        },
        ("set_scene", Some(arg)) => {
            let (name, speed) = parse_scene(arg).ok_or("Use set_scene:NAME[,SPEED]")?;
            device.set_scene_by_name(name, speed).await
        }
        ("status", _) => {
            device.refresh().await.map_err(|e| e.to_string())?;
            let state = device.state();
            println!(
                "STATE on={:?} brightness={:?} rgb={:?} effect={:?}",
                state.is_on, state.brightness_percent, state.rgb, state.effect
            );
            Ok(())
        }
        ("", _) => return Err("No command given".into()),
        (other, None) if other.starts_with("set_") => {
            return Err(format!("Missing argument for {other}"))
        }
        (other, _) => return Err(format!("Unknown command: {other}")),
    };
    result.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .compact()
        .init();
    color_eyre::install()?;

    // Get a target id/mac address from command line arguments.
    // If not provided, exit.
    let usage = "Usage: hexd <id/mac address>";
    let args: Vec<_> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{usage}");
        std::process::exit(1);
    }
    if args[1] == "-h" || args[1] == "--help" {
        eprintln!("{usage}");
        std::process::exit(0);
    }

    let config = SessionConfig::default();
    let transport = BtleplugTransport::new()
        .await?
        .bounded_by(config.connect_timeout);
    let device = DeviceSession::with_config(transport, args[1].as_str(), config);

    // Connect up front so a bad address fails fast
    device.refresh().await?;
    println!("OK");

    // Mainloop: wait for user input, line by line
    while let Some(input) = read_line().await? {
        match execute(&device, input.trim()).await {
            Ok(()) => println!("OK"),
            Err(e) => println!("ERR {e}"),
        }
    }

    device.stop().await;
    Ok(())
}
