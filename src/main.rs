//! Joy-Con Command CLI
//!
//! Attach to a Joy-Con or Pro Controller, stream decoded input and
//! orientation, and drive the rumble motors.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use hidapi::HidApi;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use joycon_cmd::config::DriverConfig;
use joycon_cmd::joycon::{AttachmentState, ControllerState, JoyCon};
use joycon_cmd::report::{Button, ButtonState};
use joycon_cmd::rumble::RumbleRequest;
use joycon_cmd::schedule::{run_loop, PollStep, ThreadScheduler};
use joycon_cmd::transport::find_controllers;

/// Nintendo Switch controller driver
#[derive(Parser)]
#[command(name = "joycon-cmd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Driver configuration file (JSON)
    #[arg(short, long, env = "JOYCON_CMD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected controllers
    List,

    /// Show controller state in real-time
    Monitor {
        /// Output one JSON object per frame
        #[arg(long)]
        json: bool,
    },

    /// Run the rumble motors
    Rumble {
        /// Low band frequency in Hz
        #[arg(long, default_value_t = 160.0)]
        low: f32,

        /// High band frequency in Hz
        #[arg(long, default_value_t = 320.0)]
        high: f32,

        /// Amplitude, 0.0 to 1.0
        #[arg(short, long, default_value_t = 0.5)]
        amplitude: f32,

        /// Duration in seconds
        #[arg(short, long, default_value_t = 0.5)]
        duration: f32,
    },

    /// Write a configuration file with default values
    Init {
        /// Output file path
        #[arg(short, long, default_value = "./joycon.json")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                format!("joycon_cmd={}", log_level)
                    .parse()
                    .context("Invalid log directive")?,
            ),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::List => list_controllers(),
        Commands::Init { output } => init_config(output),
        Commands::Validate { file } => validate_config(file),
        command => {
            let config = DriverConfig::load_or_default(cli.config.as_ref())?;
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                info!("Received shutdown signal");
                r.store(false, Ordering::SeqCst);
            })
            .context("Error setting Ctrl-C handler")?;

            // The driver loop blocks on HID reads
            tokio::task::spawn_blocking(move || match command {
                Commands::Monitor { json } => monitor_controller(config, running, json),
                Commands::Rumble {
                    low,
                    high,
                    amplitude,
                    duration,
                } => rumble_controller(
                    config,
                    running,
                    RumbleRequest {
                        low_freq: low,
                        high_freq: high,
                        amplitude,
                        duration,
                    },
                ),
                _ => Ok(()),
            })
            .await?
        }
    }
}

fn list_controllers() -> Result<()> {
    println!("{}", "Searching for Joy-Cons...".dimmed());

    let api = HidApi::new().context("Failed to initialize HID API")?;
    let controllers = find_controllers(&api);

    if controllers.is_empty() {
        println!("{} No controllers found", "✗".bright_red());
        println!();
        println!("Make sure your controller is paired via Bluetooth");
        println!(
            "  (hold the {} button on the rail to enter pairing mode)",
            "SYNC".bright_cyan()
        );
        return Ok(());
    }

    println!(
        "\n{} Found {} controller(s):\n",
        "✓".bright_green(),
        controllers.len()
    );

    for (i, device) in controllers.iter().enumerate() {
        println!(
            "  {}. {} ({:04x}:{:04x}) - Serial: {}",
            i + 1,
            device.kind.name().bright_white(),
            device.vendor_id,
            device.product_id,
            device.serial.as_deref().unwrap_or("Unknown").dimmed()
        );
    }

    println!();
    Ok(())
}

fn connect(config: DriverConfig) -> Result<JoyCon<joycon_cmd::transport::HidTransport>> {
    println!("{} Searching for Joy-Con...", "→".bright_blue());

    let api = HidApi::new().context("Failed to initialize HID API")?;
    let mut joycon =
        JoyCon::find_and_open(&api, config).context("Failed to connect to controller")?;
    joycon.attach().context("Attach handshake failed")?;

    println!(
        "{} Connected to {}",
        "✓".bright_green(),
        joycon.kind().name().bright_cyan()
    );
    Ok(joycon)
}

fn monitor_controller(config: DriverConfig, running: Arc<AtomicBool>, json: bool) -> Result<()> {
    let mut joycon = connect(config)?;
    println!("{}", "Press Ctrl+C to stop".dimmed());

    let mut scheduler = ThreadScheduler;
    let state = run_loop(&mut joycon, &mut scheduler, &running, |frame| {
        if json {
            print_state_json(frame);
        } else {
            print_state_pretty(frame);
        }
    });

    if state == AttachmentState::Dropped {
        error!("Controller stopped responding");
    }
    joycon.detach();
    println!("\n{} Monitoring stopped", "✓".bright_green());
    Ok(())
}

fn rumble_controller(
    config: DriverConfig,
    running: Arc<AtomicBool>,
    request: RumbleRequest,
) -> Result<()> {
    let mut joycon = connect(config)?;

    // Rumble is only accepted once input reports are flowing
    while joycon.attachment_state() < AttachmentState::ImuDataOk {
        match joycon.poll(Instant::now()) {
            PollStep::Reschedule(delay) => thread::sleep(delay),
            PollStep::Stop => bail!("Controller stopped responding"),
        }
    }
    joycon.set_rumble(request);
    println!(
        "{} Rumble {:.0}/{:.0} Hz at {:.2} for {:.2}s",
        "→".bright_blue(),
        request.low_freq,
        request.high_freq,
        request.amplitude,
        request.duration
    );

    // Run a little past the request so the motor is returned to neutral
    let deadline = Instant::now() + Duration::from_secs_f32(request.duration.max(0.0) + 0.1);
    let stop = running.clone();
    let mut scheduler = ThreadScheduler;
    run_loop(&mut joycon, &mut scheduler, &running, |_| {
        if Instant::now() >= deadline {
            stop.store(false, Ordering::SeqCst);
        }
    });

    joycon.detach();
    println!("{} Done", "✓".bright_green());
    Ok(())
}

fn print_state_json(state: &ControllerState) {
    if let Ok(json) = serde_json::to_string(state) {
        println!("{}", json);
    }
}

fn print_state_pretty(state: &ControllerState) {
    print!("\x1B[2J\x1B[1;1H"); // Clear screen

    println!("{}", "Joy-Con State".bright_white().bold());
    println!("{}", "═══════════════════════════════════".dimmed());

    println!("\n{}", "Stick".bright_cyan());
    println!(
        "  X {}  Y {}",
        format_value(state.stick.x),
        format_value(state.stick.y)
    );

    if let Some(stick) = state.stick2 {
        println!(
            "  X {}  Y {}  (right)",
            format_value(stick.x),
            format_value(stick.y)
        );
    }

    println!("\n{}", "Buttons".bright_cyan());
    print_buttons(state.buttons);
    if let Some(buttons) = state.buttons2 {
        print_buttons(buttons);
    }

    println!("\n{}", "IMU".bright_cyan());
    println!(
        "  Accel: ({:+.3}, {:+.3}, {:+.3}) G",
        state.accel[0], state.accel[1], state.accel[2]
    );
    println!(
        "  Gyro:  ({:+.3}, {:+.3}, {:+.3}) rad/s",
        state.gyro[0], state.gyro[1], state.gyro[2]
    );

    let [roll, pitch, yaw] = state.euler;
    println!("\n{}", "Orientation (Euler)".bright_cyan());
    println!(
        "  Roll: {:+.1}°  Pitch: {:+.1}°  Yaw: {:+.1}°",
        roll.to_degrees(),
        pitch.to_degrees(),
        yaw.to_degrees()
    );

    println!("\n{}", "Battery".bright_cyan());
    println!("  {}", format_bar(state.battery as f32 / 8.0));

    println!(
        "\n{} {:?}  ts {:02x}",
        "Link".bright_cyan(),
        state.attachment,
        state.timestamp
    );
    println!("\n{}", "Press Ctrl+C to stop".dimmed());
}

fn print_buttons(buttons: ButtonState) {
    let pressed: Vec<String> = buttons
        .pressed()
        .map(|b: Button| format!("{:?}", b))
        .collect();
    if pressed.is_empty() {
        println!("  {}", "none".dimmed());
    } else {
        println!("  {}", pressed.join(" ").bright_green());
    }
}

fn format_value(v: f32) -> String {
    if v > 0.1 {
        format!("{:+.2}", v).bright_green().to_string()
    } else if v < -0.1 {
        format!("{:+.2}", v).bright_red().to_string()
    } else {
        format!("{:+.2}", v).dimmed().to_string()
    }
}

fn format_bar(v: f32) -> String {
    let filled = (v.clamp(0.0, 1.0) * 10.0) as usize;
    let bar: String = (0..10)
        .map(|i| if i < filled { '█' } else { '░' })
        .collect();
    if v > 0.5 {
        bar.bright_green().to_string()
    } else if v > 0.1 {
        bar.bright_yellow().to_string()
    } else {
        bar.bright_red().to_string()
    }
}

fn init_config(output: PathBuf) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    DriverConfig::default().save(&output)?;

    println!(
        "{} Created configuration: {}",
        "✓".bright_green(),
        output.display()
    );
    println!(
        "\nRun with: {} -c {} monitor",
        "joycon-cmd".bright_cyan(),
        output.display()
    );
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    print!("Validating {}... ", file.display());

    match DriverConfig::load(&file) {
        Ok(config) => {
            println!("{}", "OK".bright_green());
            println!("  IMU: {}", if config.enable_imu { "on" } else { "off" });
            println!("  Filter weight: {:.3}", config.filter_weight);
            println!("  Correction: {:?}", config.orthogonality_correction);
            println!("  Poll interval: {} ms", config.poll_interval_ms);
            println!("  Consumer rate: {} Hz", config.consumer_rate_hz);
            Ok(())
        }
        Err(e) => {
            println!("{}", "FAILED".bright_red());
            println!("\nError: {:#}", e);
            Err(e)
        }
    }
}
