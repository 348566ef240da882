/// Rotary controller monitor
///
/// Connects to the controller, keeps the fast data snapshot current and
/// prints every snapshot. With `--simulate` the in-memory controller is used
/// and an indexed move is commanded so there is something to watch.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use tokio::sync::broadcast;

use rotary_modbus::config::ControllerConfig;
use rotary_modbus::connection::{Connector, SerialConnector};
use rotary_modbus::device::Device;
use rotary_modbus::logging::{CallbackLogger, LoggingMode};
use rotary_modbus::scheduler::{FastDataSnapshot, PollScheduler};
use rotary_modbus::simulator::SimulatedController;
use rotary_modbus::utils::format::format_metrics;
use rotary_modbus::RotaryResult;

#[derive(Parser, Debug)]
#[command(name = "rotary_monitor")]
#[command(about = "Poll a rotary axis controller over Modbus RTU", long_about = None)]
struct Args {
    /// JSON configuration file; command line values override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device path
    #[arg(long)]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Controller slave address
    #[arg(long)]
    slave: Option<u8>,

    /// Use the in-memory controller instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Stop after this many snapshots (0 runs until Ctrl-C)
    #[arg(long, default_value = "0")]
    cycles: u64,

    /// Print snapshots as JSON lines
    #[arg(long)]
    json: bool,

    /// Log every request and reply by register name
    #[arg(long)]
    trace_traffic: bool,
}

fn load_config(args: &Args) -> RotaryResult<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_json_file(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(port) = &args.port {
        config.link.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.link.baud_rate = baud;
    }
    if let Some(slave) = args.slave {
        config.link.slave_id = slave;
    }
    config.validate()?;
    Ok(config)
}

/// Report link settings that cannot work; the connection manager keeps
/// retrying them, so the monitor stays up and shows the link as down
fn report_link_problems(config: &ControllerConfig) {
    if let Err(e) = config.link.validate() {
        error!("{}; connection attempts will fail until the link settings are corrected", e);
    }
}

fn print_snapshot(snapshot: &FastDataSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Cannot serialise snapshot: {}", e),
        }
        return;
    }
    println!(
        "#{:<6} {:<22} pos {:>8} -> {:>8}  enc {:>8}  speed {:>8.1}  ({}us)",
        snapshot.cycle_count,
        snapshot.mode.to_string(),
        snapshot.current_position,
        snapshot.final_position,
        snapshot.encoder_position,
        snapshot.current_speed,
        snapshot.execution_interval_micros
    );
}

async fn monitor<C: Connector>(device: Device<C>, config: ControllerConfig, args: &Args) {
    let scheduler = PollScheduler::new(device, config.polling.clone());
    let mut snapshots = scheduler.subscribe();

    let (shutdown_tx, _) = broadcast::channel(1);
    let task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let mut printed = 0u64;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot, args.json);
                printed += 1;
                if args.cycles > 0 && printed >= args.cycles {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    match task.await {
        Ok(metrics) => println!("\n{}", format_metrics(&metrics)),
        Err(e) => error!("Poll scheduler task failed: {}", e),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    report_link_problems(&config);

    let logger = if args.trace_traffic {
        let mut logger = CallbackLogger::log_facade();
        logger.set_mode(LoggingMode::Both);
        Some(logger)
    } else {
        None
    };

    if args.simulate {
        let controller = SimulatedController::new(config.link.slave_id);
        let device = match logger {
            Some(logger) => Device::with_logger(controller, &config, logger),
            None => Device::new(controller, &config),
        };

        // Command an indexed quarter turn once the link is up
        let mover = device.clone();
        let motion = config.motion;
        tokio::spawn(async move {
            while !mover.is_connected().await {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            if let Err(e) = mover.move_to(90.0, &motion).await {
                error!("Demo move refused: {}", e);
            }
            let _ = mover.request_index().await;
        });
        monitor(device, config, &args).await;
    } else {
        let device = match logger {
            Some(logger) => Device::with_logger(SerialConnector, &config, logger),
            None => Device::new(SerialConnector, &config),
        };
        monitor(device, config, &args).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bad_link_settings_do_not_stop_startup() {
        let args = Args::try_parse_from(["rotary_monitor", "--simulate", "--slave", "0", "--port", ""])
            .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.link.slave_id, 0);
        assert!(config.link.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_bad_poll_settings_stop_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotary.json");
        std::fs::write(&path, r#"{ "polling": { "fast_interval_ms": 100, "slow_interval_ms": 10 } }"#)
            .unwrap();
        let args = Args::try_parse_from(["rotary_monitor", "--config", path.to_str().unwrap()]).unwrap();
        assert!(load_config(&args).unwrap_err().is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_slave_id_keeps_retrying() {
        let args = Args::try_parse_from(["rotary_monitor", "--simulate", "--slave", "0"]).unwrap();
        let config = load_config(&args).unwrap();
        let controller = SimulatedController::new(17);
        let mut scheduler = PollScheduler::new(Device::new(controller.clone(), &config), config.polling.clone());

        for attempt in 1..=3u32 {
            assert_eq!(scheduler.tick().await, rotary_modbus::scheduler::TickOutcome::Offline);
            assert_eq!(controller.open_attempts(), attempt);
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        let state = scheduler.device().connection_state().await;
        assert!(!state.connected);
        assert!(state.last_error.unwrap_or_default().contains("Invalid slave ID"));
    }
}
