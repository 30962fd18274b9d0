use anyhow::{Context, Result};
use clap::Parser;
use powermonitor::Config;
use powermonitor::logging::init_logging;
use powermonitor::reporter::Reporter;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Report P1 smart meter and SunSpec inverter readings over UDP and TCP
#[derive(Parser, Debug)]
#[command(author, version = env!("APP_VERSION"), about)]
struct Cli {
    /// Serial device of the P1 meter, or /dev/tcp/<host>/<port> for a TCP relay
    #[arg(short = 's', long = "device", env = "POWERMONITOR_DEVICE")]
    device: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "POWERMONITOR_DEBUG")]
    debug: bool,

    /// UDP/TCP port to serve on
    #[arg(short, long, env = "POWERMONITOR_PORT")]
    port: Option<u16>,

    /// SunSpec inverter host; polling is disabled when not set
    #[arg(short = 'H', long = "modbus-host", env = "POWERMONITOR_MODBUS_HOST")]
    modbus_host: Option<String>,

    /// SunSpec inverter Modbus TCP port
    #[arg(short = 'P', long = "modbus-port", env = "POWERMONITOR_MODBUS_PORT")]
    modbus_port: Option<u16>,

    /// Configuration file (YAML)
    #[arg(short, long, env = "POWERMONITOR_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Layer command line flags over the file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.meter.device = device.clone();
        }
        if self.debug {
            config.logging.level = "DEBUG".to_string();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.modbus_host {
            config.modbus.host = host.clone();
        }
        if let Some(port) = self.modbus_port {
            config.modbus.port = port;
        }
    }

    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        self.apply(&mut config);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(supervise(cli, config))
}

/// Run reporters until a termination signal; SIGHUP starts a fresh one
async fn supervise(cli: Cli, mut config: Config) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    info!("Powermonitor {} starting up", env!("APP_VERSION"));

    loop {
        let mut reporter = Reporter::bind(&config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start reporter: {}", e))?;

        let restart = tokio::select! {
            result = reporter.run() => {
                if let Err(e) = result {
                    error!("Reporter failed with error: {}", e);
                    return Err(anyhow::anyhow!("Reporter error: {}", e));
                }
                false
            }
            _ = hangup.recv() => true,
            _ = terminate.recv() => false,
            _ = interrupt.recv() => false,
        };
        // release every socket and the meter device before rebinding
        drop(reporter);

        if !restart {
            info!("Shutdown complete");
            return Ok(());
        }

        info!("SIGHUP received, restarting");
        match cli.load_config() {
            Ok(reloaded) => config = reloaded,
            Err(e) => warn!("Keeping previous configuration: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "powermonitor",
            "-s",
            "/dev/tcp/relay/2000",
            "-d",
            "-p",
            "9100",
            "-H",
            "inverter.local",
            "-P",
            "1502",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.meter.device, "/dev/tcp/relay/2000");
        assert_eq!(config.logging.level, "DEBUG");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.modbus.host, "inverter.local");
        assert_eq!(config.modbus.port, 1502);
        assert!(config.modbus.enabled());
    }

    #[test]
    fn no_flags_keep_defaults() {
        let cli = Cli::try_parse_from(["powermonitor"]).unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.port, 9012);
        assert!(!config.modbus.enabled());
    }
}
