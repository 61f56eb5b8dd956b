use anyhow::Result;
use bond_core::MacAddr;
use bondd::{cli, config, runtime};
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = config::DaemonConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run => {
            let cfg = config::load(&config_path)?;
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run_daemon(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await
        }
        cli::Command::Show { bond } => {
            let cfg = config::load(&config_path)?;
            let state = runtime::load_state(&cfg)?;
            let switch = runtime::Switch::build(&cfg, state)?;
            let log: runtime::LogFn = Box::new(|m| tracing::debug!("{m}"));
            switch.tick(Instant::now(), &log);

            let names = match bond {
                Some(name) => vec![name],
                None => switch.registry().list(),
            };
            for name in names {
                print!("{}", switch.registry().show(&name)?);
            }
            Ok(())
        }
        cli::Command::Hash { mac, vlan, basis } => {
            let mac: MacAddr = mac.parse()?;
            println!("{}", bond_core::registry::hash(mac, vlan, basis));
            Ok(())
        }
    }
}
