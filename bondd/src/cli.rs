use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bondd", version, about = "Link bonding control-plane daemon")]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Run,

    /// Bring the configured bonds up once and print their status
    Show {
        /// Only show this bond
        bond: Option<String>,
    },

    /// Print the hash bucket a MAC address lands in
    Hash {
        /// MAC address, e.g. 00:11:22:33:44:55
        mac: String,

        /// VLAN id
        #[arg(long, default_value_t = 0)]
        vlan: u16,

        /// Hashing basis
        #[arg(long, default_value_t = 0)]
        basis: u32,
    },

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}
