pub mod apps;
#[cfg(all(feature = "server", unix))]
pub mod interact;
pub mod keys;
#[cfg(all(feature = "server", unix))]
pub mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::GatewayConfig;
use crate::keys::store::KeyStore;

#[derive(Parser)]
#[command(
    name = "pgpgate",
    about = "Gateway that performs key operations on behalf of local applications"
)]
#[command(version, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every command.
#[derive(clap::Args, Clone, Debug)]
pub struct GlobalArgs {
    /// Show debug output (never prints secret values)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Minimal output (for scripting)
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Path to gateway.toml
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Gateway home directory (keys, registrations, socket)
    #[arg(long, global = true, env = "PGPGATE_HOME")]
    pub home: Option<PathBuf>,
}

impl GlobalArgs {
    pub fn store(&self) -> Result<KeyStore> {
        match &self.home {
            Some(home) => Ok(KeyStore::open_at(home.clone())),
            None => KeyStore::open(),
        }
    }

    pub fn gateway_config(&self, store: &KeyStore) -> Result<GatewayConfig> {
        GatewayConfig::load(self.config.as_deref(), &store.config_path())
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the key store
    Keys(keys::KeysArgs),

    /// Inspect and manage calling applications
    Apps(apps::AppsArgs),

    /// Run the gateway on its Unix socket
    #[cfg(all(feature = "server", unix))]
    Serve(serve::ServeArgs),

    /// Answer a pending interaction (as the gateway's owner)
    #[cfg(all(feature = "server", unix))]
    Interact(interact::InteractArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}
