use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use super::GlobalArgs;
use crate::api::{Collaborators, Gateway};
use crate::server::GatewayServer;
use crate::ui::display;

#[derive(Args)]
pub struct ServeArgs {
    /// Socket path (overrides gateway.toml)
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

pub async fn run(args: ServeArgs, global: &GlobalArgs) -> Result<()> {
    let store = global.store()?;
    store.ensure_dirs()?;
    let config = global.gateway_config(&store)?;

    let socket = args
        .socket
        .unwrap_or_else(|| config.socket_path(store.base_dir()));
    let gateway = Arc::new(Gateway::new(
        Collaborators::local(store.base_dir()),
        &config,
    ));
    let server =
        GatewayServer::bind(&socket, gateway)?.with_max_frame(config.server.max_frame_bytes);

    display::ok(&format!("pgpgate listening on {}", socket.display()));
    display::info("home:", &store.base_dir().display().to_string());
    display::info("token TTL:", &format!("{}s", config.continuation.ttl_secs));
    display::info("max pending:", &config.continuation.max_pending.to_string());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::debug!("could not remove {}: {}", socket.display(), e);
    }
    Ok(())
}
