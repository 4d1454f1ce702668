use anyhow::Result;
use clap::Parser;

use pgpgate::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let log_level = if args.global.verbose {
        tracing::Level::DEBUG
    } else if args.global.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let global = args.global;
    match args.command {
        cli::Command::Keys(args) => cli::keys::run(args, &global),
        cli::Command::Apps(args) => cli::apps::run(args, &global),
        #[cfg(all(feature = "server", unix))]
        cli::Command::Serve(args) => cli::serve::run(args, &global).await,
        #[cfg(all(feature = "server", unix))]
        cli::Command::Interact(args) => cli::interact::run(args, &global).await,
        cli::Command::Completions { shell } => {
            let mut cmd = <cli::Cli as clap::CommandFactory>::command();
            clap_complete::generate(shell, &mut cmd, "pgpgate", &mut std::io::stdout());
            Ok(())
        }
    }
}
