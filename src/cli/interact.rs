use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use rand::Rng;

use super::GlobalArgs;
use crate::api::PendingInteraction;
use crate::continuation::TokenId;
use crate::interaction::RequiredInput;
use crate::keys::KeyId;
use crate::server::client::GatewayClient;
use crate::server::protocol::{InteractionRequest, InteractionResponse, WireUserInput};
use crate::ui::display;

#[derive(Args)]
pub struct InteractArgs {
    /// Socket path (overrides gateway.toml)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: InteractCommand,
}

#[derive(Subcommand)]
pub enum InteractCommand {
    /// Show what a paused call is waiting for
    Describe { token: TokenId },

    /// Approve an app registration or key grant
    Approve { token: TokenId },

    /// Refuse the request; the app gets an error
    Deny { token: TokenId },

    /// Drop a paused call without answering
    Cancel { token: TokenId },

    /// Supply the passphrase of a secret key
    Passphrase {
        token: TokenId,
        key_id: KeyId,

        /// Passphrase (prompted if not given)
        #[arg(long, env = "PGPGATE_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Pick keys for an ambiguous recipient list or signing key
    Select {
        token: TokenId,
        #[arg(required = true)]
        key_ids: Vec<KeyId>,
    },

    /// Generate and supply the code protecting a backup
    BackupCode { token: TokenId },

    /// Proceed despite an overridable security warning
    Acknowledge { token: TokenId },
}

pub async fn run(args: InteractArgs, global: &GlobalArgs) -> Result<()> {
    let store = global.store()?;
    let config = global.gateway_config(&store)?;
    let socket = args
        .socket
        .unwrap_or_else(|| config.socket_path(store.base_dir()));
    let mut client = GatewayClient::connect(&socket).await?;

    let (token, input) = match args.command {
        InteractCommand::Describe { token } => {
            let response = client.interact(InteractionRequest::Describe { token }).await?;
            return report(response);
        }
        InteractCommand::Cancel { token } => {
            let response = client.interact(InteractionRequest::Cancel { token }).await?;
            return report(response);
        }
        InteractCommand::Approve { token } => (token, WireUserInput::Approve),
        InteractCommand::Deny { token } => (token, WireUserInput::Deny),
        InteractCommand::Passphrase {
            token,
            key_id,
            passphrase,
        } => {
            let passphrase = match passphrase {
                Some(p) => p,
                None => dialoguer::Password::new()
                    .with_prompt(format!("Passphrase for key {}", key_id))
                    .interact()?,
            };
            (token, WireUserInput::Passphrase { key_id, passphrase })
        }
        InteractCommand::Select { token, key_ids } => {
            (token, WireUserInput::SelectKeys { key_ids })
        }
        InteractCommand::BackupCode { token } => {
            let code = generate_backup_code();
            println!("Backup code (write it down, it is not stored):");
            println!();
            println!("  {}", code);
            println!();
            (token, WireUserInput::BackupCode { code })
        }
        InteractCommand::Acknowledge { token } => (token, WireUserInput::AcknowledgeWarning),
    };

    let response = client
        .interact(InteractionRequest::Complete { token, input })
        .await?;
    report(response)
}

fn report(response: InteractionResponse) -> Result<()> {
    match response {
        InteractionResponse::Pending(pending) => {
            print_pending(&pending);
            Ok(())
        }
        InteractionResponse::Completed { token } => {
            display::ok(&format!("answered; the app resumes with {}", token));
            Ok(())
        }
        InteractionResponse::Cancelled { existed: true } => {
            display::ok("call cancelled");
            Ok(())
        }
        InteractionResponse::Cancelled { existed: false } => {
            display::warning("no such pending call");
            Ok(())
        }
        InteractionResponse::Failed(body) => bail!("{}", body.message),
    }
}

fn print_pending(pending: &PendingInteraction) {
    display::info("app:", &pending.package);
    display::info("action:", &format!("{:?}", pending.action));
    let Some(required) = &pending.required else {
        display::info("waiting for:", "the app to resume");
        return;
    };

    let (what, detail) = match required {
        RequiredInput::Registration {
            package,
            fingerprint,
        } => (
            "registration",
            format!("{} (certificate sha256 {})", package, fingerprint),
        ),
        RequiredInput::CertificateMismatch { package } => (
            "nothing (refused)",
            format!("{} presented a different signing certificate", package),
        ),
        RequiredInput::KeyPermission { key_id } => {
            ("key permission", format!("use of key {}", key_id))
        }
        RequiredInput::KeyChoice {
            found,
            missing,
            duplicate,
        } => (
            "key choice",
            format!(
                "found [{}], missing [{}], ambiguous [{}]",
                join(found),
                missing.join(", "),
                duplicate.join(", ")
            ),
        ),
        RequiredInput::SigningKeyChoice { candidates } => {
            ("signing key choice", join(candidates))
        }
        RequiredInput::Passphrase { key_id, retry } => (
            "passphrase",
            if *retry {
                format!("key {} (previous passphrase was wrong)", key_id)
            } else {
                format!("key {}", key_id)
            },
        ),
        RequiredInput::SecurityToken { key_id } => {
            ("security token", format!("key {}", key_id))
        }
        RequiredInput::SecurityWarning {
            problem,
            overridable,
        } => (
            "acknowledgement",
            if *overridable {
                problem.clone()
            } else {
                format!("{} (cannot be overridden)", problem)
            },
        ),
        RequiredInput::BackupCode => ("backup code", "protects the exported keys".to_string()),
    };
    display::info("waiting for:", what);
    display::info("detail:", &detail);
}

fn join(keys: &[KeyId]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Six groups of four digits.
fn generate_backup_code() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| format!("{:04}", rng.gen_range(0..10_000)))
        .collect::<Vec<_>>()
        .join("-")
}
