use age::secrecy::SecretString;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use super::GlobalArgs;
use crate::clock::{Clock, SystemClock};
use crate::keys::bundle::PublicKeyBundle;
use crate::keys::identity::SecretKeyBundle;
use crate::keys::store::{KeyRepository, SecretKeyRepository};
use crate::keys::KeyId;
use crate::ui::display;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Parser)]
pub struct KeysArgs {
    #[command(subcommand)]
    pub command: KeysCommand,
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Generate a new secret key
    Generate {
        /// User id, e.g. "Alice <alice@example.org>" (repeatable)
        #[arg(long = "uid", required = true)]
        uids: Vec<String>,

        /// Expire the key after this many days
        #[arg(long)]
        expires_in_days: Option<u64>,

        /// Passphrase protecting the key (prompted if not given)
        #[arg(long, env = "PGPGATE_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Import a public key bundle
    Import {
        /// Path to a .pub file
        file: String,

        /// Don't ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },

    /// List known keys
    List,

    /// Print a public key bundle
    Export {
        /// Key id (16 hex digits)
        key_id: KeyId,
    },

    /// Mark a key as revoked
    Revoke {
        /// Key id (16 hex digits)
        key_id: KeyId,

        /// Don't ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
}

pub fn run(args: KeysArgs, global: &GlobalArgs) -> Result<()> {
    match args.command {
        KeysCommand::Generate {
            uids,
            expires_in_days,
            passphrase,
        } => cmd_generate(global, uids, expires_in_days, passphrase),
        KeysCommand::Import { file, yes } => cmd_import(global, &file, yes),
        KeysCommand::List => cmd_list(global),
        KeysCommand::Export { key_id } => cmd_export(global, key_id),
        KeysCommand::Revoke { key_id, yes } => cmd_revoke(global, key_id, yes),
    }
}

fn cmd_generate(
    global: &GlobalArgs,
    uids: Vec<String>,
    expires_in_days: Option<u64>,
    passphrase: Option<String>,
) -> Result<()> {
    let store = global.store()?;
    let passphrase = match passphrase {
        Some(p) => p,
        None => prompt_new_passphrase()?,
    };
    if passphrase.is_empty() {
        bail!("passphrase cannot be empty");
    }

    let now = SystemClock.unix_now();
    let expires = expires_in_days.map(|days| now + days * DAY_SECS);
    let key = SecretKeyBundle::generate(uids, now, expires);
    let sealed = key.seal(&SecretString::from(passphrase))?;

    store.save_secret(key.key_id(), &sealed)?;
    let public = key.public();
    store.save_public(&public)?;

    display::ok("key generated");
    println!();
    display::key_details(&public);
    println!();
    println!("Allow an app to use it with: pgpgate apps allow-key <package> {}", public.key_id());

    Ok(())
}

fn cmd_import(global: &GlobalArgs, file: &str, yes: bool) -> Result<()> {
    let store = global.store()?;
    let content = std::fs::read(file).with_context(|| format!("failed to read '{}'", file))?;
    let key = PublicKeyBundle::parse_public(&content)
        .with_context(|| format!("'{}' is not a public key bundle", file))?;

    println!("Importing public key:");
    display::key_details(&key);
    println!();

    if !yes && !confirm("Import this key?")? {
        println!("import cancelled");
        return Ok(());
    }

    let key_id = store.save_public(&key)?;
    display::ok(&format!("imported key {}", key_id));

    Ok(())
}

fn cmd_list(global: &GlobalArgs) -> Result<()> {
    let store = global.store()?;
    let keys = store.list_public()?;
    if keys.is_empty() {
        println!("No keys. Generate one with: pgpgate keys generate --uid <uid>");
        return Ok(());
    }

    let own = store.list_secret()?;
    let now = SystemClock.unix_now();
    for key in &keys {
        display::key_entry(key, own.contains(&key.key_id()), now);
    }

    Ok(())
}

fn cmd_export(global: &GlobalArgs, key_id: KeyId) -> Result<()> {
    let store = global.store()?;
    let Some(key) = store.public_key(key_id)? else {
        bail!("no key {}", key_id);
    };
    print!("{}", key.to_text());
    Ok(())
}

fn cmd_revoke(global: &GlobalArgs, key_id: KeyId, yes: bool) -> Result<()> {
    let store = global.store()?;
    let Some(mut key) = store.public_key(key_id)? else {
        bail!("no key {}", key_id);
    };
    if key.revoked {
        display::warning(&format!("key {} is already revoked", key_id));
        return Ok(());
    }

    if !yes && !confirm(&format!("Revoke key {}? This cannot be undone.", key_id))? {
        println!("revocation cancelled");
        return Ok(());
    }

    key.revoked = true;
    store.save_public(&key)?;
    display::ok(&format!("revoked key {}", key_id));
    Ok(())
}

fn prompt_new_passphrase() -> Result<String> {
    let passphrase = dialoguer::Password::new()
        .with_prompt("Passphrase for the new key")
        .with_confirmation("Repeat passphrase", "passphrases don't match")
        .interact()?;
    Ok(passphrase)
}

fn confirm(prompt: &str) -> Result<bool> {
    use dialoguer::Confirm;
    let result = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(result)
}
