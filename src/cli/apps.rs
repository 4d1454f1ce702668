use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use super::GlobalArgs;
use crate::autocrypt::store::PeerStore;
use crate::keys::store::{validate_package_name, KeyRepository, KeyStore};
use crate::keys::KeyId;
use crate::permission::{AppStore, PackageRegistry, PermissionGuard, PermissionStore};
use crate::ui::display;

#[derive(Parser)]
pub struct AppsArgs {
    #[command(subcommand)]
    pub command: AppsCommand,
}

#[derive(Subcommand)]
pub enum AppsCommand {
    /// List installed and registered apps
    List,

    /// Allow a registered app to use a key
    AllowKey {
        /// Package name
        package: String,
        /// Key id (16 hex digits)
        key_id: KeyId,
    },

    /// Withdraw an app's access to a key
    RevokeKey {
        /// Package name
        package: String,
        /// Key id (16 hex digits)
        key_id: KeyId,
    },

    /// Forget an app: registration, key grants and Autocrypt peers
    Uninstall {
        /// Package name
        package: String,

        /// Don't ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
}

pub fn run(args: AppsArgs, global: &GlobalArgs) -> Result<()> {
    let store = global.store()?;
    match args.command {
        AppsCommand::List => cmd_list(&store),
        AppsCommand::AllowKey { package, key_id } => cmd_allow_key(&store, &package, key_id),
        AppsCommand::RevokeKey { package, key_id } => cmd_revoke_key(&store, &package, key_id),
        AppsCommand::Uninstall { package, yes } => cmd_uninstall(&store, &package, yes),
    }
}

fn cmd_list(store: &KeyStore) -> Result<()> {
    let apps = AppStore::open_at(store.apps_path());
    let installed = PackageRegistry::open_at(store.packages_path()).list()?;
    let registered = apps.list_apps()?;

    if installed.is_empty() && registered.is_empty() {
        println!("No apps installed or registered.");
        return Ok(());
    }

    for package in &installed {
        let state = match registered.iter().find(|app| app.package == package.name) {
            None => "not registered".to_string(),
            Some(app) => match package.certificate_bytes() {
                Ok(cert) if cert == app.certificate => "registered".to_string(),
                Ok(_) => "CERTIFICATE MISMATCH".to_string(),
                Err(e) => format!("unreadable certificate ({})", e),
            },
        };
        println!("{} (uid {}): {}", package.name, package.uid, state);
        print_allowed_keys(&apps, &package.name)?;
    }

    for app in registered
        .iter()
        .filter(|app| !installed.iter().any(|p| p.name == app.package))
    {
        println!("{}: registered, not installed", app.package);
        print_allowed_keys(&apps, &app.package)?;
    }

    Ok(())
}

fn print_allowed_keys(apps: &AppStore, package: &str) -> Result<()> {
    for key_id in apps.allowed_keys(package)? {
        println!("    key {}", key_id);
    }
    Ok(())
}

fn cmd_allow_key(store: &KeyStore, package: &str, key_id: KeyId) -> Result<()> {
    validate_package_name(package)?;
    if store.public_key(key_id)?.is_none() {
        bail!("no key {}", key_id);
    }

    let apps = AppStore::open_at(store.apps_path());
    if apps.add_allowed_key(package, key_id)? {
        display::ok(&format!("{} may now use key {}", package, key_id));
    } else {
        display::info("unchanged", &format!("{} already may use key {}", package, key_id));
    }
    Ok(())
}

fn cmd_revoke_key(store: &KeyStore, package: &str, key_id: KeyId) -> Result<()> {
    validate_package_name(package)?;
    let apps = AppStore::open_at(store.apps_path());
    if apps.remove_allowed_key(package, key_id)? {
        display::ok(&format!("{} may no longer use key {}", package, key_id));
    } else {
        display::warning(&format!("{} had no access to key {}", package, key_id));
    }
    Ok(())
}

fn cmd_uninstall(store: &KeyStore, package: &str, yes: bool) -> Result<()> {
    validate_package_name(package)?;
    if !yes && !confirm(&format!("Forget everything about {}?", package))? {
        println!("uninstall cancelled");
        return Ok(());
    }

    let guard = PermissionGuard::new(
        Arc::new(AppStore::open_at(store.apps_path())),
        Arc::new(PeerStore::open_at(store.autocrypt_dir())),
    );
    guard.purge(package)?;
    display::ok(&format!("forgot {}", package));
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    use dialoguer::Confirm;
    let result = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(result)
}
