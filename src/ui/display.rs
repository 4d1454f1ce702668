use console::style;

use crate::keys::bundle::PublicKeyBundle;

pub fn ok(message: &str) {
    eprintln!("{} {}", style("ok:").green().bold(), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", style("warning:").yellow().bold(), message);
}

/// Print an aligned "label value" detail line.
pub fn info(label: &str, value: &str) {
    eprintln!("  {:<14}{}", style(label).bold(), value);
}

/// Key id, fingerprint and user ids, one per line, on stdout so scripts can
/// pick the id up.
pub fn key_details(key: &PublicKeyBundle) {
    println!("  key id:      {}", key.key_id());
    println!("  fingerprint: {}", key.fingerprint());
    for uid in &key.user_ids {
        println!("  uid:         {}", uid);
    }
}

/// One keyring entry: "sec|pub <id> [state]" followed by its user ids.
pub fn key_entry(key: &PublicKeyBundle, own: bool, now: u64) {
    let kind = if own { "sec" } else { "pub" };
    match key_state(key, now) {
        Some(state) => println!("{} {} {}", kind, key.key_id(), state),
        None => println!("{} {}", kind, key.key_id()),
    }
    for uid in &key.user_ids {
        println!("    {}", uid);
    }
}

fn key_state(key: &PublicKeyBundle, now: u64) -> Option<&'static str> {
    if key.revoked {
        Some("[revoked]")
    } else if !key.is_usable_at(now) {
        Some("[expired]")
    } else {
        None
    }
}
