use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn pgpgate(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pgpgate").unwrap();
    cmd.arg("--home").arg(home.path());
    cmd.env_remove("PGPGATE_PASSPHRASE");
    cmd
}

/// Generate a key and return its id as printed.
fn generate(home: &TempDir, uid: &str) -> String {
    let output = pgpgate(home)
        .args(["keys", "generate", "--uid", uid])
        .env("PGPGATE_PASSPHRASE", "correct horse")
        .output()
        .unwrap();
    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8(output.stdout).unwrap();
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("key id:"))
        .map(|id| id.trim().to_string())
        .expect("key id in output")
}

fn register(home: &TempDir, package: &str, certificate: &str) {
    fs::write(
        home.path().join("apps.toml"),
        format!(
            "[\"{}\"]\ncertificate = \"{}\"\nallowed_keys = []\n",
            package, certificate
        ),
    )
    .unwrap();
}

// --- keys ---

#[test]
fn generate_then_list_shows_secret_key() {
    let home = TempDir::new().unwrap();
    let key_id = generate(&home, "Alice <alice@example.org>");
    assert_eq!(key_id.len(), 16);

    pgpgate(&home)
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("sec {}", key_id)))
        .stdout(predicate::str::contains("Alice <alice@example.org>"));

    assert!(home
        .path()
        .join("keys/secret")
        .join(format!("{}.sec", key_id))
        .exists());
}

#[test]
fn list_empty_store() {
    let home = TempDir::new().unwrap();
    pgpgate(&home)
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No keys"));
}

#[test]
fn export_never_contains_secret_material() {
    let home = TempDir::new().unwrap();
    let key_id = generate(&home, "alice@example.org");

    pgpgate(&home)
        .args(["keys", "export", &key_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("# pgpgate public key {}", key_id)))
        .stdout(predicate::str::contains("age: age1"))
        .stdout(predicate::str::contains("AGE-SECRET-KEY").not());
}

#[test]
fn exported_key_imports_elsewhere_as_public() {
    let alice = TempDir::new().unwrap();
    let bob = TempDir::new().unwrap();
    let key_id = generate(&alice, "alice@example.org");

    let output = pgpgate(&alice)
        .args(["keys", "export", &key_id])
        .output()
        .unwrap();
    let file = bob.path().join("alice.pub");
    fs::write(&file, output.stdout).unwrap();

    pgpgate(&bob)
        .args(["keys", "import", file.to_str().unwrap(), "--yes"])
        .assert()
        .success()
        .stderr(predicate::str::contains(format!("imported key {}", key_id)));

    pgpgate(&bob)
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("pub {}", key_id)));
}

#[test]
fn import_rejects_secret_material() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("leak.txt");
    fs::write(&file, "uid: mallory\nAGE-SECRET-KEY-1QQQQQQQQQQ\n").unwrap();

    pgpgate(&home)
        .args(["keys", "import", file.to_str().unwrap(), "--yes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("secret key material"));
}

#[test]
fn revoke_marks_key() {
    let home = TempDir::new().unwrap();
    let key_id = generate(&home, "alice@example.org");

    pgpgate(&home)
        .args(["keys", "revoke", &key_id, "--yes"])
        .assert()
        .success();

    pgpgate(&home)
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{} [revoked]", key_id)));
}

#[test]
fn export_unknown_key_fails() {
    let home = TempDir::new().unwrap();
    pgpgate(&home)
        .args(["keys", "export", "00000000000000ab"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no key"));
}

#[test]
fn malformed_key_id_rejected() {
    let home = TempDir::new().unwrap();
    pgpgate(&home)
        .args(["keys", "export", "not-a-key"])
        .assert()
        .failure();
}

// --- apps ---

#[test]
fn apps_list_reports_certificate_state() {
    let home = TempDir::new().unwrap();
    fs::write(
        home.path().join("packages.toml"),
        r#"
[[package]]
uid = 10001
name = "org.example.mail"
certificates = ["abcd"]

[[package]]
uid = 10002
name = "org.example.notes"
certificates = ["0102"]
"#,
    )
    .unwrap();
    fs::write(
        home.path().join("apps.toml"),
        "[\"org.example.mail\"]\ncertificate = \"abcd\"\n\n[\"org.example.notes\"]\ncertificate = \"ffff\"\n",
    )
    .unwrap();

    pgpgate(&home)
        .args(["apps", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("org.example.mail (uid 10001): registered"))
        .stdout(predicate::str::contains(
            "org.example.notes (uid 10002): CERTIFICATE MISMATCH",
        ));
}

#[test]
fn allow_and_revoke_key() {
    let home = TempDir::new().unwrap();
    let key_id = generate(&home, "alice@example.org");
    register(&home, "org.example.mail", "abcd");

    pgpgate(&home)
        .args(["apps", "allow-key", "org.example.mail", &key_id])
        .assert()
        .success();
    let apps = fs::read_to_string(home.path().join("apps.toml")).unwrap();
    assert!(apps.contains(&key_id));

    pgpgate(&home)
        .args(["apps", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("key {}", key_id)));

    pgpgate(&home)
        .args(["apps", "revoke-key", "org.example.mail", &key_id])
        .assert()
        .success();
    let apps = fs::read_to_string(home.path().join("apps.toml")).unwrap();
    assert!(!apps.contains(&key_id));
}

#[test]
fn allow_key_requires_registration() {
    let home = TempDir::new().unwrap();
    let key_id = generate(&home, "alice@example.org");

    pgpgate(&home)
        .args(["apps", "allow-key", "org.example.mail", &key_id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not registered"));
}

#[test]
fn uninstall_forgets_app() {
    let home = TempDir::new().unwrap();
    register(&home, "org.example.mail", "abcd");

    pgpgate(&home)
        .args(["apps", "uninstall", "org.example.mail", "--yes"])
        .assert()
        .success();

    let apps = fs::read_to_string(home.path().join("apps.toml")).unwrap();
    assert!(!apps.contains("org.example.mail"));
}

#[test]
fn uninstall_rejects_path_like_package() {
    let home = TempDir::new().unwrap();
    pgpgate(&home)
        .args(["apps", "uninstall", "../etc", "--yes"])
        .assert()
        .failure();
}

// --- misc ---

#[test]
fn completions_bash() {
    let home = TempDir::new().unwrap();
    pgpgate(&home)
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pgpgate"));
}

#[test]
fn invalid_config_is_reported() {
    let home = TempDir::new().unwrap();
    fs::write(home.path().join("gateway.toml"), "[continuation]\nttl_secs = \"soon\"\n").unwrap();

    pgpgate(&home)
        .args(["interact", "describe", "6f1c2d3e-4b5a-4c6d-8e7f-0a1b2c3d4e5f"])
        .assert()
        .failure();
}
