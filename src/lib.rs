//! # pgpgate
//!
//! Local gateway that signs, encrypts and decrypts on behalf of other apps.
//! Apps talk to it over a Unix socket; anything needing the user's consent
//! or secrets is paused behind a continuation token until the user answers.

pub mod api;
pub mod autocrypt;
pub mod cli;
pub mod clock;
pub mod config;
pub mod continuation;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod keys;
pub mod permission;
pub mod resolve;
#[cfg(all(feature = "server", unix))]
pub mod server;
pub mod ui;
