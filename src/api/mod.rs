//! This mod holds the library's client-facing API.
mod client;
mod options;
mod wiring;

pub use client::Vault;
pub use options::VaultOptions;
pub use wiring::try_create_vault;
pub use wiring::VaultConfig;
pub use wiring::VaultCreationError;
