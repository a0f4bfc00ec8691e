//! Inventory Configuration Module
//!
//! Service, engine, facility and publisher settings loaded from TOML files.
//!
//! ## Loading Order
//!
//! 1. `RFID_CONFIG` environment variable (path to TOML file)
//! 2. `inventory_config.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! ## Usage
//!
//! The binary calls `config::init()` once at startup and reads it back with
//! `config::get()`. Library components never read the global; they receive
//! explicit settings built from it.
//!
//! ```ignore
//! config::init(InventoryConfig::load());
//! let stripes = config::get().engine.lock_stripes;
//! ```

mod inventory_config;
pub mod defaults;
pub mod validation;
pub mod watcher;

pub use inventory_config::*;

use std::sync::OnceLock;

/// Global inventory configuration, initialized once at startup.
static INVENTORY_CONFIG: OnceLock<InventoryConfig> = OnceLock::new();

/// Initialize the global inventory configuration.
///
/// Later calls are ignored with a warning.
pub fn init(config: InventoryConfig) {
    if INVENTORY_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global inventory configuration.
///
/// Falls back to built-in defaults when `init()` was never called.
pub fn get() -> &'static InventoryConfig {
    INVENTORY_CONFIG.get_or_init(|| {
        tracing::warn!("config::get() called before config::init(), using built-in defaults");
        InventoryConfig::default()
    })
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    INVENTORY_CONFIG.get().is_some()
}
