//! Session configuration via `persista.toml`
//!
//! Every knob the session reads lives in one [`SessionConfig`]. A config can
//! be built in code, parsed from a TOML string, or read from a file; the
//! values are checked together by [`SessionConfig::validate`], which every
//! loading path calls before handing the config out.

use persista_core::{Error, LockLevel, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name used by [`SessionConfig::write_default_if_missing`] callers.
pub const CONFIG_FILE_NAME: &str = "persista.toml";

/// What a transactional instance remembers so rollback can restore it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreState {
    /// Nothing; rolled back instances become hollow
    None,
    /// Immutable field values; mutable containers are unloaded instead
    #[default]
    Immutable,
    /// Every field value
    All,
}

/// Events that detach every managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoDetach {
    /// Session close
    Close,
    /// Transaction commit
    Commit,
    /// Transaction rollback
    Rollback,
    /// End of every operation outside a transaction
    NontxRead,
    /// Never; must be the only entry
    None,
}

/// Which fields a detached copy carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetachState {
    /// Whatever happens to be loaded
    #[default]
    Loaded,
    /// The active fetch groups, loading what is missing
    FetchGroups,
    /// Every persistent field
    All,
}

/// Reaction to a failing listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallbackMode {
    /// Swallow the failure
    Ignore,
    /// Log the failure
    Log,
    /// Return the failure to the caller
    Rethrow,
    /// Mark the transaction rollback-only
    Rollback,
    /// Stop notifying further listeners after the first failure
    FailFast,
}

/// Session configuration loaded from `persista.toml`.
///
/// # Example
///
/// ```toml
/// optimistic = true
/// restore_state = "immutable"
/// auto_detach = ["commit"]
/// lifecycle_callback_mode = ["log", "rollback"]
/// lock_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Defer datastore work until flush and check versions instead of locking
    pub optimistic: bool,
    /// Keep field values of committed instances
    pub retain_state: bool,
    /// What rollback restores
    pub restore_state: RestoreState,
    /// Allow reads outside a transaction
    pub nontransactional_read: bool,
    /// Allow writes outside a transaction
    pub nontransactional_write: bool,
    /// Session is shared between threads
    pub multithreaded: bool,
    /// Transactions are demarcated by an external coordinator
    pub managed: bool,
    /// Join an external transaction found active at the start of an operation
    pub sync_with_managed_transactions: bool,
    /// Events that detach every instance
    pub auto_detach: Vec<AutoDetach>,
    /// Fields carried by detached copies
    pub detach_state: DetachState,
    /// Skip the pre-flush of dirty instances before query-style reads
    pub ignore_changes: bool,
    /// Flush dirty instances in the order they were first dirtied
    pub order_dirty_objects: bool,
    /// Collapse optimistic batch failures into a terse error
    pub suppress_batch_ole_logging: bool,
    /// Reaction to failing lifecycle listeners
    pub lifecycle_callback_mode: Vec<CallbackMode>,
    /// Reaction to failing transaction listeners
    pub transaction_callback_mode: Vec<CallbackMode>,
    /// Lock taken when an instance is read in a transaction
    pub read_lock_level: LockLevel,
    /// Lock taken when an instance is written in a transaction
    pub write_lock_level: LockLevel,
    /// Lock wait in milliseconds, -1 waits forever
    pub lock_timeout_ms: i64,
    /// Check versions in pessimistic transactions too
    pub non_optimistic_version_check: bool,
    /// Upper bound on clean transactional instances, unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_capacity: Option<usize>,
    /// Run a logical flush before each savepoint snapshot
    pub savepoint_pre_flush: bool,
    /// Evict every cached instance when the session closes
    pub evict_from_cache_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            optimistic: true,
            retain_state: true,
            restore_state: RestoreState::Immutable,
            nontransactional_read: true,
            nontransactional_write: true,
            multithreaded: false,
            managed: false,
            sync_with_managed_transactions: false,
            auto_detach: Vec::new(),
            detach_state: DetachState::Loaded,
            ignore_changes: false,
            order_dirty_objects: false,
            suppress_batch_ole_logging: false,
            lifecycle_callback_mode: vec![CallbackMode::Rethrow],
            transaction_callback_mode: vec![CallbackMode::Rethrow],
            read_lock_level: LockLevel::Read,
            write_lock_level: LockLevel::Write,
            lock_timeout_ms: -1,
            non_optimistic_version_check: false,
            clean_capacity: None,
            savepoint_pre_flush: false,
            evict_from_cache_on_close: false,
        }
    }
}

impl SessionConfig {
    /// Whether `event` triggers auto-detach
    pub fn auto_detaches_on(&self, event: AutoDetach) -> bool {
        self.auto_detach.contains(&event)
    }

    /// Check the settings as a group.
    ///
    /// # Errors
    ///
    /// Returns a user error naming the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        if self.auto_detach.contains(&AutoDetach::None) && self.auto_detach.len() > 1 {
            return Err(Error::user(
                "auto_detach \"none\" cannot be combined with other events",
            ));
        }
        for (name, modes) in [
            ("lifecycle_callback_mode", &self.lifecycle_callback_mode),
            ("transaction_callback_mode", &self.transaction_callback_mode),
        ] {
            if modes.contains(&CallbackMode::Ignore) && modes.contains(&CallbackMode::Rethrow) {
                return Err(Error::user(format!(
                    "{} cannot both ignore and rethrow listener failures",
                    name
                )));
            }
        }
        if self.lock_timeout_ms < -1 {
            return Err(Error::user(format!(
                "Invalid lock_timeout_ms {}. Expected -1 or a non-negative number.",
                self.lock_timeout_ms
            )));
        }
        if self.read_lock_level > self.write_lock_level {
            return Err(Error::user(format!(
                "read_lock_level {} is stronger than write_lock_level {}",
                self.read_lock_level, self.write_lock_level
            )));
        }
        if self.clean_capacity == Some(0) {
            return Err(Error::user("clean_capacity must be at least 1"));
        }
        if self.sync_with_managed_transactions && !self.managed {
            return Err(Error::user(
                "sync_with_managed_transactions requires managed = true",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# persista session configuration
#
# Optimistic transactions defer datastore work until flush and detect
# conflicts through versions instead of locks (default: true)
optimistic = true

# Keep field values of instances after commit (default: true)
retain_state = true

# What rollback restores: "none", "immutable" (default) or "all"
restore_state = "immutable"

# Reads and writes outside a transaction (default: true)
nontransactional_read = true
nontransactional_write = true

# Share the session between threads (default: false)
multithreaded = false

# Transactions demarcated by an external coordinator (default: false)
managed = false
sync_with_managed_transactions = false

# Detach every instance on: "close", "commit", "rollback", "nontx-read"
# or "none" (alone)
auto_detach = []

# Fields carried by detached copies: "loaded" (default), "fetch-groups", "all"
detach_state = "loaded"

ignore_changes = false
order_dirty_objects = false
suppress_batch_ole_logging = false

# Listener failure handling, any of:
# "ignore", "log", "rethrow", "rollback", "fail-fast"
lifecycle_callback_mode = ["rethrow"]
transaction_callback_mode = ["rethrow"]

# Locks taken by reads and writes inside a transaction: "none", "read", "write"
read_lock_level = "read"
write_lock_level = "write"

# Lock wait in milliseconds; -1 waits forever
lock_timeout_ms = -1

non_optimistic_version_check = false

# Upper bound on clean instances kept in a transaction (default: unbounded)
# clean_capacity = 10000

savepoint_pre_flush = false
evict_from_cache_on_close = false
"#
    }

    /// Parse and validate a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(content)
            .map_err(|e| Error::user(format!("Failed to parse session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: SessionConfig = toml::from_str(&content).map_err(|e| {
            Error::user(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
