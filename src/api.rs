//! Contracts with the generic SQL abstraction layer.
//!
//! The driver registers itself in the driver registry under the name
//! `"pgsql"` and interacts with the generic layer through the state enum,
//! the callback aliases and the shared "not connected" sentinel result.

use std::cell::RefCell;

use crate::driver::PgsqlDb;
use crate::result::SqlResult;

/// Default connect timeout, seconds.
pub const SQL_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Default per-query timeout, seconds.
pub const SQL_QUERY_TIMEOUT_SECS: u64 = 60;

/// Connection state as seen by the generic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Disconnected,
    Connecting,
    Idle,
    Busy,
}

impl DbState {
    /// A connection is ready for queries once it has connected.
    pub fn is_ready(self) -> bool {
        matches!(self, DbState::Idle | DbState::Busy)
    }
}

/// Callback invoked exactly once per dispatched query.
pub type QueryCallback = Box<dyn FnOnce(&SqlResult)>;

/// Outcome of a transaction commit.
#[derive(Debug, Default)]
pub struct CommitResult {
    /// Error text; `None` on success.
    pub error: Option<String>,
}

/// Callback invoked exactly once per committed transaction.
pub type CommitCallback = Box<dyn FnOnce(&CommitResult)>;

/// A driver record in the registry.
pub struct SqlDriverDef {
    /// Driver name, used for lookup.
    pub name: &'static str,
    /// Pooling is handled by the layer above the driver.
    pub pooled: bool,
    /// Create a driver instance from a connect string. Performs no I/O.
    pub init: fn(&str) -> PgsqlDb,
}

thread_local! {
    static REGISTRY: RefCell<Vec<&'static SqlDriverDef>> = const { RefCell::new(Vec::new()) };
}

/// Register a driver. Registering the same name twice is an error in the
/// caller; the later registration wins on lookup.
pub fn sql_driver_register(def: &'static SqlDriverDef) {
    REGISTRY.with(|r| r.borrow_mut().push(def));
}

/// Remove a driver from the registry. Unknown names are ignored.
pub fn sql_driver_unregister(name: &str) {
    REGISTRY.with(|r| r.borrow_mut().retain(|d| d.name != name));
}

/// Look up a registered driver by name.
pub fn sql_driver_lookup(name: &str) -> Option<&'static SqlDriverDef> {
    REGISTRY.with(|r| r.borrow().iter().rev().find(|d| d.name == name).copied())
}
