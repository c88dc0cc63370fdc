//! An asynchronous PostgreSQL driver core for a generic SQL layer.
//!
//! # Features
//!
//! - **Event-driven connection FSM**: a single TCP connection moves through
//!   Disconnected → Connecting → Idle ⇄ Busy on socket readiness alone
//! - **Nonblocking query pipeline**: send, flush, consume and fetch phases
//!   each yield back to the event loop
//! - **Sync over async**: `query_s` and `commit_s` spin a private event
//!   loop inside the calling thread, preserving the outer loop's timers
//! - **Buffered transactions**: multi-statement commits are chained as
//!   `BEGIN`, statements, `COMMIT` through a deferred continuation
//!
//! # Example
//!
//! ```no_run
//! use pgsql_driver::{EventLoop, PgsqlDb};
//!
//! let ev = EventLoop::new();
//! EventLoop::set_current(&ev);
//!
//! let db = PgsqlDb::init("host=localhost dbname=mails");
//! db.connect();
//!
//! db.query("SELECT userid FROM users", |result| {
//!     while result.next_row() > 0 {
//!         println!("{:?}", result.field_value(0));
//!     }
//!     EventLoop::current().stop();
//! });
//! ev.run();
//! ```

pub mod api;
pub mod driver;
pub mod error;
pub mod event;
pub mod pq;
pub mod result;
pub mod transaction;

pub use api::{
    sql_driver_lookup, sql_driver_register, sql_driver_unregister, CommitResult, DbState,
    SqlDriverDef, SQL_CONNECT_TIMEOUT_SECS, SQL_QUERY_TIMEOUT_SECS,
};
pub use driver::{driver_pgsql_deinit, driver_pgsql_init, ClientFactory, PgsqlDb, DRIVER_PGSQL};
pub use error::{Error, ErrorFields, Result};
pub use event::{EventLoop, IoDir, IoWatch, Timer};
pub use pq::escape::{escape_blob, escape_string, unescape_bytea};
pub use pq::{ConnStatus, FlushStatus, PgClient, PgServerResult, PollingStatus, ResultStatus};
pub use result::{not_connected_result, SqlResult};
pub use transaction::SqlTransaction;
