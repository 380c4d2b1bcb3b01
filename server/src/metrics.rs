//! Cache server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "connections_rejected",
    description = "Connections rejected at the connection limit"
)]
pub static CONNECTIONS_REJECTED: Counter = Counter::new();

#[metric(name = "cmd_get", description = "Total GET commands")]
pub static GETS: Counter = Counter::new();

#[metric(name = "cmd_set", description = "Total storage commands")]
pub static SETS: Counter = Counter::new();

#[metric(name = "cmd_delete", description = "Total DELETE commands")]
pub static DELETES: Counter = Counter::new();

#[metric(name = "cmd_flush", description = "Total FLUSH_ALL commands")]
pub static FLUSHES: Counter = Counter::new();

#[metric(name = "store_errors", description = "Storage commands refused by the cache")]
pub static STORE_ERRORS: Counter = Counter::new();

#[metric(name = "protocol_errors", description = "Command lines that failed to parse")]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
