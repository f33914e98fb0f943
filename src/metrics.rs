//! Runtime counters.
//!
//! Registered with metriken so embedding processes can expose them
//! (e.g. via Prometheus) without the runtime knowing about the exporter.

use metriken::{Counter, metric};

#[metric(
    name = "netline/connections/accepted",
    description = "Connections accepted on the server channel"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "netline/connections/dialed",
    description = "Outbound connections completed"
)]
pub static CONNECTIONS_DIALED: Counter = Counter::new();

#[metric(
    name = "netline/connections/closed",
    description = "Sessions fully closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(name = "netline/bytes/received", description = "Total bytes read")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "netline/bytes/sent", description = "Total bytes written")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "netline/pool/exhausted",
    description = "Buffer pool allocation failures"
)]
pub static POOL_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "netline/store/spills",
    description = "Output chunks spilled to the file store"
)]
pub static STORE_SPILLS: Counter = Counter::new();
