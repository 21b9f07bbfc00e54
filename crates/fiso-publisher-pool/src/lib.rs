//! Shared message-log producer clients keyed by named cluster config (§3,
//! §4 "Publisher pool", §5). A `Sink` that publishes to a message-log topic
//! takes a pool handle and uses the producer without owning (and therefore
//! without closing) it — the pool outlives any single flow.

mod pool;
mod producer;

pub use pool::PublisherPool;
pub use producer::Producer;
