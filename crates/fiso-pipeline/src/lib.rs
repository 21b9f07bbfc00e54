//! Wires one flow's source, optional transform, and sink together (§4.1):
//! correlation/trace propagation, the sink retry loop with jittered
//! exponential backoff, and dead-letter diversion on terminal failure.
//! Everything else in the workspace treats a built [`Pipeline`] as the
//! unit that owns a flow for the duration of its `run`.

mod backoff;
mod pipeline;

pub use pipeline::Pipeline;
