//! The pieces at the edge of the protocol engine: where session ids come from, where metrics go,
//!  and who gets told about sessions coming and going.

pub mod capture;
pub mod id_allocator;
pub mod metrics_sink;
