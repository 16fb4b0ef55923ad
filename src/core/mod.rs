// Engine-independent building blocks: errors, cancellation, the instance
// registry, capability probing and output normalization.
pub mod cancel;
pub mod error;
pub mod normalize;
pub mod probe;
pub mod registry;
