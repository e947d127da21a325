//! # supernet-core — Weight-sharing supernet engine
//!
//! Everything needed to build, configure and cost a supernet lives here:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`architecture`] | `Architecture`, `ForwardState`, `ArchitectureParameter`, `SupernetState` |
//! | [`block`] | candidate operations (`Conv`, `Mobile`, `Skip`) behind the `Block` registry |
//! | [`supernet`] | `Supernet`: stages of parallel candidates, `evaluate(x, state)` |
//! | [`child`] | `ChildNet`: the standalone network of one searched architecture |
//! | [`lookup`] | `LookupTable`: per-(stage, choice) hardware cost columns |
//! | [`sampler`] | `TrainingStrategy`, `UniformSampler`, `DifferentiableSampler` |
//!
//! ## Design principles
//!
//! 1. **Explicit state.** The active path, forward mode and architecture
//!    logits form one `SupernetState` value passed to `evaluate`.
//! 2. **Closed registry.** Candidate operations are enum variants resolved
//!    once at construction; forward passes never look up names.
//! 3. **Cheap constraints.** Hardware cost is a table lookup, never a run of
//!    the network.

pub mod architecture;
pub mod block;
pub mod child;
pub mod lookup;
pub mod sampler;
pub mod supernet;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use architecture::{
    gumbel_softmax, Architecture, ArchitectureParameter, ForwardState, SupernetState,
};
pub use block::Block;
pub use child::ChildNet;
pub use lookup::{block_cost, BlockCost, LookupTable};
pub use sampler::{DifferentiableSampler, TrainingStrategy, UniformSampler};
pub use supernet::{Classifier, Supernet};
