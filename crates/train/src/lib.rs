//! # supernet-train — The Training Engine
//!
//! Multi-phase supernet training:
//!
//! * **[`TrainingAgent`]** — owns the supernet, training and search
//!   strategies, optimisers and metric sink. [`TrainingAgent::run`] walks
//!   warmup → search → finalize and persists the winning architecture.
//! * **[`EvaluateAgent`]** — trains the standalone child network of one
//!   architecture from scratch with the same epoch loop.
//! * **[`LrScheduler`]** — per-batch weight LR (ramp → cosine / linear /
//!   constant) and the architecture LR gated on the search phase.

pub mod agent;
mod epoch;
pub mod evaluate;
pub mod scheduler;

pub use agent::{build_training_strategy, EpochStats, Phase, TrainingAgent, TrainingReport};
pub use evaluate::{EvaluateAgent, EvaluateReport};
pub use scheduler::{LrDecay, LrScheduler};
