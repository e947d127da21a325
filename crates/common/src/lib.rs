//! # supernet-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`SearchSpaceConfig`]** — macro/micro topology of the supernet (JSON).
//! * **[`AgentConfig`]** — training/search knobs (JSON).
//! * **[`NasError`]** — the error type every library crate returns.
//! * **[`BatchDataset`]** / **[`InMemoryDataset`]** — batching of labelled samples.
//! * **[`AverageMeter`]** / **[`MetricSink`]** — running means and scalar events.

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;

pub use config::{
    Activation, AgentConfig, BlockSpec, BlockType, DifferentiableConfig, EvolutionConfig,
    InfoMetric, LayerConfig, MacroConfig, MicroConfig, SearchSpaceConfig, SearchStrategyKind,
    StageConfig, TrainingStrategyKind,
};
pub use data::{batch_to_tensors, BatchDataset, InMemoryDataset};
pub use error::{NasError, Result};
pub use metrics::{
    accuracy_topk, AverageMeter, CsvSink, EvalMetrics, MemorySink, MetricSink, ScalarRecord,
    TracingSink,
};
