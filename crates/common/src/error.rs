//! Error type shared by the supernet, lookup table, strategies and agent.
//!
//! None of these errors is recovered internally: every one propagates to the
//! driving caller, which is expected to abort the run.

use thiserror::Error;

/// Workspace-wide `Result` alias.
pub type Result<T> = std::result::Result<T, NasError>;

#[derive(Debug, Error)]
pub enum NasError {
    /// Malformed architecture, unknown forward state, invalid config value.
    #[error("config error: {0}")]
    Config(String),

    /// An operation was invoked without the state its mode requires.
    #[error("state error: {0}")]
    State(String),

    /// The cost table has no entry for a referenced pair.
    #[error("lookup error: no `{metric}` cost for stage {stage}, choice {choice}")]
    Lookup {
        metric: String,
        stage: usize,
        choice: usize,
    },

    /// The cost table has no column for the metric at all.
    #[error("lookup error: table has no `{metric}` column")]
    MissingMetric { metric: String },

    /// No architecture satisfying the hardware budget could be produced.
    #[error("infeasible: no architecture with cost <= {target} after {attempts} draws{}", min_cost_suffix(.min_cost))]
    Infeasible {
        target: f64,
        attempts: usize,
        min_cost: Option<f64>,
    },

    #[error("non-finite loss {loss} at epoch {epoch}, step {step}")]
    NonFiniteLoss { loss: f64, epoch: usize, step: usize },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

fn min_cost_suffix(min_cost: &Option<f64>) -> String {
    match min_cost {
        Some(c) => format!(" (minimum achievable cost {c})"),
        None => String::new(),
    }
}

impl NasError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}
