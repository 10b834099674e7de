//! Trading logic: trader selection, signal evaluation, sizing, execution
//! and position monitoring.

mod config;
mod deferred;
mod evaluator;
mod executor;
mod monitor;
mod pipeline;
mod position_sizer;
mod scoring;

pub use config::{ProfitTier, TradingConfig};
pub use deferred::DeferredQueue;
pub use evaluator::{ConsensusTracker, Evaluation, PortfolioSnapshot, SignalEvaluator};
pub use executor::{ExecutionError, ExecutionMode, Executor};
pub use monitor::{CycleReport, MonitorAction, PositionMonitor};
pub use pipeline::{CopyPipeline, PollReport};
pub use position_sizer::{PositionSizer, SizingMethod};
pub use scoring::{Rejection, TraderBook, TraderScorer};
