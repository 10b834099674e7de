//! Domain models: trade events, traders, signals and our positions.

mod execution;
mod position;
mod signal;
mod trade;
mod trader;

pub use execution::ExecutionResult;
pub use position::{stop_price_for, CloseReason, OurPosition, PositionStatus};
pub use signal::{Decision, DeferredSignal, OrderStyle, Signal};
pub use trade::{Side, TradeAction, TradeEvent};
pub use trader::{LeaderboardEntry, SourcePosition, TrackedTrader};
