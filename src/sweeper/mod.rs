pub mod builder;
pub mod chain;
pub mod error;
pub mod executor;
pub mod quotes;
pub mod types;

pub use builder::{PreparedSwap, SwapBuilder};
pub use chain::{ChainSink, RpcChainSink};
pub use error::SweepError;
pub use executor::{PipelineGateway, SweepExecutor};
pub use quotes::{QuoteService, collect_quotes, user_facing_reason};
pub use types::{QuotedToken, SwapOutcome, SweepEvent, SweepPhase, TokenBalance, lamports_to_sol};
