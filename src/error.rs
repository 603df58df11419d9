//! Typed errors raised at module boundaries. Call-site glue code still uses
//! `anyhow` (matches the teacher's style), but anything a caller might want
//! to match on — capacity limits, unknown markets, venue rejections — is a
//! concrete variant here instead of a string buried in an `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market {0} is unknown to the context store")]
    UnknownMarket(String),

    #[error("at capacity: {active}/{max} markets already active")]
    AtCapacity { active: usize, max: usize },

    /// A venue rejection classified as permanent (auth/market-level, not a
    /// transient timeout). The caller removes the market and refuses re-add
    /// for a cooldown window.
    #[error("venue rejected order: {0}")]
    VenueRejected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// One of the coordinator's own bookkeeping invariants was found
    /// violated against what the venue reports (e.g. a cancel target the
    /// venue no longer recognizes). The affected market is quarantined.
    #[error("invariant violated for market {market_id}: {detail}")]
    InvariantViolation { market_id: String, detail: String },

    /// The evaluator produced a signal this coordinator will not dispatch
    /// (e.g. negative size). Indicates a bug in the evaluator, not a venue
    /// or network condition; aborts just that market's tick.
    #[error("evaluator produced an invalid signal for market {market_id}: {detail}")]
    EvaluatorContractViolation { market_id: String, detail: String },
}
