use std::time::Duration;

/// Scalar knobs for one `DatalogEngine`. A plain struct with `Default` is the idiomatic
/// minimum here -- there is no config layer to speak of, just four caps the host sets once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// 0 = unlimited. Caps total asserted + derived facts resident across every predicate.
    pub fact_limit: u32,
    /// 0 = unlimited. Gas for the semi-naive evaluator; see `src/evaluator`.
    pub derived_facts_limit: u32,
    /// Default query deadline when the caller passes `None`.
    pub query_timeout: Duration,
    /// Whether `add_fact`/`add_facts`/`replace_facts_for` trigger re-evaluation automatically.
    pub auto_eval: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fact_limit: 0,
            derived_facts_limit: 0,
            query_timeout: Duration::from_secs(5),
            auto_eval: true,
        }
    }
}
