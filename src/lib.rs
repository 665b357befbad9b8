//! Embeddable, typed, stratified Datalog reasoning engine with negation-as-failure,
//! aggregation, lazily-materialized (virtual) predicates, and a gas-limited semi-naive
//! evaluator running over copy-on-write per-stratum fact stores.

pub mod builtins;
pub mod config;
pub mod differential;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod query;
pub mod schema;
pub mod store;
pub mod stratify;
pub mod unify;
pub mod virtual_predicates;

pub use config::EngineConfig;
pub use engine::{DatalogEngine, EngineStats, SchemaUnit};
pub use error::{EngineError, EngineResult};
pub use query::{CancellationToken, Goal};
pub use schema::{SchemaRegistry, PROTECTED_HEADS};
pub use stratify::{analyze, AnalyzedProgram};
pub use virtual_predicates::{Loader, VirtualPredicateProxy};

pub use datalog_syntax::{
    AnonymousGroundAtom, ArgBound, Atom, BodyLiteral, Declaration, Fact, Program, Rule, Term,
    TypedValue,
};
