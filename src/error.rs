use std::time::Duration;

/// Tagged engine errors. Every fallible operation in this crate returns one of these variants
/// rather than a string or an `anyhow::Error` -- the engine is a library, and library errors
/// are always typed here.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("no schema has been loaded yet")]
    SchemaMissing,

    #[error("predicate `{0}` is not declared")]
    UndeclaredPredicate(String),

    #[error("predicate `{predicate}` expects arity {expected}, got {got}")]
    ArityMismatch {
        predicate: String,
        expected: usize,
        got: usize,
    },

    #[error("predicate `{predicate}` argument {arg_index} expects kind `{expected_kind}`, got `{got_kind}`")]
    TypeMismatch {
        predicate: String,
        arg_index: usize,
        expected_kind: String,
        got_kind: String,
    },

    #[error("negation is not stratifiable across predicates {0:?}")]
    UnstratifiableNegation(Vec<String>),

    #[error("rule for `{rule_head}` uses unbound variable `{var_name}`")]
    UnsafeVariable { rule_head: String, var_name: String },

    #[error("predicate `{0}` is protected and cannot be redefined by a learned rule")]
    ProtectedHead(String),

    #[error("fact store limit exceeded")]
    FactLimitExceeded,

    #[error("derived-fact gas limit exhausted")]
    GasExhausted,

    #[error("virtual predicate `{predicate}` loader failed: {cause}")]
    VirtualLoadFailed { predicate: String, cause: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("builtin `{name}` type error: {details}")]
    BuiltinTypeError { name: String, details: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
