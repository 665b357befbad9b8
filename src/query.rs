use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use datalog_syntax::{AnonymousGroundAtom, Matcher, Mode, Query, Term, TypedValue};

use crate::error::{EngineError, EngineResult};
use crate::store::RelationStorage;

/// A small `Arc<AtomicBool>` flag, checked periodically during a query so a caller on another
/// thread can abort a long-running evaluation. No dedicated crate for this: a boolean flag is
/// the idiomatic minimal primitive, the same way performance-sensitive code elsewhere in the
/// pack reaches for `Arc`/`parking_lot` directly rather than a cancellation-token crate.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A goal atom as written by a caller, with `None` standing in for an unbound output variable
/// by name so results can be reported as a named binding map.
pub struct Goal<'a> {
    pub predicate: &'a str,
    pub terms: &'a [Term],
}

impl<'a> Goal<'a> {
    fn to_query(&self) -> Query<'a> {
        let matchers = self
            .terms
            .iter()
            .map(|term| match term {
                Term::Constant(value) => Matcher::Constant(value.clone()),
                Term::Variable(_) => Matcher::Any,
            })
            .collect();
        Query::new(self.predicate, matchers)
    }
}

/// Checks every `step_interval`-th emitted binding for cancellation/timeout; returns the bound
/// variables for each matching fact.
///
/// `modes`, when the predicate declares them, excludes `Mode::In` positions from the returned
/// binding map: an input position is supplied by the caller, not extracted from the store, so
/// it's bookkeeping rather than a result. A predicate with no declared modes (`None`) keeps the
/// old behavior of reporting every bound variable.
pub fn run_query(
    goal: &Goal,
    facts: impl Iterator<Item = Arc<AnonymousGroundAtom>>,
    modes: Option<&[Mode]>,
    token: &CancellationToken,
    deadline: Instant,
) -> EngineResult<Vec<HashMap<String, TypedValue>>> {
    let query = goal.to_query();
    let mut results = Vec::new();
    for (checked, fact) in facts.enumerate() {
        if checked % 64 == 0 {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(deadline.saturating_duration_since(Instant::now())));
            }
        }
        if !datalog_syntax::pattern_match(&query, &fact) {
            continue;
        }
        let mut bindings = HashMap::new();
        for (position, (term, value)) in goal.terms.iter().zip(fact.iter()).enumerate() {
            if let Term::Variable(name) = term {
                if datalog_syntax::is_anonymous(name) {
                    continue;
                }
                let is_input = matches!(modes.and_then(|m| m.get(position)), Some(Mode::In));
                if is_input {
                    continue;
                }
                bindings.insert(name.clone(), value.clone());
            }
        }
        results.push(bindings);
    }
    Ok(results)
}

pub fn deadline_from(timeout: Option<Duration>, default_timeout: Duration) -> Instant {
    Instant::now() + timeout.unwrap_or(default_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_extracts_bound_variables() {
        let mut store = RelationStorage::default();
        store.insert("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();

        let goal = Goal {
            predicate: "edge",
            terms: &[Term::Constant(TypedValue::from("a")), Term::Variable("y".into())],
        };
        let token = CancellationToken::new();
        let deadline = deadline_from(None, Duration::from_secs(1));
        let facts: Vec<_> = store.iter("edge").cloned().collect();
        let results = run_query(&goal, facts.into_iter(), None, &token, deadline).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("y"), Some(&TypedValue::from("b")));
    }

    #[test]
    fn in_mode_position_is_excluded_from_returned_bindings() {
        let mut store = RelationStorage::default();
        store.insert("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();

        let goal = Goal {
            predicate: "edge",
            terms: &[Term::Variable("x".into()), Term::Variable("y".into())],
        };
        let token = CancellationToken::new();
        let deadline = deadline_from(None, Duration::from_secs(1));
        let facts: Vec<_> = store.iter("edge").cloned().collect();
        let modes = [Mode::In, Mode::Out];
        let results = run_query(&goal, facts.into_iter(), Some(&modes), &token, deadline).unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].get("x").is_none());
        assert_eq!(results[0].get("y"), Some(&TypedValue::from("b")));
    }

    #[test]
    fn cancelled_token_aborts_query() {
        let mut store = RelationStorage::default();
        for i in 0..200 {
            store.insert("edge", vec![TypedValue::from(i as i64), TypedValue::from(i as i64)]).unwrap();
        }
        let goal = Goal {
            predicate: "edge",
            terms: &[Term::Variable("x".into()), Term::Variable("y".into())],
        };
        let token = CancellationToken::new();
        token.cancel();
        let deadline = deadline_from(None, Duration::from_secs(1));
        let facts: Vec<_> = store.iter("edge").cloned().collect();
        let result = run_query(&goal, facts.into_iter(), None, &token, deadline);
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
