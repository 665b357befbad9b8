use std::sync::Arc;
use std::time::{Instant, SystemTime};

use ahash::{HashMap, HashMapExt};
use datalog_syntax::{AnonymousGroundAtom, Declaration, Fact, Rule, Term, TypedValue};
use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::differential::DifferentialEngine;
use crate::error::{EngineError, EngineResult};
use crate::query::{self, CancellationToken, Goal};
use crate::schema::SchemaRegistry;
use crate::store::{check_bounds, coerce_for_bound};
use crate::stratify::{self, AnalyzedProgram};
use crate::virtual_predicates::Loader;

/// A schema/program update, as produced by whatever textual-grammar collaborator parses the
/// surface syntax (§6.1) -- the core never parses text itself, only this abstract form.
#[derive(Debug, Clone, Default)]
pub struct SchemaUnit {
    pub declarations: Vec<Declaration>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub total_facts: usize,
    pub per_predicate: HashMap<String, usize>,
    pub last_update: SystemTime,
}

struct ReadyState {
    schema: SchemaRegistry,
    analyzed: Arc<AnalyzedProgram>,
    differential: DifferentialEngine,
    auto_eval: bool,
    last_update: SystemTime,
}

enum EngineState {
    Uninitialized,
    Ready(ReadyState),
}

/// Generalizes the teacher's `MicroRuntime` facade into the full stratified, negation-aware,
/// gas-limited engine. One `parking_lot::RwLock` guards the schema, stratification plan, and
/// per-stratum stores together. `get_stats` and `snapshot` take a read lock; `load_schema`,
/// `add_fact`, evaluation, `query`, and `get_facts` take a write lock -- the latter two because
/// reading a predicate may first have to invoke a virtual predicate's loader, which inserts
/// facts into the store (see `DifferentialEngine::facts_for`).
pub struct DatalogEngine {
    state: RwLock<EngineState>,
    config: EngineConfig,
}

impl DatalogEngine {
    pub fn new(config: EngineConfig) -> Self {
        DatalogEngine {
            state: RwLock::new(EngineState::Uninitialized),
            config,
        }
    }

    fn with_ready<T>(&self, f: impl FnOnce(&ReadyState) -> EngineResult<T>) -> EngineResult<T> {
        let state = self.state.read();
        match &*state {
            EngineState::Uninitialized => Err(EngineError::SchemaMissing),
            EngineState::Ready(ready) => f(ready),
        }
    }

    fn with_ready_mut<T>(&self, f: impl FnOnce(&mut ReadyState) -> EngineResult<T>) -> EngineResult<T> {
        let mut state = self.state.write();
        match &mut *state {
            EngineState::Uninitialized => Err(EngineError::SchemaMissing),
            EngineState::Ready(ready) => f(ready),
        }
    }

    /// Builds a candidate schema + stratification from `unit` against a clone of whatever is
    /// currently loaded, so a rejection (`UnstratifiableNegation`/`UnsafeVariable`) never
    /// disturbs the engine already in place -- the whole load is atomic.
    pub fn load_schema(&self, unit: SchemaUnit) -> EngineResult<()> {
        let mut state = self.state.write();

        let (mut schema, mut rules) = match &*state {
            EngineState::Uninitialized => (SchemaRegistry::default(), Vec::new()),
            EngineState::Ready(ready) => (
                ready.schema.clone(),
                ready.analyzed.rules_by_head.values().flatten().cloned().collect::<Vec<_>>(),
            ),
        };

        for decl in &unit.declarations {
            schema.register(decl.clone())?;
        }
        for rule in &unit.rules {
            schema.validate_rule(rule)?;
        }
        rules.extend(unit.rules.clone());
        let program = datalog_syntax::Program::from(rules);
        let analyzed = Arc::new(stratify::analyze(&program)?);

        let mut differential = DifferentialEngine::new(analyzed.clone(), self.config.fact_limit);
        // Re-derive everything fresh for the merged, re-stratified program -- a schema change
        // invalidates any prior derivation, same as the teacher's `MicroRuntime::new` rebuild.
        if let EngineState::Ready(ready) = &*state {
            for layer in ready.differential.snapshot() {
                for predicate in layer.list_predicates() {
                    // EDB facts only -- IDB tables get rebuilt by `recompute_all` below.
                    if analyzed.rules_by_head.get(predicate).map(|r| r.is_empty()).unwrap_or(true) {
                        for fact in layer.iter(predicate) {
                            differential.apply_delta(
                                vec![Fact::new(predicate.to_string(), fact.as_ref().clone())],
                                false,
                                0,
                            )?;
                        }
                    }
                }
            }
        }
        differential.recompute_all(self.config.derived_facts_limit)?;

        *state = EngineState::Ready(ReadyState {
            schema,
            analyzed,
            differential,
            auto_eval: self.config.auto_eval,
            last_update: SystemTime::now(),
        });
        Ok(())
    }

    fn prepare_args(decl: &Declaration, args: Vec<TypedValue>) -> EngineResult<Vec<TypedValue>> {
        let coerced: Vec<TypedValue> = args
            .into_iter()
            .zip(decl.bounds.iter())
            .map(|(value, bound)| coerce_for_bound(value, bound))
            .collect();
        check_bounds(&decl.predicate, &coerced, decl)?;
        Ok(coerced)
    }

    pub fn add_fact(&self, predicate: &str, args: Vec<TypedValue>) -> EngineResult<()> {
        self.add_facts(vec![Fact::new(predicate.to_string(), args)])
    }

    /// Non-atomic: the first error is returned but earlier facts in `facts` remain inserted.
    pub fn add_facts(&self, facts: Vec<Fact>) -> EngineResult<()> {
        self.with_ready_mut(|ready| {
            let mut prepared = Vec::with_capacity(facts.len());
            for fact in facts {
                let decl = ready
                    .schema
                    .get(&fact.predicate)
                    .ok_or_else(|| EngineError::UndeclaredPredicate(fact.predicate.clone()))?
                    .clone();
                let args = Self::prepare_args(&decl, fact.args)?;
                prepared.push(Fact::new(fact.predicate, args));
            }
            ready
                .differential
                .apply_delta(prepared, ready.auto_eval, self.config.derived_facts_limit)?;
            ready.last_update = SystemTime::now();
            Ok(())
        })
    }

    pub fn replace_facts_for(&self, path: &str, facts: Vec<Fact>) -> EngineResult<()> {
        self.with_ready_mut(|ready| {
            ready
                .differential
                .remove_facts_for_file(path, ready.auto_eval, self.config.derived_facts_limit)?;

            let mut prepared = Vec::with_capacity(facts.len());
            for fact in facts {
                let decl = ready
                    .schema
                    .get(&fact.predicate)
                    .ok_or_else(|| EngineError::UndeclaredPredicate(fact.predicate.clone()))?
                    .clone();
                let args = Self::prepare_args(&decl, fact.args)?;
                prepared.push(Fact::new(fact.predicate, args));
            }
            ready
                .differential
                .apply_delta(prepared, ready.auto_eval, self.config.derived_facts_limit)?;
            ready.last_update = SystemTime::now();
            Ok(())
        })
    }

    /// Takes the write lock, not the read lock: a query may have to invoke a virtual
    /// predicate's loader on first touch, which inserts facts into the store. See
    /// `DifferentialEngine::facts_for`.
    pub fn query(
        &self,
        goal_predicate: &str,
        goal_terms: Vec<Term>,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> EngineResult<Vec<HashMap<String, TypedValue>>> {
        self.with_ready_mut(|ready| {
            let decl = ready
                .schema
                .get(goal_predicate)
                .ok_or_else(|| EngineError::UndeclaredPredicate(goal_predicate.to_string()))?
                .clone();
            let deadline = deadline.unwrap_or_else(|| query::deadline_from(None, self.config.query_timeout));
            let bound: Vec<Option<TypedValue>> = goal_terms
                .iter()
                .map(|term| match term {
                    Term::Constant(value) => Some(value.clone()),
                    Term::Variable(_) => None,
                })
                .collect();
            let facts = ready.differential.facts_for(goal_predicate, &bound)?;
            let goal = Goal { predicate: goal_predicate, terms: &goal_terms };
            query::run_query(&goal, facts.into_iter(), decl.modes.as_deref(), token, deadline)
        })
    }

    /// Takes the write lock for the same reason `query` does -- see `DifferentialEngine::facts_for`.
    pub fn get_facts(&self, predicate: &str) -> EngineResult<Vec<AnonymousGroundAtom>> {
        self.with_ready_mut(|ready| {
            let arity = ready
                .schema
                .get(predicate)
                .ok_or_else(|| EngineError::UndeclaredPredicate(predicate.to_string()))?
                .arity();
            let bound = vec![None; arity];
            let facts = ready.differential.facts_for(predicate, &bound)?;
            Ok(facts.iter().map(|f| f.as_ref().clone()).collect())
        })
    }

    pub fn get_stats(&self) -> EngineResult<EngineStats> {
        self.with_ready(|ready| {
            let per_predicate = ready.differential.predicate_counts();
            let total_facts = per_predicate.values().sum();
            Ok(EngineStats {
                total_facts,
                per_predicate,
                last_update: ready.last_update,
            })
        })
    }

    pub fn clear(&self) -> EngineResult<()> {
        self.with_ready_mut(|ready| {
            ready.differential.clear();
            ready.last_update = SystemTime::now();
            Ok(())
        })
    }

    pub fn reset(&self) {
        *self.state.write() = EngineState::Uninitialized;
    }

    pub fn close(&self) {
        self.reset();
    }

    pub fn toggle_auto_eval(&self, enabled: bool) -> EngineResult<()> {
        self.with_ready_mut(|ready| {
            ready.auto_eval = enabled;
            Ok(())
        })
    }

    pub fn recompute_rules(&self) -> EngineResult<()> {
        self.with_ready_mut(|ready| {
            ready.differential.recompute_all(self.config.derived_facts_limit)
        })
    }

    pub fn register_virtual_predicate(&self, predicate: impl Into<String>, loader: Loader) -> EngineResult<()> {
        self.with_ready_mut(|ready| {
            ready.differential.virtual_predicates_mut().register(predicate, loader);
            Ok(())
        })
    }

    /// Deep-clones the per-stratum stores (cheap: `Arc`-pointer clone, not fact data) and shares
    /// the immutable analyzed program. Writes to the snapshot never touch this engine's state
    /// or vice versa -- a read lock suffices, since this never replays facts through the
    /// evaluator (and so can't spuriously exhaust the derived-fact gas budget just from
    /// copying already-settled tables).
    pub fn snapshot(&self) -> EngineResult<DatalogEngine> {
        self.with_ready(|ready| {
            Ok(DatalogEngine {
                state: RwLock::new(EngineState::Ready(ReadyState {
                    schema: ready.schema.clone(),
                    analyzed: ready.analyzed.clone(),
                    differential: ready.differential.snapshot_engine(),
                    auto_eval: ready.auto_eval,
                    last_update: ready.last_update,
                })),
                config: self.config.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_syntax::{ArgBound, Mode};

    fn edge_schema() -> SchemaUnit {
        SchemaUnit {
            declarations: vec![Declaration {
                predicate: "edge".to_string(),
                bounds: vec![ArgBound::Str, ArgBound::Str],
                modes: None,
            }],
            rules: vec![],
        }
    }

    #[test]
    fn operations_fail_before_schema_loaded() {
        let engine = DatalogEngine::new(EngineConfig::default());
        let err = engine.add_fact("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap_err();
        assert_eq!(err, EngineError::SchemaMissing);
    }

    #[test]
    fn add_fact_then_query_round_trips() {
        let engine = DatalogEngine::new(EngineConfig::default());
        engine.load_schema(edge_schema()).unwrap();
        engine.add_fact("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();

        let token = CancellationToken::new();
        let results = engine
            .query("edge", vec![Term::Constant(TypedValue::from("a")), Term::Variable("y".into())], &token, None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("y"), Some(&TypedValue::from("b")));
    }

    #[test]
    fn reset_requires_schema_reload() {
        let engine = DatalogEngine::new(EngineConfig::default());
        engine.load_schema(edge_schema()).unwrap();
        engine.reset();
        let err = engine.add_fact("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap_err();
        assert_eq!(err, EngineError::SchemaMissing);
    }

    #[test]
    fn duplicate_insert_does_not_grow_stats() {
        let engine = DatalogEngine::new(EngineConfig::default());
        engine.load_schema(edge_schema()).unwrap();
        engine.add_fact("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();
        engine.add_fact("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();
        assert_eq!(engine.get_stats().unwrap().total_facts, 1);
    }

    #[test]
    fn in_mode_positions_are_excluded_from_returned_bindings() {
        let engine = DatalogEngine::new(EngineConfig::default());
        engine
            .load_schema(SchemaUnit {
                declarations: vec![Declaration {
                    predicate: "assoc".to_string(),
                    bounds: vec![ArgBound::Str, ArgBound::Str],
                    modes: Some(vec![Mode::In, Mode::Out]),
                }],
                rules: vec![],
            })
            .unwrap();
        engine.add_fact("assoc", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();

        let token = CancellationToken::new();
        let results = engine
            .query(
                "assoc",
                vec![Term::Variable("x".into()), Term::Variable("y".into())],
                &token,
                None,
            )
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].get("x").is_none(), "In-mode position must not appear in bindings");
        assert_eq!(results[0].get("y"), Some(&TypedValue::from("b")));
    }

    #[test]
    fn snapshot_is_isolated_from_further_mutation() {
        let engine = DatalogEngine::new(EngineConfig::default());
        engine.load_schema(edge_schema()).unwrap();
        engine.add_fact("edge", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();

        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.get_facts("edge").unwrap().len(), 1);

        engine.add_fact("edge", vec![TypedValue::from("b"), TypedValue::from("c")]).unwrap();
        engine
            .add_fact("edge", vec![TypedValue::from("c"), TypedValue::from("d")])
            .unwrap();

        assert_eq!(engine.get_facts("edge").unwrap().len(), 3);
        assert_eq!(
            snapshot.get_facts("edge").unwrap().len(),
            1,
            "mutating the original after snapshot must not affect the snapshot's facts"
        );
    }
}
