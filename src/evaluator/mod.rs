pub mod spj;

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use datalog_syntax::{AnonymousGroundAtom, Atom, Rule, Term, TypedValue};

use crate::builtins;
use crate::error::EngineResult;
use crate::store::RelationStorage;
use crate::unify::Bindings;
use spj::AtomRows;

/// Caps total derived-fact insertions across one top-level `evaluate`/`apply_delta` call,
/// shared across every stratum it touches. A `limit` of zero means unlimited, matching
/// `EngineConfig::derived_facts_limit`'s convention.
pub struct Gas {
    remaining: Option<u32>,
}

impl Gas {
    pub fn new(limit: u32) -> Self {
        Gas {
            remaining: if limit == 0 { None } else { Some(limit) },
        }
    }

    /// Registers `n` new insertions. Returns `false` once the limit is reached; the caller
    /// keeps whatever was already inserted and stops deriving further.
    pub fn charge(&mut self, n: usize) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(r) => {
                *r = r.saturating_sub(n as u32);
                true
            }
        }
    }

    pub fn exhausted(&self) -> bool {
        matches!(self.remaining, Some(0))
    }
}

/// Groups an aggregation rule's pre-projection frontier by its `Transform`'s `group_by`
/// variables, computes each `lets` entry over the bound values in that group, and returns one
/// `Bindings` per non-empty group ready for head projection. An empty program never reaches
/// here with zero groups -- there's always at least the (possibly singleton) grouping of
/// whatever rows matched; a group_by value that never appears produces no group and therefore
/// no row, which is how `count` over a filter that matches nothing avoids an identity row.
pub fn aggregate_frontier(rule: &Rule, frontier: Vec<Bindings>) -> EngineResult<Vec<Bindings>> {
    let transform = match &rule.transform {
        Some(t) => t,
        None => return Ok(frontier),
    };

    let mut groups: HashMap<Vec<TypedValue>, (Bindings, Vec<Bindings>)> = HashMap::new();
    for bindings in frontier {
        let key: Option<Vec<TypedValue>> = transform
            .group_by
            .iter()
            .map(|var| bindings.get(var).cloned())
            .collect();
        let Some(key) = key else { continue };
        groups
            .entry(key)
            .or_insert_with(|| (bindings.clone(), Vec::new()))
            .1
            .push(bindings);
    }

    let mut results = Vec::with_capacity(groups.len());
    for (_, (mut group_bindings, rows)) in groups {
        for (target, op, source) in &transform.lets {
            let values: Vec<TypedValue> = rows.iter().filter_map(|b| b.resolve(source)).collect();
            if values.is_empty() {
                continue;
            }
            let value = builtins::aggregate(*op, &values)?;
            group_bindings.bind(target, value);
        }
        results.push(group_bindings);
    }
    Ok(results)
}

/// Facts for a single predicate, snapshotted at the start of a round: `total` is everything
/// settled before this round, `delta` is what the previous round added. Owned (not borrowed
/// from the store) so a round can run while the store it reads from is also being written to
/// for a different predicate.
#[derive(Default, Clone)]
pub struct PredicateDelta {
    pub total: Vec<Arc<AnonymousGroundAtom>>,
    pub delta: Vec<Arc<AnonymousGroundAtom>>,
}

/// Runs one predicate-recursive stratum to a fixpoint. `rules` are every rule whose head lands
/// in this stratum. `lower` resolves any body predicate that belongs to a strictly lower,
/// already-settled stratum (including virtual-predicate-backed EDB reads). `negation_holds`
/// probes a negated atom against whichever stratum it belongs to (always lower, by
/// construction of the stratifier). Returns once no rule derives a new fact, or gas runs out.
pub fn run_stratum(
    rules: &[&Rule],
    write: &mut RelationStorage,
    lower: &dyn Fn(&str) -> Vec<Arc<AnonymousGroundAtom>>,
    negation_holds_base: &dyn Fn(&Atom, &Bindings) -> bool,
    gas: &mut Gas,
) -> EngineResult<()> {
    use std::collections::HashSet;

    let stratum_predicates: HashSet<&str> = rules.iter().map(|r| r.head.predicate.as_str()).collect();
    for predicate in &stratum_predicates {
        write.ensure_relation(predicate);
    }

    // `working` tracks, per same-stratum predicate, everything derived so far this stratum
    // (`total`) and what the previous round added (`delta`); lower-stratum predicates never
    // change during this loop so they're read straight from `lower` each time. Anything already
    // present in `write` (kept across an incremental `apply_delta` that never cleared IDB
    // tables, or pre-seeded directly as in a bottom-half-only test) seeds round one's `delta` --
    // otherwise a rule with no non-recursive base case could never bootstrap past an empty
    // `working` entry.
    let mut working: HashMap<String, PredicateDelta> = stratum_predicates
        .iter()
        .map(|p| {
            let seed: Vec<Arc<AnonymousGroundAtom>> = write.iter(p).cloned().collect();
            (p.to_string(), PredicateDelta { total: Vec::new(), delta: seed })
        })
        .collect();

    loop {
        let mut round_new: HashMap<String, Vec<AnonymousGroundAtom>> = HashMap::new();

        for rule in rules {
            let positive_predicates: Vec<String> =
                rule.positive_body_atoms().map(|a| a.predicate.clone()).collect();

            let rows = |position: usize| -> AtomRows {
                let predicate = &positive_predicates[position];
                match working.get(predicate) {
                    Some(pd) => AtomRows {
                        total: &pd.total,
                        delta: &pd.delta,
                    },
                    None => AtomRows::delta_only(&[]),
                }
            };
            // Lower-stratum atoms have no entry in `working`; fetch + stash them for the
            // duration of this rule's evaluation so `rows` above can borrow a slice.
            let lower_snapshots: Vec<(usize, Vec<Arc<AnonymousGroundAtom>>)> = positive_predicates
                .iter()
                .enumerate()
                .filter(|(_, p)| !stratum_predicates.contains(p.as_str()))
                .map(|(i, p)| (i, lower(p)))
                .collect();
            let rows = |position: usize| -> AtomRows {
                if let Some((_, snap)) = lower_snapshots.iter().find(|(i, _)| *i == position) {
                    return AtomRows::settled(snap);
                }
                rows(position)
            };
            let is_recursive = |position: usize| {
                stratum_predicates.contains(positive_predicates[position].as_str())
            };
            let negation_holds = |atom: &Atom, bindings: &Bindings| negation_holds_base(atom, bindings);

            let frontier = spj::evaluate_frontier(rule, &rows, &is_recursive, &negation_holds)?;
            let frontier = aggregate_frontier(rule, frontier)?;
            let derived: Vec<AnonymousGroundAtom> = frontier
                .iter()
                .filter_map(|b| spj::project_head(&rule.head, b))
                .collect();

            round_new.entry(rule.head.predicate.clone()).or_default().extend(derived);
        }

        let mut any_new = false;
        for (predicate, facts) in round_new {
            let mut fresh = Vec::new();
            for fact in facts {
                if write.insert(&predicate, fact.clone())? {
                    fresh.push(Arc::new(fact));
                }
            }
            if fresh.is_empty() {
                continue;
            }
            if !gas.charge(fresh.len()) {
                tracing::warn!(predicate = %predicate, "derived-fact gas limit reached mid-stratum");
                return Err(crate::error::EngineError::GasExhausted);
            }
            any_new = true;
            let entry = working.entry(predicate).or_default();
            entry.total.extend(entry.delta.drain(..));
            entry.delta = fresh;
        }

        if !any_new {
            for entry in working.values_mut() {
                entry.total.extend(entry.delta.drain(..));
            }
            break;
        }
    }

    Ok(())
}

pub fn atom_variables(atom: &Atom) -> Vec<&str> {
    atom.terms
        .iter()
        .filter_map(|t| match t {
            Term::Variable(v) => Some(v.as_str()),
            Term::Constant(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_rule_macro::program;

    #[test]
    fn linear_transitive_closure_reaches_fixpoint() {
        let prog = program! {
            tc(?x, ?z) <- [e(?x, ?y), tc(?y, ?z)],
        };
        let rules: Vec<&Rule> = prog.inner.iter().collect();

        let mut store = RelationStorage::default();
        let e: Vec<Arc<AnonymousGroundAtom>> = [("a", "b"), ("b", "c"), ("c", "d")]
            .iter()
            .map(|(a, b)| Arc::new(vec![TypedValue::from(*a), TypedValue::from(*b)]))
            .collect();
        store.insert("tc", vec![TypedValue::from("a"), TypedValue::from("b")]).unwrap();
        store.insert("tc", vec![TypedValue::from("b"), TypedValue::from("c")]).unwrap();
        store.insert("tc", vec![TypedValue::from("c"), TypedValue::from("d")]).unwrap();

        let lower = move |predicate: &str| -> Vec<Arc<AnonymousGroundAtom>> {
            if predicate == "e" {
                e.clone()
            } else {
                Vec::new()
            }
        };
        let no_negation = |_: &Atom, _: &Bindings| false;
        let mut gas = Gas::new(0);

        run_stratum(&rules, &mut store, &lower, &no_negation, &mut gas).unwrap();

        assert!(store.contains("tc", &vec![TypedValue::from("a"), TypedValue::from("d")]));
    }

    #[test]
    fn gas_limit_stops_further_derivation() {
        let prog = program! {
            tc(?x, ?z) <- [e(?x, ?y), tc(?y, ?z)],
        };
        let rules: Vec<&Rule> = prog.inner.iter().collect();
        let mut store = RelationStorage::default();

        let e: Vec<Arc<AnonymousGroundAtom>> = (0..10)
            .map(|i| Arc::new(vec![TypedValue::from(i as i64), TypedValue::from((i + 1) as i64)]))
            .collect();
        // Seeded at the chain's far end so each round's join (`e(x, y), tc(y, z)`) can only
        // extend backward one hop at a time -- this needs several rounds to reach node 0,
        // unlike seeding the near end, which this rule's right-recursion could never extend.
        store.insert("tc", vec![TypedValue::from(9i64), TypedValue::from(10i64)]).unwrap();

        let lower = move |predicate: &str| -> Vec<Arc<AnonymousGroundAtom>> {
            if predicate == "e" {
                e.clone()
            } else {
                Vec::new()
            }
        };
        let no_negation = |_: &Atom, _: &Bindings| false;
        let mut gas = Gas::new(1);

        let result = run_stratum(&rules, &mut store, &lower, &no_negation, &mut gas);
        assert!(matches!(result, Err(crate::error::EngineError::GasExhausted)));
    }
}
