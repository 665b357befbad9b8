use datalog_syntax::{AnonymousGroundAtom, Atom, BodyLiteral, Rule, Term, TypedValue};
use std::sync::Arc;

use crate::builtins;
use crate::error::{EngineError, EngineResult};
use crate::unify::Bindings;

/// One body atom's available rows for this round: `total` is everything derived before this
/// round started, `delta` is what was newly derived last round. Semi-naive evaluation unions,
/// over every choice of body atom, the plan where that atom contributes `delta` and every atom
/// to its *left* contributes `total` -- the generalization of the teacher's
/// `left x right_delta` / `left_delta x right` / `left_delta x right_delta` split to an
/// arbitrary-arity join.
pub struct AtomRows<'a> {
    pub total: &'a [Arc<AnonymousGroundAtom>],
    pub delta: &'a [Arc<AnonymousGroundAtom>],
}

impl<'a> AtomRows<'a> {
    /// Everything derived so far, with nothing new this round (contributes no derivations
    /// unless another atom in the same rule supplies the delta).
    pub fn settled(total: &'a [Arc<AnonymousGroundAtom>]) -> Self {
        AtomRows { total, delta: &[] }
    }

    /// The whole relation is "new" -- used for a one-shot, non-incremental pass (e.g. the first
    /// round of a stratum, where there is no prior total to speak of).
    pub fn delta_only(delta: &'a [Arc<AnonymousGroundAtom>]) -> Self {
        AtomRows { total: &[], delta }
    }
}

fn unify_atom_with_fact(atom: &Atom, fact: &AnonymousGroundAtom, bindings: &Bindings) -> Option<Bindings> {
    if atom.terms.len() != fact.len() {
        return None;
    }
    let mut next = bindings.clone();
    for (term, value) in atom.terms.iter().zip(fact.iter()) {
        match term {
            Term::Constant(expected) => {
                if expected != value {
                    return None;
                }
            }
            Term::Variable(name) => {
                if !next.bind(name, value.clone()) {
                    return None;
                }
            }
        }
    }
    Some(next)
}

/// The teacher's SPJ compiler turns positive atoms into a chain of `Select`/`Join` instructions
/// keyed by column position; this generalizes that natural-join fast path to named variables so
/// it composes with negation, comparisons, and assignments in the same body without a second
/// substitution scheme. Positive atoms still only ever compare by shared variable equality --
/// the join itself never inspects builtins.
fn join_positive_atoms(
    atoms: &[(&Atom, usize)],
    rows: &dyn Fn(usize) -> AtomRows,
    delta_at: Option<usize>,
) -> Vec<Bindings> {
    let mut frontier = vec![Bindings::default()];
    for &(atom, position) in atoms {
        let atom_rows = rows(position);
        let use_delta = delta_at.map(|d| d == position).unwrap_or(false);
        let slice: &[Arc<AnonymousGroundAtom>] = if use_delta { atom_rows.delta } else { atom_rows.total };

        let mut next_frontier = Vec::new();
        for bindings in &frontier {
            for fact in slice {
                if let Some(extended) = unify_atom_with_fact(atom, fact, bindings) {
                    next_frontier.push(extended);
                }
            }
        }
        frontier = next_frontier;
        if frontier.is_empty() {
            break;
        }
    }
    frontier
}

fn eval_builtin(name: &str, args: &[TypedValue]) -> EngineResult<TypedValue> {
    match (name, args) {
        ("plus", [a, b]) => builtins::plus(a, b),
        ("minus", [a, b]) => builtins::minus(a, b),
        ("mult", [a, b]) => builtins::mult(a, b),
        ("div", [a, b]) => builtins::div(a, b),
        ("mod", [a, b]) => builtins::modulo(a, b),
        ("negate", [a]) => builtins::negate(a),
        ("concat", [a, b]) => builtins::concat(a, b),
        ("contains", [a, b]) => builtins::contains(a, b),
        ("matches", [a, b]) => builtins::matches(a, b),
        _ => Err(EngineError::BuiltinTypeError {
            name: name.to_string(),
            details: format!("no builtin `{name}` with {} argument(s)", args.len()),
        }),
    }
}

/// Applies every non-join body literal (negation, comparisons, assignments) to a join frontier,
/// in body order, against a negation-probe callback for checking whether a negated atom holds.
pub fn apply_filters<'a>(
    body: &[BodyLiteral],
    frontier: Vec<Bindings>,
    negation_holds: &dyn Fn(&Atom, &Bindings) -> bool,
) -> EngineResult<Vec<Bindings>> {
    let mut current = frontier;
    for literal in body {
        match literal {
            BodyLiteral::Positive(_) => {}
            BodyLiteral::Negated(atom) => {
                current.retain(|bindings| !negation_holds(atom, bindings));
            }
            BodyLiteral::Comparison(op, lhs, rhs) => {
                let mut survivors = Vec::with_capacity(current.len());
                for bindings in current {
                    let (Some(l), Some(r)) = (bindings.resolve(lhs), bindings.resolve(rhs)) else {
                        continue;
                    };
                    if builtins::compare(*op, &l, &r)? {
                        survivors.push(bindings);
                    }
                }
                current = survivors;
            }
            BodyLiteral::Assignment(target, call) => {
                let mut survivors = Vec::with_capacity(current.len());
                for mut bindings in current {
                    let args: Option<Vec<TypedValue>> =
                        call.args.iter().map(|t| bindings.resolve(t)).collect();
                    let Some(args) = args else { continue };
                    let value = eval_builtin(&call.name, &args)?;
                    if bindings.bind(target, value) {
                        survivors.push(bindings);
                    }
                }
                current = survivors;
            }
        }
        if current.is_empty() {
            break;
        }
    }
    Ok(current)
}

pub fn project_head(head: &Atom, bindings: &Bindings) -> Option<AnonymousGroundAtom> {
    head.terms
        .iter()
        .map(|term| bindings.resolve(term))
        .collect()
}

/// Runs one rule for one semi-naive round. `rows` fetches `(total, delta)` for a positive body
/// atom by its index among the rule's positive atoms; `is_recursive` marks which of those
/// positions belong to the stratum currently being fixpointed (only those positions are ever
/// selected as the round's delta contributor -- atoms from a strictly lower, already-settled
/// stratum always join against their full `total` set, exactly as the teacher's nonrecursive
/// pass treats EDB atoms). `negation_holds` probes whether a negated atom is satisfied against
/// the accumulated total (never the delta -- negation reads the read-view, never this round's
/// in-flight derivations).
pub fn evaluate_frontier(
    rule: &Rule,
    rows: &dyn Fn(usize) -> AtomRows,
    is_recursive: &dyn Fn(usize) -> bool,
    negation_holds: &dyn Fn(&Atom, &Bindings) -> bool,
) -> EngineResult<Vec<Bindings>> {
    let positive: Vec<(&Atom, usize)> = rule
        .positive_body_atoms()
        .enumerate()
        .map(|(i, atom)| (atom, i))
        .collect();

    if positive.is_empty() {
        // Rules with only negated/comparison literals still need exactly one evaluation pass.
        return apply_filters(&rule.body, vec![Bindings::default()], negation_holds);
    }

    let recursive_positions: Vec<usize> = positive
        .iter()
        .map(|&(_, position)| position)
        .filter(|&position| is_recursive(position))
        .collect();

    if recursive_positions.is_empty() {
        // A purely nonrecursive rule body: a single full join, not a semi-naive union.
        let frontier = join_positive_atoms(&positive, rows, None);
        return apply_filters(&rule.body, frontier, negation_holds);
    }

    // Union over every choice of which recursive atom supplies this round's delta.
    let mut frontier = Vec::new();
    for delta_at in recursive_positions {
        let joined = join_positive_atoms(&positive, rows, Some(delta_at));
        frontier.extend(apply_filters(&rule.body, joined, negation_holds)?);
    }
    Ok(frontier)
}

/// Runs one rule for one semi-naive round, projecting straight to head facts. `rows` fetches
/// `(total, delta)` for a positive body atom by its index among the rule's positive atoms;
/// `is_recursive` marks which of those positions belong to the stratum currently being
/// fixpointed (only those positions are ever selected as the round's delta contributor -- atoms
/// from a strictly lower, already-settled stratum always join against their full `total` set,
/// exactly as the teacher's nonrecursive pass treats EDB atoms). `negation_holds` probes whether
/// a negated atom is satisfied against the accumulated total (never the delta -- negation reads
/// the read-view, never this round's in-flight derivations).
///
/// Rules carrying a `Transform` (aggregation) are not projected here -- the caller groups the
/// frontier from `evaluate_frontier` first. See `evaluator::aggregate_frontier`.
pub fn evaluate_round(
    rule: &Rule,
    rows: &dyn Fn(usize) -> AtomRows,
    is_recursive: &dyn Fn(usize) -> bool,
    negation_holds: &dyn Fn(&Atom, &Bindings) -> bool,
) -> EngineResult<Vec<AnonymousGroundAtom>> {
    let frontier = evaluate_frontier(rule, rows, is_recursive, negation_holds)?;
    Ok(frontier
        .iter()
        .filter_map(|bindings| project_head(&rule.head, bindings))
        .collect())
}
