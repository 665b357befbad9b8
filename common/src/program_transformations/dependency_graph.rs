use ahash::{HashMap, HashMapExt};
use datalog_syntax::{BodyLiteral, Program};
use petgraph::graphmap::DiGraphMap;
use petgraph::{algo, Directed};

/// A predicate dependency graph. An edge `p -> q` means some rule with head `p` uses `q` in its
/// body. The edge weight is `true` when that use is negative (negated literal, or `q` feeds an
/// aggregation) -- stratification is unsound if such an edge closes a cycle.
pub type PredicateGraph = DiGraphMap<usize, bool>;

pub struct PredicateIndex {
    pub name_to_index: HashMap<String, usize>,
    pub index_to_name: Vec<String>,
}

impl PredicateIndex {
    pub fn index_of(&mut self, predicate: &str) -> usize {
        if let Some(idx) = self.name_to_index.get(predicate) {
            return *idx;
        }
        let idx = self.index_to_name.len();
        self.index_to_name.push(predicate.to_string());
        self.name_to_index.insert(predicate.to_string(), idx);
        idx
    }
}

pub fn build_predicate_index(program: &Program) -> PredicateIndex {
    let mut index = PredicateIndex {
        name_to_index: HashMap::new(),
        index_to_name: Vec::new(),
    };

    for rule in &program.inner {
        index.index_of(&rule.head.predicate);
        for literal in &rule.body {
            match literal {
                BodyLiteral::Positive(atom) | BodyLiteral::Negated(atom) => {
                    index.index_of(&atom.predicate);
                }
                BodyLiteral::Comparison(_, _, _) | BodyLiteral::Assignment(_, _) => {}
            }
        }
    }

    index
}

/// Builds the predicate dependency graph for a program. `aggregated_predicates` names the
/// predicates that feed a `Transform` aggregation in a given rule (these count as negative
/// edges, per the stratification rule that aggregation sources must be strictly lower-stratum).
pub fn generate_predicate_dependency_graph(
    program: &Program,
    index: &mut PredicateIndex,
) -> PredicateGraph {
    let mut graph = DiGraphMap::new();

    for rule in &program.inner {
        let head_idx = index.index_of(&rule.head.predicate);
        graph.add_node(head_idx);

        for literal in &rule.body {
            match literal {
                BodyLiteral::Positive(atom) => {
                    let dep_idx = index.index_of(&atom.predicate);
                    graph.add_node(dep_idx);
                    if !graph.contains_edge(head_idx, dep_idx) {
                        graph.add_edge(head_idx, dep_idx, false);
                    }
                }
                BodyLiteral::Negated(atom) => {
                    let dep_idx = index.index_of(&atom.predicate);
                    graph.add_node(dep_idx);
                    graph.add_edge(head_idx, dep_idx, true);
                }
                BodyLiteral::Comparison(_, _, _) | BodyLiteral::Assignment(_, _) => {}
            }
        }

        if rule.transform.is_some() {
            // Every positively-joined body predicate is an aggregation source for this rule;
            // mark those edges negative so the source must settle in a strictly lower stratum.
            for atom in rule.positive_body_atoms() {
                let dep_idx = index.index_of(&atom.predicate);
                graph.add_edge(head_idx, dep_idx, true);
            }
        }
    }

    graph
}

/// Strongly connected components, in an order where a component with no outgoing edges to
/// another component comes first (suitable for direct use as a stratum order).
pub fn stratify(graph: &PredicateGraph) -> Vec<Vec<usize>> {
    let mut sccs = algo::kosaraju_scc(graph);
    sccs.reverse();
    sccs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstratifiableNegation {
    pub predicates: Vec<String>,
}

/// Checks every SCC for an internal negative edge. Returns the offending predicate names for
/// the first such SCC found.
pub fn check_stratifiable(
    graph: &PredicateGraph,
    sccs: &[Vec<usize>],
    index: &PredicateIndex,
) -> Result<(), UnstratifiableNegation> {
    for scc in sccs {
        if scc.len() == 1 {
            let node = scc[0];
            if graph.contains_edge(node, node) && *graph.edge_weight(node, node).unwrap() {
                return Err(UnstratifiableNegation {
                    predicates: vec![index.index_to_name[node].clone()],
                });
            }
            continue;
        }
        for &a in scc {
            for &b in scc {
                if let Some(is_negative) = graph.edge_weight(a, b) {
                    if *is_negative {
                        return Err(UnstratifiableNegation {
                            predicates: scc.iter().map(|i| index.index_to_name[*i].clone()).collect(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_syntax::{Atom, BodyLiteral, Rule, Term};

    fn positive(predicate: &str, vars: &[&str]) -> BodyLiteral {
        BodyLiteral::Positive(Atom::new(
            predicate,
            vars.iter().map(|v| Term::Variable(v.to_string())).collect(),
        ))
    }

    fn negated(predicate: &str, vars: &[&str]) -> BodyLiteral {
        BodyLiteral::Negated(Atom::new(
            predicate,
            vars.iter().map(|v| Term::Variable(v.to_string())).collect(),
        ))
    }

    #[test]
    fn acyclic_negation_is_stratifiable() {
        let program = Program::from(vec![
            Rule {
                head: Atom::new("admin", vec![Term::Variable("x".into())]),
                body: vec![],
                transform: None,
                id: 0,
            },
            Rule {
                head: Atom::new("regular", vec![Term::Variable("x".into())]),
                body: vec![positive("user", &["x"]), negated("admin", &["x"])],
                transform: None,
                id: 0,
            },
        ]);

        let mut index = build_predicate_index(&program);
        let graph = generate_predicate_dependency_graph(&program, &mut index);
        let sccs = stratify(&graph);
        assert!(check_stratifiable(&graph, &sccs, &index).is_ok());
    }

    #[test]
    fn negation_through_a_cycle_is_rejected() {
        let program = Program::from(vec![
            Rule {
                head: Atom::new("p", vec![Term::Variable("x".into())]),
                body: vec![negated("q", &["x"])],
                transform: None,
                id: 0,
            },
            Rule {
                head: Atom::new("q", vec![Term::Variable("x".into())]),
                body: vec![positive("p", &["x"])],
                transform: None,
                id: 0,
            },
        ]);

        let mut index = build_predicate_index(&program);
        let graph = generate_predicate_dependency_graph(&program, &mut index);
        let sccs = stratify(&graph);
        assert!(check_stratifiable(&graph, &sccs, &index).is_err());
    }

    #[test]
    fn recursive_positive_rules_stay_in_one_stratum() {
        let program = Program::from(vec![
            Rule {
                head: Atom::new("tc", vec![Term::Variable("x".into()), Term::Variable("y".into())]),
                body: vec![positive("e", &["x", "y"])],
                transform: None,
                id: 0,
            },
            Rule {
                head: Atom::new("tc", vec![Term::Variable("x".into()), Term::Variable("z".into())]),
                body: vec![positive("e", &["x", "y"]), positive("tc", &["y", "z"])],
                transform: None,
                id: 0,
            },
        ]);

        let mut index = build_predicate_index(&program);
        let graph = generate_predicate_dependency_graph(&program, &mut index);
        let sccs = stratify(&graph);
        assert!(check_stratifiable(&graph, &sccs, &index).is_ok());

        let tc_idx = index.name_to_index["tc"];
        let tc_scc = sccs.iter().find(|scc| scc.contains(&tc_idx)).unwrap();
        assert!(tc_scc.contains(&tc_idx));
    }
}
