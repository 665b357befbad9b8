use ahash::{HashMap, HashMapExt};
use common::program_transformations::dependency_graph::{
    build_predicate_index, check_stratifiable, generate_predicate_dependency_graph, stratify,
    PredicateIndex,
};
use datalog_syntax::{Program, Rule};
use petgraph::algo::{condensation, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::error::{EngineError, EngineResult};

/// The analyzed program: every predicate's stratum, and the rules that derive it. Rebuilt in
/// full on every schema change and shared read-only afterwards.
pub struct AnalyzedProgram {
    pub strata: HashMap<String, usize>,
    pub rules_by_head: HashMap<String, Vec<Rule>>,
    pub stratum_count: usize,
}

impl AnalyzedProgram {
    pub fn stratum_of(&self, predicate: &str) -> usize {
        self.strata.get(predicate).copied().unwrap_or(0)
    }

    pub fn rules_for_stratum(&self, stratum: usize) -> Vec<&Rule> {
        self.rules_by_head
            .values()
            .flatten()
            .filter(|rule| self.stratum_of(&rule.head.predicate) == stratum)
            .collect()
    }
}

/// Builds the predicate dependency graph, checks for unstratifiable negation, condenses SCCs
/// into a DAG, and assigns each predicate a stratum equal to its SCC's topological position.
/// EDB-only predicates (never a rule head) land in stratum 0 by construction, since a
/// predicate with no incoming rule edges has no dependency forcing it higher.
pub fn analyze(program: &Program) -> EngineResult<AnalyzedProgram> {
    let mut index: PredicateIndex = build_predicate_index(program);
    let graph = generate_predicate_dependency_graph(program, &mut index);
    let sccs = stratify(&graph);

    check_stratifiable(&graph, &sccs, &index).map_err(|e| EngineError::UnstratifiableNegation(e.predicates))?;

    // `condensation` needs a plain DiGraphMap<_, ()> -- polarity has already been consulted by
    // `check_stratifiable`; from here on only reachability between strata matters.
    let mut plain_graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for node in graph.nodes() {
        plain_graph.add_node(node);
    }
    for (a, b, _) in graph.all_edges() {
        plain_graph.add_edge(a, b, ());
    }

    let condensed = condensation(plain_graph.into_graph::<u32>(), true);
    let order = toposort(&condensed, None).expect("condensation output is always a DAG");

    // `toposort` yields sources-before-sinks; dependency edges point from a rule's head to the
    // predicates its body reads, so a predicate's stratum must come *after* (higher index than)
    // everything it depends on -- reverse the topological order to get that.
    let mut node_stratum: HashMap<usize, usize> = HashMap::new();
    let stratum_count = order.len();
    for (position, node) in order.into_iter().rev().enumerate() {
        for &member in &condensed[node] {
            node_stratum.insert(member, position);
        }
    }

    let mut strata: HashMap<String, usize> = HashMap::new();
    for (predicate, &node_idx) in index.name_to_index.iter() {
        let stratum = node_stratum.get(&node_idx).copied().unwrap_or(0);
        strata.insert(predicate.clone(), stratum);
    }

    let mut rules_by_head: HashMap<String, Vec<Rule>> = HashMap::new();
    for rule in &program.inner {
        rules_by_head
            .entry(rule.head.predicate.clone())
            .or_default()
            .push(rule.clone());
    }

    Ok(AnalyzedProgram {
        strata,
        rules_by_head,
        stratum_count: stratum_count.max(1),
    })
}
