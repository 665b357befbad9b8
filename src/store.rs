use ahash::{HashMap, HashMapExt};
use datalog_syntax::{AnonymousGroundAtom, ArgBound, Atom, Declaration, Matcher, Query, Term, TypedValue};
use indexmap::IndexSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// De-duplicating, `Arc`-shared, predicate-indexed table of ground facts. Cloning the
/// `IndexSet` clones `Arc` pointers, not fact data -- this is what gives snapshots their
/// copy-on-write property for free.
pub type FactTable = IndexSet<Arc<AnonymousGroundAtom>, ahash::RandomState>;

/// The whole-store fact ceiling (spec's "cap on total asserted + derived facts"), shared by
/// every per-stratum `RelationStorage` in one `DifferentialEngine` so the limit applies to the
/// engine as a whole, not to each stratum independently. Also owns the "warned once" latch so
/// crossing 85% utilization logs a single `tracing::warn!`, not one per insert thereafter.
pub struct FactBudget {
    limit: u32,
    count: AtomicUsize,
    warned: AtomicBool,
}

impl FactBudget {
    pub fn new(limit: u32) -> Arc<Self> {
        Arc::new(FactBudget {
            limit,
            count: AtomicUsize::new(0),
            warned: AtomicBool::new(false),
        })
    }

    fn over_limit(&self) -> bool {
        self.limit != 0 && self.count.load(Ordering::Relaxed) >= self.limit as usize
    }

    fn record_insert(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.warn_if_near_limit();
    }

    fn record_removal(&self, n: usize) {
        if n > 0 {
            self.count.fetch_sub(n, Ordering::Relaxed);
        }
    }

    fn warn_if_near_limit(&self) {
        if self.limit == 0 {
            return;
        }
        let utilization = self.count.load(Ordering::Relaxed) as f64 / self.limit as f64;
        if utilization >= 0.85 && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                utilization = utilization,
                fact_limit = self.limit,
                "fact store utilization crossed 85%"
            );
        }
    }

    /// Used by `RelationStorage::deep_clone_with_budget`: a snapshot gets its own independent
    /// budget, seeded at the parent's current count/warned state, so mutating the clone or the
    /// parent afterward never affects the other's accounting.
    pub fn snapshot_independent(&self) -> Arc<Self> {
        Arc::new(FactBudget {
            limit: self.limit,
            count: AtomicUsize::new(self.count.load(Ordering::Relaxed)),
            warned: AtomicBool::new(self.warned.load(Ordering::Relaxed)),
        })
    }
}

fn canonicalize_path(path: &str) -> String {
    let slashed = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in slashed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

pub struct RelationStorage {
    inner: HashMap<String, FactTable>,
    file_index: HashMap<String, Vec<Arc<AnonymousGroundAtom>>>,
    budget: Arc<FactBudget>,
}

impl Default for RelationStorage {
    fn default() -> Self {
        RelationStorage::with_shared_budget(FactBudget::new(0))
    }
}

impl RelationStorage {
    /// Convenience constructor for a `RelationStorage` that is the only stratum sharing its
    /// budget -- tests and call sites that don't care about cross-stratum sharing.
    pub fn with_fact_limit(fact_limit: u32) -> Self {
        RelationStorage::with_shared_budget(FactBudget::new(fact_limit))
    }

    /// The constructor `DifferentialEngine::new` actually uses: every stratum of one engine is
    /// built with the same `Arc<FactBudget>` so `fact_limit` caps the whole store, not each
    /// stratum independently.
    pub fn with_shared_budget(budget: Arc<FactBudget>) -> Self {
        RelationStorage {
            inner: HashMap::new(),
            file_index: HashMap::new(),
            budget,
        }
    }

    pub fn ensure_relation(&mut self, predicate: &str) {
        self.inner.entry(predicate.to_string()).or_default();
    }

    pub fn get_relation(&self, predicate: &str) -> Option<&FactTable> {
        self.inner.get(predicate)
    }

    pub fn list_predicates(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|s| s.as_str())
    }

    pub fn iter(&self, predicate: &str) -> impl Iterator<Item = &Arc<AnonymousGroundAtom>> {
        self.inner.get(predicate).into_iter().flatten()
    }

    pub fn iter_match<'a>(
        &'a self,
        query: &'a Query<'a>,
    ) -> impl Iterator<Item = &'a Arc<AnonymousGroundAtom>> + 'a {
        self.iter(query.predicate)
            .filter(move |fact| datalog_syntax::pattern_match(query, fact))
    }

    pub fn count(&self, predicate: &str) -> usize {
        self.inner.get(predicate).map(|table| table.len()).unwrap_or(0)
    }

    pub fn contains(&self, predicate: &str, fact: &AnonymousGroundAtom) -> bool {
        self.inner
            .get(predicate)
            .map(|table| table.contains(fact))
            .unwrap_or(false)
    }

    /// Inserts one fact. Returns `Ok(true)` if the fact was newly added, `Ok(false)` if it was
    /// already present (de-duplication, no change), `Err` if the store is at `fact_limit`.
    pub fn insert(
        &mut self,
        predicate: &str,
        fact: AnonymousGroundAtom,
    ) -> Result<bool, crate::error::EngineError> {
        if self.contains(predicate, &fact) {
            return Ok(false);
        }
        if self.budget.over_limit() {
            return Err(crate::error::EngineError::FactLimitExceeded);
        }

        let arc_fact = Arc::new(fact);
        self.inner
            .entry(predicate.to_string())
            .or_default()
            .insert(arc_fact.clone());

        if let Some(TypedValue::Str(path) | TypedValue::Atom(path)) = arc_fact.first() {
            let canonical = canonicalize_path(path);
            self.file_index.entry(canonical).or_default().push(arc_fact);
        }

        self.budget.record_insert();
        Ok(true)
    }

    pub fn insert_registered(
        &mut self,
        predicate: &str,
        facts: impl Iterator<Item = Arc<AnonymousGroundAtom>>,
    ) {
        let table = self.inner.entry(predicate.to_string()).or_default();
        let before = table.len();
        table.extend(facts);
        for _ in before..table.len() {
            self.budget.record_insert();
        }
    }

    pub fn remove(&mut self, predicate: &str, fact: &AnonymousGroundAtom) -> bool {
        let removed = self
            .inner
            .get_mut(predicate)
            .map(|table| table.shift_remove(fact))
            .unwrap_or(false);
        if removed {
            self.budget.record_removal(1);
        }
        removed
    }

    /// Removes every previously-indexed fact whose first argument canonicalizes to `path`.
    pub fn facts_for_file(&self, path: &str) -> Vec<Arc<AnonymousGroundAtom>> {
        self.file_index
            .get(&canonicalize_path(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_facts_for_file(&mut self, path: &str) {
        let canonical = canonicalize_path(path);
        if let Some(facts) = self.file_index.remove(&canonical) {
            let mut removed = 0;
            for table in self.inner.values_mut() {
                for fact in &facts {
                    if table.shift_remove(fact.as_ref()) {
                        removed += 1;
                    }
                }
            }
            self.budget.record_removal(removed);
        }
    }

    pub fn drain_all_relations(
        &mut self,
    ) -> impl Iterator<Item = (String, Vec<Arc<AnonymousGroundAtom>>)> + '_ {
        let predicates: Vec<String> = self.inner.keys().cloned().collect();
        predicates.into_iter().map(move |predicate| {
            let drained = self
                .inner
                .get_mut(&predicate)
                .map(|table| table.drain(..).collect())
                .unwrap_or_default();
            (predicate, drained)
        })
    }

    pub fn estimate_count(&self) -> usize {
        self.inner.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.estimate_count() == 0
    }

    pub fn clear(&mut self) {
        let removed: usize = self.inner.values().map(|table| table.len()).sum();
        for table in self.inner.values_mut() {
            table.clear();
        }
        self.file_index.clear();
        self.budget.record_removal(removed);
    }

    /// Clears only `predicate`'s table, leaving every other predicate at this stratum (and the
    /// file index) untouched -- used when retracting drives a rebuild of just the derived
    /// relations above a change, not the whole stratum's EDB facts.
    pub fn clear_predicate(&mut self, predicate: &str) {
        if let Some(table) = self.inner.get_mut(predicate) {
            let removed = table.len();
            table.clear();
            self.budget.record_removal(removed);
        }
    }

    /// Deep-clones this stratum's tables into a fresh `RelationStorage` sharing `budget` with
    /// whichever sibling strata are being cloned alongside it, so the clone's whole-store cap
    /// is tracked independently of the original's.
    pub fn deep_clone_with_budget(&self, budget: Arc<FactBudget>) -> Self {
        RelationStorage {
            inner: self.inner.clone(),
            file_index: self.file_index.clone(),
            budget,
        }
    }

    pub fn budget(&self) -> Arc<FactBudget> {
        self.budget.clone()
    }
}

/// One-way coercion of a `/`-prefixed string into an `Atom`, applied only at the insertion
/// boundary and only when the declared bound at this position is `Atom` -- see the Open
/// Question resolution in DESIGN.md. Any other string, or a position with a different bound,
/// passes through untouched.
pub fn coerce_for_bound(value: TypedValue, bound: &ArgBound) -> TypedValue {
    match (value, bound) {
        (TypedValue::Str(text), ArgBound::Atom) if text.starts_with('/') => {
            TypedValue::Atom(text.trim_start_matches('/').to_string())
        }
        (other, _) => other,
    }
}

pub fn check_bounds(
    predicate: &str,
    args: &[TypedValue],
    decl: &Declaration,
) -> Result<(), crate::error::EngineError> {
    if args.len() != decl.arity() {
        return Err(crate::error::EngineError::ArityMismatch {
            predicate: predicate.to_string(),
            expected: decl.arity(),
            got: args.len(),
        });
    }
    for (idx, (value, bound)) in args.iter().zip(decl.bounds.iter()).enumerate() {
        if !bound.accepts(value) {
            return Err(crate::error::EngineError::TypeMismatch {
                predicate: predicate.to_string(),
                arg_index: idx,
                expected_kind: format!("{:?}", bound),
                got_kind: value.kind_name().to_string(),
            });
        }
    }
    Ok(())
}

pub fn atom_to_pattern(atom: &Atom) -> Vec<Matcher> {
    atom.terms
        .iter()
        .map(|term| match term {
            Term::Constant(value) => Matcher::Constant(value.clone()),
            Term::Variable(_) => Matcher::Any,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut storage = RelationStorage::default();
        let fact: AnonymousGroundAtom = ("a", "b").into();
        assert_eq!(storage.insert("edge", fact.clone()).unwrap(), true);
        assert_eq!(storage.insert("edge", fact.clone()).unwrap(), false);
        assert_eq!(storage.estimate_count(), 1);
    }

    #[test]
    fn fact_limit_rejects_further_inserts() {
        let mut storage = RelationStorage::with_fact_limit(1);
        storage.insert("edge", ("a", "b").into()).unwrap();
        let err = storage.insert("edge", ("b", "c").into()).unwrap_err();
        assert_eq!(err, crate::error::EngineError::FactLimitExceeded);
    }

    #[test]
    fn fact_limit_is_shared_across_relation_storages() {
        let budget = FactBudget::new(1);
        let mut first = RelationStorage::with_shared_budget(budget.clone());
        let mut second = RelationStorage::with_shared_budget(budget);

        first.insert("edge", ("a", "b").into()).unwrap();
        let err = second.insert("node", ("c",).into()).unwrap_err();
        assert_eq!(err, crate::error::EngineError::FactLimitExceeded);
    }

    #[test]
    fn utilization_warning_latches_after_first_fire() {
        let budget = FactBudget::new(10);
        assert!(!budget.warned.load(Ordering::Relaxed));

        // 85 through 89 percent: crosses the threshold on the 9th insert.
        for _ in 0..9 {
            budget.record_insert();
        }
        assert!(budget.warned.load(Ordering::Relaxed));

        // `swap` returns the previous value, so a second insert past the threshold observes
        // the latch already set and must not flip anything -- this is what keeps the warning
        // to a single emission instead of firing on every insert for the remaining capacity.
        let already_warned = budget.warned.swap(true, Ordering::Relaxed);
        assert!(already_warned);
    }

    #[test]
    fn canonicalizes_path_separators_and_dots() {
        assert_eq!(canonicalize_path("a\\b\\..\\c"), "a/c");
        assert_eq!(canonicalize_path("./a/./b"), "a/b");
    }

    #[test]
    fn replace_facts_for_file_clears_prior_entries() {
        let mut storage = RelationStorage::default();
        storage
            .insert("file_owner", ("/src/main.rs", "alice").into())
            .unwrap();
        assert_eq!(storage.facts_for_file("src/main.rs").len(), 1);

        storage.remove_facts_for_file("src/main.rs");
        assert!(storage.facts_for_file("src/main.rs").is_empty());
        assert_eq!(storage.estimate_count(), 0);
    }

    #[test]
    fn atom_bound_position_coerces_slash_string() {
        let coerced = coerce_for_bound(TypedValue::from("/active"), &ArgBound::Atom);
        assert_eq!(coerced, TypedValue::Atom("active".to_string()));
    }

    #[test]
    fn non_atom_bound_position_leaves_string_alone() {
        let coerced = coerce_for_bound(TypedValue::from("/active"), &ArgBound::Str);
        assert_eq!(coerced, TypedValue::Str("/active".to_string()));
    }
}
