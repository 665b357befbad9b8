use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use datalog_syntax::{Atom, TypedValue};

use crate::error::{EngineError, EngineResult};
use crate::store::RelationStorage;

pub type Loader = Box<dyn Fn(&[Option<TypedValue>]) -> Result<Vec<Vec<TypedValue>>, String> + Send + Sync>;

/// Lazily materializes an EDB predicate by calling back into host code on first read of a given
/// bound key. A fully-bound key is cached so a loader never runs twice in the same round for
/// the same lookup.
#[derive(Default)]
pub struct VirtualPredicateProxy {
    loaders: HashMap<String, Loader>,
    seen_this_round: HashSet<(String, Vec<Option<TypedValue>>)>,
}

impl VirtualPredicateProxy {
    pub fn register(&mut self, predicate: impl Into<String>, loader: Loader) {
        self.loaders.insert(predicate.into(), loader);
    }

    pub fn unregister(&mut self, predicate: &str) {
        self.loaders.remove(predicate);
    }

    pub fn is_virtual(&self, predicate: &str) -> bool {
        self.loaders.contains_key(predicate)
    }

    pub fn start_round(&mut self) {
        self.seen_this_round.clear();
    }

    /// Resolves a query atom's bound positions into a key (constants, `None` for still-free
    /// variables), invokes the predicate's loader if registered and not yet run this round for
    /// that key, and inserts whatever facts it returns into `store`. Loader failures surface as
    /// `VirtualLoadFailed` but never abort the surrounding evaluation -- callers treat the
    /// predicate as if the loader simply returned nothing for this round.
    pub fn load_if_bound(
        &mut self,
        predicate: &str,
        bound: &[Option<TypedValue>],
        store: &mut RelationStorage,
    ) -> EngineResult<()> {
        let Some(loader) = self.loaders.get(predicate) else {
            return Ok(());
        };
        let key = (predicate.to_string(), bound.to_vec());
        if self.seen_this_round.contains(&key) {
            return Ok(());
        }
        self.seen_this_round.insert(key);

        match loader(bound) {
            Ok(rows) => {
                store.ensure_relation(predicate);
                for row in rows {
                    store.insert(predicate, row)?;
                }
                Ok(())
            }
            Err(cause) => {
                tracing::warn!(predicate, cause, "virtual predicate loader failed");
                Err(EngineError::VirtualLoadFailed {
                    predicate: predicate.to_string(),
                    cause,
                })
            }
        }
    }

    pub fn bound_key_for(atom: &Atom) -> Vec<Option<TypedValue>> {
        atom.terms
            .iter()
            .map(|term| match term {
                datalog_syntax::Term::Constant(value) => Some(value.clone()),
                datalog_syntax::Term::Variable(_) => None,
            })
            .collect()
    }
}
