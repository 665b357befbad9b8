use ahash::{HashMap, HashMapExt};
use datalog_syntax::{Term, TypedValue, Variable};

/// Union-find binder over a substitution environment. Ordinary positive joins are still
/// resolved by the SPJ compiler's natural column-equality fast path (see `evaluator::spj`);
/// this binder exists for the cases that need a named-variable lookup outside of a join --
/// comparisons, assignments, and aggregation group keys.
#[derive(Default, Clone)]
pub struct Bindings {
    classes: HashMap<Variable, usize>,
    values: Vec<Option<TypedValue>>,
}

impl Bindings {
    fn class_of(&mut self, var: &str) -> usize {
        if let Some(&class) = self.classes.get(var) {
            return class;
        }
        let class = self.values.len();
        self.values.push(None);
        self.classes.insert(var.to_string(), class);
        class
    }

    pub fn get(&self, var: &str) -> Option<&TypedValue> {
        self.classes
            .get(var)
            .and_then(|&class| self.values[class].as_ref())
    }

    /// Binds `var` to `value`. Fails (returns `false`, leaving bindings untouched) if `var`
    /// is already bound to a different value -- unification of two constants succeeds only
    /// when the kind tag and value are equal.
    pub fn bind(&mut self, var: &str, value: TypedValue) -> bool {
        if datalog_syntax::is_anonymous(var) {
            return true;
        }
        let class = self.class_of(var);
        match &self.values[class] {
            Some(existing) => existing == &value,
            None => {
                self.values[class] = Some(value);
                true
            }
        }
    }

    pub fn resolve(&self, term: &Term) -> Option<TypedValue> {
        match term {
            Term::Constant(value) => Some(value.clone()),
            Term::Variable(name) => self.get(name).cloned(),
        }
    }
}
