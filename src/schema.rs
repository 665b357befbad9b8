use crate::error::{EngineError, EngineResult};
use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use datalog_syntax::{BodyLiteral, Declaration, Rule, Term};

/// Predicates whose derivation must stay in the core's hands; rules loaded from untrusted
/// (learned) sources may never redefine them.
pub const PROTECTED_HEADS: &[&str] = &[
    "permitted",
    "safe_action",
    "admin_override",
    "signed_approval",
    "pending_action",
    "permitted_action",
    "permission_check_result",
    "routing_result",
    "execution_result",
    "system_shard_state",
];

#[derive(Clone)]
pub struct SchemaRegistry {
    predicates: HashMap<String, Declaration>,
    protected: HashSet<&'static str>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut protected = HashSet::new();
        protected.extend(PROTECTED_HEADS.iter().copied());
        SchemaRegistry {
            predicates: HashMap::new(),
            protected,
        }
    }
}

impl SchemaRegistry {
    pub fn register(&mut self, decl: Declaration) -> EngineResult<()> {
        if let Some(existing) = self.predicates.get(&decl.predicate) {
            if existing.arity() != decl.arity() {
                return Err(EngineError::ArityMismatch {
                    predicate: decl.predicate.clone(),
                    expected: existing.arity(),
                    got: decl.arity(),
                });
            }
        }
        self.predicates.insert(decl.predicate.clone(), decl);
        Ok(())
    }

    pub fn get(&self, predicate: &str) -> Option<&Declaration> {
        self.predicates.get(predicate)
    }

    pub fn is_declared(&self, predicate: &str) -> bool {
        self.predicates.contains_key(predicate)
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Declaration> {
        self.predicates.values()
    }

    fn check_declared_and_arity(&self, predicate: &str, arity: usize) -> EngineResult<()> {
        match self.predicates.get(predicate) {
            None => Err(EngineError::UndeclaredPredicate(predicate.to_string())),
            Some(decl) if decl.arity() != arity => Err(EngineError::ArityMismatch {
                predicate: predicate.to_string(),
                expected: decl.arity(),
                got: arity,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Every referenced predicate is declared with matching arity, and every rule is safe:
    /// head variables are bound by a positive body literal; variables used in a negated
    /// literal, comparison, or assignment RHS are bound by a strictly earlier positive literal.
    pub fn validate_rule(&self, rule: &Rule) -> EngineResult<()> {
        self.check_declared_and_arity(&rule.head.predicate, rule.head.arity())?;

        for literal in &rule.body {
            if let Some(atom) = literal.as_atom() {
                self.check_declared_and_arity(&atom.predicate, atom.arity())?;
            }
        }

        let mut bound: HashSet<String> = HashSet::new();
        for literal in &rule.body {
            match literal {
                BodyLiteral::Positive(atom) => {
                    for var in atom.variables() {
                        bound.insert(var.clone());
                    }
                }
                BodyLiteral::Negated(atom) => {
                    for var in atom.variables() {
                        if !bound.contains(var) {
                            return Err(EngineError::UnsafeVariable {
                                rule_head: rule.head.predicate.clone(),
                                var_name: var.clone(),
                            });
                        }
                    }
                }
                BodyLiteral::Comparison(_, left, right) => {
                    for term in [left, right] {
                        if let Term::Variable(name) = term {
                            if !datalog_syntax::is_anonymous(name) && !bound.contains(name) {
                                return Err(EngineError::UnsafeVariable {
                                    rule_head: rule.head.predicate.clone(),
                                    var_name: name.clone(),
                                });
                            }
                        }
                    }
                }
                BodyLiteral::Assignment(target, call) => {
                    for term in &call.args {
                        if let Term::Variable(name) = term {
                            if !datalog_syntax::is_anonymous(name) && !bound.contains(name) {
                                return Err(EngineError::UnsafeVariable {
                                    rule_head: rule.head.predicate.clone(),
                                    var_name: name.clone(),
                                });
                            }
                        }
                    }
                    bound.insert(target.clone());
                }
            }
        }

        if let Some(transform) = &rule.transform {
            for var in &transform.group_by {
                if !bound.contains(var) {
                    return Err(EngineError::UnsafeVariable {
                        rule_head: rule.head.predicate.clone(),
                        var_name: var.clone(),
                    });
                }
            }
            for (result_var, _, source_term) in &transform.lets {
                if let Term::Variable(name) = source_term {
                    if !datalog_syntax::is_anonymous(name) && !bound.contains(name) {
                        return Err(EngineError::UnsafeVariable {
                            rule_head: rule.head.predicate.clone(),
                            var_name: name.clone(),
                        });
                    }
                }
                bound.insert(result_var.clone());
            }
        }

        for var in rule.head.variables() {
            if !bound.contains(var) {
                return Err(EngineError::UnsafeVariable {
                    rule_head: rule.head.predicate.clone(),
                    var_name: var.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn validate_learned_rule(&self, rule: &Rule) -> EngineResult<()> {
        if self.protected.contains(rule.head.predicate.as_str()) {
            return Err(EngineError::ProtectedHead(rule.head.predicate.clone()));
        }
        self.validate_rule(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_syntax::{ArgBound, Atom, Term};

    fn decl(predicate: &str, arity: usize) -> Declaration {
        Declaration {
            predicate: predicate.to_string(),
            bounds: vec![ArgBound::Any; arity],
            modes: None,
        }
    }

    #[test]
    fn rejects_undeclared_predicate() {
        let registry = SchemaRegistry::default();
        let rule = Rule {
            head: Atom::new("p", vec![Term::Variable("x".into())]),
            body: vec![BodyLiteral::Positive(Atom::new(
                "q",
                vec![Term::Variable("x".into())],
            ))],
            transform: None,
            id: 0,
        };
        assert!(matches!(
            registry.validate_rule(&rule),
            Err(EngineError::UndeclaredPredicate(_))
        ));
    }

    #[test]
    fn rejects_unsafe_head_variable() {
        let mut registry = SchemaRegistry::default();
        registry.register(decl("p", 1)).unwrap();
        registry.register(decl("q", 1)).unwrap();

        let rule = Rule {
            head: Atom::new("p", vec![Term::Variable("y".into())]),
            body: vec![BodyLiteral::Positive(Atom::new(
                "q",
                vec![Term::Variable("x".into())],
            ))],
            transform: None,
            id: 0,
        };
        assert!(matches!(
            registry.validate_rule(&rule),
            Err(EngineError::UnsafeVariable { .. })
        ));
    }

    #[test]
    fn rejects_protected_head_for_learned_rules() {
        let mut registry = SchemaRegistry::default();
        registry.register(decl("permitted", 1)).unwrap();

        let rule = Rule {
            head: Atom::new("permitted", vec![Term::Constant("delete".into())]),
            body: vec![],
            transform: None,
            id: 0,
        };
        assert!(matches!(
            registry.validate_learned_rule(&rule),
            Err(EngineError::ProtectedHead(_))
        ));
    }

    #[test]
    fn accepts_safe_rule() {
        let mut registry = SchemaRegistry::default();
        registry.register(decl("reach", 2)).unwrap();
        registry.register(decl("edge", 2)).unwrap();

        let rule = Rule {
            head: Atom::new(
                "reach",
                vec![Term::Variable("x".into()), Term::Variable("y".into())],
            ),
            body: vec![BodyLiteral::Positive(Atom::new(
                "edge",
                vec![Term::Variable("x".into()), Term::Variable("y".into())],
            ))],
            transform: None,
            id: 0,
        };
        assert!(registry.validate_rule(&rule).is_ok());
    }
}
