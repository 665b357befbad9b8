use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

/// A typed constant. Atoms and strings with identical bytes are distinct kinds and never
/// unify with one another -- the kind tag is always compared first.
#[derive(Clone)]
pub enum TypedValue {
    Str(String),
    /// Identifier constant, conventionally rendered with a leading `/`. Distinct from `Str`
    /// even when the underlying text matches.
    Atom(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Nanoseconds since the Unix epoch.
    Time(i64),
    /// Nanoseconds.
    Duration(i64),
}

impl TypedValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TypedValue::Str(_) => "str",
            TypedValue::Atom(_) => "atom",
            TypedValue::Int(_) => "int",
            TypedValue::Float(_) => "float",
            TypedValue::Bool(_) => "bool",
            TypedValue::Bytes(_) => "bytes",
            TypedValue::Time(_) => "time",
            TypedValue::Duration(_) => "duration",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Int(x) => Some(*x as f64),
            TypedValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TypedValue::Int(_) | TypedValue::Float(_))
    }
}

impl Debug for TypedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::Str(x) => write!(f, "{:?}", x),
            TypedValue::Atom(x) => write!(f, "/{}", x.trim_start_matches('/')),
            TypedValue::Int(x) => x.fmt(f),
            TypedValue::Float(x) => x.fmt(f),
            TypedValue::Bool(x) => x.fmt(f),
            TypedValue::Bytes(x) => write!(f, "bytes({})", x.len()),
            TypedValue::Time(x) => write!(f, "time({})", x),
            TypedValue::Duration(x) => write!(f, "duration({})", x),
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypedValue::Str(a), TypedValue::Str(b)) => a == b,
            (TypedValue::Atom(a), TypedValue::Atom(b)) => a == b,
            (TypedValue::Int(a), TypedValue::Int(b)) => a == b,
            (TypedValue::Float(a), TypedValue::Float(b)) => a.to_bits() == b.to_bits(),
            (TypedValue::Bool(a), TypedValue::Bool(b)) => a == b,
            (TypedValue::Bytes(a), TypedValue::Bytes(b)) => a == b,
            (TypedValue::Time(a), TypedValue::Time(b)) => a == b,
            (TypedValue::Duration(a), TypedValue::Duration(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TypedValue {}

impl Hash for TypedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            TypedValue::Str(x) => x.hash(state),
            TypedValue::Atom(x) => x.hash(state),
            TypedValue::Int(x) => x.hash(state),
            TypedValue::Float(x) => x.to_bits().hash(state),
            TypedValue::Bool(x) => x.hash(state),
            TypedValue::Bytes(x) => x.hash(state),
            TypedValue::Time(x) => x.hash(state),
            TypedValue::Duration(x) => x.hash(state),
        }
    }
}

fn kind_rank(value: &TypedValue) -> u8 {
    match value {
        TypedValue::Str(_) => 0,
        TypedValue::Atom(_) => 1,
        TypedValue::Int(_) => 2,
        TypedValue::Float(_) => 3,
        TypedValue::Bool(_) => 4,
        TypedValue::Bytes(_) => 5,
        TypedValue::Time(_) => 6,
        TypedValue::Duration(_) => 7,
    }
}

impl PartialOrd for TypedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TypedValue::Str(a), TypedValue::Str(b)) => a.cmp(b),
            (TypedValue::Atom(a), TypedValue::Atom(b)) => a.cmp(b),
            (TypedValue::Int(a), TypedValue::Int(b)) => a.cmp(b),
            (TypedValue::Float(a), TypedValue::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (TypedValue::Bool(a), TypedValue::Bool(b)) => a.cmp(b),
            (TypedValue::Bytes(a), TypedValue::Bytes(b)) => a.cmp(b),
            (TypedValue::Time(a), TypedValue::Time(b)) => a.cmp(b),
            (TypedValue::Duration(a), TypedValue::Duration(b)) => a.cmp(b),
            _ => kind_rank(self).cmp(&kind_rank(other)),
        }
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        TypedValue::Str(value)
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::Str(value.to_string())
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::Int(value)
    }
}

impl From<f64> for TypedValue {
    fn from(value: f64) -> Self {
        TypedValue::Float(value)
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Bool(value)
    }
}

pub type Variable = String;

/// `_` never binds; every other variable name is significant.
pub fn is_anonymous(variable: &str) -> bool {
    variable == "_"
}

#[derive(Clone, Hash, PartialEq, Eq)]
pub enum Term {
    Variable(Variable),
    Constant(TypedValue),
}

impl Debug for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Variable(x) => write!(f, "?{}", x),
            Term::Constant(x) => x.fmt(f),
        }
    }
}

pub type AnonymousGroundAtom = Vec<TypedValue>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    pub predicate: String,
    pub terms: Vec<Term>,
}

impl Atom {
    pub fn new(predicate: impl Into<String>, terms: Vec<Term>) -> Self {
        Atom {
            predicate: predicate.into(),
            terms,
        }
    }

    pub fn arity(&self) -> usize {
        self.terms.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.terms.iter().filter_map(|term| match term {
            Term::Variable(v) if !is_anonymous(v) => Some(v),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuiltinCall {
    pub name: String,
    pub args: Vec<Term>,
}

/// One literal in a rule body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BodyLiteral {
    Positive(Atom),
    Negated(Atom),
    Comparison(CompOp, Term, Term),
    Assignment(Variable, BuiltinCall),
}

impl BodyLiteral {
    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            BodyLiteral::Positive(a) | BodyLiteral::Negated(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_negated(&self) -> bool {
        matches!(self, BodyLiteral::Negated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggOp {
    Count,
    Sum,
    Min,
    Max,
    Collect,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transform {
    pub group_by: Vec<Variable>,
    pub lets: Vec<(Variable, AggOp, Term)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub head: Atom,
    pub body: Vec<BodyLiteral>,
    pub transform: Option<Transform>,
    pub id: usize,
}

impl Rule {
    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
            && self.transform.is_none()
            && self
                .head
                .terms
                .iter()
                .all(|term| matches!(term, Term::Constant(_)))
    }

    pub fn positive_body_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.body.iter().filter_map(|literal| match literal {
            BodyLiteral::Positive(atom) => Some(atom),
            _ => None,
        })
    }

    pub fn negated_body_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.body.iter().filter_map(|literal| match literal {
            BodyLiteral::Negated(atom) => Some(atom),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    pub inner: Vec<Rule>,
}

impl From<Vec<Rule>> for Program {
    fn from(value: Vec<Rule>) -> Self {
        let mut val = value;
        for (id, rule) in val.iter_mut().enumerate() {
            rule.id = id;
        }
        Self { inner: val }
    }
}

pub enum Matcher {
    Any,
    Constant(TypedValue),
}

pub struct Query<'a> {
    pub matchers: Vec<Matcher>,
    pub predicate: &'a str,
}

impl<'a> Query<'a> {
    pub fn new(predicate: &'a str, matchers: Vec<Matcher>) -> Self {
        Query { matchers, predicate }
    }
}

pub fn pattern_match(query: &Query, fact: &AnonymousGroundAtom) -> bool {
    fact.iter().enumerate().all(|(index, term)| match query.matchers.get(index) {
        Some(Matcher::Any) | None => true,
        Some(Matcher::Constant(target)) => target == term,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgBound {
    Str,
    Atom,
    Int,
    Float,
    Bool,
    Bytes,
    Time,
    Duration,
    Any,
}

impl ArgBound {
    pub fn accepts(&self, value: &TypedValue) -> bool {
        match self {
            ArgBound::Any => true,
            ArgBound::Str => matches!(value, TypedValue::Str(_)),
            ArgBound::Atom => matches!(value, TypedValue::Atom(_)),
            ArgBound::Int => matches!(value, TypedValue::Int(_)),
            ArgBound::Float => matches!(value, TypedValue::Float(_)),
            ArgBound::Bool => matches!(value, TypedValue::Bool(_)),
            ArgBound::Bytes => matches!(value, TypedValue::Bytes(_)),
            ArgBound::Time => matches!(value, TypedValue::Time(_)),
            ArgBound::Duration => matches!(value, TypedValue::Duration(_)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub predicate: String,
    pub bounds: Vec<ArgBound>,
    pub modes: Option<Vec<Mode>>,
}

impl Declaration {
    pub fn arity(&self) -> usize {
        self.bounds.len()
    }
}

/// A ground fact: an `AnonymousGroundAtom` tagged with its predicate. Conceptually a `Rule`
/// with an empty body and an all-constant head, but kept as its own lightweight newtype since
/// that is the shape the fact store and engine façade actually move around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fact {
    pub predicate: String,
    pub args: AnonymousGroundAtom,
}

impl Fact {
    pub fn new(predicate: impl Into<String>, args: AnonymousGroundAtom) -> Self {
        Fact {
            predicate: predicate.into(),
            args,
        }
    }
}

impl From<Fact> for Rule {
    fn from(fact: Fact) -> Self {
        Rule {
            head: Atom::new(
                fact.predicate,
                fact.args.into_iter().map(Term::Constant).collect(),
            ),
            body: vec![],
            transform: None,
            id: 0,
        }
    }
}

macro_rules! impl_fact_args_tuple {
    ($($idx:tt $t:ident),+) => {
        impl<$($t),+> From<($($t,)+)> for AnonymousGroundAtom
        where
            $($t: Into<TypedValue>),+
        {
            fn from(tuple: ($($t,)+)) -> Self {
                vec![$(tuple.$idx.into()),+]
            }
        }
    };
}

impl_fact_args_tuple!(0 A);
impl_fact_args_tuple!(0 A, 1 B);
impl_fact_args_tuple!(0 A, 1 B, 2 C);
impl_fact_args_tuple!(0 A, 1 B, 2 C, 3 D);
