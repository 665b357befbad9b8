#[cfg(test)]
mod tests {
    use datalog_rule_macro::rule;
    use datalog_syntax::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_rule() {
        let rule_output = rule! { tc(?x, ?z) <- [e(?x, ?y), tc(?y, ?z)] };

        let expected_output = Rule {
            head: Atom::new(
                "tc",
                vec![Term::Variable("x".to_string()), Term::Variable("z".to_string())],
            ),
            body: vec![
                BodyLiteral::Positive(Atom::new(
                    "e",
                    vec![Term::Variable("x".to_string()), Term::Variable("y".to_string())],
                )),
                BodyLiteral::Positive(Atom::new(
                    "tc",
                    vec![Term::Variable("y".to_string()), Term::Variable("z".to_string())],
                )),
            ],
            transform: None,
            id: 0,
        };

        assert_eq!(rule_output, expected_output);
    }

    #[test]
    fn test_rule_with_constants() {
        let rule_output = rule! { tc(?x, 13) <- [e(?x, "haha"), tc(?y, true)] };

        let expected_output = Rule {
            head: Atom::new(
                "tc",
                vec![
                    Term::Variable("x".to_string()),
                    Term::Constant(TypedValue::from(13)),
                ],
            ),
            body: vec![
                BodyLiteral::Positive(Atom::new(
                    "e",
                    vec![
                        Term::Variable("x".to_string()),
                        Term::Constant(TypedValue::from("haha")),
                    ],
                )),
                BodyLiteral::Positive(Atom::new(
                    "tc",
                    vec![
                        Term::Variable("y".to_string()),
                        Term::Constant(TypedValue::from(true)),
                    ],
                )),
            ],
            transform: None,
            id: 0,
        };

        assert_eq!(rule_output, expected_output);
    }

    #[test]
    fn test_rule_with_negation() {
        let rule_output = rule! { d(?x, ?z) <- [tc(?x, ?y), !e(?y, ?z)] };

        let expected_output = Rule {
            head: Atom::new(
                "d",
                vec![Term::Variable("x".to_string()), Term::Variable("z".to_string())],
            ),
            body: vec![
                BodyLiteral::Positive(Atom::new(
                    "tc",
                    vec![Term::Variable("x".to_string()), Term::Variable("y".to_string())],
                )),
                BodyLiteral::Negated(Atom::new(
                    "e",
                    vec![Term::Variable("y".to_string()), Term::Variable("z".to_string())],
                )),
            ],
            transform: None,
            id: 0,
        };

        assert_eq!(rule_output, expected_output);
    }
}
