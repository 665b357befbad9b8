extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use std::collections::HashMap;
use syn::parse::{Parse, ParseStream};
use syn::{bracketed, parenthesized, Expr, Ident, Result, Token};

enum TermArg {
    Variable(Ident),
    Constant(Expr),
}

struct AtomArgs {
    name: Ident,
    args: Vec<TermArg>,
    sign: bool,
}

struct RuleMacroInput {
    head: AtomArgs,
    body: Vec<AtomArgs>,
}

impl Parse for TermArg {
    fn parse(input: ParseStream) -> Result<Self> {
        if input.peek(Token![?]) {
            input.parse::<Token![?]>()?;
            let ident: Ident = input.parse()?;
            Ok(TermArg::Variable(ident))
        } else {
            let expr: Expr = input.parse()?;
            Ok(TermArg::Constant(expr))
        }
    }
}

impl Parse for AtomArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        let sign = if input.peek(Token![!]) {
            input.parse::<Token![!]>()?;
            false
        } else {
            true
        };

        let name: Ident = input.parse()?;
        let content;
        parenthesized!(content in input);
        let args = content
            .parse_terminated::<TermArg, Token![,]>(TermArg::parse)?
            .into_iter()
            .collect();

        Ok(AtomArgs { name, args, sign })
    }
}

impl Parse for RuleMacroInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let head = input.parse::<AtomArgs>()?;
        let mut distinguished_variables: HashMap<String, (Ident, bool)> = head
            .args
            .iter()
            .filter_map(|term| match term {
                TermArg::Variable(ident) => Some((ident.to_string(), (ident.clone(), false))),
                TermArg::Constant(_) => None,
            })
            .collect();

        input.parse::<Token![<-]>()?;
        let content;
        bracketed!(content in input);
        let body: syn::punctuated::Punctuated<AtomArgs, Token![,]> =
            content.parse_terminated(AtomArgs::parse)?;
        let body_vec: Vec<AtomArgs> = body.into_iter().collect();

        body_vec.iter().for_each(|body_atom| {
            body_atom
                .args
                .iter()
                .filter(|term| matches!(term, TermArg::Variable(_)))
                .for_each(|variable| {
                    if let TermArg::Variable(ident) = variable {
                        let owned = ident.to_string();
                        if let Some(entry) = distinguished_variables.get_mut(&owned) {
                            entry.1 = true;
                        }
                    }
                });
        });

        for (name, (ident, seen_in_body)) in distinguished_variables {
            if !seen_in_body {
                return Err(syn::Error::new(
                    ident.span(),
                    format!("variable {} not found in the body", name),
                ));
            }
        }

        Ok(RuleMacroInput {
            head,
            body: body_vec,
        })
    }
}

fn term_tokens(arg: &TermArg) -> proc_macro2::TokenStream {
    match arg {
        TermArg::Variable(ident) => {
            quote! { datalog_syntax::Term::Variable(stringify!(#ident).to_string()) }
        }
        TermArg::Constant(expr) => {
            quote! { datalog_syntax::Term::Constant(datalog_syntax::TypedValue::from(#expr)) }
        }
    }
}

fn atom_tokens(atom: &AtomArgs) -> proc_macro2::TokenStream {
    let name = &atom.name;
    let terms: Vec<_> = atom.args.iter().map(term_tokens).collect();
    quote! { datalog_syntax::Atom::new(stringify!(#name), vec![#(#terms),*]) }
}

fn body_literal_tokens(atom: &AtomArgs) -> proc_macro2::TokenStream {
    let atom_tokens = atom_tokens(atom);
    if atom.sign {
        quote! { datalog_syntax::BodyLiteral::Positive(#atom_tokens) }
    } else {
        quote! { datalog_syntax::BodyLiteral::Negated(#atom_tokens) }
    }
}

fn rule_tokens(input: &RuleMacroInput) -> proc_macro2::TokenStream {
    let head = atom_tokens(&input.head);
    let body: Vec<_> = input.body.iter().map(body_literal_tokens).collect();

    quote! {
        datalog_syntax::Rule {
            head: #head,
            body: vec![#(#body),*],
            transform: None,
            id: 0,
        }
    }
}

/// Builds a single `Rule` value, e.g. `rule! { tc(?x, ?y) <- [e(?x, ?y)] }`.
#[proc_macro]
pub fn rule(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as RuleMacroInput);
    rule_tokens(&input).into()
}

struct ProgramMacroInput {
    rules: syn::punctuated::Punctuated<RuleMacroInput, Token![,]>,
}

impl Parse for ProgramMacroInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let rules = input.parse_terminated(RuleMacroInput::parse)?;
        Ok(ProgramMacroInput { rules })
    }
}

/// Builds a `Program` from a comma-separated list of rules, e.g.
/// `program! { tc(?x, ?y) <- [e(?x, ?y)], tc(?x, ?z) <- [e(?x, ?y), tc(?y, ?z)] }`.
///
/// Only positive and negated atoms are supported here; rules using comparisons, builtin
/// assignments, or aggregation transforms are built with ordinary struct literals instead.
#[proc_macro]
pub fn program(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as ProgramMacroInput);
    let rules: Vec<_> = input.rules.iter().map(rule_tokens).collect();

    let expanded = quote! {
        datalog_syntax::Program::from(vec![#(#rules),*])
    };

    expanded.into()
}
