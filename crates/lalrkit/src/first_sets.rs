//! Nullability and FIRST-set analysis, computed by monotone fixed-point
//! iteration over the (possibly cyclic) rule graph.

use crate::grammar::{Grammar, Symbol};
use crate::util::{Map, Set};

#[derive(Debug, PartialEq)]
pub struct FirstSets {
    nulls: Set<Symbol>,
    map: Map<Symbol, Set<Symbol>>,
}

impl FirstSets {
    pub fn new<V>(grammar: &Grammar<V>) -> Self {
        let nulls = nulls_set(grammar);
        let map = first_map(grammar, &nulls);
        Self { nulls, map }
    }

    /// Whether the symbol can derive the empty sequence.
    pub fn is_nullable(&self, s: Symbol) -> bool {
        self.nulls.contains(&s)
    }

    pub fn first(&self, s: Symbol) -> Option<&Set<Symbol>> {
        self.map.get(&s)
    }

    /// FIRST of a sequence, accumulated up to (and including) the first
    /// non-nullable element. The flag reports whether every element was
    /// nullable, i.e. whether the whole sequence can collapse.
    pub fn first_of_sequence(&self, seq: &[Symbol]) -> (Set<Symbol>, bool) {
        let mut out = Set::default();
        for s in seq {
            match self.map.get(s) {
                Some(first) => out.extend(first.iter().copied()),
                // A symbol the analysis has not seen is a terminal.
                None => {
                    out.insert(*s);
                }
            }
            if !self.nulls.contains(s) {
                return (out, false);
            }
        }
        (out, true)
    }
}

/// The set of nonterminals that can collapse to the empty sequence.
fn nulls_set<V>(grammar: &Grammar<V>) -> Set<Symbol> {
    let mut nulls: Set<Symbol> = grammar
        .rules()
        .iter()
        .filter(|r| r.rhs().is_empty())
        .map(|r| r.lhs())
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for rule in grammar.rules() {
            if nulls.contains(&rule.lhs()) {
                continue;
            }
            if rule.rhs().iter().all(|s| nulls.contains(s)) {
                nulls.insert(rule.lhs());
                changed = true;
            }
        }
    }

    nulls
}

fn first_map<V>(grammar: &Grammar<V>, nulls: &Set<Symbol>) -> Map<Symbol, Set<Symbol>> {
    let mut map: Map<Symbol, Set<Symbol>> = Map::default();

    // First(t) = {t} for terminals, {} initially for nonterminals.
    for s in grammar.symbols_used() {
        if grammar.is_nonterminal(s) {
            map.insert(s, Set::default());
        } else {
            map.insert(s, std::iter::once(s).collect());
        }
    }

    // For X -> Y1 .. Yn, First(X) absorbs First(Yi) for the maximal
    // nullable-then-one-more prefix Y1 .. Yk.
    struct Constraint {
        sup: Symbol,
        sub: Symbol,
    }
    let mut constraints = Vec::new();
    for rule in grammar.rules() {
        for &s in rule.rhs() {
            if s != rule.lhs() {
                constraints.push(Constraint {
                    sup: rule.lhs(),
                    sub: s,
                });
            }
            if !nulls.contains(&s) {
                break;
            }
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for Constraint { sup, sub } in &constraints {
            let added: Vec<Symbol> = match map.get(sub) {
                Some(set) => set.iter().copied().collect(),
                None => continue,
            };
            let superset = map.entry(*sup).or_default();
            for s in added {
                changed |= superset.insert(s);
            }
        }
    }

    map
}
