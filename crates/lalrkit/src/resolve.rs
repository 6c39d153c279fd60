//! Residual-ambiguity machinery.
//!
//! Priority and associativity cannot express every disambiguation. For the
//! cells they leave conflicted, this module reconstructs witness token
//! sequences reaching each conflict, and pins a winning action by replaying
//! concrete examples against every combination of conflicted choices until
//! the produced tree matches the shape the grammar author expects.

use crate::engine::{Parser, SliceSource, Token};
use crate::grammar::{Grammar, Symbol};
use crate::parse_table::{Action, ActionTable};
use crate::util::{Map, Set};
use std::collections::VecDeque;

/// A token sequence that drives a parse into a conflicted cell.
#[derive(Debug, Clone)]
pub struct ConflictExample {
    pub state: usize,
    pub symbol: Symbol,
    pub tokens: Vec<Symbol>,
}

/// For every cell still holding multiple candidate actions, reconstruct a
/// minimal token sequence that reaches its state, breadth-first over the
/// shift edges of the transition graph. Nonterminal edge labels are replaced
/// by their shortest terminal expansion so the witness is a real input.
pub fn collect_examples<V>(grammar: &Grammar<V>, table: &ActionTable) -> Vec<ConflictExample> {
    let witnesses = terminal_witnesses(grammar);

    let mut paths: Map<usize, Vec<Symbol>> = Map::default();
    paths.insert(0, Vec::new());
    let mut queue = VecDeque::from([0usize]);
    while let Some(state) = queue.pop_front() {
        for (symbol, cell) in table.cells(state) {
            for action in cell.candidates() {
                let next = match *action {
                    Action::Shift(next) => next,
                    Action::Reduce(_) => continue,
                };
                if paths.contains_key(&next) {
                    continue;
                }
                let mut path = paths[&state].clone();
                match witnesses.get(&symbol) {
                    Some(expansion) => path.extend(expansion.iter().copied()),
                    None => path.push(symbol),
                }
                paths.insert(next, path);
                queue.push_back(next);
            }
        }
    }

    table
        .conflicts()
        .filter_map(|(state, symbol, _)| {
            let mut tokens = paths.get(&state)?.clone();
            tokens.push(symbol);
            Some(ConflictExample {
                state,
                symbol,
                tokens,
            })
        })
        .collect()
}

/// Shortest terminal expansion of every symbol, by fixed point over rule
/// lengths. Terminals expand to themselves; a nonterminal that derives no
/// terminal string gets no entry.
fn terminal_witnesses<V>(grammar: &Grammar<V>) -> Map<Symbol, Vec<Symbol>> {
    let mut out: Map<Symbol, Vec<Symbol>> = Map::default();
    for s in grammar.symbols_used() {
        if !grammar.is_nonterminal(s) {
            out.insert(s, vec![s]);
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for rule in grammar.rules() {
            let expansion: Option<Vec<Symbol>> = rule
                .rhs()
                .iter()
                .map(|s| out.get(s).cloned())
                .collect::<Option<Vec<_>>>()
                .map(|parts| parts.concat());
            let expansion = match expansion {
                Some(e) => e,
                None => continue,
            };
            match out.get(&rule.lhs()) {
                Some(best) if best.len() <= expansion.len() => {}
                _ => {
                    out.insert(rule.lhs(), expansion);
                    changed = true;
                }
            }
        }
    }

    out
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no combination of conflicted actions produces the expected tree")]
    AmbiguityUnresolved,
}

/// Example-driven conflict resolution: replays a token sequence against
/// every combination of conflicted choices in odometer order until the
/// parse result equals the expected tree, then locks the winning choices
/// into the table.
pub struct ConflictResolver<'g, V> {
    grammar: &'g Grammar<V>,
    table: &'g mut ActionTable,
}

impl<'g, V> ConflictResolver<'g, V>
where
    V: Clone + Default + PartialEq,
{
    pub fn new(grammar: &'g Grammar<V>, table: &'g mut ActionTable) -> Self {
        Self { grammar, table }
    }

    pub fn resolve(&mut self, tokens: &[Token<V>], expected: &V) -> Result<(), ResolveError> {
        let mut trials: Map<(usize, Symbol), usize> = Map::default();
        // Each replay is deterministic in the trial assignment, so seeing an
        // assignment a second time means the decision points drifted into a
        // cycle that no longer enumerates anything new.
        let mut seen: Set<Vec<((usize, Symbol), usize)>> = Set::default();
        let mut attempts = 0usize;
        loop {
            if !seen.insert(snapshot(&trials)) {
                tracing::debug!(attempts, "trial assignment revisited without a match");
                return Err(ResolveError::AmbiguityUnresolved);
            }
            attempts += 1;

            let (outcome, visits) = {
                let parser = Parser::new(self.grammar, &*self.table);
                let mut session = parser.session(SliceSource::new(tokens.to_vec()));
                session.set_trials(trials.clone());
                let outcome = session.run();
                let visits: Vec<(usize, Symbol)> = session.visited().collect();
                (outcome, visits)
            };

            // A replay that fails to parse is just a non-matching choice.
            if matches!(&outcome, Ok(datum) if datum == expected) {
                for &(state, symbol) in &visits {
                    let choice = trials.get(&(state, symbol)).copied().unwrap_or_else(|| {
                        self.table
                            .cell(state, symbol)
                            .map(|cell| cell.chosen_index())
                            .unwrap_or(0)
                    });
                    tracing::debug!(
                        state,
                        symbol = %self.grammar.display_symbol(symbol),
                        choice,
                        "locking conflicted cell"
                    );
                    self.table.lock(state, symbol, choice);
                }
                tracing::debug!(attempts, "ambiguity resolved");
                return Ok(());
            }

            // The odometer wrapping back to all-zero is the primary
            // exhaustion signal; the snapshot check above only catches
            // drifting decision sets that cycle without wrapping.
            if !advance(self.table, &mut trials, &visits) {
                return Err(ResolveError::AmbiguityUnresolved);
            }
        }
    }
}

/// A canonical, order-independent view of a trial assignment.
fn snapshot(trials: &Map<(usize, Symbol), usize>) -> Vec<((usize, Symbol), usize)> {
    let mut entries: Vec<_> = trials.iter().map(|(cell, choice)| (*cell, *choice)).collect();
    entries.sort();
    entries
}

/// Odometer step over the decisions of the last replay: increment the last
/// visited decision; on overflow reset it and carry into the previous one.
/// Returns false once every decision has wrapped around.
fn advance(
    table: &ActionTable,
    trials: &mut Map<(usize, Symbol), usize>,
    visits: &[(usize, Symbol)],
) -> bool {
    for &(state, symbol) in visits.iter().rev() {
        let arity = table
            .cell(state, symbol)
            .map(|cell| cell.candidates().len())
            .unwrap_or(1);
        let slot = trials.entry((state, symbol)).or_insert(0);
        *slot += 1;
        if *slot < arity {
            return true;
        }
        *slot = 0;
    }
    false
}
