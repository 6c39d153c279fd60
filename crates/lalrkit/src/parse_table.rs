//! Action-table construction with build-time conflict resolution.
//!
//! Every `(state, symbol)` cell keeps the full candidate list in discovery
//! order (reduces first, then the shift); resolution only moves the `chosen`
//! index. Unresolved cells stay queryable for the ambiguity resolver.

use crate::dfa::ClosureTable;
use crate::grammar::{Assoc, Grammar, GrammarError, Symbol};
use crate::util::{display_fn, Map};
use std::{cmp::Ordering, fmt};

/// A parser action: consume the next symbol, or collapse a recognized
/// right-hand side into its rule's left-hand nonterminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    Shift(usize),
    Reduce(usize),
}

/// One `(state, symbol)` cell of the action table.
#[derive(Debug)]
pub struct Cell {
    candidates: Vec<Action>,
    chosen: usize,
    unresolved: bool,
}

impl Cell {
    fn new(action: Action) -> Self {
        Self {
            candidates: vec![action],
            chosen: 0,
            unresolved: false,
        }
    }

    /// The action a deterministic parse takes.
    pub fn action(&self) -> Action {
        self.candidates[self.chosen]
    }

    pub fn candidates(&self) -> &[Action] {
        &self.candidates
    }

    /// Index of the chosen action within [`candidates`](Cell::candidates).
    pub fn chosen_index(&self) -> usize {
        self.chosen
    }

    /// Whether priority/associativity failed to collapse this cell.
    pub fn is_conflicted(&self) -> bool {
        self.unresolved
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error("{count} action-table cells hold unresolved conflicts")]
    UnresolvedConflict { count: usize },
}

/// The per-state, per-symbol action table derived from a closure table.
///
/// Immutable once built (the ambiguity resolver may still lock a winning
/// candidate into a conflicted cell); shared read-only by any number of
/// engines.
#[derive(Debug)]
pub struct ActionTable {
    states: Vec<Map<Symbol, Cell>>,
}

impl ActionTable {
    /// Build the table, resolving conflicts by priority then associativity.
    /// Unresolved conflicts are logged and deterministically resolved to the
    /// earliest-discovered action; they remain visible via [`conflicts`].
    ///
    /// [`conflicts`]: ActionTable::conflicts
    pub fn generate<V>(grammar: &Grammar<V>, closures: &ClosureTable) -> Self {
        let mut states = Vec::with_capacity(closures.len());

        for (id, node) in closures.nodes() {
            let mut cells: Map<Symbol, Cell> = Map::default();

            // Reduces enter first so that "left-associative keeps the
            // existing action" groups to the left.
            for (core, lookaheads) in node.items() {
                if core.cursor() < grammar.rule(core.rule()).rhs().len() {
                    continue;
                }
                for &la in lookaheads.iter() {
                    insert_action(grammar, &mut cells, id.index(), la, Action::Reduce(core.rule()));
                }
            }

            for (label, target) in node.edges() {
                insert_action(
                    grammar,
                    &mut cells,
                    id.index(),
                    label,
                    Action::Shift(target.index()),
                );
            }

            states.push(cells);
        }

        Self { states }
    }

    /// Like [`generate`](ActionTable::generate), but unresolved conflicts
    /// are a hard error.
    pub fn generate_strict<V>(
        grammar: &Grammar<V>,
        closures: &ClosureTable,
    ) -> Result<Self, BuildError> {
        let table = Self::generate(grammar, closures);
        let count = table.conflicts().count();
        if count > 0 {
            return Err(BuildError::UnresolvedConflict { count });
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn cell(&self, state: usize, symbol: Symbol) -> Option<&Cell> {
        self.states.get(state)?.get(&symbol)
    }

    pub fn cells(&self, state: usize) -> impl Iterator<Item = (Symbol, &Cell)> + '_ {
        self.states[state].iter().map(|(s, c)| (*s, c))
    }

    /// Every cell still holding an unresolved conflict.
    pub fn conflicts(&self) -> impl Iterator<Item = (usize, Symbol, &Cell)> + '_ {
        self.states.iter().enumerate().flat_map(|(state, cells)| {
            cells
                .iter()
                .filter(|(_, cell)| cell.unresolved)
                .map(move |(symbol, cell)| (state, *symbol, cell))
        })
    }

    /// Pin a conflicted cell to one of its candidates. Subsequent parses
    /// deterministically take the locked action.
    pub(crate) fn lock(&mut self, state: usize, symbol: Symbol, candidate: usize) {
        let cell = self.states[state]
            .get_mut(&symbol)
            .unwrap_or_else(|| panic!("no cell to lock at state {}", state));
        debug_assert!(candidate < cell.candidates.len());
        cell.chosen = candidate;
        cell.unresolved = false;
    }

    pub fn display<'a, V>(&'a self, grammar: &'a Grammar<V>) -> impl fmt::Display + 'a {
        display_fn(move |f| {
            for (state, cells) in self.states.iter().enumerate() {
                writeln!(f, "- state: {:02}", state)?;
                for (symbol, cell) in cells {
                    write!(f, "  {} => ", grammar.display_symbol(*symbol))?;
                    match cell.action() {
                        Action::Shift(next) => write!(f, "shift({:02})", next)?,
                        Action::Reduce(rule) => write!(f, "reduce({})", rule)?,
                    }
                    if cell.candidates.len() > 1 {
                        write!(f, " (of {} candidates", cell.candidates.len())?;
                        if cell.unresolved {
                            f.write_str(", unresolved")?;
                        }
                        f.write_str(")")?;
                    }
                    writeln!(f)?;
                }
            }
            Ok(())
        })
    }
}

/// Push an action into a cell, resolving against the currently chosen one.
fn insert_action<V>(
    grammar: &Grammar<V>,
    cells: &mut Map<Symbol, Cell>,
    state: usize,
    symbol: Symbol,
    incoming: Action,
) {
    let cell = match cells.entry(symbol) {
        indexmap::map::Entry::Vacant(entry) => {
            entry.insert(Cell::new(incoming));
            return;
        }
        indexmap::map::Entry::Occupied(entry) => entry.into_mut(),
    };

    if matches!(incoming, Action::Shift(_))
        && cell.candidates.iter().any(|a| matches!(a, Action::Shift(_)))
    {
        // Kernel merging guarantees one outgoing edge per symbol.
        panic!(
            "shift/shift collision at state {} on {}",
            state,
            grammar.display_symbol(symbol)
        );
    }

    let existing = cell.action();
    cell.candidates.push(incoming);
    let incoming_index = cell.candidates.len() - 1;

    match resolve_conflict(grammar, symbol, existing, incoming) {
        Resolution::Existing => {}
        Resolution::Incoming => cell.chosen = incoming_index,
        Resolution::Unresolved => {
            tracing::warn!(
                state,
                symbol = %grammar.display_symbol(symbol),
                existing = ?existing,
                incoming = ?incoming,
                "unresolved conflict; keeping the earlier action"
            );
            cell.unresolved = true;
        }
    }
}

enum Resolution {
    Existing,
    Incoming,
    Unresolved,
}

fn resolve_conflict<V>(
    grammar: &Grammar<V>,
    symbol: Symbol,
    existing: Action,
    incoming: Action,
) -> Resolution {
    let priority = |action: Action| match action {
        Action::Shift(_) => grammar.priority(symbol),
        Action::Reduce(rule) => grammar.rule_priority(rule),
    };

    if let (Some(old), Some(new)) = (priority(existing), priority(incoming)) {
        match Ord::cmp(&new, &old) {
            Ordering::Greater => return Resolution::Incoming,
            Ordering::Less => return Resolution::Existing,
            Ordering::Equal => {}
        }
    }

    match grammar.assoc(symbol) {
        Some(Assoc::Left) => Resolution::Existing,
        Some(Assoc::Right) => Resolution::Incoming,
        None => Resolution::Unresolved,
    }
}

/// Normalize the grammar and build its action table in one step.
pub fn build<V>(grammar: &mut Grammar<V>) -> Result<ActionTable, GrammarError> {
    grammar.normalize()?;
    let closures = ClosureTable::generate(grammar);
    Ok(ActionTable::generate(grammar, &closures))
}

/// Strict variant of [`build`]: any unresolved conflict fails the build.
pub fn build_strict<V>(grammar: &mut Grammar<V>) -> Result<ActionTable, BuildError> {
    grammar.normalize()?;
    let closures = ClosureTable::generate(grammar);
    ActionTable::generate_strict(grammar, &closures)
}
