//! Grammar model: interned symbols, production rules and their reduction
//! actions, priority/associativity registries, and epsilon normalization.

use crate::first_sets::FirstSets;
use crate::util::{display_fn, Map, Set};
use std::{cell::RefCell, collections::BTreeSet, fmt, rc::Rc};

/// An interned grammar symbol.
///
/// There is no intrinsic terminal/nonterminal distinction; a symbol is a
/// nonterminal iff it appears as the left-hand side of some rule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Symbol {
    raw: u32,
}

impl Symbol {
    /// The synthetic root nonterminal; the left-hand side of rule 0.
    pub const START: Self = Self::new(0);

    /// The sentinel terminal appended to every token stream.
    pub const EOI: Self = Self::new(1);

    /// A symbol no grammar ever interns. Character sources map input the
    /// grammar does not know onto it, so lookup fails at the offending
    /// position instead of truncating the stream.
    pub(crate) const INVALID: Self = Self::new(u32::MAX);

    const OFFSET: u32 = 2;

    #[inline]
    const fn new(raw: u32) -> Self {
        Self { raw }
    }
}

/// The value a [`Symbol`] was interned from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolValue {
    Char(char),
    Name(String),
    Synthetic(u32),
}

#[derive(Debug, Default)]
struct SymbolTable {
    ids: Map<SymbolValue, Symbol>,
    values: Vec<SymbolValue>,
    next_synthetic: u32,
}

impl SymbolTable {
    fn intern(&mut self, value: SymbolValue) -> Symbol {
        if let Some(&id) = self.ids.get(&value) {
            return id;
        }
        let id = Symbol::new(Symbol::OFFSET + self.values.len() as u32);
        self.values.push(value.clone());
        self.ids.insert(value, id);
        id
    }

    fn fresh(&mut self) -> Symbol {
        let n = self.next_synthetic;
        self.next_synthetic += 1;
        self.intern(SymbolValue::Synthetic(n))
    }

    fn value(&self, id: Symbol) -> Option<&SymbolValue> {
        self.values.get(id.raw.checked_sub(Symbol::OFFSET)? as usize)
    }
}

/// Associativity of a terminal symbol, consulted when two equal-priority
/// actions collide in one action-table cell.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

impl fmt::Display for Assoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

/// A reduction callback: receives the data popped for the rule's right-hand
/// side (with defaults filled in at elided positions) and produces the datum
/// associated with the reduced nonterminal.
pub type ReduceFn<V> = Rc<dyn Fn(&[V]) -> V>;

/// A production rule.
pub struct Rule<V> {
    lhs: Symbol,
    rhs: Vec<Symbol>,
    actions: Vec<ReduceFn<V>>,
    /// Rule index this one was synthesized from during epsilon elimination.
    origin: Option<usize>,
    /// Positions of the origin's right-hand side that were elided because
    /// the symbol there was nullable. Coordinates refer to the origin rhs.
    holes: BTreeSet<usize>,
}

impl<V> Rule<V> {
    pub fn lhs(&self) -> Symbol {
        self.lhs
    }

    pub fn rhs(&self) -> &[Symbol] {
        &self.rhs
    }

    pub fn actions(&self) -> &[ReduceFn<V>] {
        &self.actions
    }

    pub fn holes(&self) -> &BTreeSet<usize> {
        &self.holes
    }

    /// Map a position in the current rhs back to the origin's coordinates,
    /// skipping over elided positions.
    fn original_pos(&self, pos: usize) -> usize {
        let total = self.rhs.len() + self.holes.len();
        let mut cur = 0;
        for orig in 0..total {
            if self.holes.contains(&orig) {
                continue;
            }
            if cur == pos {
                return orig;
            }
            cur += 1;
        }
        unreachable!("position out of range of the original right-hand side")
    }
}

/// Errors raised at grammar-authoring time; the `InvalidGrammar` class of
/// the error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("the end-of-input sentinel cannot be used as a left-hand side")]
    EoiAsLeftHandSide,

    #[error("rule {0} does not exist")]
    UnknownRule(usize),

    #[error("the root rule cannot be removed")]
    RootNotRemovable,

    #[error("the grammar has no rules")]
    EmptyGrammar,
}

/// A context-free grammar, generic over the derived value type `V` produced
/// by reduction actions.
///
/// The grammar is mutable while rules are being registered and becomes
/// logically frozen once a closure table is derived from it. The nullable
/// and FIRST analyses are cached and lazily recomputed after rule edits.
pub struct Grammar<V> {
    symbols: SymbolTable,
    rules: Vec<Rule<V>>,
    start: Option<Symbol>,
    assoc: Map<Symbol, Assoc>,
    priorities: Map<Symbol, u16>,
    analysis: RefCell<Option<Rc<FirstSets>>>,
}

impl<V> Default for Grammar<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Grammar<V> {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::default(),
            rules: Vec::new(),
            start: None,
            assoc: Map::default(),
            priorities: Map::default(),
            analysis: RefCell::new(None),
        }
    }

    // --- symbols ---

    /// Intern a character symbol.
    pub fn sym_char(&mut self, c: char) -> Symbol {
        self.symbols.intern(SymbolValue::Char(c))
    }

    /// Look up an already interned character symbol without interning.
    /// Used by token sources once the grammar is frozen.
    pub fn char_symbol(&self, c: char) -> Option<Symbol> {
        self.symbols.ids.get(&SymbolValue::Char(c)).copied()
    }

    /// Intern a named symbol.
    pub fn sym(&mut self, name: &str) -> Symbol {
        self.symbols.intern(SymbolValue::Name(name.to_owned()))
    }

    /// Create a fresh synthetic symbol, unused by any other rule.
    pub fn fresh_symbol(&mut self) -> Symbol {
        self.symbols.fresh()
    }

    pub fn symbol_value(&self, s: Symbol) -> Option<&SymbolValue> {
        self.symbols.value(s)
    }

    pub fn display_symbol(&self, s: Symbol) -> impl fmt::Display + '_ {
        display_fn(move |f| match s {
            Symbol::START => f.write_str("$start"),
            Symbol::EOI => f.write_str("$eoi"),
            _ => match self.symbols.value(s) {
                Some(SymbolValue::Char(c)) => write!(f, "'{}'", c),
                Some(SymbolValue::Name(name)) => f.write_str(name),
                Some(SymbolValue::Synthetic(n)) => write!(f, "$s{}", n),
                None => f.write_str("<unknown>"),
            },
        })
    }

    /// A symbol is a nonterminal iff it occurs as some rule's left-hand side.
    pub fn is_nonterminal(&self, s: Symbol) -> bool {
        self.rules.iter().any(|r| r.lhs == s)
    }

    /// Every symbol mentioned by the grammar, plus the reserved ones.
    pub(crate) fn symbols_used(&self) -> Set<Symbol> {
        let mut out: Set<Symbol> = [Symbol::START, Symbol::EOI].into_iter().collect();
        for rule in &self.rules {
            out.insert(rule.lhs);
            out.extend(rule.rhs.iter().copied());
        }
        out
    }

    // --- rules ---

    pub fn rules(&self) -> &[Rule<V>] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> &Rule<V> {
        &self.rules[index]
    }

    /// Register a production rule, returning its index.
    ///
    /// An identical `(lhs, rhs)` pair is deduplicated: the existing index is
    /// returned and, when both registrations stem from the same origin,
    /// their elision metadata is merged. A duplicate that cannot be merged
    /// is an ambiguity in the grammar and is logged, not raised.
    pub fn add_rule(&mut self, lhs: Symbol, rhs: Vec<Symbol>) -> Result<usize, GrammarError> {
        self.insert_rule(lhs, rhs, Vec::new(), None, BTreeSet::new())
            .map(|(index, _)| index)
    }

    fn insert_rule(
        &mut self,
        lhs: Symbol,
        rhs: Vec<Symbol>,
        actions: Vec<ReduceFn<V>>,
        origin: Option<usize>,
        holes: BTreeSet<usize>,
    ) -> Result<(usize, bool), GrammarError> {
        if lhs == Symbol::EOI {
            return Err(GrammarError::EoiAsLeftHandSide);
        }

        if let Some(index) = self
            .rules
            .iter()
            .position(|r| r.lhs == lhs && r.rhs == rhs)
        {
            let existing = &mut self.rules[index];
            if existing.origin == origin {
                existing.holes.extend(holes);
            } else {
                tracing::warn!(
                    rule = %display_rule(&self.symbols, lhs, &rhs),
                    "duplicate production with diverging provenance; keeping the first"
                );
            }
            return Ok((index, false));
        }

        self.rules.push(Rule {
            lhs,
            rhs,
            actions,
            origin,
            holes,
        });
        self.analysis.replace(None);
        Ok((self.rules.len() - 1, true))
    }

    /// Remove a rule. All later rule indices shift down by one.
    pub fn remove_rule(&mut self, index: usize) -> Result<(), GrammarError> {
        if index >= self.rules.len() {
            return Err(GrammarError::UnknownRule(index));
        }
        if index == 0 && self.rules[0].lhs == Symbol::START {
            return Err(GrammarError::RootNotRemovable);
        }
        self.rules.remove(index);
        self.analysis.replace(None);
        Ok(())
    }

    /// Attach a reduction action to a rule. Actions run in registration
    /// order when the rule fires; the last action's value becomes the datum.
    ///
    /// Actions must be registered before the grammar is normalized, so that
    /// rules synthesized by epsilon elimination inherit them.
    pub fn add_action<F>(&mut self, rule: usize, f: F) -> Result<(), GrammarError>
    where
        F: Fn(&[V]) -> V + 'static,
    {
        self.rules
            .get_mut(rule)
            .ok_or(GrammarError::UnknownRule(rule))?
            .actions
            .push(Rc::new(f));
        Ok(())
    }

    /// Specify the start symbol. Without it, the left-hand side of the first
    /// registered rule is used.
    pub fn set_start(&mut self, symbol: Symbol) {
        self.start = Some(symbol);
    }

    // --- priority / associativity ---

    pub fn set_priority(&mut self, symbol: Symbol, priority: u16) {
        self.priorities.insert(symbol, priority);
    }

    pub fn set_assoc(&mut self, symbol: Symbol, assoc: Assoc) {
        self.assoc.insert(symbol, assoc);
    }

    pub fn priority(&self, symbol: Symbol) -> Option<u16> {
        self.priorities.get(&symbol).copied()
    }

    pub fn assoc(&self, symbol: Symbol) -> Option<Assoc> {
        self.assoc.get(&symbol).copied()
    }

    /// A rule's priority: the highest priority among its rhs terminals.
    pub fn rule_priority(&self, index: usize) -> Option<u16> {
        self.rules[index]
            .rhs
            .iter()
            .filter(|s| !self.is_nonterminal(**s))
            .filter_map(|s| self.priority(*s))
            .max()
    }

    // --- derived analyses ---

    pub(crate) fn first_sets(&self) -> Rc<FirstSets> {
        let mut slot = self.analysis.borrow_mut();
        slot.get_or_insert_with(|| Rc::new(FirstSets::new(self)))
            .clone()
    }

    /// Whether the symbol can derive the empty sequence.
    pub fn is_nullable(&self, symbol: Symbol) -> bool {
        self.first_sets().is_nullable(symbol)
    }

    /// The set of terminals that can begin a derivation of the symbol.
    pub fn first_set(&self, symbol: Symbol) -> Set<Symbol> {
        self.first_sets()
            .first(symbol)
            .cloned()
            .unwrap_or_else(|| std::iter::once(symbol).collect())
    }

    /// FIRST of a sequence: accumulation stops at the first non-nullable
    /// element, inclusive.
    pub fn first_set_of_sequence(&self, symbols: &[Symbol]) -> Set<Symbol> {
        self.first_sets().first_of_sequence(symbols).0
    }

    // --- regex-style sugar ---

    /// `A -> alt | alt | ...` for a fresh nonterminal `A`.
    pub fn union(&mut self, alternatives: &[&[Symbol]]) -> Result<Symbol, GrammarError> {
        let s = self.fresh_symbol();
        for alt in alternatives {
            self.add_rule(s, alt.to_vec())?;
        }
        Ok(s)
    }

    /// `A -> s1 s2 ...` for a fresh nonterminal `A`.
    pub fn seq(&mut self, symbols: &[Symbol]) -> Result<Symbol, GrammarError> {
        let s = self.fresh_symbol();
        self.add_rule(s, symbols.to_vec())?;
        Ok(s)
    }

    /// `A -> | A x` for a fresh nonterminal `A`.
    pub fn zero_or_more(&mut self, symbol: Symbol) -> Result<Symbol, GrammarError> {
        let s = self.fresh_symbol();
        self.add_rule(s, vec![])?;
        self.add_rule(s, vec![s, symbol])?;
        Ok(s)
    }

    /// `A -> x | A x` for a fresh nonterminal `A`.
    pub fn one_or_more(&mut self, symbol: Symbol) -> Result<Symbol, GrammarError> {
        let s = self.fresh_symbol();
        self.add_rule(s, vec![symbol])?;
        self.add_rule(s, vec![s, symbol])?;
        Ok(s)
    }

    /// `A -> | x` for a fresh nonterminal `A`.
    pub fn optional(&mut self, symbol: Symbol) -> Result<Symbol, GrammarError> {
        let s = self.fresh_symbol();
        self.add_rule(s, vec![])?;
        self.add_rule(s, vec![symbol])?;
        Ok(s)
    }

    // --- normalization ---

    /// Prepare the grammar for automaton construction: install the single
    /// root rule `$start -> start $eoi` at index 0 and eliminate nullable
    /// productions by synthesizing elided rule variants.
    pub fn normalize(&mut self) -> Result<(), GrammarError> {
        self.normalize_root()?;
        self.eliminate_epsilon();
        Ok(())
    }

    fn normalize_root(&mut self) -> Result<(), GrammarError> {
        let roots: Vec<usize> = (0..self.rules.len())
            .filter(|&i| self.rules[i].lhs == Symbol::START)
            .collect();

        match roots.len() {
            0 => {
                let start = self
                    .start
                    .or_else(|| self.rules.first().map(|r| r.lhs))
                    .ok_or(GrammarError::EmptyGrammar)?;
                self.rules.insert(
                    0,
                    Rule {
                        lhs: Symbol::START,
                        rhs: vec![start, Symbol::EOI],
                        actions: Vec::new(),
                        origin: None,
                        holes: BTreeSet::new(),
                    },
                );
            }
            1 => {
                let index = roots[0];
                let mut root = self.rules.remove(index);
                if root.rhs.last() != Some(&Symbol::EOI) {
                    root.rhs.push(Symbol::EOI);
                }
                self.rules.insert(0, root);
            }
            _ => {
                // Several root productions: rewire them through a fresh
                // auxiliary nonterminal so that exactly one root remains.
                let aux = self.fresh_symbol();
                for &i in &roots {
                    self.rules[i].lhs = aux;
                }
                self.rules.insert(
                    0,
                    Rule {
                        lhs: Symbol::START,
                        rhs: vec![aux, Symbol::EOI],
                        actions: Vec::new(),
                        origin: None,
                        holes: BTreeSet::new(),
                    },
                );
            }
        }

        self.analysis.replace(None);
        Ok(())
    }

    /// For every rule whose rhs contains a nullable nonterminal, synthesize
    /// the variants in which that occurrence contributes nothing; then drop
    /// rules whose rhs became entirely empty. Runs to a fixed point.
    fn eliminate_epsilon(&mut self) {
        loop {
            let first_sets = self.first_sets();
            let mut variants = Vec::new();

            for (i, rule) in self.rules.iter().enumerate() {
                for (pos, &s) in rule.rhs.iter().enumerate() {
                    if !first_sets.is_nullable(s) {
                        continue;
                    }
                    let mut rhs = rule.rhs.clone();
                    rhs.remove(pos);
                    let mut holes = rule.holes.clone();
                    holes.insert(rule.original_pos(pos));
                    variants.push((
                        rule.lhs,
                        rhs,
                        rule.actions.clone(),
                        Some(rule.origin.unwrap_or(i)),
                        holes,
                    ));
                }
            }

            let mut grew = false;
            for (lhs, rhs, actions, origin, holes) in variants {
                // lhs is never EOI here; ignore the impossible error
                if let Ok((_, added)) = self.insert_rule(lhs, rhs, actions, origin, holes) {
                    grew |= added;
                }
            }
            if !grew {
                break;
            }
        }

        self.drop_degenerate_rules();

        for rule in &mut self.rules {
            rule.origin = None;
        }
        self.analysis.replace(None);
    }

    fn drop_degenerate_rules(&mut self) {
        let was_nonterminal: Set<Symbol> = self.rules.iter().map(|r| r.lhs).collect();

        let mut kept = Vec::with_capacity(self.rules.len());
        for rule in self.rules.drain(..) {
            if rule.rhs.is_empty() {
                // Covered by the elided variants of every use site.
                continue;
            }
            if rule.rhs.len() == 1 && rule.rhs[0] == rule.lhs {
                // A unit self-cycle left behind by elision would reduce
                // forever without consuming input.
                tracing::warn!(
                    rule = %display_rule(&self.symbols, rule.lhs, &rule.rhs),
                    "dropping self-cycle production left by epsilon elimination"
                );
                continue;
            }
            kept.push(rule);
        }
        self.rules = kept;

        // A nonterminal whose productions were all dropped can no longer
        // derive anything; rules still mentioning it are unusable.
        loop {
            let live: Set<Symbol> = self.rules.iter().map(|r| r.lhs).collect();
            let before = self.rules.len();
            self.rules.retain(|r| {
                r.rhs
                    .iter()
                    .all(|s| !was_nonterminal.contains(s) || live.contains(s))
            });
            if self.rules.len() == before {
                break;
            }
        }
    }
}

fn display_rule<'a>(
    symbols: &'a SymbolTable,
    lhs: Symbol,
    rhs: &'a [Symbol],
) -> impl fmt::Display + 'a {
    display_fn(move |f| {
        write!(f, "{} :=", symbol_name(symbols, lhs))?;
        for s in rhs {
            write!(f, " {}", symbol_name(symbols, *s))?;
        }
        Ok(())
    })
}

fn symbol_name<'a>(symbols: &'a SymbolTable, s: Symbol) -> impl fmt::Display + 'a {
    display_fn(move |f| match s {
        Symbol::START => f.write_str("$start"),
        Symbol::EOI => f.write_str("$eoi"),
        _ => match symbols.value(s) {
            Some(SymbolValue::Char(c)) => write!(f, "'{}'", c),
            Some(SymbolValue::Name(name)) => f.write_str(name),
            Some(SymbolValue::Synthetic(n)) => write!(f, "$s{}", n),
            None => f.write_str("<unknown>"),
        },
    })
}

impl<V> fmt::Display for Grammar<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "## rules:")?;
        for (i, rule) in self.rules.iter().enumerate() {
            write!(f, "{:3}: {}", i, display_rule(&self.symbols, rule.lhs, &rule.rhs))?;
            if !rule.holes.is_empty() {
                write!(f, " (elided: {:?})", rule.holes)?;
            }
            writeln!(f)?;
        }
        if !self.priorities.is_empty() || !self.assoc.is_empty() {
            writeln!(f, "\n## terminals:")?;
            for s in self.symbols_used() {
                let (prio, assoc) = (self.priority(s), self.assoc(s));
                if prio.is_none() && assoc.is_none() {
                    continue;
                }
                write!(f, "{}", symbol_name(&self.symbols, s))?;
                if let Some(p) = prio {
                    write!(f, " (priority={})", p)?;
                }
                if let Some(a) = assoc {
                    write!(f, " (assoc={})", a)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
