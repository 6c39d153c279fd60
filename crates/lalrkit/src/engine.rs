//! The shift/reduce runtime.
//!
//! A parse drives a stack of `(state, symbol, value)` entries whose top
//! entry carries the pending lookahead. Reductions un-read that lookahead
//! into the token source (one level of pushback) so the reduced nonterminal
//! is re-examined against the uncovered state on the next turn.

use crate::grammar::{Grammar, Symbol};
use crate::parse_table::{Action, ActionTable};
use crate::util::{Map, Set};
use std::fmt::Write as _;

/// One unit of input: a symbol plus the value the parse associates with it.
#[derive(Debug, Clone)]
pub struct Token<V> {
    pub symbol: Symbol,
    pub value: V,
}

impl<V: Default> Token<V> {
    /// The end-of-input sentinel token.
    pub fn eoi() -> Self {
        Self {
            symbol: Symbol::EOI,
            value: V::default(),
        }
    }
}

/// A stream of tokens with exactly one level of pushback.
///
/// `back` un-reads the most recently read token; calling it twice without
/// an intervening `read` is a contract violation. A source never runs dry:
/// past its input it yields the end-of-input sentinel forever.
pub trait TokenSource<V> {
    /// Advance and return the token at the current position.
    fn read(&mut self) -> Token<V>;

    /// Return the token at the current position without consuming it.
    fn get(&mut self) -> Token<V>;

    /// Un-read the last token returned by [`read`](TokenSource::read).
    fn back(&mut self);
}

/// A source over pre-built tokens.
#[derive(Debug)]
pub struct SliceSource<V> {
    tokens: Vec<Token<V>>,
    pos: usize,
}

impl<V: Clone + Default> SliceSource<V> {
    pub fn new(tokens: Vec<Token<V>>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Tokenize a string against the grammar's character symbols. Characters
    /// the grammar never interned map to a dead symbol, failing the parse at
    /// that position.
    pub fn chars<G>(grammar: &Grammar<G>, input: &str, value: impl Fn(char) -> V) -> Self {
        let tokens = input
            .chars()
            .map(|c| Token {
                symbol: grammar.char_symbol(c).unwrap_or(Symbol::INVALID),
                value: value(c),
            })
            .collect();
        Self::new(tokens)
    }

    fn current(&self) -> Token<V> {
        self.tokens.get(self.pos).cloned().unwrap_or_else(Token::eoi)
    }
}

impl<V: Clone + Default> TokenSource<V> for SliceSource<V> {
    fn read(&mut self) -> Token<V> {
        let token = self.current();
        if self.pos <= self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn get(&mut self) -> Token<V> {
        self.current()
    }

    fn back(&mut self) {
        self.pos = self.pos.saturating_sub(1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no action for {symbol} in state {state} [stack: {trail}]")]
    UnexpectedSymbol {
        state: usize,
        symbol: String,
        trail: String,
    },
}

/// The outcome of one engine step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    Shifted,
    Reduced(usize),
    Done,
}

/// A parser handle: a normalized grammar plus its action table. Cheap to
/// copy; any number of sessions can run against one handle concurrently.
pub struct Parser<'g, V> {
    grammar: &'g Grammar<V>,
    table: &'g ActionTable,
}

impl<'g, V> Clone for Parser<'g, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, V> Copy for Parser<'g, V> {}

impl<'g, V: Clone + Default> Parser<'g, V> {
    pub fn new(grammar: &'g Grammar<V>, table: &'g ActionTable) -> Self {
        Self { grammar, table }
    }

    /// Start an incremental session over the given source.
    pub fn session<S>(&self, source: S) -> ParseSession<'g, V, S>
    where
        S: TokenSource<V>,
    {
        ParseSession::new(self.grammar, self.table, source)
    }

    /// Run the source to acceptance and return the derived value.
    pub fn parse<S>(&self, source: S) -> Result<V, ParseError>
    where
        S: TokenSource<V>,
    {
        self.session(source).run()
    }

    /// Whether the source is a sentence of the grammar.
    pub fn recognize<S>(&self, source: S) -> bool
    where
        S: TokenSource<V>,
    {
        self.parse(source).is_ok()
    }

    /// Parse until the source stops fitting the grammar, then substitute an
    /// exhausted sentinel source and keep reducing. Returns whether the
    /// consumed prefix completed into a sentence.
    pub fn parse_prefix<S>(&self, source: S) -> bool
    where
        S: TokenSource<V>,
    {
        let mut session = self.session(source);
        loop {
            match session.step() {
                Ok(Step::Done) => return true,
                Ok(_) => {}
                Err(err) => {
                    if session.recovered {
                        return false;
                    }
                    tracing::trace!(%err, "switching to the exhausted sentinel source");
                    session.recover();
                }
            }
        }
    }
}

#[derive(Debug)]
struct StackEntry<V> {
    state: usize,
    symbol: Symbol,
    value: V,
}

/// One in-flight parse: the value/state stack plus the source position.
pub struct ParseSession<'g, V, S> {
    grammar: &'g Grammar<V>,
    table: &'g ActionTable,
    source: S,
    stack: Vec<StackEntry<V>>,
    recovered: bool,
    /// Overrides for conflicted cells, used by trial replays.
    trials: Map<(usize, Symbol), usize>,
    /// Conflicted cells consulted by this parse, in first-visit order.
    visited: Set<(usize, Symbol)>,
}

impl<'g, V, S> ParseSession<'g, V, S>
where
    V: Clone + Default,
    S: TokenSource<V>,
{
    fn new(grammar: &'g Grammar<V>, table: &'g ActionTable, mut source: S) -> Self {
        let first = source.read();
        Self {
            grammar,
            table,
            source,
            stack: vec![StackEntry {
                state: 0,
                symbol: first.symbol,
                value: first.value,
            }],
            recovered: false,
            trials: Map::default(),
            visited: Set::default(),
        }
    }

    pub(crate) fn set_trials(&mut self, trials: Map<(usize, Symbol), usize>) {
        self.trials = trials;
    }

    pub(crate) fn visited(&self) -> impl Iterator<Item = (usize, Symbol)> + '_ {
        self.visited.iter().copied()
    }

    pub(crate) fn recovered(&self) -> bool {
        self.recovered
    }

    /// Replace the rest of the input with the exhausted sentinel, dropping
    /// the offending lookahead. The engine then only reduces and finishes,
    /// or fails for good.
    pub(crate) fn recover(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.symbol = Symbol::EOI;
            top.value = V::default();
        }
        self.recovered = true;
    }

    fn read(&mut self) -> Token<V> {
        if self.recovered {
            Token::eoi()
        } else {
            self.source.read()
        }
    }

    /// Perform one action. `Done` is sticky once the root nonterminal
    /// reaches the top of the stack.
    pub fn step(&mut self) -> Result<Step, ParseError> {
        let (state, symbol) = match self.stack.last() {
            Some(top) if top.symbol == Symbol::START => return Ok(Step::Done),
            Some(top) => (top.state, top.symbol),
            None => panic!("empty parse stack"),
        };

        let cell = match self.table.cell(state, symbol) {
            Some(cell) => cell,
            None => return Err(self.unexpected(state, symbol)),
        };

        let action = if cell.is_conflicted() {
            self.visited.insert((state, symbol));
            match self.trials.get(&(state, symbol)) {
                Some(&choice) => cell.candidates()[choice],
                None => cell.action(),
            }
        } else {
            cell.action()
        };

        match action {
            Action::Shift(next) => {
                tracing::trace!(
                    state,
                    symbol = %self.grammar.display_symbol(symbol),
                    next,
                    "shift"
                );
                let token = self.read();
                self.stack.push(StackEntry {
                    state: next,
                    symbol: token.symbol,
                    value: token.value,
                });
                Ok(Step::Shifted)
            }
            Action::Reduce(rule) => {
                self.reduce(rule);
                Ok(Step::Reduced(rule))
            }
        }
    }

    fn reduce(&mut self, index: usize) {
        let rule = self.grammar.rule(index);
        let arity = rule.rhs().len();
        assert!(arity > 0, "empty production reached the runtime");

        // Un-read the pending lookahead; it is re-examined after the goto.
        self.stack.pop();
        if !self.recovered {
            self.source.back();
        }

        assert!(self.stack.len() >= arity, "malformed stack during reduce");
        let split = self.stack.len() - arity;
        let popped: Vec<StackEntry<V>> = self.stack.drain(split..).collect();
        let next_state = popped[0].state;
        let passthrough = popped[0].value.clone();

        tracing::trace!(
            rule = index,
            lhs = %self.grammar.display_symbol(rule.lhs()),
            arity,
            next_state,
            "reduce"
        );

        // Restore the rule's original arity: elided positions see a default.
        let total = arity + rule.holes().len();
        let mut values: Vec<V> = Vec::with_capacity(total);
        let mut rest = popped.into_iter();
        for pos in 0..total {
            if rule.holes().contains(&pos) {
                values.push(V::default());
            } else {
                match rest.next() {
                    Some(entry) => values.push(entry.value),
                    None => panic!("malformed stack during reduce"),
                }
            }
        }

        let mut datum = passthrough;
        for action in rule.actions() {
            datum = action(&values);
        }

        self.stack.push(StackEntry {
            state: next_state,
            symbol: rule.lhs(),
            value: datum,
        });
    }

    /// Drive the session to acceptance and return the derived value.
    pub fn run(&mut self) -> Result<V, ParseError> {
        loop {
            if let Step::Done = self.step()? {
                let top = match self.stack.pop() {
                    Some(top) => top,
                    None => panic!("empty parse stack"),
                };
                return Ok(top.value);
            }
        }
    }

    fn unexpected(&self, state: usize, symbol: Symbol) -> ParseError {
        let mut trail = String::new();
        for entry in &self.stack {
            let _ = write!(trail, " {}", self.grammar.display_symbol(entry.symbol));
        }
        ParseError::UnexpectedSymbol {
            state,
            symbol: self.grammar.display_symbol(symbol).to_string(),
            trail: trail.trim_start().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_table::build;

    fn zeros() -> (Grammar<()>, ActionTable) {
        let mut g = Grammar::new();
        let (s, zero) = (g.sym("S"), g.sym_char('0'));
        g.set_start(s);
        g.add_rule(s, vec![]).unwrap();
        g.add_rule(s, vec![s, zero]).unwrap();
        let table = build(&mut g).unwrap();
        (g, table)
    }

    #[test]
    fn accepts_the_empty_input() {
        let (g, table) = zeros();
        let parser = Parser::new(&g, &table);
        assert!(parser.recognize(SliceSource::chars(&g, "", |_| ())));
    }

    #[test]
    fn accepts_any_run_of_zeros() {
        let (g, table) = zeros();
        let parser = Parser::new(&g, &table);
        for input in ["0", "00", "0000000"] {
            assert!(parser.recognize(SliceSource::chars(&g, input, |_| ())), "{input:?}");
        }
    }

    #[test]
    fn rejects_foreign_characters() {
        let (g, table) = zeros();
        let parser = Parser::new(&g, &table);
        for input in ["1", "01", "0a0", " "] {
            assert!(!parser.recognize(SliceSource::chars(&g, input, |_| ())), "{input:?}");
        }
    }

    #[test]
    fn unexpected_symbol_reports_the_stack_trail() {
        let mut g = Grammar::<()>::new();
        let (s, a, b) = (g.sym("S"), g.sym_char('a'), g.sym_char('b'));
        g.set_start(s);
        g.add_rule(s, vec![a, b]).unwrap();
        let table = build(&mut g).unwrap();
        let parser = Parser::new(&g, &table);

        let err = parser
            .parse(SliceSource::chars(&g, "aa", |_| ()))
            .unwrap_err();
        let ParseError::UnexpectedSymbol { symbol, trail, .. } = err;
        assert_eq!(symbol, "'a'");
        assert!(trail.contains("'a'"));
    }

    #[test]
    fn pushback_source_restores_the_last_token() {
        let g = {
            let mut g = Grammar::<()>::new();
            g.sym_char('x');
            g
        };
        let mut source = SliceSource::chars(&g, "x", |_| ());
        let first = source.read();
        source.back();
        assert_eq!(source.read().symbol, first.symbol);
        assert_eq!(source.read().symbol, Symbol::EOI);
        source.back();
        assert_eq!(source.read().symbol, Symbol::EOI);
    }

    #[test]
    fn prefix_parse_completes_a_broken_tail() {
        let mut g = Grammar::<()>::new();
        let (n, d) = (g.sym("N"), g.sym_char('7'));
        g.set_start(n);
        g.add_rule(n, vec![d]).unwrap();
        g.add_rule(n, vec![n, d]).unwrap();
        let table = build(&mut g).unwrap();
        let parser = Parser::new(&g, &table);

        // The space stops the parse; the consumed prefix still reduces.
        assert!(parser.parse_prefix(SliceSource::chars(&g, "77 7", |_| ())));
        assert!(!parser.parse_prefix(SliceSource::chars(&g, " 77", |_| ())));
    }

    #[test]
    fn reduction_actions_see_original_arity() {
        use std::cell::Cell as StdCell;
        use std::rc::Rc;

        #[derive(Debug, Clone, Default, PartialEq)]
        struct Datum(i32);

        let mut g = Grammar::<Datum>::new();
        let (s, opt, a, b) = (g.sym("S"), g.sym("Opt"), g.sym_char('a'), g.sym_char('b'));
        g.set_start(s);
        let top = g.add_rule(s, vec![a, opt, b]).unwrap();
        g.add_rule(opt, vec![]).unwrap();
        g.add_rule(opt, vec![a]).unwrap();

        let seen = Rc::new(StdCell::new(0));
        let seen_in = seen.clone();
        g.add_action(top, move |values| {
            seen_in.set(values.len() as i32);
            Datum(values.len() as i32)
        })
        .unwrap();

        let table = build(&mut g).unwrap();
        let parser = Parser::new(&g, &table);

        // "ab" exercises the elided variant; the action still sees 3 slots.
        let datum = parser
            .parse(SliceSource::chars(&g, "ab", |_| Datum(0)))
            .unwrap();
        assert_eq!(datum, Datum(3));
        assert_eq!(seen.get(), 3);
    }
}
