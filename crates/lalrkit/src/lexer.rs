//! Lexer-over-parser composition.
//!
//! A lexer is an ordinary parse session over characters whose reduction
//! actions emit higher-level tokens into a one-slot mailbox. Wrapping that
//! session behind [`TokenSource`] lets an outer parser pull tokens on
//! demand, stepping the inner engine exactly as far as needed.

use crate::engine::{ParseSession, Parser, Step, Token, TokenSource};
use std::{cell::RefCell, rc::Rc};

/// A one-slot channel between the inner grammar's reduction actions and the
/// enclosing [`Lexer`]. Clone the handle into every emitting action.
#[derive(Debug)]
pub struct Mailbox<V> {
    slot: Rc<RefCell<Option<Token<V>>>>,
}

impl<V> Clone for Mailbox<V> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<V> Default for Mailbox<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Mailbox<V> {
    pub fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
        }
    }

    /// Deposit a token. The lexer drains the slot after every engine step,
    /// so an occupied slot means two emissions in one reduction chain; the
    /// earlier token would be lost and is worth a warning.
    pub fn post(&self, token: Token<V>) {
        if self.slot.borrow().is_some() {
            tracing::warn!("mailbox overwritten before the previous token was consumed");
        }
        self.slot.replace(Some(token));
    }

    fn take(&self) -> Option<Token<V>> {
        self.slot.replace(None)
    }
}

/// A token source produced by running a character-level parser underneath.
///
/// `A` is the inner parse's datum type (typically an accumulated lexeme);
/// `V` is the value type of the emitted tokens.
pub struct Lexer<'g, A, V, S> {
    session: ParseSession<'g, A, S>,
    mailbox: Mailbox<V>,
    last: Option<Token<V>>,
    pushed_back: bool,
    done: bool,
}

impl<'g, A, V, S> Lexer<'g, A, V, S>
where
    A: Clone + Default,
    V: Clone + Default,
    S: TokenSource<A>,
{
    /// Wrap an inner parser whose reduction actions post into `mailbox`.
    pub fn new(inner: Parser<'g, A>, source: S, mailbox: Mailbox<V>) -> Self {
        Self {
            session: inner.session(source),
            mailbox,
            last: None,
            pushed_back: false,
            done: false,
        }
    }
}

impl<'g, A, V, S> TokenSource<V> for Lexer<'g, A, V, S>
where
    A: Clone + Default,
    V: Clone + Default,
    S: TokenSource<A>,
{
    fn read(&mut self) -> Token<V> {
        if self.pushed_back {
            self.pushed_back = false;
            if let Some(token) = &self.last {
                return token.clone();
            }
        }

        loop {
            if let Some(token) = self.mailbox.take() {
                self.last = Some(token.clone());
                return token;
            }
            if self.done {
                let token = Token::eoi();
                self.last = Some(token.clone());
                return token;
            }
            match self.session.step() {
                Ok(Step::Done) => self.done = true,
                Ok(_) => {}
                Err(err) => {
                    if self.session.recovered() {
                        // A TokenSource cannot fail; pin the stream at EOI.
                        tracing::warn!(%err, "token stream stopped on unrecoverable input");
                        self.done = true;
                    } else {
                        tracing::trace!(%err, "flushing the final token");
                        self.session.recover();
                    }
                }
            }
        }
    }

    fn get(&mut self) -> Token<V> {
        let token = self.read();
        self.pushed_back = true;
        token
    }

    fn back(&mut self) {
        self.pushed_back = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SliceSource;
    use crate::grammar::{Grammar, Symbol};
    use crate::parse_table::{build, ActionTable};

    // Character grammar: a run of 'a's and 'b's; every 'a' emits a token.
    fn letters(emit: Symbol, mailbox: &Mailbox<String>) -> (Grammar<String>, ActionTable) {
        let mut g = Grammar::<String>::new();
        let (run, a, b) = (g.sym("Run"), g.sym_char('a'), g.sym_char('b'));
        g.set_start(run);
        g.add_rule(run, vec![]).unwrap();
        let step_a = g.add_rule(run, vec![run, a]).unwrap();
        g.add_rule(run, vec![run, b]).unwrap();

        let handle = mailbox.clone();
        g.add_action(step_a, move |_| {
            handle.post(Token {
                symbol: emit,
                value: "a".to_owned(),
            });
            String::new()
        })
        .unwrap();

        let table = build(&mut g).unwrap();
        (g, table)
    }

    #[test]
    fn emitted_tokens_come_out_in_input_order() {
        let mut outer = Grammar::<String>::new();
        let letter = outer.sym("LETTER");

        let mailbox = Mailbox::new();
        let (g, table) = letters(letter, &mailbox);
        let inner = Parser::new(&g, &table);
        let source = SliceSource::chars(&g, "aba", |c| c.to_string());
        let mut lexer = Lexer::new(inner, source, mailbox);

        assert_eq!(lexer.read().symbol, letter);
        assert_eq!(lexer.read().symbol, letter);
        assert_eq!(lexer.read().symbol, Symbol::EOI);
        assert_eq!(lexer.read().symbol, Symbol::EOI);
    }

    #[test]
    fn pushback_returns_the_same_token_once() {
        let mut outer = Grammar::<String>::new();
        let letter = outer.sym("LETTER");

        let mailbox = Mailbox::new();
        let (g, table) = letters(letter, &mailbox);
        let inner = Parser::new(&g, &table);
        let source = SliceSource::chars(&g, "aa", |c| c.to_string());
        let mut lexer = Lexer::new(inner, source, mailbox);

        let first = lexer.read();
        lexer.back();
        let again = lexer.read();
        assert_eq!(first.symbol, again.symbol);
        assert_eq!(lexer.read().symbol, letter);
        assert_eq!(lexer.read().symbol, Symbol::EOI);
    }

    #[test]
    fn get_peeks_without_consuming() {
        let mut outer = Grammar::<String>::new();
        let letter = outer.sym("LETTER");

        let mailbox = Mailbox::new();
        let (g, table) = letters(letter, &mailbox);
        let inner = Parser::new(&g, &table);
        let source = SliceSource::chars(&g, "a", |c| c.to_string());
        let mut lexer = Lexer::new(inner, source, mailbox);

        assert_eq!(lexer.get().symbol, letter);
        assert_eq!(lexer.get().symbol, letter);
        assert_eq!(lexer.read().symbol, letter);
        assert_eq!(lexer.read().symbol, Symbol::EOI);
    }
}
