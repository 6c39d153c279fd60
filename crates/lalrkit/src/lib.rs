//! An LALR(1) parser-generator toolkit.
//!
//! A [`grammar::Grammar`] is turned into a [`dfa::ClosureTable`] and then a
//! [`parse_table::ActionTable`]; the [`engine`] runs the table against a
//! token stream, and [`lexer`] reuses the same engine as a token source for
//! another parser. Residual conflicts are handled by [`resolve`].

pub mod dfa;
pub mod engine;
pub mod first_sets;
pub mod grammar;
pub mod lexer;
pub mod parse_table;
pub mod resolve;
pub mod util;
