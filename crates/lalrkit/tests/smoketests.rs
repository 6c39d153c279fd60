use lalrkit::engine::{Parser, SliceSource, Token, TokenSource};
use lalrkit::grammar::{Assoc, Grammar, Symbol};
use lalrkit::lexer::{Lexer, Mailbox};
use lalrkit::parse_table::{build, ActionTable};
use lalrkit::resolve::{collect_examples, ConflictResolver};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Nested-array parse tree, mirroring reduction groupings.
#[derive(Debug, Clone, PartialEq)]
enum Tree {
    Leaf(char),
    List(Vec<Tree>),
}

impl Default for Tree {
    fn default() -> Self {
        Tree::List(Vec::new())
    }
}

fn leaf(c: char) -> Tree {
    Tree::Leaf(c)
}

fn node(children: &[Tree]) -> Tree {
    Tree::List(children.to_vec())
}

fn tree_source(grammar: &Grammar<Tree>, input: &str) -> SliceSource<Tree> {
    SliceSource::chars(grammar, input, Tree::Leaf)
}

// --- round trip over {"0"*} ---

#[test]
fn zeros_language_round_trip() {
    init_tracing();
    let mut g = Grammar::<()>::new();
    let (s, zero) = (g.sym("S"), g.sym_char('0'));
    g.set_start(s);
    g.add_rule(s, vec![]).unwrap();
    g.add_rule(s, vec![s, zero]).unwrap();
    let table = build(&mut g).unwrap();
    let parser = Parser::new(&g, &table);

    for accepted in ["", "0", "00", "000000"] {
        assert!(
            parser.recognize(SliceSource::chars(&g, accepted, |_| ())),
            "{accepted:?} must be accepted"
        );
    }
    for rejected in ["1", "0 0", "00x", "x00"] {
        assert!(
            !parser.recognize(SliceSource::chars(&g, rejected, |_| ())),
            "{rejected:?} must be rejected"
        );
    }
}

// --- associativity ---

fn sum_grammar() -> (Grammar<Tree>, ActionTable) {
    let mut g = Grammar::<Tree>::new();
    let (e, plus, one) = (g.sym("E"), g.sym_char('+'), g.sym_char('1'));
    g.set_start(e);
    let infix = g.add_rule(e, vec![e, plus, e]).unwrap();
    g.add_rule(e, vec![one]).unwrap();
    g.add_action(infix, |values| node(values)).unwrap();
    g.set_assoc(plus, Assoc::Left);
    let table = build(&mut g).unwrap();
    (g, table)
}

#[test]
fn left_associative_sum_groups_to_the_left() {
    init_tracing();
    let (g, table) = sum_grammar();
    assert_eq!(table.conflicts().count(), 0);

    let parser = Parser::new(&g, &table);
    let tree = parser.parse(tree_source(&g, "1+1+1")).unwrap();
    let expected = node(&[node(&[leaf('1'), leaf('+'), leaf('1')]), leaf('+'), leaf('1')]);
    assert_eq!(tree, expected);
}

// --- priority ---

#[test]
fn multiplication_binds_tighter_than_addition() {
    init_tracing();
    let mut g = Grammar::<Tree>::new();
    let e = g.sym("E");
    let (plus, star) = (g.sym_char('+'), g.sym_char('*'));
    let digits: Vec<Symbol> = ['1', '2', '3'].iter().map(|&c| g.sym_char(c)).collect();
    g.set_start(e);
    let add = g.add_rule(e, vec![e, plus, e]).unwrap();
    let mul = g.add_rule(e, vec![e, star, e]).unwrap();
    for d in digits {
        g.add_rule(e, vec![d]).unwrap();
    }
    g.add_action(add, |values| node(values)).unwrap();
    g.add_action(mul, |values| node(values)).unwrap();
    g.set_priority(plus, 100);
    g.set_priority(star, 200);
    g.set_assoc(plus, Assoc::Left);
    g.set_assoc(star, Assoc::Left);

    let table = build(&mut g).unwrap();
    assert_eq!(table.conflicts().count(), 0);

    let parser = Parser::new(&g, &table);
    let tree = parser.parse(tree_source(&g, "1+2*3")).unwrap();
    let expected = node(&[leaf('1'), leaf('+'), node(&[leaf('2'), leaf('*'), leaf('3')])]);
    assert_eq!(tree, expected);
}

// --- determinism ---

#[test]
fn conflict_free_tables_are_deterministic() {
    init_tracing();
    let (_, table) = sum_grammar();

    // Every cell resolves to exactly one effective action.
    for state in 0..table.len() {
        for (_, cell) in table.cells(state) {
            assert!(!cell.is_conflicted());
            let chosen = cell.action();
            assert!(cell.candidates().contains(&chosen));
        }
    }
}

// --- analysis stability ---

#[test]
fn derived_analyses_are_stable_fixed_points() {
    init_tracing();
    let mut g = Grammar::<()>::new();
    let (s, opt, a, b) = (g.sym("S"), g.sym("Opt"), g.sym_char('a'), g.sym_char('b'));
    g.set_start(s);
    g.add_rule(s, vec![a, opt, b]).unwrap();
    g.add_rule(opt, vec![]).unwrap();
    g.add_rule(opt, vec![a]).unwrap();

    let before: Vec<_> = [s, opt, a, b]
        .iter()
        .map(|&sym| (g.is_nullable(sym), g.first_set(sym)))
        .collect();
    let again: Vec<_> = [s, opt, a, b]
        .iter()
        .map(|&sym| (g.is_nullable(sym), g.first_set(sym)))
        .collect();
    assert_eq!(before, again);
}

// --- lexer composition ---

#[test]
fn lexer_splits_naturals_and_skips_spaces() {
    init_tracing();
    let mut outer = Grammar::<String>::new();
    let natural = outer.sym("NATURAL");

    let mailbox = Mailbox::new();
    let mut g = Grammar::<String>::new();
    let (stream, item, nat) = (g.sym("Stream"), g.sym("Item"), g.sym("Nat"));
    let space = g.sym_char(' ');
    let digits: Vec<Symbol> = "12345".chars().map(|c| g.sym_char(c)).collect();
    g.set_start(stream);
    g.add_rule(stream, vec![]).unwrap();
    g.add_rule(stream, vec![stream, item]).unwrap();
    let emit = g.add_rule(item, vec![nat]).unwrap();
    g.add_rule(item, vec![space]).unwrap();
    for &d in &digits {
        g.add_rule(nat, vec![d]).unwrap();
    }
    let grow = g.add_rule(nat, vec![nat, digits[0]]).unwrap();
    for &d in &digits[1..] {
        g.add_rule(nat, vec![nat, d]).unwrap();
    }
    g.add_action(grow, |values| format!("{}{}", values[0], values[1]))
        .unwrap();
    for &d in &digits[1..] {
        let index = g
            .rules()
            .iter()
            .position(|r| r.rhs() == [nat, d])
            .unwrap();
        g.add_action(index, |values| format!("{}{}", values[0], values[1]))
            .unwrap();
    }

    // Maximal munch: on a digit lookahead, keep extending the number
    // instead of closing it off.
    for &d in &digits {
        g.set_assoc(d, Assoc::Right);
    }

    let handle = mailbox.clone();
    g.add_action(emit, move |values| {
        handle.post(Token {
            symbol: natural,
            value: values[0].clone(),
        });
        String::new()
    })
    .unwrap();

    let table = build(&mut g).unwrap();
    assert_eq!(table.conflicts().count(), 0);
    let inner = Parser::new(&g, &table);
    let source = SliceSource::chars(&g, "12 345", |c| c.to_string());
    let mut lexer = Lexer::new(inner, source, mailbox);

    let first = lexer.read();
    assert_eq!((first.symbol, first.value.as_str()), (natural, "12"));
    let second = lexer.read();
    assert_eq!((second.symbol, second.value.as_str()), (natural, "345"));
    assert_eq!(lexer.read().symbol, Symbol::EOI);
}

// --- ambiguity resolution ---

fn ambiguous_grammar() -> (Grammar<Tree>, ActionTable) {
    let mut g = Grammar::<Tree>::new();
    let (e, plus, one) = (g.sym("E"), g.sym_char('+'), g.sym_char('1'));
    g.set_start(e);
    let juxt = g.add_rule(e, vec![e, e]).unwrap();
    let infix = g.add_rule(e, vec![e, plus, e]).unwrap();
    g.add_rule(e, vec![one]).unwrap();
    g.add_action(juxt, |values| node(values)).unwrap();
    g.add_action(infix, |values| node(values)).unwrap();
    let table = build(&mut g).unwrap();
    (g, table)
}

fn example_tokens(g: &Grammar<Tree>, input: &str) -> Vec<Token<Tree>> {
    input
        .chars()
        .map(|c| Token {
            symbol: g.char_symbol(c).expect("token characters are interned"),
            value: Tree::Leaf(c),
        })
        .collect()
}

#[test]
fn ambiguous_cells_produce_witness_examples() {
    init_tracing();
    let (g, table) = ambiguous_grammar();
    assert!(table.conflicts().count() > 0);

    let examples = collect_examples(&g, &table);
    assert!(!examples.is_empty());
    for example in &examples {
        assert_eq!(example.tokens.last(), Some(&example.symbol));
        assert!(example.tokens.iter().all(|s| !g.is_nonterminal(*s)));
    }
}

#[test]
fn example_resolution_pins_left_grouping() {
    init_tracing();
    let (g, mut table) = ambiguous_grammar();
    let tokens = example_tokens(&g, "1+1+1");
    let expected = node(&[node(&[leaf('1'), leaf('+'), leaf('1')]), leaf('+'), leaf('1')]);

    ConflictResolver::new(&g, &mut table)
        .resolve(&tokens, &expected)
        .unwrap();

    let parser = Parser::new(&g, &table);
    assert_eq!(parser.parse(SliceSource::new(tokens)).unwrap(), expected);
}

#[test]
fn example_resolution_pins_right_grouping() {
    init_tracing();
    let (g, mut table) = ambiguous_grammar();
    let tokens = example_tokens(&g, "1+1+1");
    let expected = node(&[leaf('1'), leaf('+'), node(&[leaf('1'), leaf('+'), leaf('1')])]);

    ConflictResolver::new(&g, &mut table)
        .resolve(&tokens, &expected)
        .unwrap();

    let parser = Parser::new(&g, &table);
    assert_eq!(parser.parse(SliceSource::new(tokens)).unwrap(), expected);
}

#[test]
fn resolution_fails_when_no_combination_matches() {
    init_tracing();
    let (g, mut table) = ambiguous_grammar();
    let tokens = example_tokens(&g, "1+1");
    // "1+1" can only ever parse into a single grouping; an impossible
    // expectation must exhaust the search.
    let expected = node(&[leaf('1'), leaf('1')]);

    let result = ConflictResolver::new(&g, &mut table).resolve(&tokens, &expected);
    assert!(result.is_err());
}

// --- regex-style sugar ---

#[test]
fn sugar_forms_compose_into_parsable_grammars() {
    init_tracing();
    let mut g = Grammar::<()>::new();
    let (a, b, c) = (g.sym_char('a'), g.sym_char('b'), g.sym_char('c'));
    let bs = g.zero_or_more(b).unwrap();
    let tail = g.optional(c).unwrap();
    let word = g.seq(&[a, bs, tail]).unwrap();
    g.set_start(word);
    let table = build(&mut g).unwrap();
    let parser = Parser::new(&g, &table);

    for accepted in ["a", "ab", "abbb", "ac", "abbc"] {
        assert!(
            parser.recognize(SliceSource::chars(&g, accepted, |_| ())),
            "{accepted:?} must be accepted"
        );
    }
    for rejected in ["", "b", "ca", "abcb", "acc"] {
        assert!(
            !parser.recognize(SliceSource::chars(&g, rejected, |_| ())),
            "{rejected:?} must be rejected"
        );
    }
}
