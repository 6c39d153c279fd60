//! LALR(1) closure-table construction.
//!
//! States are discovered breadth-first from the root kernel. Kernels are
//! deduplicated by their `(rule, cursor)` core sets; lookaheads flow between
//! merged states along explicit propagation links until a fixed point is
//! reached.

use crate::first_sets::FirstSets;
use crate::grammar::{Grammar, Symbol};
use crate::util::{display_fn, Map, Set};
use std::{collections::VecDeque, fmt, rc::Rc};

/// Identifier of one automaton state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NodeID {
    raw: u32,
}

impl NodeID {
    /// The initial state, seeded from the root rule.
    pub const START: Self = Self::new(0);

    const fn new(raw: u32) -> Self {
        Self { raw }
    }

    pub fn index(self) -> usize {
        self.raw as usize
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, f)
    }
}

/// The lookahead-independent identity of an item: a rule with a cursor into
/// its right-hand side. Two items are the same item iff their cores match;
/// lookahead sets are merged, never compared.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ItemCore {
    rule: usize,
    cursor: usize,
}

impl ItemCore {
    pub fn rule(&self) -> usize {
        self.rule
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn advanced(&self) -> Self {
        Self {
            rule: self.rule,
            cursor: self.cursor + 1,
        }
    }
}

/// Items of one state: core -> monotonically growing lookahead set.
type ItemSet = Map<ItemCore, Set<Symbol>>;

/// One automaton state: its closed item set and outgoing transitions.
#[derive(Debug)]
pub struct Node {
    items: ItemSet,
    edges: Map<Symbol, NodeID>,
}

impl Node {
    pub fn items(&self) -> impl Iterator<Item = (ItemCore, &Set<Symbol>)> + '_ {
        self.items.iter().map(|(core, las)| (*core, las))
    }

    pub fn edges(&self) -> impl Iterator<Item = (Symbol, NodeID)> + '_ {
        self.edges.iter().map(|(s, id)| (*s, *id))
    }

    pub fn edge(&self, symbol: Symbol) -> Option<NodeID> {
        self.edges.get(&symbol).copied()
    }
}

/// A lookahead-propagation edge: the lookaheads of the source item flow into
/// the target item. Stored as plain indices so cycles are harmless.
#[derive(Debug, Copy, Clone)]
struct Link {
    from: (NodeID, ItemCore),
    to: (NodeID, ItemCore),
}

/// The LALR(1) state graph derived from a normalized grammar.
#[derive(Debug)]
pub struct ClosureTable {
    nodes: Map<NodeID, Node>,
}

impl ClosureTable {
    pub fn generate<V>(grammar: &Grammar<V>) -> Self {
        let mut builder = Builder {
            grammar,
            first_sets: grammar.first_sets(),
            nodes: Map::default(),
            links: Vec::new(),
            pending: VecDeque::new(),
        };

        // Kernel 0 holds every root production so that an elided variant
        // of the root (an empty-input acceptor) is reachable too.
        let mut kernel = ItemSet::default();
        for (i, rule) in grammar.rules().iter().enumerate() {
            if rule.lhs() == Symbol::START {
                kernel
                    .entry(ItemCore { rule: i, cursor: 0 })
                    .or_default()
                    .insert(Symbol::EOI);
            }
        }
        builder.expand_closure(&mut kernel);
        builder.enqueue(kernel);

        builder.discover();
        builder.propagate();

        tracing::debug!(
            states = builder.nodes.len(),
            links = builder.links.len(),
            "closure table built"
        );

        Self {
            nodes: builder.nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeID, &Node)> + '_ {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    pub fn node(&self, id: NodeID) -> &Node {
        &self.nodes[&id]
    }

    pub fn display<'a, V>(&'a self, grammar: &'a Grammar<V>) -> impl fmt::Display + 'a {
        display_fn(move |f| {
            for (id, node) in &self.nodes {
                writeln!(f, "- state: {:02}", id)?;
                writeln!(f, "  items:")?;
                for (core, lookaheads) in &node.items {
                    let rule = grammar.rule(core.rule);
                    write!(f, "  - {} :=", grammar.display_symbol(rule.lhs()))?;
                    for (i, s) in rule.rhs().iter().enumerate() {
                        if i == core.cursor {
                            f.write_str(" @")?;
                        }
                        write!(f, " {}", grammar.display_symbol(*s))?;
                    }
                    if core.cursor == rule.rhs().len() {
                        f.write_str(" @")?;
                    }
                    write!(f, " [")?;
                    for (i, la) in lookaheads.iter().enumerate() {
                        if i > 0 {
                            f.write_str("/")?;
                        }
                        write!(f, "{}", grammar.display_symbol(*la))?;
                    }
                    writeln!(f, "]")?;
                }
                writeln!(f, "  edges:")?;
                for (label, target) in &node.edges {
                    writeln!(f, "  - {} -> {:02}", grammar.display_symbol(*label), target)?;
                }
            }
            Ok(())
        })
    }
}

struct Builder<'g, V> {
    grammar: &'g Grammar<V>,
    first_sets: Rc<FirstSets>,
    nodes: Map<NodeID, Node>,
    links: Vec<Link>,
    pending: VecDeque<NodeID>,
}

impl<V> Builder<'_, V> {
    fn enqueue(&mut self, items: ItemSet) -> NodeID {
        let id = NodeID::new(self.nodes.len() as u32);
        self.nodes.insert(
            id,
            Node {
                items,
                edges: Map::default(),
            },
        );
        self.pending.push_back(id);
        id
    }

    /// Breadth-first state discovery. Every transition records one
    /// propagation link per contributing item, whether or not the target
    /// kernel merged into an existing state.
    fn discover(&mut self) {
        while let Some(id) = self.pending.pop_front() {
            for (label, sources) in self.extract_transitions(id) {
                let mut candidate = ItemSet::default();
                for &core in &sources {
                    let lookaheads = self.nodes[&id].items[&core].clone();
                    candidate
                        .entry(core.advanced())
                        .or_default()
                        .extend(lookaheads);
                }
                self.expand_closure(&mut candidate);

                let target = match self.find_same_cores(&candidate) {
                    Some(existing) => {
                        let items = &mut self.nodes[&existing].items;
                        for (core, lookaheads) in candidate {
                            items.entry(core).or_default().extend(lookaheads);
                        }
                        existing
                    }
                    None => self.enqueue(candidate),
                };

                for core in sources {
                    self.links.push(Link {
                        from: (id, core),
                        to: (target, core.advanced()),
                    });
                }
                self.nodes[&id].edges.insert(label, target);
            }
        }
    }

    /// Group the node's non-final items by the symbol after the cursor.
    fn extract_transitions(&self, id: NodeID) -> Map<Symbol, Vec<ItemCore>> {
        let mut out: Map<Symbol, Vec<ItemCore>> = Map::default();
        for (core, _) in self.nodes[&id].items.iter() {
            let rhs = self.grammar.rule(core.rule).rhs();
            if let Some(&label) = rhs.get(core.cursor) {
                out.entry(label).or_default().push(*core);
            }
        }
        out
    }

    /// Find a state whose item cores exactly match the candidate's,
    /// irrespective of lookaheads. This is the LALR merge.
    fn find_same_cores(&self, candidate: &ItemSet) -> Option<NodeID> {
        self.nodes
            .iter()
            .find(|(_, node)| {
                node.items.len() == candidate.len()
                    && candidate.keys().all(|core| node.items.contains_key(core))
            })
            .map(|(id, _)| *id)
    }

    /// Epsilon-closure: for every item `[X := ... @ Y beta]` with nonterminal
    /// `Y`, add `[Y := @ ...]` for each of Y's rules, with lookaheads
    /// FIRST(beta), plus the item's own lookaheads when beta is nullable.
    fn expand_closure(&self, items: &mut ItemSet) {
        let mut changed = true;
        while changed {
            changed = false;

            let mut added: ItemSet = Map::default();
            for (core, lookaheads) in &*items {
                let rhs = self.grammar.rule(core.rule).rhs();
                let y = match rhs.get(core.cursor) {
                    Some(&y) if self.grammar.is_nonterminal(y) => y,
                    _ => continue,
                };
                let beta = &rhs[core.cursor + 1..];

                let (mut firsts, beta_nullable) = self.first_sets.first_of_sequence(beta);
                if beta_nullable {
                    firsts.extend(lookaheads.iter().copied());
                }

                for (rule, r) in self.grammar.rules().iter().enumerate() {
                    if r.lhs() != y {
                        continue;
                    }
                    added
                        .entry(ItemCore { rule, cursor: 0 })
                        .or_default()
                        .extend(firsts.iter().copied());
                }
            }

            for (core, lookaheads) in added {
                let slot = items.entry(core).or_insert_with(|| {
                    changed = true;
                    Set::default()
                });
                for la in lookaheads {
                    changed |= slot.insert(la);
                }
            }
        }
    }

    /// Run lookahead propagation to a fixed point. A round walks every link
    /// and unions source lookaheads into the target; any state that grew is
    /// re-closed, since its derived items depend on the kernel lookaheads.
    fn propagate(&mut self) {
        let mut round = 0usize;
        let mut changed = true;
        while changed {
            changed = false;
            round += 1;

            let mut dirty: Set<NodeID> = Set::default();
            for link in &self.links {
                let from: Vec<Symbol> = self.nodes[&link.from.0].items[&link.from.1]
                    .iter()
                    .copied()
                    .collect();
                let target = self.nodes[&link.to.0]
                    .items
                    .entry(link.to.1)
                    .or_default();
                for la in from {
                    if target.insert(la) {
                        dirty.insert(link.to.0);
                    }
                }
            }

            for id in dirty {
                let mut items = std::mem::take(&mut self.nodes[&id].items);
                self.expand_closure(&mut items);
                self.nodes[&id].items = items;
                changed = true;
            }
        }
        tracing::trace!(rounds = round, "lookahead propagation converged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(build: impl FnOnce(&mut Grammar<()>)) -> Grammar<()> {
        let mut g = Grammar::new();
        build(&mut g);
        g.normalize().unwrap();
        g
    }

    #[test]
    fn start_state_holds_every_root_item() {
        // zero-or-more '0': the root also has an elided variant so the
        // empty input must be representable in state 0.
        let g = normalized(|g| {
            let (s, zero) = (g.sym("S"), g.sym_char('0'));
            g.set_start(s);
            g.add_rule(s, vec![]).unwrap();
            g.add_rule(s, vec![s, zero]).unwrap();
        });
        let table = ClosureTable::generate(&g);

        let roots = table
            .node(NodeID::START)
            .items()
            .filter(|(core, _)| g.rule(core.rule()).lhs() == Symbol::START)
            .count();
        assert!(roots >= 2, "both root variants must seed state 0");
    }

    #[test]
    fn kernels_with_equal_cores_are_merged() {
        // E := E '+' E | '1' visits "E '+' @ E" through many paths; LALR
        // merging must keep the state count well below canonical LR(1).
        let g = normalized(|g| {
            let (e, plus, one) = (g.sym("E"), g.sym_char('+'), g.sym_char('1'));
            g.set_start(e);
            g.add_rule(e, vec![e, plus, e]).unwrap();
            g.add_rule(e, vec![one]).unwrap();
        });
        let table = ClosureTable::generate(&g);

        // States are bounded by the number of distinct core sets.
        let mut seen: Set<Vec<ItemCore>> = Set::default();
        for (_, node) in table.nodes() {
            let mut cores: Vec<ItemCore> = node.items().map(|(c, _)| c).collect();
            cores.sort_by_key(|c| (c.rule(), c.cursor()));
            assert!(seen.insert(cores), "duplicate core set escaped merging");
        }
    }

    #[test]
    fn lookaheads_propagate_into_merged_states() {
        let g = normalized(|g| {
            let (e, plus, one) = (g.sym("E"), g.sym_char('+'), g.sym_char('1'));
            g.set_start(e);
            g.add_rule(e, vec![e, plus, e]).unwrap();
            g.add_rule(e, vec![one]).unwrap();
        });
        let plus = g
            .rules()
            .iter()
            .find(|r| r.rhs().len() == 3)
            .map(|r| r.rhs()[1])
            .unwrap();
        let table = ClosureTable::generate(&g);

        // Every final item for E := '1' must see both continuations:
        // the infix operator and end-of-input.
        for (_, node) in table.nodes() {
            for (core, lookaheads) in node.items() {
                let rule = g.rule(core.rule());
                if rule.rhs().len() == 1 && core.cursor() == 1 && rule.lhs() != Symbol::START {
                    assert!(lookaheads.contains(&plus));
                    assert!(lookaheads.contains(&Symbol::EOI));
                }
            }
        }
    }

    #[test]
    fn transitions_cover_every_non_final_item() {
        let g = normalized(|g| {
            let (s, a, b) = (g.sym("S"), g.sym_char('a'), g.sym_char('b'));
            g.set_start(s);
            g.add_rule(s, vec![a, b]).unwrap();
        });
        let table = ClosureTable::generate(&g);

        for (_, node) in table.nodes() {
            for (core, _) in node.items() {
                let rhs = g.rule(core.rule()).rhs();
                if let Some(&label) = rhs.get(core.cursor()) {
                    assert!(node.edge(label).is_some());
                }
            }
        }
    }
}
