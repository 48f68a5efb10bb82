//! Dominator tree, computed with petgraph's simple-fast algorithm.
use std::collections::BTreeMap;

use petgraph::{algo::dominators, graph::DiGraph};

use crate::modules::{Function, operand::Label};

/// Immediate-dominator tree for the blocks reachable from entry.
#[derive(Debug, Clone)]
pub struct DomTree {
    idom: BTreeMap<Label, Label>,
}

impl DomTree {
    pub fn build(f: &Function) -> DomTree {
        let mut graph = DiGraph::<Label, ()>::new();
        let mut nodes = BTreeMap::new();
        for label in f.body.keys() {
            nodes.insert(*label, graph.add_node(*label));
        }
        for (label, bb) in &f.body {
            for succ in bb.terminator.successors() {
                graph.add_edge(nodes[label], nodes[&succ], ());
            }
        }

        let doms = dominators::simple_fast(&graph, nodes[&Label::ENTRY]);
        let mut idom = BTreeMap::new();
        for (label, node) in &nodes {
            if let Some(parent) = doms.immediate_dominator(*node) {
                idom.insert(*label, graph[parent]);
            }
        }
        DomTree { idom }
    }

    /// Blocks unreachable from entry have no dominator information.
    pub fn is_reachable(&self, label: Label) -> bool {
        label == Label::ENTRY || self.idom.contains_key(&label)
    }

    pub fn idom(&self, label: Label) -> Option<Label> {
        self.idom.get(&label).copied()
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: Label, b: Label) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{control_flow::Terminator, operand::Operand};

    #[test]
    fn diamond_join_is_dominated_by_entry_only() {
        let mut f = Function::new("diamond");
        let join = f.add_block(Terminator::Ret { value: None });
        let left = f.add_block(Terminator::Br { target: join });
        let right = f.add_block(Terminator::Br { target: join });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(1), then_to: left, else_to: right },
        );

        let dom = DomTree::build(&f);
        assert!(dom.dominates(Label::ENTRY, join));
        assert!(!dom.dominates(left, join));
        assert_eq!(dom.idom(join), Some(Label::ENTRY));
    }

    #[test]
    fn unreachable_blocks_are_flagged() {
        let mut f = Function::new("f");
        f.set_terminator(Label::ENTRY, Terminator::Ret { value: None });
        let orphan = f.add_block(Terminator::Ret { value: None });
        let dom = DomTree::build(&f);
        assert!(!dom.is_reachable(orphan));
    }
}
