//! Control-flow graph edges and traversal orders.
//!
//! [`FlowGraph`] is a snapshot of a function's edges; passes that mutate the
//! graph recompute it as needed. Predecessor lists hold distinct blocks (a
//! conditional branch with both arms into the same block contributes one
//! entry), matching how join-point argument merging binds per predecessor.
use std::collections::{BTreeMap, BTreeSet};

use crate::modules::{Function, operand::Label};

/// Predecessor/successor maps for one function.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    preds: BTreeMap<Label, Vec<Label>>,
    succs: BTreeMap<Label, Vec<Label>>,
}

impl FlowGraph {
    pub fn of(f: &Function) -> FlowGraph {
        let mut graph = FlowGraph::default();
        for label in f.body.keys() {
            graph.preds.entry(*label).or_default();
            graph.succs.entry(*label).or_default();
        }
        for (label, bb) in &f.body {
            for succ in bb.terminator.successors() {
                let succs = graph.succs.entry(*label).or_default();
                if !succs.contains(&succ) {
                    succs.push(succ);
                }
                let preds = graph.preds.entry(succ).or_default();
                if !preds.contains(label) {
                    preds.push(*label);
                }
            }
        }
        graph
    }

    pub fn preds(&self, label: Label) -> &[Label] {
        self.preds.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn succs(&self, label: Label) -> &[Label] {
        self.succs.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct predecessor blocks.
    pub fn in_degree(&self, label: Label) -> usize {
        self.preds(label).len()
    }

    /// The single predecessor of `label`, if it has exactly one.
    pub fn unique_pred(&self, label: Label) -> Option<Label> {
        match self.preds(label) {
            [pred] => Some(*pred),
            _ => None,
        }
    }
}

/// Blocks reachable from the entry block.
pub fn reachable(f: &Function) -> BTreeSet<Label> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![Label::ENTRY];
    while let Some(label) = stack.pop() {
        if !seen.insert(label) {
            continue;
        }
        if let Some(bb) = f.body.get(&label) {
            stack.extend(bb.terminator.successors());
        }
    }
    seen
}

/// Post-order over the blocks reachable from `start`, restricted to the
/// `within` set. `start` itself must be in `within`.
pub fn post_order_within(f: &Function, start: Label, within: &BTreeSet<Label>) -> Vec<Label> {
    let mut order = Vec::new();
    let mut seen = BTreeSet::new();
    // Iterative DFS with an explicit visit state: (label, next child index).
    let mut stack: Vec<(Label, usize)> = Vec::new();
    if within.contains(&start) {
        stack.push((start, 0));
        seen.insert(start);
    }
    while let Some((label, child)) = stack.pop() {
        let succs = f.block(label).terminator.successors();
        let mut advanced = false;
        for (i, succ) in succs.iter().enumerate().skip(child) {
            if within.contains(succ) && !seen.contains(succ) {
                seen.insert(*succ);
                stack.push((label, i + 1));
                stack.push((*succ, 0));
                advanced = true;
                break;
            }
        }
        if !advanced {
            order.push(label);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{control_flow::Terminator, operand::Operand};

    fn diamond() -> Function {
        let mut f = Function::new("diamond");
        let join = f.add_block(Terminator::Ret { value: None });
        let left = f.add_block(Terminator::Br { target: join });
        let right = f.add_block(Terminator::Br { target: join });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(1), then_to: left, else_to: right },
        );
        f
    }

    #[test]
    fn in_degree_counts_distinct_preds() {
        let f = diamond();
        let graph = FlowGraph::of(&f);
        let join = Label(1);
        assert_eq!(graph.in_degree(join), 2);
        assert_eq!(graph.unique_pred(join), None);
        assert_eq!(graph.unique_pred(Label(2)), Some(Label::ENTRY));
    }

    #[test]
    fn post_order_visits_successors_first() {
        let f = diamond();
        let within: BTreeSet<Label> = f.body.keys().copied().collect();
        let order = post_order_within(&f, Label::ENTRY, &within);
        assert_eq!(order.len(), 4);
        assert_eq!(*order.last().unwrap(), Label::ENTRY);
        // The join is visited before either branch arm.
        let pos = |l: Label| order.iter().position(|x| *x == l).unwrap();
        assert!(pos(Label(1)) < pos(Label(2)));
        assert!(pos(Label(1)) < pos(Label(3)));
    }
}
