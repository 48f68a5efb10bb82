//! Natural-loop forest.
//!
//! Back edges are edges whose target dominates their source; each header's
//! natural loop is the union of its back edges' reaching sets. Loops nest
//! into a forest. [`simplify_loops`] gives every header a dedicated
//! preheader (a unique out-of-loop predecessor with the header as its only
//! successor), which loop instrumentation relies on.
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    analysis::{cfg::FlowGraph, dom::DomTree},
    builder::split_predecessors,
    modules::{Function, operand::Label},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub usize);

#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: Label,
    pub latches: Vec<Label>,
    pub blocks: BTreeSet<Label>,
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
}

#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: Vec<NaturalLoop>,
    roots: Vec<LoopId>,
    innermost: BTreeMap<Label, LoopId>,
}

impl LoopForest {
    pub fn build(f: &Function, dom: &DomTree) -> LoopForest {
        let graph = FlowGraph::of(f);

        // Back edges grouped by header.
        let mut latches_by_header: BTreeMap<Label, Vec<Label>> = BTreeMap::new();
        for (label, bb) in &f.body {
            if !dom.is_reachable(*label) {
                continue;
            }
            for succ in bb.terminator.successors() {
                if dom.dominates(succ, *label) {
                    let latches = latches_by_header.entry(succ).or_default();
                    if !latches.contains(label) {
                        latches.push(*label);
                    }
                }
            }
        }

        // Natural loop body: header plus every block that reaches a latch
        // without passing through the header.
        let mut loops = Vec::new();
        for (header, latches) in &latches_by_header {
            let mut blocks = BTreeSet::new();
            blocks.insert(*header);
            let mut stack: Vec<Label> = latches.clone();
            while let Some(label) = stack.pop() {
                if !blocks.insert(label) {
                    continue;
                }
                for pred in graph.preds(label) {
                    if !blocks.contains(pred) {
                        stack.push(*pred);
                    }
                }
            }
            loops.push(NaturalLoop {
                header: *header,
                latches: latches.clone(),
                blocks,
                parent: None,
                children: Vec::new(),
            });
        }

        // Nesting: the parent of a loop is the smallest strictly-containing
        // loop.
        for i in 0..loops.len() {
            let mut best: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].blocks.contains(&loops[i].header) {
                    continue;
                }
                if loops[j].header == loops[i].header {
                    continue;
                }
                match best {
                    Some(b) if loops[b].blocks.len() <= loops[j].blocks.len() => {}
                    _ => best = Some(j),
                }
            }
            if let Some(parent) = best {
                loops[i].parent = Some(LoopId(parent));
            }
        }
        let mut roots = Vec::new();
        for i in 0..loops.len() {
            match loops[i].parent {
                Some(LoopId(p)) => loops[p].children.push(LoopId(i)),
                None => roots.push(LoopId(i)),
            }
        }

        // Innermost loop per block: the smallest loop containing it.
        let mut innermost: BTreeMap<Label, LoopId> = BTreeMap::new();
        for (i, l) in loops.iter().enumerate() {
            for block in &l.blocks {
                match innermost.get(block) {
                    Some(LoopId(prev)) if loops[*prev].blocks.len() <= l.blocks.len() => {}
                    _ => {
                        innermost.insert(*block, LoopId(i));
                    }
                }
            }
        }

        // Deterministic traversal order: roots and children by header label.
        let mut forest = LoopForest { loops, roots, innermost };
        forest.roots.sort_by_key(|id| forest.loops[id.0].header);
        for i in 0..forest.loops.len() {
            let mut children = std::mem::take(&mut forest.loops[i].children);
            children.sort_by_key(|id| forest.loops[id.0].header);
            forest.loops[i].children = children;
        }
        forest
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn roots(&self) -> &[LoopId] {
        &self.roots
    }

    pub fn get(&self, id: LoopId) -> &NaturalLoop {
        &self.loops[id.0]
    }

    /// Innermost loop containing `label`, if any.
    pub fn loop_of(&self, label: Label) -> Option<LoopId> {
        self.innermost.get(&label).copied()
    }

    /// The loop's preheader: the unique out-of-loop predecessor of the
    /// header whose only successor is the header.
    pub fn preheader(&self, f: &Function, id: LoopId) -> Option<Label> {
        let l = self.get(id);
        let graph = FlowGraph::of(f);
        let outside: Vec<Label> = graph
            .preds(l.header)
            .iter()
            .copied()
            .filter(|p| !l.blocks.contains(p))
            .collect();
        match outside.as_slice() {
            [pred] => {
                let succs = f.block(*pred).terminator.successors();
                if succs.len() == 1 && succs[0] == l.header {
                    Some(*pred)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Edges leaving the loop, as `(exiting block, exit target)` pairs.
    pub fn exiting_edges(&self, f: &Function, id: LoopId) -> Vec<(Label, Label)> {
        let l = self.get(id);
        let mut edges = Vec::new();
        for block in &l.blocks {
            for succ in f.block(*block).terminator.successors() {
                if !l.blocks.contains(&succ) && !edges.contains(&(*block, succ)) {
                    edges.push((*block, succ));
                }
            }
        }
        edges
    }

    /// Distinct blocks outside the loop targeted by exiting edges.
    pub fn exit_blocks(&self, f: &Function, id: LoopId) -> Vec<Label> {
        let mut out = Vec::new();
        for (_, target) in self.exiting_edges(f, id) {
            if !out.contains(&target) {
                out.push(target);
            }
        }
        out
    }

    pub fn is_latch(&self, id: LoopId, label: Label) -> bool {
        self.get(id).latches.contains(&label)
    }

    /// The unique latch of the loop, if it has exactly one.
    pub fn unique_latch(&self, id: LoopId) -> Option<Label> {
        match self.get(id).latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }
}

/// Give every loop header a dedicated preheader. Returns how many blocks
/// were inserted.
pub fn simplify_loops(f: &mut Function) -> usize {
    let mut inserted = 0;
    loop {
        let dom = DomTree::build(f);
        let forest = LoopForest::build(f, &dom);
        let graph = FlowGraph::of(f);

        let mut pending: Option<(Label, Vec<Label>)> = None;
        for i in 0..forest.loops.len() {
            let id = LoopId(i);
            if forest.preheader(f, id).is_some() {
                continue;
            }
            let l = forest.get(id);
            let outside: Vec<Label> = graph
                .preds(l.header)
                .iter()
                .copied()
                .filter(|p| !l.blocks.contains(p))
                .collect();
            if outside.is_empty() {
                // Header reachable only through back edges; nothing to do.
                continue;
            }
            pending = Some((l.header, outside));
            break;
        }

        match pending {
            Some((header, outside)) => {
                let preheader = split_predecessors(f, header, &outside);
                log::debug!(
                    "inserted preheader {} for loop header {} in '{}'",
                    preheader,
                    header,
                    f.name
                );
                inserted += 1;
            }
            None => return inserted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{control_flow::Terminator, operand::Operand};

    /// entry -> ph -> header <-> body(latch), header -> exit
    fn counted_loop() -> (Function, Label, Label, Label) {
        let mut f = Function::new("loopy");
        let exit = f.add_block(Terminator::Ret { value: None });
        let header = f.add_block(Terminator::Unreachable);
        let latch = f.add_block(Terminator::Br { target: header });
        f.set_terminator(
            header,
            Terminator::CondBr { cond: Operand::i64(1), then_to: latch, else_to: exit },
        );
        f.set_terminator(Label::ENTRY, Terminator::Br { target: header });
        (f, header, latch, exit)
    }

    #[test]
    fn detects_single_loop_with_latch_and_exit() {
        let (f, header, latch, exit) = counted_loop();
        let dom = DomTree::build(&f);
        let forest = LoopForest::build(&f, &dom);
        assert_eq!(forest.roots().len(), 1);
        let id = forest.roots()[0];
        let l = forest.get(id);
        assert_eq!(l.header, header);
        assert_eq!(l.latches, vec![latch]);
        assert_eq!(forest.preheader(&f, id), Some(Label::ENTRY));
        assert_eq!(forest.exit_blocks(&f, id), vec![exit]);
        assert!(forest.is_latch(id, latch));
    }

    #[test]
    fn nested_loops_form_a_forest() {
        let mut f = Function::new("nest");
        let exit = f.add_block(Terminator::Ret { value: None });
        let outer_h = f.add_block(Terminator::Unreachable);
        let inner_h = f.add_block(Terminator::Unreachable);
        let inner_latch = f.add_block(Terminator::Br { target: inner_h });
        let outer_latch = f.add_block(Terminator::Br { target: outer_h });
        f.set_terminator(
            inner_h,
            Terminator::CondBr { cond: Operand::i64(1), then_to: inner_latch, else_to: outer_latch },
        );
        f.set_terminator(
            outer_h,
            Terminator::CondBr { cond: Operand::i64(1), then_to: inner_h, else_to: exit },
        );
        f.set_terminator(Label::ENTRY, Terminator::Br { target: outer_h });

        let dom = DomTree::build(&f);
        let forest = LoopForest::build(&f, &dom);
        assert_eq!(forest.roots().len(), 1);
        let outer = forest.roots()[0];
        assert_eq!(forest.get(outer).header, outer_h);
        assert_eq!(forest.get(outer).children.len(), 1);
        let inner = forest.get(outer).children[0];
        assert_eq!(forest.get(inner).header, inner_h);
        assert_eq!(forest.get(inner).parent, Some(outer));
        assert_eq!(forest.loop_of(inner_h), Some(inner));
        assert_eq!(forest.loop_of(outer_latch), Some(outer));
    }

    #[test]
    fn simplify_inserts_missing_preheader() {
        // Two blocks jump straight into the header.
        let mut f = Function::new("rough");
        let exit = f.add_block(Terminator::Ret { value: None });
        let header = f.add_block(Terminator::Unreachable);
        let latch = f.add_block(Terminator::Br { target: header });
        let a = f.add_block(Terminator::Br { target: header });
        let b = f.add_block(Terminator::Br { target: header });
        f.set_terminator(
            header,
            Terminator::CondBr { cond: Operand::i64(1), then_to: latch, else_to: exit },
        );
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(0), then_to: a, else_to: b },
        );

        let inserted = simplify_loops(&mut f);
        assert_eq!(inserted, 1);
        let dom = DomTree::build(&f);
        let forest = LoopForest::build(&f, &dom);
        let id = forest.roots()[0];
        let ph = forest.preheader(&f, id).expect("preheader after simplify");
        assert_ne!(ph, a);
        assert_ne!(ph, b);
    }
}
