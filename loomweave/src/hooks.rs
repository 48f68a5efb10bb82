//! Hook declarations, insertion, and join-point argument merging.
//!
//! [`Hooks`] lazily declares the external hook functions as they are first
//! needed. Direct insertion goes through a [`Cursor`]; insertion at a
//! control-flow join goes through the [`SelectorRegistry`], which maintains
//! one [`SelectorNode`] per `(join block, hook)` pair. A selector holds one
//! argument binding per incoming edge — a real argument tuple on the edge
//! that triggered the hook, the default sentinel tuple on every other edge
//! — and guarantees that exactly one hook call is emitted for the pair no
//! matter how many syntactic sites feed it.
//!
//! Selectors are lowered once per function, after every instrumenter ran:
//! each argument position gets a stack slot in the entry block, every
//! incoming edge stores its bound tuple in the predecessor before its
//! terminator, and the single hook call reads the slots. Chained bindings
//! (shared exception exits) store a load of an upstream selector's slots
//! instead, which is how one coherent merge propagates through a chain of
//! shared unwind blocks.
use std::collections::{BTreeMap, HashMap};

use loomir::{
    analysis::FlowGraph,
    builder::Cursor,
    modules::{
        ExternalFunction, Function, InstrRef, Module,
        control_flow::Terminator,
        operand::{ExtId, Label, Name, Operand},
    },
    types::Ty,
};

use crate::tables::{EventCategory, Tables, UNKNOWN_ID};

/// Lazily declared external hook functions.
#[derive(Debug, Default)]
pub struct Hooks {
    declared: HashMap<&'static str, ExtId>,
}

macro_rules! hook_decl {
    ($fn_name:ident, $symbol:literal, [$($param:expr),* $(,)?]) => {
        pub fn $fn_name(&mut self, m: &mut Module) -> ExtId {
            self.declare(m, $symbol, vec![$($param),*])
        }
    };
}

impl Hooks {
    fn declare(&mut self, m: &mut Module, name: &'static str, params: Vec<Ty>) -> ExtId {
        if let Some(ext) = self.declared.get(name) {
            return *ext;
        }
        let ext = m.get_or_insert_external(ExternalFunction {
            name: name.to_string(),
            params,
            return_ty: None,
            nounwind: true,
        });
        self.declared.insert(name, ext);
        ext
    }

    hook_decl!(func_entry, "__loom_func_entry", [Ty::I64, Ty::I64]);
    hook_decl!(func_exit, "__loom_func_exit", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(bb_entry, "__loom_bb_entry", [Ty::I64, Ty::I64]);
    hook_decl!(bb_exit, "__loom_bb_exit", [Ty::I64, Ty::I64]);
    hook_decl!(before_loop, "__loom_before_loop", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(after_loop, "__loom_after_loop", [Ty::I64, Ty::I64]);
    hook_decl!(loopbody_entry, "__loom_loopbody_entry", [Ty::I64, Ty::I64]);
    hook_decl!(loopbody_exit, "__loom_loopbody_exit", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(before_call, "__loom_before_call", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(after_call, "__loom_after_call", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(before_load, "__loom_before_load", [Ty::I64, Ty::Ptr, Ty::I32, Ty::I64]);
    hook_decl!(after_load, "__loom_after_load", [Ty::I64, Ty::Ptr, Ty::I32, Ty::I64]);
    hook_decl!(before_store, "__loom_before_store", [Ty::I64, Ty::Ptr, Ty::I32, Ty::I64]);
    hook_decl!(after_store, "__loom_after_store", [Ty::I64, Ty::Ptr, Ty::I32, Ty::I64]);
    hook_decl!(fork, "__loom_fork", [Ty::I64, Ty::Ptr]);
    hook_decl!(task_entry, "__loom_task", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(task_exit, "__loom_task_exit", [Ty::I64, Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(fork_continue, "__loom_fork_continue", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(before_join, "__loom_before_join", [Ty::I64, Ty::Ptr]);
    hook_decl!(after_join, "__loom_after_join", [Ty::I64, Ty::Ptr]);
    hook_decl!(before_local_alloc, "__loom_before_local_alloc", [Ty::I64, Ty::I64, Ty::I64]);
    hook_decl!(
        after_local_alloc,
        "__loom_after_local_alloc",
        [Ty::I64, Ty::Ptr, Ty::I64, Ty::I64]
    );
    hook_decl!(
        before_heap_alloc,
        "__loom_before_heap_alloc",
        [Ty::I64, Ty::I64, Ty::I64, Ty::I64, Ty::Ptr, Ty::I64]
    );
    hook_decl!(
        after_heap_alloc,
        "__loom_after_heap_alloc",
        [Ty::I64, Ty::Ptr, Ty::I64, Ty::I64, Ty::I64, Ty::Ptr, Ty::I64]
    );
    hook_decl!(before_free, "__loom_before_free", [Ty::I64, Ty::Ptr, Ty::I64]);
    hook_decl!(after_free, "__loom_after_free", [Ty::I64, Ty::Ptr, Ty::I64]);
}

/// One argument binding on an incoming edge of a selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Real argument tuple bound by an instrumentation site on this edge.
    Args(Vec<Operand>),
    /// The already-merged bindings of an upstream selector (shared unwind
    /// chains): the edge forwards that selector's slot values.
    Chained(Label),
    /// The default sentinel tuple.
    Default,
}

/// Where a selector's single hook call is emitted at lowering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// At the head of the join block; the merged tuple is the full argument
    /// list.
    JoinHead,
    /// Before the join block's `DetachedRethrow` terminator, with a fresh
    /// ID of the given category prepended to the merged tuple. Blocks
    /// without such a terminator emit nothing.
    AtRethrow(EventCategory),
}

/// Synthesized argument-merge structure for one `(join block, hook)` pair.
#[derive(Debug)]
pub struct SelectorNode {
    pub block: Label,
    pub hook: ExtId,
    pub tys: Vec<Ty>,
    pub defaults: Vec<Operand>,
    pub bindings: BTreeMap<Label, Binding>,
    pub emit: EmitMode,
    /// Flag slots reset to zero immediately after the emitted call
    /// (join-after bookkeeping).
    pub post_resets: Vec<Name>,
    slots: Vec<Name>,
}

impl SelectorNode {
    fn all_default(&self) -> bool {
        self.bindings.values().all(|b| matches!(b, Binding::Default))
    }
}

/// Outcome of a merge-based insertion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The successor had a unique predecessor; the hook call was inserted
    /// directly and is identified by the returned handle.
    Direct(InstrRef),
    /// A new selector was created for the pair; the hook call is emitted at
    /// lowering.
    Created,
    /// An existing selector was updated; only the binding changed.
    Rebound,
}

/// Registry of selector nodes for the function being instrumented.
///
/// Scoped to one function; discarded after lowering.
#[derive(Debug, Default)]
pub struct SelectorRegistry {
    nodes: BTreeMap<(Label, ExtId), SelectorNode>,
    order: Vec<(Label, ExtId)>,
}

impl SelectorRegistry {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, block: Label, hook: ExtId) -> Option<&SelectorNode> {
        self.nodes.get(&(block, hook))
    }

    /// Insert a hook at `succ` for the event on the edge from `from`.
    ///
    /// With a unique predecessor the call is inserted directly. Otherwise
    /// the pair's selector is found or created: `args` is bound on the
    /// `from` edge and `defaults` on all others; the first caller registers
    /// the single pending call, later callers only rebind.
    pub fn insert_hook_at_successor(
        &mut self,
        f: &mut Function,
        succ: Label,
        from: Label,
        hook: ExtId,
        args: Vec<(Operand, Ty)>,
        defaults: Vec<Operand>,
    ) -> MergeOutcome {
        let graph = FlowGraph::of(f);
        if graph.unique_pred(succ) == Some(from) {
            let mut cur = Cursor::at_block_start(f, succ);
            let iref = cur.call_ext(hook, args.into_iter().map(|(op, _)| op).collect());
            return MergeOutcome::Direct(iref);
        }

        let (ops, tys): (Vec<Operand>, Vec<Ty>) = args.into_iter().unzip();
        match self.nodes.get_mut(&(succ, hook)) {
            Some(node) => {
                node.bindings.insert(from, Binding::Args(ops));
                MergeOutcome::Rebound
            }
            None => {
                let mut bindings = BTreeMap::new();
                for pred in graph.preds(succ) {
                    bindings.insert(*pred, Binding::Default);
                }
                bindings.insert(from, Binding::Args(ops));
                self.nodes.insert(
                    (succ, hook),
                    SelectorNode {
                        block: succ,
                        hook,
                        tys,
                        defaults,
                        bindings,
                        emit: EmitMode::JoinHead,
                        post_resets: Vec::new(),
                        slots: Vec::new(),
                    },
                );
                self.order.push((succ, hook));
                MergeOutcome::Created
            }
        }
    }

    /// Find or create a rethrow-mode selector without binding any edge;
    /// used by shared-unwind chain propagation. Returns whether the node
    /// was created.
    pub fn ensure_rethrow_node(
        &mut self,
        f: &Function,
        block: Label,
        hook: ExtId,
        category: EventCategory,
        tys: Vec<Ty>,
        defaults: Vec<Operand>,
    ) -> bool {
        if self.nodes.contains_key(&(block, hook)) {
            return false;
        }
        let graph = FlowGraph::of(f);
        let mut bindings = BTreeMap::new();
        for pred in graph.preds(block) {
            bindings.insert(*pred, Binding::Default);
        }
        self.nodes.insert(
            (block, hook),
            SelectorNode {
                block,
                hook,
                tys,
                defaults,
                bindings,
                emit: EmitMode::AtRethrow(category),
                post_resets: Vec::new(),
                slots: Vec::new(),
            },
        );
        self.order.push((block, hook));
        true
    }

    /// Bind a real argument tuple on the edge `pred -> block`.
    pub fn bind_args(&mut self, block: Label, hook: ExtId, pred: Label, args: Vec<Operand>) {
        if let Some(node) = self.nodes.get_mut(&(block, hook)) {
            node.bindings.insert(pred, Binding::Args(args));
        }
    }

    /// Bind the edge `pred -> block` to the merged value of the selector at
    /// `pred` for the same hook.
    pub fn bind_chained(&mut self, block: Label, hook: ExtId, pred: Label) {
        if let Some(node) = self.nodes.get_mut(&(block, hook)) {
            node.bindings.insert(pred, Binding::Chained(pred));
        }
    }

    /// Register a flag slot reset emitted right after the pair's call.
    pub fn add_post_reset(&mut self, block: Label, hook: ExtId, slot: Name) {
        if let Some(node) = self.nodes.get_mut(&(block, hook)) {
            if !node.post_resets.contains(&slot) {
                node.post_resets.push(slot);
            }
        }
    }

    /// Lower every selector: allocate slots, emit per-edge stores and the
    /// single merged hook call per pair.
    pub fn lower(&mut self, f: &mut Function, tables: &mut Tables) {
        // Normalize bindings to the current predecessor sets and allocate
        // slots first: chained edges load the slots of upstream selectors.
        let graph = FlowGraph::of(f);
        let keys = self.order.clone();
        for key in &keys {
            let node = self.nodes.get_mut(key).expect("ordered key is present");
            let mut normalized = BTreeMap::new();
            for pred in graph.preds(node.block) {
                let binding =
                    node.bindings.get(pred).cloned().unwrap_or(Binding::Default);
                normalized.insert(*pred, binding);
            }
            node.bindings = normalized;
            if node.all_default() {
                continue;
            }
            let mut slots = Vec::with_capacity(node.tys.len());
            let tys = node.tys.clone();
            for ty in tys {
                let mut cur = Cursor::at_block_start(f, Label::ENTRY);
                slots.push(cur.alloca(ty));
            }
            let node = self.nodes.get_mut(key).expect("ordered key is present");
            node.slots = slots;
        }

        // Second phase: per-edge stores, then the merged calls.
        for key in &keys {
            let node = &self.nodes[key];
            if node.all_default() {
                continue;
            }
            let block = node.block;
            let slots = node.slots.clone();
            let tys = node.tys.clone();
            let bindings: Vec<(Label, Binding)> =
                node.bindings.iter().map(|(l, b)| (*l, b.clone())).collect();
            let defaults = node.defaults.clone();
            let hook = node.hook;

            for (pred, binding) in bindings {
                let values: Vec<Operand> = match binding {
                    Binding::Args(ops) => ops,
                    Binding::Default => defaults.clone(),
                    Binding::Chained(upstream) => {
                        let upstream_slots = self.nodes[&(upstream, hook)].slots.clone();
                        if upstream_slots.is_empty() {
                            // The upstream selector merged only defaults.
                            defaults.clone()
                        } else {
                            let mut cur = Cursor::before_terminator(f, pred);
                            upstream_slots
                                .iter()
                                .zip(&tys)
                                .map(|(slot, ty)| {
                                    Operand::Reg(cur.load(ty.clone(), Operand::Reg(*slot)))
                                })
                                .collect()
                        }
                    }
                };
                let mut cur = Cursor::before_terminator(f, pred);
                for ((slot, ty), value) in slots.iter().zip(&tys).zip(values) {
                    cur.store(ty.clone(), Operand::Reg(*slot), value);
                }
            }

            let node = &self.nodes[key];
            match node.emit {
                EmitMode::JoinHead => {
                    let post_resets = node.post_resets.clone();
                    let mut cur = Cursor::at_block_start(f, block);
                    let args: Vec<Operand> = slots
                        .iter()
                        .zip(&tys)
                        .map(|(slot, ty)| Operand::Reg(cur.load(ty.clone(), Operand::Reg(*slot))))
                        .collect();
                    cur.call_ext(hook, args);
                    for slot in post_resets {
                        cur.store(Ty::I32, Operand::Reg(slot), Operand::i32(0));
                    }
                }
                EmitMode::AtRethrow(category) => {
                    if !matches!(
                        f.block(block).terminator,
                        Terminator::DetachedRethrow { .. }
                    ) {
                        continue;
                    }
                    let local = tables.fed[category].add_term(f, block);
                    let mut cur = Cursor::before_terminator(f, block);
                    let id = tables.fed[category].local_to_global(local, &mut cur);
                    let mut args = vec![id];
                    for (slot, ty) in slots.iter().zip(&tys) {
                        args.push(Operand::Reg(cur.load(ty.clone(), Operand::Reg(*slot))));
                    }
                    cur.call_ext(hook, args);
                }
            }
        }
    }
}

/// The default sentinel tuple for an ID-plus-properties hook signature.
pub fn default_id_args(count: usize) -> Vec<Operand> {
    std::iter::repeat_n(Operand::i64(UNKNOWN_ID), count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomir::modules::{Module, control_flow::Terminator, instructions::Instr};

    fn count_calls_to(m: &Module, f: &Function, name: &str) -> usize {
        let Some((ext, _)) = m.external_by_name(name) else { return 0 };
        f.body
            .values()
            .flat_map(|bb| bb.seq.iter())
            .filter(|iref| match f.instr(**iref) {
                Instr::Call(call) => {
                    call.callee
                        == loomir::modules::instructions::Callee::Func(
                            loomir::modules::operand::FuncRef::External(ext),
                        )
                }
                _ => false,
            })
            .count()
    }

    #[test]
    fn unique_predecessor_inserts_directly() {
        let mut m = Module::new("unit");
        let mut hooks = Hooks::default();
        let hook = hooks.after_call(&mut m);

        let mut f = Function::new("f");
        let succ = f.add_block(Terminator::Ret { value: None });
        f.set_terminator(Label::ENTRY, Terminator::Br { target: succ });

        let mut reg = SelectorRegistry::default();
        let outcome = reg.insert_hook_at_successor(
            &mut f,
            succ,
            Label::ENTRY,
            hook,
            vec![
                (Operand::i64(7), Ty::I64),
                (Operand::i64(0), Ty::I64),
                (Operand::i64(0), Ty::I64),
            ],
            default_id_args(3),
        );
        assert!(matches!(outcome, MergeOutcome::Direct(_)));
        assert!(reg.is_empty());
        assert_eq!(count_calls_to(&m, &f, "__loom_after_call"), 1);
    }

    #[test]
    fn join_selector_fires_exactly_once_with_full_in_degree() {
        let mut m = Module::new("unit");
        let mut hooks = Hooks::default();
        let hook = hooks.after_call(&mut m);

        // Two invoke-like predecessors feed one join block.
        let mut f = Function::new("f");
        let join = f.add_block(Terminator::Ret { value: None });
        let p1 = f.add_block(Terminator::Br { target: join });
        let p2 = f.add_block(Terminator::Br { target: join });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(1), then_to: p1, else_to: p2 },
        );

        let mut reg = SelectorRegistry::default();
        let args1 = vec![
            (Operand::i64(1), Ty::I64),
            (Operand::i64(0), Ty::I64),
            (Operand::i64(0), Ty::I64),
        ];
        let args2 = vec![
            (Operand::i64(2), Ty::I64),
            (Operand::i64(0), Ty::I64),
            (Operand::i64(0), Ty::I64),
        ];
        assert_eq!(
            reg.insert_hook_at_successor(&mut f, join, p1, hook, args1, default_id_args(3)),
            MergeOutcome::Created
        );
        assert_eq!(
            reg.insert_hook_at_successor(&mut f, join, p2, hook, args2, default_id_args(3)),
            MergeOutcome::Rebound
        );

        let mut tables = Tables::new(&mut m);
        reg.lower(&mut f, &mut tables);

        // One binding per incoming edge.
        let node = reg.node(join, hook).expect("selector exists");
        assert_eq!(node.bindings.len(), 2);
        assert!(node.bindings.values().all(|b| matches!(b, Binding::Args(_))));
        // Exactly one call for the (block, kind) pair.
        assert_eq!(count_calls_to(&m, &f, "__loom_after_call"), 1);
        // Each predecessor stores the full tuple on its edge.
        let stores_in = |label: Label| {
            f.block(label)
                .seq
                .iter()
                .filter(|iref| matches!(f.instr(**iref), Instr::Store(_)))
                .count()
        };
        assert_eq!(stores_in(p1), 3);
        assert_eq!(stores_in(p2), 3);
        m.add_function(f);
        m.verify().expect("lowered module verifies");
    }

    #[test]
    fn all_default_selector_emits_nothing() {
        let mut m = Module::new("unit");
        let mut hooks = Hooks::default();
        let hook = hooks.task_exit(&mut m);

        let mut f = Function::new("f");
        let sink = f.add_block(Terminator::Resume { value: None });
        let p1 = f.add_block(Terminator::Br { target: sink });
        let p2 = f.add_block(Terminator::Br { target: sink });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(1), then_to: p1, else_to: p2 },
        );

        let mut reg = SelectorRegistry::default();
        reg.ensure_rethrow_node(
            &f,
            sink,
            hook,
            EventCategory::TaskExit,
            vec![Ty::I64, Ty::I64, Ty::I64],
            default_id_args(3),
        );
        let mut tables = Tables::new(&mut m);
        reg.lower(&mut f, &mut tables);
        assert_eq!(count_calls_to(&m, &f, "__loom_task_exit"), 0);
        assert!(f.block(Label::ENTRY).seq.is_empty());
    }
}
