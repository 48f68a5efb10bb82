//! The per-function instrumentation driver.
//!
//! Each function is processed once: canonicalize the CFG, classify every
//! instrumentable site into typed work lists before anything is mutated,
//! then run the instrumenters in a fixed order, lower the join-point
//! selectors, and finish with basic-block hooks so that block-entry/exit
//! calls enclose every other hook kind at both boundaries. Table
//! serialization and the unit constructor are emitted once per module, and
//! the result must pass the structural verifier.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use loomir::{
    alloc::{classify_alloc, classify_free},
    analysis::{DomTree, LoopForest, TaskTree},
    builder::Cursor,
    modules::{
        ExternalFunction, Function, InstrRef, Module,
        control_flow::Terminator,
        instructions::{Call, Callee, Instr, MemIntrKind},
        operand::{FuncRef, Label},
    },
    types::Ty,
};
use uuid::Uuid;

use crate::{
    canonicalize,
    config::{InstrPoint, InstrumentOptions, InstrumentProfile},
    error::WeaveResult,
    hooks::{Hooks, SelectorRegistry},
    props::{BlockProp, FuncExitProp, FuncProp},
    tables::{EventCategory, Tables},
    tool,
};

pub mod alloc;
pub mod calls;
pub mod forkjoin;
pub mod loops;
pub mod memory;

/// Optional host-supplied per-block cost estimate, used in place of the
/// default instruction count for the size table.
pub type CostEstimate = dyn Fn(&Function, Label) -> u32;

/// Per-function instrumentation context shared by all instrumenters.
pub(crate) struct FuncCtx<'a> {
    pub m: &'a mut Module,
    pub tables: &'a mut Tables,
    pub hooks: &'a mut Hooks,
    pub options: &'a InstrumentOptions,
    pub profile: &'a InstrumentProfile,
    pub selectors: SelectorRegistry,
}

/// The whole-module instrumentation pass.
pub struct Instrumenter {
    options: InstrumentOptions,
    profile: InstrumentProfile,
    tool: Option<Module>,
    cost_estimate: Option<Box<CostEstimate>>,
}

impl Instrumenter {
    pub fn new(options: InstrumentOptions, profile: InstrumentProfile) -> Instrumenter {
        Instrumenter { options, profile, tool: None, cost_estimate: None }
    }

    /// Merge the externally supplied hook-implementation module before
    /// instrumenting.
    pub fn with_tool(mut self, tool: Module) -> Instrumenter {
        self.tool = Some(tool);
        self
    }

    pub fn with_cost_estimate(mut self, estimate: Box<CostEstimate>) -> Instrumenter {
        self.cost_estimate = Some(estimate);
        self
    }

    /// Instrument the module in place.
    ///
    /// Any error aborts the transformation; an error from the final
    /// structural verification indicates a defect in the instrumenter
    /// itself.
    pub fn run(mut self, m: &mut Module) -> WeaveResult<()> {
        let tool_symbols = match self.tool.take() {
            Some(tool) => tool::merge_tool_module(m, tool)?,
            None => HashSet::new(),
        };

        let mut tables = Tables::new(m);
        let mut hooks = Hooks::default();

        let uuids: Vec<Uuid> = m.functions.keys().copied().collect();
        for uuid in uuids {
            let mut f = m
                .functions
                .remove(&uuid)
                .expect("uuid collected from the function map");
            if should_instrument(&f, &tool_symbols) {
                let mut ctx = FuncCtx {
                    m,
                    tables: &mut tables,
                    hooks: &mut hooks,
                    options: &self.options,
                    profile: &self.profile,
                    selectors: SelectorRegistry::default(),
                };
                instrument_function(&mut ctx, &mut f, self.cost_estimate.as_deref());
            }
            m.functions.insert(uuid, f);
        }

        crate::finalize::emit_unit_tables(m, &tables)?;
        m.verify()?;
        Ok(())
    }
}

fn should_instrument(f: &Function, tool_symbols: &HashSet<String>) -> bool {
    !f.name.starts_with("__loom") && !tool_symbols.contains(&f.name)
}

/// Everything classified about a function before mutation begins.
#[derive(Default)]
struct Worklists {
    blocks: Vec<Label>,
    unwind_targets: BTreeSet<Label>,
    atomics: Vec<(Label, InstrRef)>,
    detaches: Vec<Label>,
    syncs: Vec<Label>,
    call_sites: Vec<(Label, InstrRef)>,
    invoke_sites: Vec<Label>,
    alloc_calls: Vec<(Label, InstrRef)>,
    alloc_invokes: Vec<Label>,
    free_calls: Vec<(Label, InstrRef)>,
    mem_intrinsics: Vec<(Label, InstrRef)>,
    allocas: Vec<(Label, InstrRef)>,
    /// Every call or invoke, for interposition. `None` names an invoke.
    all_calls: Vec<(Label, Option<InstrRef>)>,
}

fn classify(m: &Module, f: &Function, dom: &DomTree) -> Worklists {
    let mut w = Worklists::default();

    // Join successors in explicit-exception-edge form are artifacts, not
    // program blocks.
    let mut ignored: BTreeSet<Label> = BTreeSet::new();
    for bb in f.body.values() {
        if let Terminator::Sync { cont, region } = bb.terminator {
            if matches!(
                f.block(cont).terminator,
                Terminator::SyncUnwind { region: r, .. } if r == region
            ) {
                ignored.insert(cont);
            }
        }
        w.unwind_targets.extend(bb.terminator.unwind_successors());
    }

    for (label, bb) in &f.body {
        if !dom.is_reachable(*label) {
            continue;
        }
        for iref in &bb.seq {
            let instr = f.instr(*iref);
            match instr {
                _ if instr.is_atomic_access() => w.atomics.push((*label, *iref)),
                Instr::Alloca(_) => w.allocas.push((*label, *iref)),
                Instr::MemIntr(_) => w.mem_intrinsics.push((*label, *iref)),
                Instr::Call(call) => {
                    let direct_name = match &call.callee {
                        Callee::Func(func) => m.symbol_name(*func),
                        Callee::Indirect(_) => None,
                    };
                    if canonicalize::is_placeholder_call(m, instr) {
                        continue;
                    }
                    match direct_name {
                        Some(name) if classify_alloc(name).is_some() => {
                            w.alloc_calls.push((*label, *iref))
                        }
                        Some(name) if classify_free(name).is_some() => {
                            w.free_calls.push((*label, *iref))
                        }
                        _ => w.call_sites.push((*label, *iref)),
                    }
                    w.all_calls.push((*label, Some(*iref)));
                }
                _ => {}
            }
        }
        match &bb.terminator {
            Terminator::Detach { .. } => w.detaches.push(*label),
            Terminator::Sync { .. } => w.syncs.push(*label),
            Terminator::Invoke { callee, .. } => {
                let is_alloc = match callee {
                    Callee::Func(func) => m
                        .symbol_name(*func)
                        .is_some_and(|name| classify_alloc(name).is_some()),
                    Callee::Indirect(_) => false,
                };
                if is_alloc {
                    w.alloc_invokes.push(*label);
                } else {
                    w.invoke_sites.push(*label);
                }
                w.all_calls.push((*label, None));
            }
            _ => {}
        }
        if !ignored.contains(label) {
            w.blocks.push(*label);
        }
    }
    w
}

fn instrument_function(ctx: &mut FuncCtx<'_>, f: &mut Function, cost: Option<&CostEstimate>) {
    log::debug!("instrumenting function '{}'", f.name);

    // CFG canonicalization: promote throwing calls, terminate blocks at
    // calls, give loops preheaders, make join predecessors homogeneous.
    if ctx.options.calls_may_throw {
        canonicalize::promote_calls_to_invokes(ctx.m, f);
    }
    if ctx.options.basic_blocks && ctx.options.calls_terminate_blocks {
        canonicalize::split_blocks_at_calls(ctx.m, f);
    }
    if ctx.options.loops {
        loomir::analysis::loops::simplify_loops(f);
    }
    canonicalize::setup_blocks(ctx.m, f);

    let dom = DomTree::build(f);
    let forest = LoopForest::build(f, &dom);
    let tasks = TaskTree::build(f);

    // One classification pass before any mutation.
    let w = classify(ctx.m, f, &dom);
    let load_store_props =
        memory::collect_load_store_properties(ctx.m, f, &w.blocks);

    // Block IDs and sizes come from the pre-instrumentation snapshot; the
    // block metadata table and the size table must agree on every ID.
    let mut block_ids: BTreeMap<Label, u64> = BTreeMap::new();
    for label in &w.blocks {
        let id = ctx.tables.fed[EventCategory::Block].add_block(f, *label);
        let size_id = ctx.tables.block_size.add(ctx.m, f, *label, cost);
        debug_assert_eq!(id, size_id, "block ids diverged between tables");
        block_ids.insert(*label, id);
    }

    let func_local = ctx.tables.fed[EventCategory::FunctionEntry].add_function(f);
    ctx.tables.func_offsets.insert(f.name.clone(), func_local);
    let may_spawn = !w.detaches.is_empty();

    // Fork/join constructs.
    if ctx.options.fork_join && (!w.detaches.is_empty() || !w.syncs.is_empty()) {
        let flags = forkjoin::region_flags(f, &w.detaches, &w.syncs);
        if ctx.profile.instrument_point(&f.name, InstrPoint::Fork) {
            for label in &w.detaches {
                forkjoin::instrument_detach(ctx, f, &forest, &tasks, *label, &flags);
            }
        }
        if ctx.profile.instrument_point(&f.name, InstrPoint::Join) {
            for label in &w.syncs {
                forkjoin::instrument_sync(ctx, f, *label, &flags);
            }
        }
    }

    if ctx.options.loops {
        // Fork/join instrumentation may have split continue edges; the
        // loop forest must describe the current graph.
        let dom = DomTree::build(f);
        let forest = LoopForest::build(f, &dom);
        loops::instrument_loops(ctx, f, &forest, &tasks);
    }

    if ctx.options.memory_accesses {
        for (label, iref, prop) in load_store_props {
            memory::instrument_load_or_store(ctx, f, label, iref, prop);
        }
    }

    // Atomics can implement synchronization; leaving them silent would be
    // worse than noisy.
    if ctx.options.atomics && !w.atomics.is_empty() {
        log::warn!(
            "{} atomic operations in '{}' are not instrumented",
            w.atomics.len(),
            f.name
        );
    }

    if ctx.options.mem_intrinsics {
        for (_, iref) in &w.mem_intrinsics {
            rewrite_mem_intrinsic(ctx, f, *iref);
        }
    }

    if ctx.options.calls {
        for (label, iref) in &w.call_sites {
            calls::instrument_call(ctx, f, *label, *iref);
        }
        for label in &w.invoke_sites {
            calls::instrument_invoke(ctx, f, *label);
        }
    }

    if ctx.options.local_allocs {
        for (label, iref) in &w.allocas {
            alloc::instrument_alloca(ctx, f, *label, *iref);
        }
    }

    if ctx.options.alloc_fns {
        for (label, iref) in &w.alloc_calls {
            alloc::instrument_alloc_call(ctx, f, *label, *iref);
        }
        for label in &w.alloc_invokes {
            alloc::instrument_alloc_invoke(ctx, f, *label);
        }
        for (label, iref) in &w.free_calls {
            alloc::instrument_free(ctx, f, *label, *iref);
        }
    }

    if ctx.options.interpose && ctx.profile.interposes_anything() {
        for (label, iref) in &w.all_calls {
            calls::interpose_call(ctx, f, *label, *iref);
        }
    }

    if ctx.options.function_entry_exit {
        instrument_function_entry_exit(ctx, f, func_local, may_spawn);
    }

    // Resolve join-point argument merges now, so their calls sit inside
    // the block hooks inserted below.
    let mut selectors = std::mem::take(&mut ctx.selectors);
    selectors.lower(f, ctx.tables);

    // Basic blocks last: block-entry/exit hooks enclose every other hook
    // kind at both boundaries.
    if ctx.options.basic_blocks {
        for label in &w.blocks {
            instrument_basic_block(ctx, f, *label, block_ids[label], &w.unwind_targets);
        }
    }
}

fn instrument_function_entry_exit(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    func_local: u64,
    may_spawn: bool,
) {
    let entry_hook = ctx.hooks.func_entry(ctx.m);
    let exit_hook = ctx.hooks.func_exit(ctx.m);

    // The function ID is computed once at the entry; it dominates every
    // exit site.
    let name = f.name.clone();
    let mut cur = Cursor::at_block_start(f, Label::ENTRY);
    let func_id = ctx.tables.fed[EventCategory::FunctionEntry].local_to_global(func_local, &mut cur);

    if ctx.profile.instrument_point(&name, InstrPoint::Entry) {
        let mut prop = FuncProp::default();
        if may_spawn {
            prop |= FuncProp::MAY_SPAWN;
        }
        cur.call_ext(entry_hook, vec![func_id.clone(), prop.operand()]);
    }

    if ctx.profile.instrument_point(&name, InstrPoint::Exit) {
        // One exit hook per escape point: ordinary returns and exception
        // resumes, each with its own exit ID.
        let exits: Vec<(Label, bool)> = f
            .body
            .iter()
            .filter_map(|(label, bb)| match bb.terminator {
                Terminator::Ret { .. } => Some((*label, false)),
                Terminator::Resume { .. } => Some((*label, true)),
                _ => None,
            })
            .collect();
        for (label, eh_return) in exits {
            let mut prop = FuncExitProp::default();
            if may_spawn {
                prop |= FuncExitProp::MAY_SPAWN;
            }
            if eh_return {
                prop |= FuncExitProp::EH_RETURN;
            }
            let exit_local = ctx.tables.fed[EventCategory::FunctionExit].add_term(f, label);
            let mut cur = Cursor::before_terminator(f, label);
            let exit_id =
                ctx.tables.fed[EventCategory::FunctionExit].local_to_global(exit_local, &mut cur);
            cur.call_ext(exit_hook, vec![exit_id, func_id.clone(), prop.operand()]);
        }
    }
}

fn instrument_basic_block(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    label: Label,
    local: u64,
    unwind_targets: &BTreeSet<Label>,
) {
    let entry_hook = ctx.hooks.bb_entry(ctx.m);
    let exit_hook = ctx.hooks.bb_exit(ctx.m);

    let mut prop = BlockProp::default();
    if unwind_targets.contains(&label) {
        prop |= BlockProp::LANDING_PAD;
    }

    // One ID computation at the head serves both hooks.
    let mut cur = Cursor::at_block_start(f, label);
    let id = ctx.tables.fed[EventCategory::Block].local_to_global(local, &mut cur);
    cur.call_ext(entry_hook, vec![id.clone(), prop.operand()]);
    let mut cur = Cursor::before_terminator(f, label);
    cur.call_ext(exit_hook, vec![id, prop.operand()]);
}

/// Rewrite a memory copy/fill intrinsic to an ordinary call, so later
/// stages need no special-casing.
fn rewrite_mem_intrinsic(ctx: &mut FuncCtx<'_>, f: &mut Function, iref: InstrRef) {
    let Instr::MemIntr(intr) = f.instr(iref) else { return };
    let (name, params) = match intr.kind {
        MemIntrKind::Cpy => ("memcpy", vec![Ty::Ptr, Ty::Ptr, Ty::I64]),
        MemIntrKind::Move => ("memmove", vec![Ty::Ptr, Ty::Ptr, Ty::I64]),
        MemIntrKind::Set => ("memset", vec![Ty::Ptr, Ty::I32, Ty::I64]),
    };
    let (dst, src, len) = (intr.dst.clone(), intr.src.clone(), intr.len.clone());
    let ext = ctx.m.get_or_insert_external(ExternalFunction {
        name: name.to_string(),
        params,
        return_ty: Some(Ty::Ptr),
        nounwind: true,
    });
    *f.instr_mut(iref) = Instr::Call(Call {
        dest: None,
        callee: Callee::Func(FuncRef::External(ext)),
        args: vec![dst, src, len],
        return_ty: Some(Ty::Ptr),
        no_return: false,
    });
}
