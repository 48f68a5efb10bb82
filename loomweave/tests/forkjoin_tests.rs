//! Fork/join instrumentation scenarios.
use loomir::{
    modules::{
        Function, Module,
        control_flow::{RegionId, Terminator},
        instructions::Instr,
        operand::{Imm, Label, Operand},
    },
    types::Ty,
};

mod support;
use support::{calls_to, instrument};

/// One fork whose spawned block both returns normally and rethrows, with
/// a join in explicit-exception-edge form behind it.
fn fork_with_both_exits() -> Function {
    let region = RegionId(0);
    let mut f = Function::new("forky");
    let p = f.add_param(Ty::I1);
    let ret_block = f.add_block(Terminator::Ret { value: None });
    let join_pad = f.add_block(Terminator::Resume { value: None });
    let sync_unwind = f.add_block(Terminator::SyncUnwind {
        region,
        normal: ret_block,
        unwind: join_pad,
    });
    let cont = f.add_block(Terminator::Sync { cont: sync_unwind, region });
    let fork_pad = f.add_block(Terminator::Resume { value: None });
    let body_ret = f.add_block(Terminator::Reattach { cont, region });
    let body_throw = f.add_block(Terminator::DetachedRethrow { region, unwind: fork_pad });
    let body = f.add_block(Terminator::CondBr {
        cond: Operand::Reg(p),
        then_to: body_ret,
        else_to: body_throw,
    });
    f.set_terminator(
        Label::ENTRY,
        Terminator::Detach { task: body, cont, unwind: Some(fork_pad), region },
    );
    f
}

/// The block and in-block index of every call to the named hook.
fn hook_sites(m: &Module, f: &Function, hook: &str) -> Vec<(Label, usize)> {
    let Some((ext, _)) = m.external_by_name(hook) else { return Vec::new() };
    let mut sites = Vec::new();
    for (label, bb) in &f.body {
        for (index, iref) in bb.seq.iter().enumerate() {
            if let Instr::Call(call) = f.instr(*iref) {
                if call.callee
                    == loomir::modules::instructions::Callee::Func(
                        loomir::modules::operand::FuncRef::External(ext),
                    )
                {
                    sites.push((*label, index));
                }
            }
        }
    }
    sites
}

fn is_flag_store(f: &Function, label: Label, index: usize, value: i32) -> bool {
    f.block(label)
        .seq
        .get(index)
        .is_some_and(|iref| match f.instr(*iref) {
            Instr::Store(store) => {
                store.ty == Ty::I32 && store.value == Operand::Imm(Imm::i32(value))
            }
            _ => false,
        })
}

#[test]
fn fork_with_normal_and_exceptional_exits_gets_the_full_hook_set() {
    let mut m = Module::new("unit");
    m.add_function(fork_with_both_exits());

    instrument(&mut m);

    let f = m.function_by_name("forky").unwrap();
    assert_eq!(calls_to(&m, f, "__loom_fork"), 1);
    assert_eq!(calls_to(&m, f, "__loom_task"), 1);
    // One task exit per exit kind: the reattach and the rethrow.
    assert_eq!(calls_to(&m, f, "__loom_task_exit"), 2);
    assert_eq!(calls_to(&m, f, "__loom_before_join"), 1);
    // One after-join on each of the join's normal and exceptional
    // successors.
    assert_eq!(calls_to(&m, f, "__loom_after_join"), 2);
    // The fork continuation fires on the normal path and on the unwind
    // path.
    assert_eq!(calls_to(&m, f, "__loom_fork_continue"), 2);
}

#[test]
fn scope_flag_is_set_at_the_fork_and_reset_after_both_join_paths() {
    let mut m = Module::new("unit");
    m.add_function(fork_with_both_exits());

    instrument(&mut m);

    let f = m.function_by_name("forky").unwrap();

    // The fork hook is immediately preceded by the flag-set store.
    let fork_sites = hook_sites(&m, f, "__loom_fork");
    assert_eq!(fork_sites.len(), 1);
    let (fork_block, fork_index) = fork_sites[0];
    assert!(fork_index > 0 && is_flag_store(f, fork_block, fork_index - 1, 1));

    // Every after-join hook is immediately followed by the flag reset,
    // on the normal and the exceptional path alike.
    let join_sites = hook_sites(&m, f, "__loom_after_join");
    assert_eq!(join_sites.len(), 2);
    for (label, index) in join_sites {
        assert!(
            is_flag_store(f, label, index + 1, 0),
            "after-join at {label} lacks its flag reset"
        );
    }
}

/// Two sibling tasks whose rethrows land in one shared cleanup chain.
fn shared_unwind_tasks() -> Function {
    let region = RegionId(0);
    let mut f = Function::new("shared");
    let ret_block = f.add_block(Terminator::Ret { value: None });
    let final_pad = f.add_block(Terminator::Resume { value: None });
    let cleanup = f.add_block(Terminator::DetachedRethrow { region, unwind: final_pad });
    let body1 = f.add_block(Terminator::DetachedRethrow { region, unwind: cleanup });
    let body2 = f.add_block(Terminator::DetachedRethrow { region, unwind: cleanup });
    let cont2 = f.add_block(Terminator::Sync { cont: ret_block, region });
    let cont1 = f.add_block(Terminator::Detach {
        task: body2,
        cont: cont2,
        unwind: Some(cleanup),
        region,
    });
    f.set_terminator(
        Label::ENTRY,
        Terminator::Detach { task: body1, cont: cont1, unwind: Some(cleanup), region },
    );
    f
}

#[test]
fn shared_unwind_chain_merges_into_one_task_exit_call() {
    let mut m = Module::new("unit");
    m.add_function(shared_unwind_tasks());

    instrument(&mut m);

    let f = m.function_by_name("shared").unwrap();
    assert_eq!(calls_to(&m, f, "__loom_fork"), 2);
    assert_eq!(calls_to(&m, f, "__loom_task"), 2);
    // Both tasks' exception exits alias the same cleanup chain: exactly
    // one merged task-exit call, regardless of how many tasks feed it.
    assert_eq!(calls_to(&m, f, "__loom_task_exit"), 1);
}

/// A task that maintains its own frame: the unwind continuation hook
/// belongs after the intermediate resume point.
fn task_with_frame() -> Function {
    let region = RegionId(0);
    let mut f = Function::new("framed");
    let p = f.add_param(Ty::I1);
    let ret_block = f.add_block(Terminator::Ret { value: None });
    let real_pad = f.add_block(Terminator::Resume { value: None });
    let frame_resume = f.add_block(Terminator::TaskFrameResume { unwind: real_pad });
    let cont = f.add_block(Terminator::Sync { cont: ret_block, region });
    let body_ret = f.add_block(Terminator::Reattach { cont, region });
    let body = f.add_block(Terminator::CondBr {
        cond: Operand::Reg(p),
        then_to: body_ret,
        else_to: frame_resume,
    });
    f.set_terminator(
        Label::ENTRY,
        Terminator::Detach { task: body, cont, unwind: Some(real_pad), region },
    );
    f
}

#[test]
fn taskframe_resume_redirects_the_unwind_continuation() {
    let mut m = Module::new("unit");
    m.add_function(task_with_frame());

    instrument(&mut m);

    let f = m.function_by_name("framed").unwrap();
    assert_eq!(calls_to(&m, f, "__loom_fork_continue"), 2);

    // One continuation hook carries the unwind property (reached through
    // the frame-resume redirect), the other is the normal continuation.
    let props: Vec<i64> = f
        .body
        .values()
        .flat_map(|bb| bb.seq.iter())
        .filter_map(|iref| match f.instr(*iref) {
            Instr::Call(call) => {
                let ext = m.external_by_name("__loom_fork_continue")?.0;
                if call.callee
                    == loomir::modules::instructions::Callee::Func(
                        loomir::modules::operand::FuncRef::External(ext),
                    )
                {
                    match call.args.get(2) {
                        Some(Operand::Imm(imm)) => Some(imm.value),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect();
    assert!(props.contains(&1), "the redirected continuation carries the unwind bit");
    assert!(props.contains(&0), "the normal continuation carries no unwind bit");
}
