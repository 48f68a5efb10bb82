//! Loop instrumentation scenarios.
use loomir::{
    builder::Cursor,
    modules::{
        Function, Module,
        control_flow::Terminator,
        instructions::{BinOpKind, CmpOp, Instr},
        operand::{Label, Operand},
    },
    types::Ty,
};

mod support;
use support::{call_id_constant, calls_to, instrument, nth_call_arg_imm};

/// One outer loop containing one inner loop, neither with a derivable
/// trip count.
fn nested_loops() -> Function {
    let mut f = Function::new("nest");
    let p_outer = f.add_param(Ty::I1);
    let p_inner = f.add_param(Ty::I1);
    let exit = f.add_block(Terminator::Ret { value: None });
    let outer_h = f.add_block(Terminator::Unreachable);
    let inner_h = f.add_block(Terminator::Unreachable);
    let inner_latch = f.add_block(Terminator::Br { target: inner_h });
    let outer_latch = f.add_block(Terminator::Br { target: outer_h });
    f.set_terminator(
        inner_h,
        Terminator::CondBr {
            cond: Operand::Reg(p_inner),
            then_to: inner_latch,
            else_to: outer_latch,
        },
    );
    f.set_terminator(
        outer_h,
        Terminator::CondBr { cond: Operand::Reg(p_outer), then_to: inner_h, else_to: exit },
    );
    f.set_terminator(Label::ENTRY, Terminator::Br { target: outer_h });
    f
}

#[test]
fn nested_loops_get_one_hook_set_each_with_preorder_ids() {
    let mut m = Module::new("unit");
    m.add_function(nested_loops());

    instrument(&mut m);

    let f = m.function_by_name("nest").unwrap();
    assert_eq!(calls_to(&m, f, "__loom_before_loop"), 2);
    assert_eq!(calls_to(&m, f, "__loom_loopbody_entry"), 2);
    assert_eq!(calls_to(&m, f, "__loom_loopbody_exit"), 2);
    assert_eq!(calls_to(&m, f, "__loom_after_loop"), 2);

    // The outer loop's preheader is the entry block and its ID precedes
    // the inner loop's.
    assert_eq!(call_id_constant(&m, f, Label::ENTRY, "__loom_before_loop", 0), Some(0));
    let inner_id = f
        .body
        .keys()
        .filter(|label| **label != Label::ENTRY)
        .find_map(|label| call_id_constant(&m, f, *label, "__loom_before_loop", 0));
    assert_eq!(inner_id, Some(1));

    // Neither trip count is derivable: both hooks carry the sentinel.
    assert_eq!(nth_call_arg_imm(&m, f, "__loom_before_loop", 1), vec![-1, -1]);
}

/// A canonical counted loop: slot initialized in the preheader, stepped
/// by one in the single latch, compared against a parameter bound.
fn counted_loop() -> Function {
    let mut f = Function::new("counted");
    let n = f.add_param(Ty::I64);
    let exit = f.add_block(Terminator::Ret { value: None });
    let header = f.add_block(Terminator::Unreachable);

    let slot;
    {
        let mut cur = Cursor::at_block_start(&mut f, Label::ENTRY);
        slot = cur.alloca(Ty::I64);
        cur.store(Ty::I64, Operand::Reg(slot), Operand::i64(0));
    }
    f.set_terminator(Label::ENTRY, Terminator::Br { target: header });

    let cond;
    {
        let mut cur = Cursor::at_block_start(&mut f, header);
        let iv = cur.load(Ty::I64, Operand::Reg(slot));
        let next = cur.add(Ty::I64, Operand::Reg(iv), Operand::i64(1));
        cur.store(Ty::I64, Operand::Reg(slot), Operand::Reg(next));
        cond = cur.cmp(CmpOp::Slt, Ty::I64, Operand::Reg(next), Operand::Reg(n));
    }
    f.set_terminator(
        header,
        Terminator::CondBr { cond: Operand::Reg(cond), then_to: header, else_to: exit },
    );
    f
}

#[test]
fn counted_loop_carries_a_runtime_trip_count() {
    let mut m = Module::new("unit");
    m.add_function(counted_loop());

    instrument(&mut m);

    let f = m.function_by_name("counted").unwrap();
    assert_eq!(calls_to(&m, f, "__loom_before_loop"), 1);

    // The trip count argument is a computed value, not the sentinel:
    // bound minus the initial slot value, emitted in the preheader.
    let trip_reg = f
        .block(Label::ENTRY)
        .seq
        .iter()
        .find_map(|iref| match f.instr(*iref) {
            Instr::Call(call) => {
                let name = match &call.callee {
                    loomir::modules::instructions::Callee::Func(
                        loomir::modules::operand::FuncRef::External(ext),
                    ) => m.external(*ext).map(|e| e.name.as_str()),
                    _ => None,
                };
                if name == Some("__loom_before_loop") {
                    call.args.get(1).and_then(Operand::as_reg)
                } else {
                    None
                }
            }
            _ => None,
        })
        .expect("before-loop hook carries a register trip count");
    let def = f.def_of(trip_reg).expect("trip count is computed");
    assert!(matches!(
        f.instr(def),
        Instr::BinOp(binop) if binop.kind == BinOpKind::Sub
    ));
}

#[test]
fn latch_exits_are_tagged() {
    let mut m = Module::new("unit");
    m.add_function(counted_loop());

    instrument(&mut m);

    let f = m.function_by_name("counted").unwrap();
    // The single exiting block is the latch itself.
    let props = nth_call_arg_imm(&m, f, "__loom_loopbody_exit", 2);
    assert_eq!(props.len(), 1);
    assert_eq!(props[0] & 1, 1, "latch exit must carry the latch tag");
}
