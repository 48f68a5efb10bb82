//! Module-finish serialization.
//!
//! Emitted exactly once, after every function is instrumented: the
//! per-category metadata tables and their unit descriptors, the size
//! table, the generated callsite-to-function-ID initializer, and one unit
//! constructor calling `__loomrt_unit_init` with references to all tables,
//! registered to run before ordinary program code at load time.
use loomir::{
    builder::Cursor,
    modules::{
        ExternalFunction, Function, Global, Linkage, Module,
        consts::Const,
        control_flow::Terminator,
        operand::{FuncRef, Label, Operand},
    },
    types::Ty,
};
use strum::IntoEnumIterator;

use crate::{
    error::WeaveResult,
    instrument::calls::func_id_global,
    tables::{EventCategory, Tables, intern_cstr},
};

/// Serialize all tables and register the unit constructor.
pub fn emit_unit_tables(m: &mut Module, tables: &Tables) -> WeaveResult<()> {
    let init_callsites = build_init_callsites(m, tables);

    // Per-category unit descriptors: {count, base-id cell, record array}.
    let mut descriptors = Vec::new();
    for category in EventCategory::iter() {
        let table = &tables.fed[category];
        let records = table.serialize(m)?;
        descriptors.push(Const::Struct(vec![
            Const::i64(table.len() as i64),
            Const::GlobalRef(table.base_cell()),
            Const::GlobalRef(records),
        ]));
    }
    let fed_tables = m.add_global(Global {
        name: "__loom_unit_fed_tables".to_string(),
        ty: Ty::Ptr,
        init: Const::Array(descriptors),
        constant: true,
        thread_local: false,
        linkage: Linkage::Internal,
    });

    // The size table descriptor: {count, record array}.
    let size_records = tables.block_size.serialize(m);
    let size_tables = m.add_global(Global {
        name: "__loom_unit_size_tables".to_string(),
        ty: Ty::Ptr,
        init: Const::Array(vec![Const::Struct(vec![
            Const::i64(tables.block_size.len() as i64),
            Const::GlobalRef(size_records),
        ])]),
        constant: true,
        thread_local: false,
        linkage: Linkage::Internal,
    });

    // The unit constructor calls the runtime initializer with the unit
    // name and every table reference.
    let rt_init = m.get_or_insert_external(ExternalFunction {
        name: "__loomrt_unit_init".to_string(),
        params: vec![Ty::Ptr, Ty::Ptr, Ty::Ptr, Ty::Ptr],
        return_ty: None,
        nounwind: true,
    });
    let unit_name = {
        let name = m.name.clone();
        intern_cstr(m, &name)
    };
    let mut ctor = Function::new("__loom_unit_ctor");
    ctor.nounwind = true;
    let mut cur = Cursor::at_block_start(&mut ctor, Label::ENTRY);
    cur.call_ext(
        rt_init,
        vec![
            Operand::Global(unit_name),
            Operand::Global(fed_tables),
            Operand::Global(size_tables),
            Operand::Func(FuncRef::Internal(init_callsites)),
        ],
    );
    ctor.set_terminator(Label::ENTRY, Terminator::Ret { value: None });
    let ctor_uuid = m.add_function(ctor);
    m.ctors.push(FuncRef::Internal(ctor_uuid));

    log::debug!("emitted unit tables and constructor for module '{}'", m.name);
    Ok(())
}

/// Generate the function that stores each defined function's global ID
/// (base plus local offset) into its weak per-callee ID cell at load time.
fn build_init_callsites(m: &mut Module, tables: &Tables) -> uuid::Uuid {
    let targets: Vec<(loomir::modules::operand::GlobalId, u64)> = tables
        .func_offsets
        .iter()
        .map(|(name, local)| (func_id_global(m, name), *local))
        .collect();
    let base_cell = tables.fed[EventCategory::FunctionEntry].base_cell();

    let mut f = Function::new("__loom_init_callsites");
    f.nounwind = true;
    let mut cur = Cursor::at_block_start(&mut f, Label::ENTRY);
    let base = cur.load(Ty::I64, Operand::Global(base_cell));
    for (gid, local) in targets {
        let id = cur.add(Ty::I64, Operand::Reg(base), Operand::i64(local as i64));
        cur.store(Ty::I64, Operand::Global(gid), Operand::Reg(id));
    }
    f.set_terminator(Label::ENTRY, Terminator::Ret { value: None });
    m.add_function(f)
}
