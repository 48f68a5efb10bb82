//! Tool-module merging.
//!
//! The externally supplied tool module defines the hook bodies. Its
//! functions, globals and external declarations are copied into the
//! program module before instrumentation; a definition colliding with a
//! program definition (unless one side is weak) aborts the transformation,
//! naming the conflicting symbol and the source module. Merged function
//! names are returned so the orchestrator never instruments hook bodies.
use std::collections::{BTreeMap, HashSet};

use loomir::modules::{
    Function, Linkage, Module,
    control_flow::Terminator,
    instructions::{Callee, Instr},
    operand::{ExtId, FuncRef, GlobalId, Operand},
};
use uuid::Uuid;

use crate::error::{WeaveError, WeaveResult};

/// Merge `tool` into `m`, returning the names of the merged functions.
pub fn merge_tool_module(m: &mut Module, tool: Module) -> WeaveResult<HashSet<String>> {
    let tool_name = if tool.name.is_empty() {
        "<tool>".to_string()
    } else {
        tool.name.clone()
    };

    // Defined-symbol conflicts are fatal and must name the definition.
    for func in tool.functions.values() {
        if let Some(existing) = m.function_by_name(&func.name) {
            if existing.linkage != Linkage::Weak && func.linkage != Linkage::Weak {
                return Err(WeaveError::SymbolConflict {
                    symbol: func.name.clone(),
                    tool_module: tool_name,
                });
            }
        }
    }
    for global in tool.globals.values() {
        if let Some((_, existing)) = m.global_by_name(&global.name) {
            if existing.linkage != Linkage::Weak && global.linkage != Linkage::Weak {
                return Err(WeaveError::SymbolConflict {
                    symbol: global.name.clone(),
                    tool_module: tool_name,
                });
            }
        }
    }

    // Copy globals and externals, building the handle remappings.
    let mut global_map: BTreeMap<GlobalId, GlobalId> = BTreeMap::new();
    for (old, global) in tool.globals {
        let new = match m.global_by_name(&global.name) {
            Some((gid, _)) => gid,
            None => m.add_global(global),
        };
        global_map.insert(old, new);
    }
    let mut ext_map: BTreeMap<ExtId, ExtId> = BTreeMap::new();
    for (old, ext) in tool.externals {
        let new = m.get_or_insert_external(ext);
        ext_map.insert(old, new);
    }

    // Weak collisions resolve to the program's definition; calls into the
    // skipped tool copy are redirected by UUID.
    let mut func_map: BTreeMap<Uuid, Uuid> = BTreeMap::new();
    let mut to_merge: Vec<Function> = Vec::new();
    for (uuid, func) in tool.functions {
        match m.function_by_name(&func.name) {
            Some(existing) => {
                func_map.insert(uuid, existing.uuid);
            }
            None => to_merge.push(func),
        }
    }

    let mut merged = HashSet::new();
    for mut func in to_merge {
        remap_function(&mut func, &global_map, &ext_map, &func_map);
        merged.insert(func.name.clone());
        log::debug!("merged tool function '{}'", func.name);
        m.add_function(func);
    }
    Ok(merged)
}

fn remap_operand(
    op: &mut Operand,
    global_map: &BTreeMap<GlobalId, GlobalId>,
    ext_map: &BTreeMap<ExtId, ExtId>,
    func_map: &BTreeMap<Uuid, Uuid>,
) {
    match op {
        Operand::Global(gid) => {
            if let Some(new) = global_map.get(gid) {
                *gid = *new;
            }
        }
        Operand::Func(func) => remap_func_ref(func, ext_map, func_map),
        _ => {}
    }
}

fn remap_func_ref(
    func: &mut FuncRef,
    ext_map: &BTreeMap<ExtId, ExtId>,
    func_map: &BTreeMap<Uuid, Uuid>,
) {
    match func {
        FuncRef::External(ext) => {
            if let Some(new) = ext_map.get(ext) {
                *ext = *new;
            }
        }
        FuncRef::Internal(uuid) => {
            if let Some(new) = func_map.get(uuid) {
                *uuid = *new;
            }
        }
    }
}

fn remap_function(
    f: &mut Function,
    global_map: &BTreeMap<GlobalId, GlobalId>,
    ext_map: &BTreeMap<ExtId, ExtId>,
    func_map: &BTreeMap<Uuid, Uuid>,
) {
    for (_, instr) in f.pool.iter_mut() {
        for op in instr.operands_mut() {
            remap_operand(op, global_map, ext_map, func_map);
        }
        if let Instr::Call(call) = instr {
            if let Callee::Func(func) = &mut call.callee {
                remap_func_ref(func, ext_map, func_map);
            }
        }
    }
    for bb in f.body.values_mut() {
        for op in bb.terminator.operands_mut() {
            remap_operand(op, global_map, ext_map, func_map);
        }
        if let Terminator::Invoke { callee: Callee::Func(func), .. } = &mut bb.terminator {
            remap_func_ref(func, ext_map, func_map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomir::modules::control_flow::Terminator;

    fn defined(name: &str) -> Function {
        let mut f = Function::new(name);
        f.set_terminator(
            loomir::modules::operand::Label::ENTRY,
            Terminator::Ret { value: None },
        );
        f
    }

    #[test]
    fn merges_disjoint_tool_functions() {
        let mut m = Module::new("program");
        m.add_function(defined("main"));
        let mut tool = Module::new("tool.bc");
        tool.add_function(defined("__loom_func_entry"));

        let merged = merge_tool_module(&mut m, tool).expect("merge succeeds");
        assert!(merged.contains("__loom_func_entry"));
        assert!(m.function_by_name("__loom_func_entry").is_some());
    }

    #[test]
    fn conflicting_definitions_name_symbol_and_module() {
        let mut m = Module::new("program");
        m.add_function(defined("helper"));
        let mut tool = Module::new("tool.bc");
        tool.add_function(defined("helper"));

        let err = merge_tool_module(&mut m, tool).unwrap_err();
        match err {
            WeaveError::SymbolConflict { symbol, tool_module } => {
                assert_eq!(symbol, "helper");
                assert_eq!(tool_module, "tool.bc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn weak_collision_keeps_the_program_definition() {
        let mut m = Module::new("program");
        m.add_function(defined("shared"));
        let program_uuid = m.function_by_name("shared").unwrap().uuid;

        let mut tool = Module::new("tool.bc");
        let mut weak = defined("shared");
        weak.linkage = Linkage::Weak;
        tool.add_function(weak);

        let merged = merge_tool_module(&mut m, tool).expect("weak collision is allowed");
        assert!(merged.is_empty());
        assert_eq!(m.function_by_name("shared").unwrap().uuid, program_uuid);
    }
}
