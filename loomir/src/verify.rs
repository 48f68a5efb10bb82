//! Structural well-formedness checks.
//!
//! [`Module::verify`] confirms that every function has an entry block, that
//! all terminator targets name blocks of the same function, that SSA names
//! are defined exactly once and every referenced name has a definition, and
//! that symbol references (globals, externals, internal callees, ctors)
//! resolve. Passes that mutate the IR are expected to leave modules in a
//! state that passes this check; a failure after a transformation indicates
//! a defect in the transformation itself.
use std::collections::BTreeSet;

use crate::{
    error::{IrError, IrResult},
    modules::{Function, Module, instructions::Callee, operand::{FuncRef, Label, Operand}},
};

impl Module {
    /// Check the whole module, reporting the first structural error found.
    pub fn verify(&self) -> IrResult<()> {
        for function in self.functions.values() {
            self.verify_function(function)?;
        }
        for ctor in &self.ctors {
            match ctor {
                FuncRef::Internal(uuid) if !self.functions.contains_key(uuid) => {
                    return Err(IrError::UnknownCtor);
                }
                FuncRef::External(ext) if !self.externals.contains_key(ext) => {
                    return Err(IrError::UnknownCtor);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn verify_function(&self, f: &Function) -> IrResult<()> {
        if !f.body.contains_key(&Label::ENTRY) {
            return Err(IrError::MissingEntryBlock { function: f.name.clone() });
        }

        // Terminator targets must name blocks of this function.
        for (label, bb) in &f.body {
            for succ in bb.terminator.successors() {
                if !f.body.contains_key(&succ) {
                    return Err(IrError::UnknownBlock {
                        function: f.name.clone(),
                        block: *label,
                        target: succ,
                    });
                }
            }
        }

        // Each SSA name defined exactly once, counting parameters and
        // invoke destinations.
        let mut defined = BTreeSet::new();
        for (name, _) in &f.params {
            if !defined.insert(*name) {
                return Err(IrError::DuplicateName { function: f.name.clone(), name: *name });
            }
        }
        for bb in f.body.values() {
            for iref in &bb.seq {
                if let Some(dest) = f.pool[*iref].destination() {
                    if !defined.insert(dest) {
                        return Err(IrError::DuplicateName { function: f.name.clone(), name: dest });
                    }
                }
            }
            if let Some(dest) = bb.terminator.destination() {
                if !defined.insert(dest) {
                    return Err(IrError::DuplicateName { function: f.name.clone(), name: dest });
                }
            }
        }

        // Every referenced name has a definition, and every symbol operand
        // resolves within the module.
        for bb in f.body.values() {
            for iref in &bb.seq {
                let instr = &f.pool[*iref];
                for op in instr.operands() {
                    self.verify_operand(f, op, &defined)?;
                }
                if let crate::modules::instructions::Instr::Call(call) = instr {
                    self.verify_callee(f, &call.callee, &defined)?;
                }
            }
            for op in bb.terminator.operands() {
                self.verify_operand(f, op, &defined)?;
            }
            if let crate::modules::control_flow::Terminator::Invoke { callee, .. } = &bb.terminator
            {
                self.verify_callee(f, callee, &defined)?;
            }
        }

        Ok(())
    }

    fn verify_operand(
        &self,
        f: &Function,
        op: &Operand,
        defined: &BTreeSet<crate::modules::operand::Name>,
    ) -> IrResult<()> {
        match op {
            Operand::Reg(name) => {
                if !defined.contains(name) {
                    return Err(IrError::UndefinedName { function: f.name.clone(), name: *name });
                }
            }
            Operand::Global(gid) => {
                if !self.globals.contains_key(gid) {
                    return Err(IrError::UnknownGlobal { function: f.name.clone(), global: *gid });
                }
            }
            Operand::Func(FuncRef::Internal(uuid)) => {
                if !self.functions.contains_key(uuid) {
                    return Err(IrError::UnknownFunction {
                        function: f.name.clone(),
                        callee: *uuid,
                    });
                }
            }
            Operand::Func(FuncRef::External(ext)) => {
                if !self.externals.contains_key(ext) {
                    return Err(IrError::UnknownExternal { function: f.name.clone(), ext: *ext });
                }
            }
            Operand::Imm(_) | Operand::Null => {}
        }
        Ok(())
    }

    fn verify_callee(
        &self,
        f: &Function,
        callee: &Callee,
        defined: &BTreeSet<crate::modules::operand::Name>,
    ) -> IrResult<()> {
        match callee {
            Callee::Func(FuncRef::Internal(uuid)) => {
                if !self.functions.contains_key(uuid) {
                    return Err(IrError::UnknownFunction {
                        function: f.name.clone(),
                        callee: *uuid,
                    });
                }
            }
            Callee::Func(FuncRef::External(ext)) => {
                if !self.externals.contains_key(ext) {
                    return Err(IrError::UnknownExternal { function: f.name.clone(), ext: *ext });
                }
            }
            Callee::Indirect(target) => self.verify_operand(f, target, defined)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        builder::Cursor,
        error::IrError,
        modules::{Function, Module, control_flow::Terminator, operand::{Label, Operand}},
        types::Ty,
    };

    #[test]
    fn accepts_a_minimal_function() {
        let mut m = Module::new("unit");
        let mut f = Function::new("f");
        let mut cur = Cursor::at_block_start(&mut f, Label::ENTRY);
        let v = cur.add(Ty::I64, Operand::i64(1), Operand::i64(2));
        f.set_terminator(Label::ENTRY, Terminator::Ret { value: Some(Operand::Reg(v)) });
        m.add_function(f);
        m.verify().expect("module should verify");
    }

    #[test]
    fn rejects_dangling_branch_target() {
        let mut m = Module::new("unit");
        let mut f = Function::new("f");
        f.set_terminator(Label::ENTRY, Terminator::Br { target: Label(99) });
        m.add_function(f);
        assert!(matches!(m.verify(), Err(IrError::UnknownBlock { .. })));
    }

    #[test]
    fn rejects_undefined_operand() {
        let mut m = Module::new("unit");
        let mut f = Function::new("f");
        let ghost = crate::modules::operand::Name(42);
        f.set_terminator(Label::ENTRY, Terminator::Ret { value: Some(Operand::Reg(ghost)) });
        m.add_function(f);
        assert!(matches!(m.verify(), Err(IrError::UndefinedName { .. })));
    }
}
