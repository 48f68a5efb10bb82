//! Program representation: modules, functions, blocks and symbols.
//!
//! A [`Module`] is the compilation-unit boundary: it owns function
//! definitions (keyed by UUID), external declarations, global variables and
//! the ordered constructor list run before ordinary code at load time.
//!
//! A [`Function`] owns its instructions in a slotmap pool; basic blocks hold
//! sequences of pool handles plus one terminator. Handles stay valid across
//! insertion and block splitting, so a pass may collect work lists first and
//! mutate afterwards without invalidating them.
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use uuid::Uuid;

use crate::{
    modules::{
        consts::Const,
        control_flow::Terminator,
        instructions::Instr,
        operand::{ExtId, FuncRef, GlobalId, Label, Name},
    },
    types::Ty,
};

pub mod consts;
pub mod control_flow;
pub mod instructions;
pub mod operand;

new_key_type! {
    /// Stable handle to an instruction in a function's pool.
    pub struct InstrRef;
}

/// Symbol linkage.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Linkage {
    /// Only accessible within the current module.
    #[default]
    Internal,
    /// Visible to and overridable from other modules.
    External,
    /// Multiple definitions allowed; the linker keeps one.
    Weak,
}

/// Source location recorded by the front end for an instruction or block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceSpan {
    pub line: i32,
    pub column: i32,
}

/// A basic block: a sequence of pool handles plus a terminator.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub seq: Vec<InstrRef>,
    pub terminator: Terminator,
}

/// A function made of basic blocks and parameter metadata.
///
/// By convention the entry block is [`Label::ENTRY`]. Fresh SSA names and
/// labels are allocated through [`Function::fresh_name`] and
/// [`Function::fresh_label`]; neither is ever reused.
#[derive(Debug, Clone)]
pub struct Function {
    pub uuid: Uuid,
    pub name: String,
    pub params: Vec<(Name, Ty)>,
    pub return_ty: Option<Ty>,
    pub pool: SlotMap<InstrRef, Instr>,
    pub body: BTreeMap<Label, BasicBlock>,
    pub spans: SecondaryMap<InstrRef, SourceSpan>,
    pub span: Option<SourceSpan>,
    pub linkage: Linkage,
    /// The function is known never to raise an exception.
    pub nounwind: bool,
    next_name: u32,
    next_label: u32,
}

impl Function {
    /// Create an empty function with an entry block terminated by
    /// `unreachable`.
    pub fn new(name: impl Into<String>) -> Function {
        let mut body = BTreeMap::new();
        body.insert(
            Label::ENTRY,
            BasicBlock { seq: Vec::new(), terminator: Terminator::Unreachable },
        );
        Function {
            uuid: Uuid::new_v4(),
            name: name.into(),
            params: Vec::new(),
            return_ty: None,
            pool: SlotMap::with_key(),
            body,
            spans: SecondaryMap::new(),
            span: None,
            linkage: Linkage::default(),
            nounwind: false,
            next_name: 0,
            next_label: 1,
        }
    }

    pub fn add_param(&mut self, ty: Ty) -> Name {
        let name = self.fresh_name();
        self.params.push((name, ty));
        name
    }

    /// Allocate the next unused SSA name.
    pub fn fresh_name(&mut self) -> Name {
        let name = Name(self.next_name);
        self.next_name += 1;
        name
    }

    /// Allocate the next unused block label.
    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Append a new empty block with the given terminator.
    pub fn add_block(&mut self, terminator: Terminator) -> Label {
        let label = self.fresh_label();
        self.body.insert(label, BasicBlock { seq: Vec::new(), terminator });
        label
    }

    pub fn block(&self, label: Label) -> &BasicBlock {
        &self.body[&label]
    }

    pub fn block_mut(&mut self, label: Label) -> &mut BasicBlock {
        self.body.get_mut(&label).expect("label refers to a block of this function")
    }

    pub fn entry(&self) -> &BasicBlock {
        self.block(Label::ENTRY)
    }

    pub fn labels(&self) -> Vec<Label> {
        self.body.keys().copied().collect()
    }

    pub fn instr(&self, iref: InstrRef) -> &Instr {
        &self.pool[iref]
    }

    pub fn instr_mut(&mut self, iref: InstrRef) -> &mut Instr {
        &mut self.pool[iref]
    }

    /// Append an instruction at the end of `block` (before the terminator).
    pub fn push(&mut self, block: Label, instr: Instr) -> InstrRef {
        let iref = self.pool.insert(instr);
        self.block_mut(block).seq.push(iref);
        iref
    }

    /// Insert an instruction at `index` within `block`.
    pub fn insert(&mut self, block: Label, index: usize, instr: Instr) -> InstrRef {
        let iref = self.pool.insert(instr);
        self.block_mut(block).seq.insert(index, iref);
        iref
    }

    pub fn set_terminator(&mut self, block: Label, terminator: Terminator) {
        self.block_mut(block).terminator = terminator;
    }

    /// Remove an instruction from `block` and the pool, returning it.
    pub fn remove(&mut self, block: Label, iref: InstrRef) -> Option<Instr> {
        let index = self.position(block, iref)?;
        self.block_mut(block).seq.remove(index);
        self.pool.remove(iref)
    }

    /// Index of `iref` within `block`, if it lives there.
    pub fn position(&self, block: Label, iref: InstrRef) -> Option<usize> {
        self.block(block).seq.iter().position(|r| *r == iref)
    }

    /// The block containing `iref`.
    pub fn block_of(&self, iref: InstrRef) -> Option<Label> {
        self.body
            .iter()
            .find(|(_, bb)| bb.seq.contains(&iref))
            .map(|(label, _)| *label)
    }

    /// The instruction defining `name`, if any.
    pub fn def_of(&self, name: Name) -> Option<InstrRef> {
        self.body
            .values()
            .flat_map(|bb| bb.seq.iter())
            .copied()
            .find(|iref| self.pool[*iref].destination() == Some(name))
    }

    pub fn set_span(&mut self, iref: InstrRef, span: SourceSpan) {
        self.spans.insert(iref, span);
    }

    /// First recorded source span in the given block, if any.
    pub fn first_span_in(&self, block: Label) -> Option<&SourceSpan> {
        self.block(block)
            .seq
            .iter()
            .find_map(|iref| self.spans.get(*iref))
    }
}

/// An externally defined function declaration.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExternalFunction {
    pub name: String,
    pub params: Vec<Ty>,
    pub return_ty: Option<Ty>,
    /// The callee is known never to raise an exception.
    pub nounwind: bool,
}

/// A module-level global variable.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
    pub init: Const,
    pub constant: bool,
    pub thread_local: bool,
    pub linkage: Linkage,
}

/// Source file information for the compilation unit.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub file: String,
    pub directory: String,
}

/// A module containing defined functions, external declarations, globals
/// and the load-time constructor list.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: BTreeMap<Uuid, Function>,
    pub externals: BTreeMap<ExtId, ExternalFunction>,
    pub globals: BTreeMap<GlobalId, Global>,
    /// Functions run before ordinary program code at load time, in order.
    pub ctors: Vec<FuncRef>,
    pub source: Option<SourceInfo>,
    next_ext: u32,
    next_global: u32,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Module {
        Module { name: name.into(), ..Module::default() }
    }

    pub fn add_function(&mut self, function: Function) -> Uuid {
        let uuid = function.uuid;
        self.functions.insert(uuid, function);
        uuid
    }

    pub fn function(&self, uuid: Uuid) -> Option<&Function> {
        self.functions.get(&uuid)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.values().find(|f| f.name == name)
    }

    /// Declare an external function, reusing an existing declaration with
    /// the same name.
    pub fn get_or_insert_external(&mut self, ext: ExternalFunction) -> ExtId {
        if let Some((id, _)) = self.externals.iter().find(|(_, e)| e.name == ext.name) {
            return *id;
        }
        let id = ExtId(self.next_ext);
        self.next_ext += 1;
        self.externals.insert(id, ext);
        id
    }

    pub fn external(&self, id: ExtId) -> Option<&ExternalFunction> {
        self.externals.get(&id)
    }

    pub fn external_by_name(&self, name: &str) -> Option<(ExtId, &ExternalFunction)> {
        self.externals.iter().map(|(id, e)| (*id, e)).find(|(_, e)| e.name == name)
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        let id = GlobalId(self.next_global);
        self.next_global += 1;
        self.globals.insert(id, global);
        id
    }

    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(&id)
    }

    pub fn global_mut(&mut self, id: GlobalId) -> Option<&mut Global> {
        self.globals.get_mut(&id)
    }

    pub fn global_by_name(&self, name: &str) -> Option<(GlobalId, &Global)> {
        self.globals.iter().map(|(id, g)| (*id, g)).find(|(_, g)| g.name == name)
    }

    /// Name of the symbol behind a function reference.
    pub fn symbol_name(&self, func: FuncRef) -> Option<&str> {
        match func {
            FuncRef::Internal(uuid) => self.functions.get(&uuid).map(|f| f.name.as_str()),
            FuncRef::External(ext) => self.externals.get(&ext).map(|e| e.name.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::operand::Operand;

    #[test]
    fn fresh_names_and_labels_are_never_reused() {
        let mut f = Function::new("f");
        let a = f.fresh_name();
        let b = f.fresh_name();
        assert_ne!(a, b);
        let l1 = f.add_block(Terminator::Ret { value: None });
        let l2 = f.add_block(Terminator::Ret { value: None });
        assert_ne!(l1, l2);
        assert!(!l1.is_entry());
    }

    #[test]
    fn instruction_handles_survive_insertion() {
        let mut f = Function::new("f");
        let dest = f.fresh_name();
        let first = f.push(
            Label::ENTRY,
            Instr::BinOp(instructions::BinOp {
                dest,
                kind: instructions::BinOpKind::Add,
                ty: Ty::I64,
                lhs: Operand::i64(1),
                rhs: Operand::i64(2),
            }),
        );
        let dest2 = f.fresh_name();
        f.insert(
            Label::ENTRY,
            0,
            Instr::BinOp(instructions::BinOp {
                dest: dest2,
                kind: instructions::BinOpKind::Add,
                ty: Ty::I64,
                lhs: Operand::i64(3),
                rhs: Operand::i64(4),
            }),
        );
        assert_eq!(f.position(Label::ENTRY, first), Some(1));
        assert_eq!(f.instr(first).destination(), Some(dest));
        assert_eq!(f.def_of(dest), Some(first));
    }

    #[test]
    fn externals_deduplicate_by_name() {
        let mut m = Module::new("unit");
        let a = m.get_or_insert_external(ExternalFunction {
            name: "memcpy".into(),
            params: vec![Ty::Ptr, Ty::Ptr, Ty::I64],
            return_ty: Some(Ty::Ptr),
            nounwind: true,
        });
        let b = m.get_or_insert_external(ExternalFunction {
            name: "memcpy".into(),
            params: vec![Ty::Ptr, Ty::Ptr, Ty::I64],
            return_ty: Some(Ty::Ptr),
            nounwind: true,
        });
        assert_eq!(a, b);
        assert_eq!(m.externals.len(), 1);
    }
}
