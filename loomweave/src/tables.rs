//! Identifier, metadata and size tables.
//!
//! Every event category owns a dense, zero-based local ID space assigned in
//! first-use order, plus one metadata record per ID. Local IDs only become
//! global at load time: each category has a mutable base cell (an `i64`
//! module global, written by the runtime when units are registered), and
//! every use site synthesizes a fresh `load base; add #local` sequence —
//! the sum is never folded into a compile-time constant, which is what lets
//! independently compiled units merge their ID spaces without
//! recompilation.
use std::collections::{BTreeMap, HashMap};

use enum_map::{Enum, EnumMap};
use loomir::{
    builder::Cursor,
    modules::{
        Function, Global, InstrRef, Linkage, Module,
        consts::Const,
        instructions::Instr,
        operand::{GlobalId, Imm, Label, Operand},
    },
    types::Ty,
};
use strum::{Display, EnumIter};
use uuid::Uuid;

use crate::error::{WeaveError, WeaveResult};

/// Sentinel for unknown IDs (indirect call targets, default selector
/// bindings).
pub const UNKNOWN_ID: i64 = -1;

/// The closed set of event categories, each with its own ID space and
/// metadata table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Enum, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventCategory {
    FunctionEntry,
    FunctionExit,
    Loop,
    LoopExit,
    Block,
    Callsite,
    Load,
    Store,
    Fork,
    Task,
    TaskExit,
    ForkContinuation,
    Join,
    LocalAlloc,
    HeapAlloc,
    Free,
}

impl EventCategory {
    pub fn base_cell_name(&self) -> String {
        format!("__loom_base_id_{}", self)
    }

    pub fn table_name(&self) -> String {
        format!("__loom_unit_table_{}", self)
    }
}

/// Handle to an instrumentable entity, captured before mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SiteKey {
    Function(Uuid),
    Block(Uuid, Label),
    Instr(Uuid, InstrRef),
    /// The terminator of a block.
    Term(Uuid, Label),
}

/// Dense local-ID allocator keyed by entity handle.
///
/// IDs are zero-based, assigned in first-use order, and never reused.
#[derive(Debug, Clone, Default)]
pub struct IdentifierTable {
    counter: u64,
    ids: HashMap<SiteKey, u64>,
}

impl IdentifierTable {
    /// The entity's existing local ID, or the next counter value.
    pub fn get_id(&mut self, key: SiteKey) -> u64 {
        match self.ids.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.counter;
                self.counter += 1;
                self.ids.insert(key, id);
                id
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.counter
    }

    pub fn is_empty(&self) -> bool {
        self.counter == 0
    }
}

/// Source-location record correlated to one local ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    pub name: Option<String>,
    pub line: i32,
    pub column: i32,
    pub file: Option<String>,
    pub directory: Option<String>,
}

impl MetadataRecord {
    pub fn unknown() -> MetadataRecord {
        MetadataRecord { name: None, line: -1, column: -1, file: None, directory: None }
    }
}

/// Per-category metadata table: the ID allocator, one record per ID, and
/// the load-time base cell.
#[derive(Debug, Clone)]
pub struct MetadataTable {
    category: EventCategory,
    ids: IdentifierTable,
    records: BTreeMap<u64, MetadataRecord>,
    base_cell: GlobalId,
    unit_file: Option<(String, String)>,
}

impl MetadataTable {
    /// Create the table and its base cell global (an `i64` initialized to
    /// zero, written by the runtime at load time).
    pub fn new(category: EventCategory, m: &mut Module) -> MetadataTable {
        let base_cell = match m.global_by_name(&category.base_cell_name()) {
            Some((gid, _)) => gid,
            None => m.add_global(Global {
                name: category.base_cell_name(),
                ty: Ty::I64,
                init: Const::i64(0),
                constant: false,
                thread_local: false,
                linkage: Linkage::Internal,
            }),
        };
        let unit_file = m.source.as_ref().map(|s| (s.file.clone(), s.directory.clone()));
        MetadataTable {
            category,
            ids: IdentifierTable::default(),
            records: BTreeMap::new(),
            base_cell,
            unit_file,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    pub fn base_cell(&self) -> GlobalId {
        self.base_cell
    }

    pub fn len(&self) -> u64 {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn record(&self, id: u64) -> Option<&MetadataRecord> {
        self.records.get(&id)
    }

    fn located(&self, name: Option<String>, line: i32, column: i32) -> MetadataRecord {
        let (file, directory) = match &self.unit_file {
            Some((file, dir)) => (Some(file.clone()), Some(dir.clone())),
            None => (None, None),
        };
        MetadataRecord { name, line, column, file, directory }
    }

    fn add_record(&mut self, id: u64, record: MetadataRecord) {
        self.records.entry(id).or_insert(record);
    }

    /// Allocate (or look up) the ID of a whole function.
    pub fn add_function(&mut self, f: &Function) -> u64 {
        let id = self.ids.get_id(SiteKey::Function(f.uuid));
        let record = match &f.span {
            Some(span) => self.located(Some(f.name.clone()), span.line, span.column),
            None => self.located(Some(f.name.clone()), -1, -1),
        };
        self.add_record(id, record);
        id
    }

    /// Allocate the ID of a basic block, located at its first recorded
    /// span.
    pub fn add_block(&mut self, f: &Function, label: Label) -> u64 {
        let id = self.ids.get_id(SiteKey::Block(f.uuid, label));
        let record = match f.first_span_in(label) {
            Some(span) => self.located(None, span.line, span.column),
            None => self.located(None, -1, -1),
        };
        self.add_record(id, record);
        id
    }

    /// Allocate the ID of an instruction site. `real_name` overrides the
    /// recorded name (callee names for callsites, variable names for
    /// allocations).
    pub fn add_instr(&mut self, f: &Function, iref: InstrRef, real_name: Option<&str>) -> u64 {
        let id = self.ids.get_id(SiteKey::Instr(f.uuid, iref));
        let name = real_name.map(str::to_owned).or_else(|| match f.instr(iref) {
            Instr::Alloca(alloca) => alloca.var_name.clone(),
            _ => None,
        });
        let record = match f.spans.get(iref) {
            Some(span) => self.located(name, span.line, span.column),
            None => self.located(name, -1, -1),
        };
        self.add_record(id, record);
        id
    }

    /// Allocate the ID of a block's terminator site.
    pub fn add_term(&mut self, f: &Function, label: Label) -> u64 {
        let id = self.ids.get_id(SiteKey::Term(f.uuid, label));
        let record = match f.first_span_in(label) {
            Some(span) => self.located(None, span.line, span.column),
            None => self.located(None, -1, -1),
        };
        self.add_record(id, record);
        id
    }

    /// Synthesize the global ID of `local` at the cursor: a fresh load of
    /// the base cell plus the local constant. Never precomputed — the base
    /// is only known at load time.
    pub fn local_to_global(&self, local: u64, cur: &mut Cursor<'_>) -> Operand {
        let base = cur.load(Ty::I64, Operand::Global(self.base_cell));
        let id = cur.add(
            Ty::I64,
            Operand::Reg(base),
            Operand::Imm(Imm::i64(local as i64)),
        );
        Operand::Reg(id)
    }

    /// Serialize the record array into a constant global, interning name
    /// and file strings. Every allocated ID must have a record (possibly
    /// "unknown") or serialization fails.
    pub fn serialize(&self, m: &mut Module) -> WeaveResult<GlobalId> {
        let mut entries = Vec::with_capacity(self.ids.len() as usize);
        for id in 0..self.ids.len() {
            let record = self.records.get(&id).cloned().ok_or_else(|| {
                WeaveError::MissingMetadata { category: self.category.to_string(), id }
            })?;
            let name_ptr = match &record.name {
                Some(name) => Const::GlobalRef(intern_cstr(m, name)),
                None => Const::Null,
            };
            let file_ptr = match &record.file {
                Some(file) => {
                    let full = match record.directory.as_deref() {
                        Some(dir) if !dir.is_empty() => format!("{}/{}", dir, file),
                        _ => file.clone(),
                    };
                    Const::GlobalRef(intern_cstr(m, &full))
                }
                None => Const::Null,
            };
            entries.push(Const::Struct(vec![
                name_ptr,
                Const::i32(record.line),
                Const::i32(record.column),
                file_ptr,
            ]));
        }
        Ok(m.add_global(Global {
            name: self.category.table_name(),
            ty: Ty::Ptr,
            init: Const::Array(entries),
            constant: true,
            thread_local: false,
            linkage: Linkage::Internal,
        }))
    }

    /// Read a serialized record array back. Inverse of [`serialize`] for
    /// the encoding it produces.
    ///
    /// [`serialize`]: MetadataTable::serialize
    pub fn decode(m: &Module, table: GlobalId) -> Vec<MetadataRecord> {
        let Some(global) = m.global(table) else { return Vec::new() };
        let Some(entries) = global.init.as_array() else { return Vec::new() };
        entries
            .iter()
            .filter_map(|entry| {
                let fields = entry.as_struct()?;
                let read_str = |c: &Const| -> Option<String> {
                    let gid = c.as_global_ref()?;
                    match &m.global(gid)?.init {
                        Const::CStr(text) => Some(text.clone()),
                        _ => None,
                    }
                };
                let (file, directory) = match fields.get(3).and_then(&read_str) {
                    Some(full) => match full.rsplit_once('/') {
                        Some((dir, file)) => (Some(file.to_string()), Some(dir.to_string())),
                        None => (Some(full), None),
                    },
                    None => (None, None),
                };
                Some(MetadataRecord {
                    name: fields.first().and_then(&read_str),
                    line: fields.get(1)?.as_int()? as i32,
                    column: fields.get(2)?.as_int()? as i32,
                    file,
                    directory,
                })
            })
            .collect()
    }
}

/// Intern a NUL-terminated string constant, reusing an existing global with
/// the same content.
pub fn intern_cstr(m: &mut Module, text: &str) -> GlobalId {
    let name = format!("__loom_str_{}", text);
    if let Some((gid, _)) = m.global_by_name(&name) {
        return gid;
    }
    m.add_global(Global {
        name,
        ty: Ty::Array(Box::new(Ty::I8), text.len() as u64 + 1),
        init: Const::CStr(text.to_string()),
        constant: true,
        thread_local: false,
        linkage: Linkage::Internal,
    })
}

/// Per-block static size record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRecord {
    /// All instructions in the block (terminator included).
    pub full: u32,
    /// Instructions that represent real work after lowering: synthesized
    /// hook calls and placeholder operations are excluded.
    pub non_empty: u32,
}

/// Per-block size table, parallel to the Block metadata table.
#[derive(Debug, Clone, Default)]
pub struct SizeTable {
    ids: IdentifierTable,
    records: BTreeMap<u64, SizeRecord>,
}

impl SizeTable {
    /// Record the size of `label`, optionally overriding the default count
    /// with a host-supplied cost estimate.
    pub fn add(
        &mut self,
        m: &Module,
        f: &Function,
        label: Label,
        estimate: Option<&dyn Fn(&Function, Label) -> u32>,
    ) -> u64 {
        let id = self.ids.get_id(SiteKey::Block(f.uuid, label));
        let bb = f.block(label);
        let full = bb.seq.len() as u32 + 1;
        let non_empty = match estimate {
            Some(estimate) => estimate(f, label),
            None => {
                let real = bb
                    .seq
                    .iter()
                    .filter(|iref| !crate::canonicalize::is_placeholder_call(m, f.instr(**iref)))
                    .count() as u32;
                real + 1
            }
        };
        self.records.insert(id, SizeRecord { full, non_empty });
        id
    }

    pub fn len(&self) -> u64 {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn record(&self, id: u64) -> Option<&SizeRecord> {
        self.records.get(&id)
    }

    /// Serialize `{full, non_empty}` pairs into a constant global array.
    pub fn serialize(&self, m: &mut Module) -> GlobalId {
        let mut entries = Vec::with_capacity(self.ids.len() as usize);
        for id in 0..self.ids.len() {
            let record = self.records.get(&id).copied().unwrap_or(SizeRecord { full: 0, non_empty: 0 });
            entries.push(Const::Struct(vec![
                Const::i32(record.full as i32),
                Const::i32(record.non_empty as i32),
            ]));
        }
        m.add_global(Global {
            name: "__loom_unit_size_table_block".to_string(),
            ty: Ty::Ptr,
            init: Const::Array(entries),
            constant: true,
            thread_local: false,
            linkage: Linkage::Internal,
        })
    }

    /// Read a serialized size table back.
    pub fn decode(m: &Module, table: GlobalId) -> Vec<SizeRecord> {
        let Some(global) = m.global(table) else { return Vec::new() };
        let Some(entries) = global.init.as_array() else { return Vec::new() };
        entries
            .iter()
            .filter_map(|entry| {
                let fields = entry.as_struct()?;
                Some(SizeRecord {
                    full: fields.first()?.as_int()? as u32,
                    non_empty: fields.get(1)?.as_int()? as u32,
                })
            })
            .collect()
    }
}

/// All tables of one instrumentation run: one metadata table per event
/// category, the per-block size table, and the function-name → local-ID map
/// used to initialize callsite func-id globals.
#[derive(Debug)]
pub struct Tables {
    pub fed: EnumMap<EventCategory, MetadataTable>,
    pub block_size: SizeTable,
    pub func_offsets: BTreeMap<String, u64>,
}

impl Tables {
    /// Create every category table (and its base cell) up front.
    pub fn new(m: &mut Module) -> Tables {
        Tables {
            fed: EnumMap::from_fn(|category| MetadataTable::new(category, m)),
            block_size: SizeTable::default(),
            func_offsets: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut table = IdentifierTable::default();
        let f = Uuid::new_v4();
        let a = table.get_id(SiteKey::Block(f, Label(1)));
        let b = table.get_id(SiteKey::Block(f, Label(2)));
        let a_again = table.get_id(SiteKey::Block(f, Label(1)));
        assert_eq!((a, b, a_again), (0, 1, 0));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn every_category_has_a_distinct_base_cell() {
        let mut m = Module::new("unit");
        let tables: Vec<MetadataTable> = EventCategory::iter()
            .map(|category| MetadataTable::new(category, &mut m))
            .collect();
        let names: Vec<String> = tables
            .iter()
            .map(|t| m.global(t.base_cell()).unwrap().name.clone())
            .collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn metadata_round_trips_in_insertion_order() {
        let mut m = Module::new("unit");
        m.source = Some(loomir::modules::SourceInfo {
            file: "kernel.c".into(),
            directory: "/src".into(),
        });
        let mut table = MetadataTable::new(EventCategory::Callsite, &mut m);

        let mut f = Function::new("caller");
        f.span = Some(loomir::modules::SourceSpan { line: 10, column: 2 });
        let id0 = table.add_function(&f);
        let block = f.add_block(loomir::modules::control_flow::Terminator::Ret { value: None });
        let id1 = table.add_block(&f, block);
        assert_eq!((id0, id1), (0, 1));

        let table_gid = table.serialize(&mut m).expect("all ids have records");
        let records = MetadataTable::decode(&m, table_gid);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name.as_deref(), Some("caller"));
        assert_eq!(records[0].line, 10);
        assert_eq!(records[0].column, 2);
        assert_eq!(records[0].file.as_deref(), Some("kernel.c"));
        assert_eq!(records[0].directory.as_deref(), Some("/src"));
        assert_eq!(records[1].name, None);
        assert_eq!(records[1].line, -1);
    }

    #[test]
    fn size_table_round_trips() {
        let mut m = Module::new("unit");
        let mut f = Function::new("f");
        let mut cur = Cursor::at_block_start(&mut f, Label::ENTRY);
        cur.add(Ty::I64, Operand::i64(1), Operand::i64(2));
        let mut table = SizeTable::default();
        let id = table.add(&m, &f, Label::ENTRY, None);
        assert_eq!(id, 0);
        assert_eq!(table.record(0), Some(&SizeRecord { full: 2, non_empty: 2 }));

        let gid = table.serialize(&mut m);
        let records = SizeTable::decode(&m, gid);
        assert_eq!(records, vec![SizeRecord { full: 2, non_empty: 2 }]);
    }
}
