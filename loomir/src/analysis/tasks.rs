//! Fork/join task tree.
//!
//! Each `Detach` spawns a task rooted at its detached block; tasks nest into
//! a forest under an implicit root task spanning the rest of the function.
//! A task's blocks are those reachable from its entry without crossing a
//! task exit: `Reattach` edges back to the continuation, `DetachedRethrow`
//! edges to the enclosing handler, and `TaskFrameResume` edges out of a
//! task frame.
//!
//! Unwind targets reachable from the exception exits of two or more distinct
//! tasks are *shared unwind* blocks: one handler subgraph aliased by several
//! exit paths. Task-exit instrumentation must merge its arguments across
//! such subgraphs instead of inserting per-site calls.
use std::collections::{BTreeMap, BTreeSet};

use crate::modules::{
    Function,
    control_flow::{RegionId, Terminator},
    operand::Label,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

#[derive(Debug, Clone)]
pub struct Task {
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    /// Entry block: the detached block, or the function entry for the root.
    pub entry: Label,
    /// Block whose terminator is the spawning `Detach` (`None` for root).
    pub detach_block: Option<Label>,
    pub region: Option<RegionId>,
    pub blocks: BTreeSet<Label>,
}

#[derive(Debug, Clone)]
pub struct TaskTree {
    tasks: Vec<Task>,
    by_block: BTreeMap<Label, TaskId>,
    /// Unwind blocks tagged with every task whose exception exits reach them.
    unwind_tags: BTreeMap<Label, BTreeSet<TaskId>>,
    shared: BTreeSet<Label>,
}

impl TaskTree {
    pub const ROOT: TaskId = TaskId(0);

    pub fn build(f: &Function) -> TaskTree {
        let mut tree = TaskTree {
            tasks: vec![Task {
                parent: None,
                children: Vec::new(),
                entry: Label::ENTRY,
                detach_block: None,
                region: None,
                blocks: BTreeSet::new(),
            }],
            by_block: BTreeMap::new(),
            unwind_tags: BTreeMap::new(),
            shared: BTreeSet::new(),
        };
        tree.claim(f, TaskTree::ROOT, Label::ENTRY);
        tree.compute_shared(f);
        tree
    }

    /// Depth-first claim of a task's blocks, spawning child tasks at each
    /// `Detach`.
    fn claim(&mut self, f: &Function, task: TaskId, entry: Label) {
        let mut stack = vec![entry];
        while let Some(label) = stack.pop() {
            if self.by_block.contains_key(&label) {
                continue;
            }
            self.by_block.insert(label, task);
            self.tasks[task.0].blocks.insert(label);

            match &f.block(label).terminator {
                Terminator::Detach { task: detached, cont, unwind, region } => {
                    let child = TaskId(self.tasks.len());
                    self.tasks.push(Task {
                        parent: Some(task),
                        children: Vec::new(),
                        entry: *detached,
                        detach_block: Some(label),
                        region: Some(*region),
                        blocks: BTreeSet::new(),
                    });
                    self.tasks[task.0].children.push(child);
                    self.claim(f, child, *detached);
                    stack.push(*cont);
                    if let Some(unwind) = unwind {
                        stack.push(*unwind);
                    }
                }
                // Task exits: the targets belong to an enclosing scope and
                // are claimed by its own traversal.
                Terminator::Reattach { .. }
                | Terminator::DetachedRethrow { .. }
                | Terminator::TaskFrameResume { .. } => {}
                other => stack.extend(other.successors()),
            }
        }
    }

    /// Tag unwind targets with the tasks whose exception exits reach them,
    /// propagate tags forward, and mark multi-task blocks as shared.
    fn compute_shared(&mut self, f: &Function) {
        for (label, bb) in &f.body {
            let source_task = match self.by_block.get(label) {
                Some(task) => *task,
                None => continue,
            };
            if source_task == TaskTree::ROOT {
                continue;
            }
            match &bb.terminator {
                Terminator::DetachedRethrow { unwind, .. }
                | Terminator::TaskFrameResume { unwind } => {
                    self.unwind_tags.entry(*unwind).or_default().insert(source_task);
                }
                _ => {}
            }
        }

        // Forward fixpoint: a successor inherits its predecessor's tags.
        let mut changed = true;
        while changed {
            changed = false;
            let tagged: Vec<Label> = self.unwind_tags.keys().copied().collect();
            for label in tagged {
                let tags = self.unwind_tags[&label].clone();
                let Some(bb) = f.body.get(&label) else { continue };
                for succ in bb.terminator.successors() {
                    let entry = self.unwind_tags.entry(succ).or_default();
                    let before = entry.len();
                    entry.extend(tags.iter().copied());
                    if entry.len() != before {
                        changed = true;
                    }
                }
            }
        }

        for (label, tags) in &self.unwind_tags {
            if tags.len() >= 2 {
                self.shared.insert(*label);
            }
        }
    }

    pub fn root(&self) -> &Task {
        &self.tasks[0]
    }

    pub fn get(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.len() <= 1
    }

    /// The innermost task owning `label`. Blocks reachable only through
    /// exception exits of several tasks are owned by no single task and
    /// report the root.
    pub fn task_for(&self, label: Label) -> TaskId {
        self.by_block.get(&label).copied().unwrap_or(TaskTree::ROOT)
    }

    /// The task spawned at the given detach block, if any.
    pub fn task_of_detach(&self, detach_block: Label) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|t| t.detach_block == Some(detach_block))
            .map(TaskId)
    }

    pub fn is_shared_unwind(&self, label: Label) -> bool {
        self.shared.contains(&label)
    }

    pub fn shared_members(&self) -> &BTreeSet<Label> {
        &self.shared
    }

    /// Blocks in `task` terminated by a `Reattach` to the fork continuation.
    pub fn reattach_exits(&self, f: &Function, task: TaskId) -> Vec<Label> {
        self.get(task)
            .blocks
            .iter()
            .copied()
            .filter(|label| matches!(f.block(*label).terminator, Terminator::Reattach { .. }))
            .collect()
    }

    /// Blocks in `task` terminated by a `DetachedRethrow` whose target is
    /// not part of a shared unwind subgraph.
    pub fn rethrow_exits(&self, f: &Function, task: TaskId) -> Vec<Label> {
        self.get(task)
            .blocks
            .iter()
            .copied()
            .filter(|label| match &f.block(*label).terminator {
                Terminator::DetachedRethrow { unwind, .. } => !self.shared.contains(unwind),
                _ => false,
            })
            .collect()
    }

    /// Entry points of shared unwind subgraphs reached directly from this
    /// task's exception exits.
    pub fn shared_exits(&self, f: &Function, task: TaskId) -> Vec<Label> {
        let mut out = Vec::new();
        for label in &self.get(task).blocks {
            match &f.block(*label).terminator {
                Terminator::DetachedRethrow { unwind, .. }
                | Terminator::TaskFrameResume { unwind } => {
                    if self.shared.contains(unwind) && !out.contains(unwind) {
                        out.push(*unwind);
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// The task-frame resume point used by `task`, as
    /// `(resume block, resume destination)`, if the task maintains one.
    pub fn taskframe_resume(&self, f: &Function, task: TaskId) -> Option<(Label, Label)> {
        self.get(task).blocks.iter().find_map(|label| {
            match f.block(*label).terminator {
                Terminator::TaskFrameResume { unwind } => Some((*label, unwind)),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{control_flow::Terminator, operand::Operand};

    /// entry: detach task -> body, cont -> sync -> ret
    fn simple_fork() -> (Function, Label, Label) {
        let mut f = Function::new("forky");
        let region = RegionId(0);
        let ret = f.add_block(Terminator::Ret { value: None });
        let cont = f.add_block(Terminator::Sync { cont: ret, region });
        let body = f.add_block(Terminator::Reattach { cont, region });
        f.set_terminator(
            Label::ENTRY,
            Terminator::Detach { task: body, cont, unwind: None, region },
        );
        (f, body, cont)
    }

    #[test]
    fn detach_creates_child_task() {
        let (f, body, cont) = simple_fork();
        let tree = TaskTree::build(&f);
        assert_eq!(tree.len(), 2);
        let child = tree.task_of_detach(Label::ENTRY).expect("child task");
        assert_eq!(tree.get(child).entry, body);
        assert_eq!(tree.task_for(body), child);
        assert_eq!(tree.task_for(cont), TaskTree::ROOT);
        assert_eq!(tree.reattach_exits(&f, child), vec![body]);
    }

    #[test]
    fn shared_unwind_needs_two_tasks() {
        // Two sibling tasks rethrow into the same cleanup block.
        let mut f = Function::new("shared");
        let region = RegionId(0);
        let ret = f.add_block(Terminator::Ret { value: None });
        let cleanup = f.add_block(Terminator::Resume { value: None });
        let body1 = f.add_block(Terminator::DetachedRethrow { region, unwind: cleanup });
        let body2 = f.add_block(Terminator::DetachedRethrow { region, unwind: cleanup });
        let cont2 = f.add_block(Terminator::Sync { cont: ret, region });
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

        let tree = TaskTree::build(&f);
        assert!(tree.is_shared_unwind(cleanup));
        let t1 = tree.task_of_detach(Label::ENTRY).unwrap();
        let t2 = tree.task_of_detach(cont1).unwrap();
        assert_eq!(tree.shared_exits(&f, t1), vec![cleanup]);
        assert_eq!(tree.shared_exits(&f, t2), vec![cleanup]);
        // Rethrows into shared subgraphs are not plain exits.
        assert!(tree.rethrow_exits(&f, t1).is_empty());
    }

    #[test]
    fn single_task_rethrow_is_not_shared() {
        let mut f = Function::new("solo");
        let region = RegionId(0);
        let ret = f.add_block(Terminator::Ret { value: None });
        let cleanup = f.add_block(Terminator::Resume { value: None });
        let body = f.add_block(Terminator::DetachedRethrow { region, unwind: cleanup });
        let cont = f.add_block(Terminator::Sync { cont: ret, region });
        f.set_terminator(
            Label::ENTRY,
            Terminator::Detach { task: body, cont, unwind: Some(cleanup), region },
        );

        let tree = TaskTree::build(&f);
        assert!(!tree.is_shared_unwind(cleanup));
        let child = tree.task_of_detach(Label::ENTRY).unwrap();
        assert_eq!(tree.rethrow_exits(&f, child), vec![body]);
        assert!(tree.shared_exits(&f, child).is_empty());
    }
}
