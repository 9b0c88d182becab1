use std::rc::Rc;

use indexmap::IndexMap;
use log::debug;

use crate::iterator::{KeyBy, item_for_key, keyed_items};
use crate::program::{Environment, Handle};
use crate::reference::{Reference, Revision, Tag};
use crate::scope::{DynamicScope, Scope};
use crate::stack::StackValue;
use crate::tree::{NodeId, RegionId, TreeBuilder};
use crate::value::Value;
use crate::vm::VM;

// ── Updating opcode tree ─────────────────────────────────────────────
//
// Every rendered block leaves behind an updating opcode: a node that can
// re-validate and re-run itself on a later pass. Nodes live in an
// append-only arena; handles stay valid for the life of a render result,
// and a retired subtree leaves tombstones behind rather than shifting
// its siblings.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateHandle(pub u32);

#[derive(Default)]
pub struct OpArena {
    ops: Vec<UpdatingOp>,
}

impl OpArena {
    pub fn alloc(&mut self, op: UpdatingOp) -> UpdateHandle {
        let handle = UpdateHandle(self.ops.len() as u32);
        self.ops.push(op);
        handle
    }

    pub fn get(&self, handle: UpdateHandle) -> &UpdatingOp {
        &self.ops[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: UpdateHandle) -> &mut UpdatingOp {
        &mut self.ops[handle.0 as usize]
    }
}

/// Captured VM state a block needs to re-run itself: the scope pair plus
/// an owned snapshot of the stack values it consumes. Never a live view
/// into the running stack.
#[derive(Clone)]
pub struct VmSnapshot {
    pub scope: Rc<Scope>,
    pub dynamic_scope: Rc<DynamicScope>,
    pub stack: Vec<StackValue>,
}

pub struct BlockState {
    pub start: Handle,
    pub state: VmSnapshot,
    pub region: RegionId,
    pub children: Vec<UpdateHandle>,
    /// Combination of the children's tags, sealed by the
    /// children-attached hook and re-sealed after reconciliation.
    pub tag: Tag,
}

pub struct ListState {
    pub block: BlockState,
    /// Iteration key to the block governing that key, in document order.
    pub map: IndexMap<String, UpdateHandle>,
    pub iterable: Rc<dyn Reference>,
    pub key_by: KeyBy,
    pub artifact_snapshot: Revision,
}

pub enum UpdatingOp {
    /// A rendered leaf: re-runs its append action when the tag moved.
    Content {
        reference: Rc<dyn Reference>,
        tag: Tag,
        snapshot: Revision,
        last: Value,
        node: NodeId,
    },
    /// A truthiness watch; a flip re-runs the enclosing block.
    Assert {
        reference: Rc<dyn Reference>,
        tag: Tag,
        snapshot: Revision,
        expected: bool,
    },
    /// Cache-group guard: skips to its label while the combined tag
    /// holds still.
    Guard {
        tag: Tag,
        snapshot: Revision,
        target: UpdateHandle,
    },
    /// Trailing marker of a guarded run; re-snapshots the guard after
    /// the run actually executed.
    DidModify { guard: UpdateHandle },
    Label,
    /// A re-runnable block (`enter`).
    Try(BlockState),
    /// A keyed-list block (`enter_list`).
    List(ListState),
    /// Tombstone for a retired keyed subtree.
    Retired,
}

impl UpdatingOp {
    /// The dependency tag this opcode contributes to a combination.
    /// Structural markers contribute nothing.
    pub fn tag(&self) -> Option<Tag> {
        match self {
            UpdatingOp::Content { tag, .. } | UpdatingOp::Assert { tag, .. } => Some(tag.clone()),
            UpdatingOp::Try(block) | UpdatingOp::List(ListState { block, .. }) => {
                Some(block.tag.clone())
            }
            UpdatingOp::Guard { .. }
            | UpdatingOp::DidModify { .. }
            | UpdatingOp::Label
            | UpdatingOp::Retired => None,
        }
    }

    pub fn block(&self) -> &BlockState {
        match self {
            UpdatingOp::Try(block) | UpdatingOp::List(ListState { block, .. }) => block,
            _ => panic!("expected a block opcode"),
        }
    }

    fn block_mut(&mut self) -> &mut BlockState {
        match self {
            UpdatingOp::Try(block) | UpdatingOp::List(ListState { block, .. }) => block,
            _ => panic!("expected a block opcode"),
        }
    }
}

// ── Update pass ──────────────────────────────────────────────────────
//
// Re-evaluates updating opcodes in appended order; nested lists are only
// reachable through their owning block, so traversal is a fixed
// pre-order. An assert flip unwinds to the nearest enclosing block,
// which re-renders itself from its snapshot.

enum Outcome {
    Clean,
    Retry,
}

pub(crate) struct UpdatingVm<'a, 'b> {
    pub env: &'a Environment,
    pub builder: &'b mut dyn TreeBuilder,
}

impl UpdatingVm<'_, '_> {
    pub fn execute(&mut self, ops: &mut OpArena, root: &[UpdateHandle]) {
        match self.update_run(ops, root) {
            Outcome::Clean => {}
            Outcome::Retry => panic!("an assertion flipped outside any enclosing block"),
        }
    }

    fn update_run(&mut self, ops: &mut OpArena, run: &[UpdateHandle]) -> Outcome {
        enum Action {
            Next,
            SkipTo(UpdateHandle),
            Resnapshot(UpdateHandle),
            Descend(Vec<UpdateHandle>),
            DescendList(UpdateHandle),
            Retry,
        }

        let mut ip = 0;
        while ip < run.len() {
            let handle = run[ip];
            ip += 1;

            let action = match ops.get_mut(handle) {
                UpdatingOp::Content { reference, tag, snapshot, last, node } => {
                    if tag.changed_since(*snapshot) {
                        let value = reference.value();
                        if value != *last {
                            self.builder.update_node(*node, &value);
                            *last = value;
                        }
                        *snapshot = tag.revision();
                    }
                    Action::Next
                }
                UpdatingOp::Assert { reference, tag, snapshot, expected } => {
                    if tag.changed_since(*snapshot) {
                        if reference.value().truthy() != *expected {
                            Action::Retry
                        } else {
                            *snapshot = tag.revision();
                            Action::Next
                        }
                    } else {
                        Action::Next
                    }
                }
                UpdatingOp::Guard { tag, snapshot, target } => {
                    if tag.changed_since(*snapshot) {
                        Action::Next
                    } else {
                        Action::SkipTo(*target)
                    }
                }
                UpdatingOp::DidModify { guard } => Action::Resnapshot(*guard),
                UpdatingOp::Label | UpdatingOp::Retired => Action::Next,
                UpdatingOp::Try(block) => Action::Descend(block.children.clone()),
                UpdatingOp::List(_) => Action::DescendList(handle),
            };

            match action {
                Action::Next => {}
                Action::Retry => return Outcome::Retry,
                Action::SkipTo(target) => {
                    while ip < run.len() && run[ip - 1] != target {
                        ip += 1;
                    }
                }
                Action::Resnapshot(guard) => {
                    if let UpdatingOp::Guard { tag, snapshot, .. } = ops.get_mut(guard) {
                        *snapshot = tag.revision();
                    }
                }
                Action::Descend(children) => {
                    if let Outcome::Retry = self.update_run(ops, &children) {
                        self.retry_block(ops, handle);
                    }
                }
                Action::DescendList(list) => {
                    if let Outcome::Retry = self.update_list(ops, list) {
                        return Outcome::Retry;
                    }
                }
            }
        }
        Outcome::Clean
    }

    fn update_list(&mut self, ops: &mut OpArena, handle: UpdateHandle) -> Outcome {
        let changed = match ops.get(handle) {
            UpdatingOp::List(list) => list.iterable.tag().changed_since(list.artifact_snapshot),
            _ => unreachable!("list walk on a non-list opcode"),
        };
        if changed {
            self.reconcile(ops, handle);
            if let UpdatingOp::List(list) = ops.get_mut(handle) {
                list.artifact_snapshot = list.iterable.tag().revision();
            }
        }
        let children = ops.get(handle).block().children.clone();
        // a flip below an item is absorbed by the item's own block; one
        // surfacing here belongs to an outer block
        self.update_run(ops, &children)
    }

    /// Re-render a block from its snapshot: clear its children, reopen
    /// its region, and replay its sub-program in a nested VM.
    fn retry_block(&mut self, ops: &mut OpArena, handle: UpdateHandle) {
        let (start, state, region) = {
            let block = ops.get_mut(handle).block_mut();
            block.children.clear();
            (block.start, block.state.clone(), block.region)
        };
        debug!("re-rendering block at {:?}", start);
        self.builder.reopen_region(region);

        let arena = std::mem::take(ops);
        let mut vm = VM::resume(self.env, &mut *self.builder, &state, arena);
        vm.seed_retry(handle);
        let (arena, _) = vm.run_nested(start);
        *ops = arena;
    }

    /// Keyed-list diff: keys in both orders are retained and moved, new
    /// keys entered fresh, departed keys retired. The new key order
    /// becomes the canonical map.
    fn reconcile(&mut self, ops: &mut OpArena, handle: UpdateHandle) {
        let (iterable, key_by, list_region, state, start, old_map) = {
            let list = match ops.get_mut(handle) {
                UpdatingOp::List(list) => list,
                _ => unreachable!("reconcile on a non-list opcode"),
            };
            (
                list.iterable.clone(),
                list.key_by.clone(),
                list.block.region,
                list.block.state.clone(),
                list.block.start,
                std::mem::take(&mut list.map),
            )
        };

        let new_items = keyed_items(&iterable.value(), &key_by);
        let new_keys: std::collections::HashSet<&str> =
            new_items.iter().map(|(k, _)| k.as_str()).collect();

        for (key, old) in &old_map {
            if !new_keys.contains(key.as_str()) {
                debug!("retiring list item {:?}", key);
                let region = ops.get(*old).block().region;
                self.builder.retire_region(region);
                *ops.get_mut(*old) = UpdatingOp::Retired;
            }
        }

        // Walk the new order back to front so every move and insert has
        // its final successor as the anchor.
        let mut fresh: IndexMap<String, UpdateHandle> = IndexMap::new();
        let mut next_region: Option<RegionId> = None;
        for (key, _) in new_items.iter().rev() {
            match old_map.get(key) {
                Some(existing) => {
                    let region = ops.get(*existing).block().region;
                    self.builder.move_region(region, next_region);
                    next_region = Some(region);
                }
                None => {
                    debug!("entering fresh list item {:?}", key);
                    let item = item_for_key(&iterable, &key_by, key.clone());
                    self.builder.begin_insert(list_region, next_region);
                    let entered = self.insert_item(ops, handle, &state, start, item);
                    self.builder.end_insert();
                    next_region = Some(ops.get(entered).block().region);
                    fresh.insert(key.clone(), entered);
                }
            }
        }

        let mut map = IndexMap::new();
        for (key, _) in &new_items {
            let entry = old_map
                .get(key)
                .or_else(|| fresh.get(key))
                .copied()
                .expect("every reconciled key is retained or entered");
            map.insert(key.clone(), entry);
        }
        let children: Vec<UpdateHandle> = map.values().copied().collect();
        let tags: Vec<Tag> = children.iter().filter_map(|c| ops.get(*c).tag()).collect();

        let list = match ops.get_mut(handle) {
            UpdatingOp::List(list) => list,
            _ => unreachable!(),
        };
        list.map = map;
        list.block.children = children;
        list.block.tag.update(Tag::combine(tags));
    }

    /// Run one fresh key's sub-program in a nested VM positioned at the
    /// insertion point.
    fn insert_item(
        &mut self,
        ops: &mut OpArena,
        list: UpdateHandle,
        state: &VmSnapshot,
        start: Handle,
        item: crate::iterator::IterItem,
    ) -> UpdateHandle {
        let arena = std::mem::take(ops);
        let mut vm = VM::resume(self.env, &mut *self.builder, state, arena);
        vm.seed_insertion(list, item);
        let (arena, entered) = vm.run_nested(start);
        *ops = arena;
        *entered.first().expect("fresh item left no block behind")
    }
}
