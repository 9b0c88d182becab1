use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::iterator::{IterItem, ListIterator};
use crate::program::{Environment, Handle, Op, Register};
use crate::reference::{Constant, Property, Reference, Tag};
use crate::scope::{DynamicScope, Scope};
use crate::stack::{EvalStack, StackValue};
use crate::tree::{Destroyable, RegionId, TreeBuilder};
use crate::value::Value;

pub mod update;

use update::{BlockState, ListState, OpArena, UpdateHandle, UpdatingOp, UpdatingVm, VmSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("unknown entry point: {name}")]
    UnknownEntry { name: String },
}

// ── Step protocol ────────────────────────────────────────────────────

/// One pull of the step API: either exactly one opcode was evaluated, or
/// the machine drained and yielded its terminal result.
pub enum Step<'a> {
    Pending,
    Done(RenderResult<'a>),
}

/// The terminal render result: everything a caller needs to persist
/// between an initial render and a later incremental update pass.
pub struct RenderResult<'a> {
    env: &'a Environment,
    ops: OpArena,
    root: Vec<UpdateHandle>,
    region: RegionId,
}

impl<'a> RenderResult<'a> {
    pub fn env(&self) -> &'a Environment {
        self.env
    }

    pub fn root_region(&self) -> RegionId {
        self.region
    }

    /// The root updating-opcode list, in document order.
    pub fn root_ops(&self) -> &[UpdateHandle] {
        &self.root
    }

    pub fn ops(&self) -> &OpArena {
        &self.ops
    }

    /// Re-run the updating-opcode tree against the current data model,
    /// touching only output whose dependencies changed. The builder must
    /// be the one that produced this result's output tree.
    pub fn rerender(&mut self, builder: &mut dyn TreeBuilder) {
        let root = self.root.clone();
        let mut vm = UpdatingVm { env: self.env, builder };
        vm.execute(&mut self.ops, &root);
    }

    /// Tear the whole render down, releasing every destroyable.
    pub fn teardown(self, builder: &mut dyn TreeBuilder) {
        builder.retire_region(self.region);
    }
}

// ── VM ───────────────────────────────────────────────────────────────

/// Where appended updating opcodes currently land: the root list, or an
/// open block's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListRef {
    Root,
    Block(UpdateHandle),
}

pub struct VM<'a, 'b> {
    env: &'a Environment,
    builder: &'b mut dyn TreeBuilder,
    stack: EvalStack,

    // registers: exclusively owned by this instance, never ambient
    pc: i32,
    ra: i32,
    s0: StackValue,
    s1: StackValue,
    t0: StackValue,
    t1: StackValue,

    scope_stack: Vec<Rc<Scope>>,
    dynamic_scope_stack: Vec<Rc<DynamicScope>>,
    updating_stack: Vec<ListRef>,
    root_list: Vec<UpdateHandle>,
    cache_groups: Vec<Option<UpdateHandle>>,
    list_blocks: Vec<UpdateHandle>,
    ops: OpArena,
}

impl<'a, 'b> VM<'a, 'b> {
    pub fn initial(
        env: &'a Environment,
        builder: &'b mut dyn TreeBuilder,
        self_ref: Rc<dyn Reference>,
        dynamic_scope: Rc<DynamicScope>,
    ) -> VM<'a, 'b> {
        let scope = Scope::root(self_ref, env.program().symbols);
        VM {
            env,
            builder,
            stack: EvalStack::empty(),
            pc: -1,
            ra: -1,
            s0: StackValue::Null,
            s1: StackValue::Null,
            t0: StackValue::Null,
            t1: StackValue::Null,
            scope_stack: vec![scope],
            dynamic_scope_stack: vec![dynamic_scope],
            updating_stack: vec![ListRef::Root],
            root_list: Vec::new(),
            cache_groups: Vec::new(),
            list_blocks: Vec::new(),
            ops: OpArena::default(),
        }
    }

    /// A nested VM continuing from a captured snapshot: block retries
    /// and fresh list items run through here.
    pub(crate) fn resume(
        env: &'a Environment,
        builder: &'b mut dyn TreeBuilder,
        snapshot: &VmSnapshot,
        ops: OpArena,
    ) -> VM<'a, 'b> {
        VM {
            env,
            builder,
            stack: EvalStack::restore(snapshot.stack.clone()),
            pc: -1,
            ra: -1,
            s0: StackValue::Null,
            s1: StackValue::Null,
            t0: StackValue::Null,
            t1: StackValue::Null,
            scope_stack: vec![snapshot.scope.clone()],
            dynamic_scope_stack: vec![snapshot.dynamic_scope.clone()],
            updating_stack: vec![ListRef::Root],
            root_list: Vec::new(),
            cache_groups: Vec::new(),
            list_blocks: Vec::new(),
            ops,
        }
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Point the machine at `start` for an external step driver.
    pub fn begin(&mut self, start: Handle) {
        self.pc = self.env.program().getaddr(start);
    }

    /// Run the step loop to completion from `start`.
    pub fn execute(self, start: Handle) -> RenderResult<'a> {
        self.execute_with(start, |_| {})
    }

    /// As `execute`, with an initializer run before the first step.
    pub fn execute_with(
        mut self,
        start: Handle,
        initialize: impl FnOnce(&mut Self),
    ) -> RenderResult<'a> {
        self.pc = self.env.program().getaddr(start);
        initialize(&mut self);
        loop {
            if let Step::Done(result) = self.next() {
                return result;
            }
        }
    }

    /// Evaluate exactly one opcode, or finalize once the program counter
    /// reaches the done sentinel. Cooperative and single-threaded: a
    /// step owns every register and stack it touches.
    pub fn next(&mut self) -> Step<'a> {
        if self.pc == -1 {
            self.stack.reset();
            match self.updating_stack.pop() {
                Some(ListRef::Root) => {}
                _ => panic!("expected a final updating opcode list"),
            }
            let region = self.builder.pop_block();
            return Step::Done(RenderResult {
                env: self.env,
                ops: std::mem::take(&mut self.ops),
                root: std::mem::take(&mut self.root_list),
                region,
            });
        }

        let pc = self.pc;
        self.pc += 1;
        let op = self.env.program().opcode(pc).clone();
        trace!("pc {:>4}  {:?}", pc, op);
        self.evaluate(op);
        Step::Pending
    }

    /// Drive a nested run (retry or insertion) to the done sentinel and
    /// hand the arena back together with what got appended at the root.
    pub(crate) fn run_nested(mut self, start: Handle) -> (OpArena, Vec<UpdateHandle>) {
        self.pc = self.env.program().getaddr(start);
        while self.pc != -1 {
            let pc = self.pc;
            self.pc += 1;
            let op = self.env.program().opcode(pc).clone();
            trace!("nested pc {:>4}  {:?}", pc, op);
            self.evaluate(op);
        }
        self.stack.reset();
        match self.updating_stack.pop() {
            Some(ListRef::Root) => {}
            _ => panic!("nested run finished inside an open block"),
        }
        (self.ops, self.root_list)
    }

    pub(crate) fn seed_retry(&mut self, handle: UpdateHandle) {
        self.root_list.push(handle);
        self.updating_stack.push(ListRef::Block(handle));
    }

    pub(crate) fn seed_insertion(&mut self, list: UpdateHandle, item: IterItem) {
        self.list_blocks.push(list);
        let opcode = self.iterate(item.memo, item.value);
        self.enter_item(item.key, opcode);
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn evaluate(&mut self, op: Op) {
        match op {
            Op::Primitive(k) => {
                let value = self.env.program().constant(k).clone();
                self.stack.push(StackValue::Value(value));
            }
            Op::Constant(k) => {
                let value = self.env.program().constant(k).clone();
                self.stack.push(StackValue::Reference(Constant::shared(value)));
            }
            Op::Pop(n) => {
                self.stack.pop(n as i32);
            }
            Op::Dup(n) => self.stack.dup(self.stack.sp - n as i32),
            Op::Fetch(register) => {
                let value = self.register(register);
                self.stack.push(value);
            }
            Op::Load(register) => {
                let value = self.stack.pop(1);
                self.set_register(register, value);
            }

            Op::PushFrame => self.push_frame(),
            Op::PopFrame => self.pop_frame(),
            Op::Call(handle) => self.call(handle),
            Op::Return => self.do_return(),
            Op::ReturnTo(offset) => self.return_to(offset),
            Op::Jump(offset) => self.goto(offset),
            Op::JumpUnless(offset) => {
                let condition = self.stack.pop(1).as_reference();
                if !condition.value().truthy() {
                    self.goto(offset);
                }
            }

            Op::RootScope { size, bind_caller } => {
                self.push_root_scope(size, bind_caller);
            }
            Op::ChildScope => self.push_child_scope(),
            Op::CallerScope { child } => self.push_caller_scope(child),
            Op::PopScope => self.pop_scope(),
            Op::SetSelf => {
                let reference = self.stack.pop(1).as_reference();
                self.scope().bind_self(reference);
            }
            Op::GetSelf => {
                let reference = self.get_self();
                self.stack.push(StackValue::Reference(reference));
            }
            Op::SetVariable(symbol) => {
                let reference = self.stack.pop(1).as_reference();
                self.scope().bind_symbol(symbol, reference);
            }
            Op::GetVariable(symbol) => {
                let reference = self.reference_for_symbol(symbol);
                self.stack.push(StackValue::Reference(reference));
            }
            Op::GetProperty(k) => {
                let name = self.constant_text(k);
                let parent = self.stack.pop(1).as_reference();
                self.stack.push(StackValue::Reference(Rc::new(Property::new(parent, name))));
            }
            Op::PushDynamicScope => {
                self.push_dynamic_scope();
            }
            Op::PopDynamicScope => self.pop_dynamic_scope(),
            Op::BindDynamicScope(names) => self.bind_dynamic_scope(&names),
            Op::PushDynamicVar(k) => {
                let name = self.constant_text(k);
                let reference = self
                    .dynamic_scope()
                    .get(&name)
                    .unwrap_or_else(|| panic!("unbound dynamic variable: {name}"));
                self.stack.push(StackValue::Reference(reference));
            }

            Op::AppendValue => {
                let reference = self.stack.pop(1).as_reference();
                let value = reference.value();
                let node = self.builder.append(&value);
                let tag = reference.tag();
                if !tag.is_constant() {
                    let snapshot = tag.revision();
                    let opcode = self.ops.alloc(UpdatingOp::Content {
                        reference,
                        tag,
                        snapshot,
                        last: value,
                        node,
                    });
                    self.update_with(opcode);
                }
            }
            Op::AppendConst(k) => {
                let value = self.env.program().constant(k).clone();
                self.builder.append(&value);
            }
            Op::Assert => {
                let reference = self.stack.peek().as_reference();
                let tag = reference.tag();
                if !tag.is_constant() {
                    let snapshot = tag.revision();
                    let expected = reference.value().truthy();
                    let opcode =
                        self.ops.alloc(UpdatingOp::Assert { reference, tag, snapshot, expected });
                    self.update_with(opcode);
                }
            }

            Op::Enter(args) => self.enter(args),
            Op::Exit => self.exit(),
            Op::BeginCacheGroup => self.begin_cache_group(),
            Op::CommitCacheGroup => self.commit_cache_group(),

            Op::PutIterator(key_by) => {
                let iterable = self.stack.pop(1).as_reference();
                let iterator = ListIterator::new(iterable, key_by);
                self.stack.push(StackValue::Iter(Rc::new(RefCell::new(iterator))));
            }
            Op::EnterList(offset) => self.enter_list(offset),
            Op::Iterate(offset) => {
                let iterator = self.stack.peek().as_iter();
                let next = iterator.borrow_mut().next_item();
                match next {
                    Some(item) => {
                        self.push_frame();
                        let opcode = self.iterate(item.memo, item.value);
                        self.enter_item(item.key, opcode);
                        let start = self.ops.get(self.list_block()).block().start;
                        self.ra = self.pc;
                        self.pc = self.env.program().getaddr(start);
                    }
                    None => self.goto(offset),
                }
            }
            Op::ExitList => self.exit_list(),
        }
    }

    // ── Registers and frames ─────────────────────────────────────────

    fn register(&self, register: Register) -> StackValue {
        match register {
            Register::S0 => self.s0.clone(),
            Register::S1 => self.s1.clone(),
            Register::T0 => self.t0.clone(),
            Register::T1 => self.t1.clone(),
        }
    }

    fn set_register(&mut self, register: Register, value: StackValue) {
        match register {
            Register::S0 => self.s0 = value,
            Register::S1 => self.s1 = value,
            Register::T0 => self.t0 = value,
            Register::T1 => self.t1 = value,
        }
    }

    /// Save `ra` and `fp` on the stack, then open a new frame whose
    /// saved registers sit at `from_base(0)` and `from_base(-1)`.
    pub fn push_frame(&mut self) {
        self.stack.push(StackValue::Int(self.ra));
        let fp = self.stack.fp;
        self.stack.push(StackValue::Int(fp));
        self.stack.fp = self.stack.sp - 1;
    }

    /// Restore `sp`, `ra` and `fp` from the frame's saved registers,
    /// discarding them and anything the frame left on top.
    pub fn pop_frame(&mut self) {
        self.stack.sp = self.stack.fp - 1;
        self.ra = self.stack.from_base(0).as_int();
        self.stack.fp = self.stack.from_base(-1).as_int();
    }

    /// Subroutine call: the return address is the instruction after the
    /// call, which the advanced `pc` already names.
    pub fn call(&mut self, handle: Handle) {
        self.ra = self.pc;
        self.pc = self.env.program().getaddr(handle);
    }

    pub fn return_to(&mut self, offset: i32) {
        self.ra = self.pc + offset;
    }

    pub fn do_return(&mut self) {
        self.pc = self.ra;
    }

    pub fn goto(&mut self, offset: i32) {
        self.pc += offset;
    }

    // ── Scopes ───────────────────────────────────────────────────────

    pub fn scope(&self) -> Rc<Scope> {
        self.scope_stack.last().expect("expected a scope on the scope stack").clone()
    }

    pub fn dynamic_scope(&self) -> Rc<DynamicScope> {
        self.dynamic_scope_stack
            .last()
            .expect("expected a dynamic scope on the dynamic scope stack")
            .clone()
    }

    pub fn get_self(&self) -> Rc<dyn Reference> {
        self.scope().get_self()
    }

    pub fn reference_for_symbol(&self, symbol: u32) -> Rc<dyn Reference> {
        self.scope().get_symbol(symbol)
    }

    pub fn push_child_scope(&mut self) {
        let child = self.scope().child();
        self.scope_stack.push(child);
    }

    pub fn push_root_scope(&mut self, size: u32, bind_caller: bool) -> Rc<Scope> {
        let scope = Scope::sized(size);
        if bind_caller {
            scope.bind_caller(self.scope());
        }
        self.scope_stack.push(scope.clone());
        scope
    }

    pub fn push_caller_scope(&mut self, child: bool) {
        let caller = self
            .scope()
            .caller()
            .expect("caller scope requested where no caller context exists");
        self.scope_stack.push(if child { caller.child() } else { caller });
    }

    pub fn pop_scope(&mut self) {
        self.scope_stack.pop().expect("popped an empty scope stack");
    }

    pub fn push_dynamic_scope(&mut self) -> Rc<DynamicScope> {
        let child = self.dynamic_scope().child();
        self.dynamic_scope_stack.push(child.clone());
        child
    }

    pub fn pop_dynamic_scope(&mut self) {
        self.dynamic_scope_stack.pop().expect("popped an empty dynamic scope stack");
    }

    pub fn bind_dynamic_scope(&mut self, names: &[u32]) {
        let scope = self.dynamic_scope();
        for k in names.iter().rev() {
            let name = self.constant_text(*k);
            let reference = self.stack.pop(1).as_reference();
            scope.set(name, reference);
        }
    }

    // ── Updating opcode tree ─────────────────────────────────────────

    /// Snapshot the top `args` stack values plus the current scope pair.
    pub fn capture(&self, args: u32) -> VmSnapshot {
        VmSnapshot {
            scope: self.scope(),
            dynamic_scope: self.dynamic_scope(),
            stack: self.stack.capture(args),
        }
    }

    /// Open a nested updatable region governed by a fresh block opcode.
    /// Must be balanced by exactly one `exit`.
    pub fn enter(&mut self, args: u32) {
        let state = self.capture(args);
        let region = self.builder.push_updatable_block();
        let start = self.env.program().gethandle(self.pc);
        let opcode = self.ops.alloc(UpdatingOp::Try(BlockState {
            start,
            state,
            region,
            children: Vec::new(),
            tag: Tag::updatable(),
        }));
        self.did_enter(opcode);
    }

    /// Close the innermost region, restore the enclosing updating list,
    /// and fire the children-attached hook on the block just closed.
    pub fn exit(&mut self) {
        self.builder.pop_block();
        self.updating_stack.pop().expect("popped an empty updating-list stack");
        let tail = *self
            .current_list()
            .last()
            .expect("exited a block with no enclosing opcode");
        self.did_initialize_children(tail);
    }

    fn did_enter(&mut self, opcode: UpdateHandle) {
        self.update_with(opcode);
        self.updating_stack.push(ListRef::Block(opcode));
    }

    /// Seal a block: its tag becomes the combination of its children's.
    fn did_initialize_children(&mut self, handle: UpdateHandle) {
        let children = self.ops.get(handle).block().children.clone();
        let tags: Vec<Tag> = children.iter().filter_map(|c| self.ops.get(*c).tag()).collect();
        match self.ops.get_mut(handle) {
            UpdatingOp::Try(block) | UpdatingOp::List(ListState { block, .. }) => {
                block.tag.update(Tag::combine(tags));
            }
            _ => panic!("sealed children on a non-block opcode"),
        }
    }

    /// Append an updating opcode to the current list.
    pub(crate) fn update_with(&mut self, opcode: UpdateHandle) {
        self.current_list_mut().push(opcode);
    }

    fn current_list(&self) -> &Vec<UpdateHandle> {
        match self
            .updating_stack
            .last()
            .expect("expected an updating list on the updating-list stack")
        {
            ListRef::Root => &self.root_list,
            ListRef::Block(handle) => &self.ops.get(*handle).block().children,
        }
    }

    fn current_list_mut(&mut self) -> &mut Vec<UpdateHandle> {
        let top = *self
            .updating_stack
            .last()
            .expect("expected an updating list on the updating-list stack");
        match top {
            ListRef::Root => &mut self.root_list,
            ListRef::Block(handle) => match self.ops.get_mut(handle) {
                UpdatingOp::Try(block) | UpdatingOp::List(ListState { block, .. }) => {
                    &mut block.children
                }
                _ => panic!("current updating list points at a non-block opcode"),
            },
        }
    }

    // ── Cache groups ─────────────────────────────────────────────────

    pub fn begin_cache_group(&mut self) {
        self.cache_groups.push(self.current_list().last().copied());
    }

    /// Bracket everything appended since the matching `begin_cache_group`
    /// with a guard that skips the whole run while its combined tag holds
    /// still, turning an O(children) re-check into O(1).
    pub fn commit_cache_group(&mut self) {
        let marker = self.cache_groups.pop().expect("popped an empty cache-group stack");
        let head = {
            let list = self.current_list();
            match marker {
                Some(m) => list.iter().position(|h| *h == m).map(|i| i + 1).unwrap_or(0),
                None => 0,
            }
        };
        let run: Vec<UpdateHandle> = self.current_list()[head..].to_vec();
        let tag = Tag::combine(run.iter().filter_map(|h| self.ops.get(*h).tag()).collect());
        let snapshot = tag.revision();

        let label = self.ops.alloc(UpdatingOp::Label);
        let guard = self.ops.alloc(UpdatingOp::Guard { tag, snapshot, target: label });
        let did_modify = self.ops.alloc(UpdatingOp::DidModify { guard });

        let list = self.current_list_mut();
        list.insert(head, guard);
        list.push(did_modify);
        list.push(label);
    }

    // ── Keyed lists ──────────────────────────────────────────────────

    /// Open a list block. The iterator's artifacts come off the top of
    /// the stack; `relative_start` names the per-item sub-program.
    pub fn enter_list(&mut self, relative_start: i32) {
        let state = self.capture(0);
        let region = self.builder.push_block_list();
        let iterator = self.stack.peek().as_iter();
        let (iterable, key_by) = {
            let it = iterator.borrow();
            (it.iterable(), it.key_by())
        };
        let artifact_snapshot = iterable.tag().revision();
        let start = self.env.program().gethandle(self.pc + relative_start);
        let opcode = self.ops.alloc(UpdatingOp::List(ListState {
            block: BlockState {
                start,
                state,
                region,
                children: Vec::new(),
                tag: Tag::updatable(),
            },
            map: indexmap::IndexMap::new(),
            iterable,
            key_by,
            artifact_snapshot,
        }));
        self.list_blocks.push(opcode);
        self.did_enter(opcode);
    }

    /// Build the per-item block: pushes the item's value and memo
    /// references, captures them, and opens the item's region.
    pub(crate) fn iterate(
        &mut self,
        memo: Rc<dyn Reference>,
        value: Rc<dyn Reference>,
    ) -> UpdateHandle {
        let start = self.ops.get(self.list_block()).block().start;
        self.stack.push(StackValue::Reference(value));
        self.stack.push(StackValue::Reference(memo));
        let state = self.capture(2);
        let region = self.builder.push_updatable_block();
        self.ops.alloc(UpdatingOp::Try(BlockState {
            start,
            state,
            region,
            children: Vec::new(),
            tag: Tag::updatable(),
        }))
    }

    /// Register a freshly entered per-key block under its key and nest
    /// into it exactly as `enter` does.
    pub(crate) fn enter_item(&mut self, key: String, opcode: UpdateHandle) {
        let list = self.list_block();
        match self.ops.get_mut(list) {
            UpdatingOp::List(l) => {
                l.map.insert(key, opcode);
            }
            _ => panic!("entered an item outside a list block"),
        }
        self.did_enter(opcode);
    }

    pub fn exit_list(&mut self) {
        self.exit();
        self.list_blocks.pop().expect("popped an empty list-block stack");
    }

    fn list_block(&self) -> UpdateHandle {
        *self.list_blocks.last().expect("expected a list block")
    }

    // ── Resources ────────────────────────────────────────────────────

    /// Register a resource owned by the innermost open region; released
    /// exactly once when that region (or an ancestor) is torn down.
    pub fn new_destroyable(&mut self, destroyable: Destroyable) {
        self.builder.did_add_destroyable(destroyable);
    }

    fn constant_text(&self, k: u32) -> String {
        match self.env.program().constant(k) {
            Value::Text(s) => s.clone(),
            other => panic!("expected a text constant, found {other}"),
        }
    }
}

/// Resolve a named entry point and run it to completion.
pub fn render<'a>(
    env: &'a Environment,
    builder: &mut dyn TreeBuilder,
    entry: &str,
    self_ref: Rc<dyn Reference>,
    dynamic_scope: Rc<DynamicScope>,
) -> Result<RenderResult<'a>, VmError> {
    let start = env
        .program()
        .entry(entry)
        .ok_or_else(|| VmError::UnknownEntry { name: entry.to_string() })?;
    let vm = VM::initial(env, builder, self_ref, dynamic_scope);
    Ok(vm.execute(start))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use crate::tree::RenderTreeBuilder;

    fn empty_env() -> Environment {
        Environment::new(Program::new(vec![], vec![]))
    }

    fn null_self() -> Rc<dyn Reference> {
        Constant::shared(Value::Null)
    }

    #[test]
    fn balanced_frames_restore_sp_fp_ra() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());

        vm.stack.push(StackValue::Int(42));
        vm.ra = 7;
        let (sp, fp, ra) = (vm.stack.sp, vm.stack.fp, vm.ra);

        vm.push_frame();
        vm.stack.push(StackValue::Int(1));
        vm.push_frame();
        vm.pop_frame();
        vm.pop_frame();

        assert_eq!(vm.stack.sp, sp);
        assert_eq!(vm.stack.fp, fp);
        assert_eq!(vm.ra, ra);
    }

    #[test]
    fn frame_registers_readable_from_base() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());

        vm.ra = 99;
        vm.push_frame();
        assert_eq!(vm.stack.from_base(0).as_int(), 99);
        assert_eq!(vm.stack.from_base(-1).as_int(), 0);
    }

    #[test]
    fn exit_restores_the_entered_list() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());

        let before = *vm.updating_stack.last().unwrap();
        vm.stack.push(StackValue::Reference(Constant::shared(Value::Number(1.0))));
        vm.enter(1);
        assert_ne!(*vm.updating_stack.last().unwrap(), before);
        vm.exit();
        assert_eq!(*vm.updating_stack.last().unwrap(), before);
        assert_eq!(vm.root_list.len(), 1);
    }

    #[test]
    fn entered_block_captures_requested_args() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());

        vm.stack.push(StackValue::Reference(Constant::shared(Value::Number(1.0))));
        vm.stack.push(StackValue::Reference(Constant::shared(Value::Number(2.0))));
        vm.enter(1);
        vm.exit();

        let handle = vm.root_list[0];
        assert_eq!(vm.ops.get(handle).block().state.stack.len(), 1);
        // capture leaves the stack untouched
        assert_eq!(vm.stack.sp, 1);
    }

    #[test]
    fn commit_splices_guard_marker_and_label() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());

        vm.begin_cache_group();
        vm.stack.push(StackValue::Reference(Constant::shared(Value::Number(1.0))));
        vm.enter(0);
        vm.exit();
        vm.commit_cache_group();

        assert_eq!(vm.root_list.len(), 4);
        assert!(matches!(vm.ops.get(vm.root_list[0]), UpdatingOp::Guard { .. }));
        assert!(matches!(vm.ops.get(vm.root_list[1]), UpdatingOp::Try(_)));
        assert!(matches!(vm.ops.get(vm.root_list[2]), UpdatingOp::DidModify { .. }));
        assert!(matches!(vm.ops.get(vm.root_list[3]), UpdatingOp::Label));
    }

    #[test]
    #[should_panic(expected = "caller scope requested where no caller context exists")]
    fn caller_scope_without_context_faults() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());
        vm.push_caller_scope(false);
    }

    #[test]
    fn caller_scope_binds_through_root_scope() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let mut vm = VM::initial(&env, &mut builder, null_self(), DynamicScope::new());

        let outer = vm.scope();
        vm.push_root_scope(2, true);
        vm.push_caller_scope(false);
        assert!(Rc::ptr_eq(&vm.scope(), &outer));
        vm.pop_scope();
        vm.pop_scope();
        assert!(Rc::ptr_eq(&vm.scope(), &outer));
    }

    #[test]
    fn unknown_entry_is_an_error() {
        let env = empty_env();
        let mut builder = RenderTreeBuilder::new();
        let err = render(&env, &mut builder, "missing", null_self(), DynamicScope::new())
            .err()
            .expect("unknown entry must fail");
        assert!(matches!(err, VmError::UnknownEntry { .. }));
    }
}
