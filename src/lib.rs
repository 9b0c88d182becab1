//! weft — an incremental rendering virtual machine.
//!
//! A precompiled bytecode program runs against a live data model and
//! produces a tree of rendered output; later passes re-execute only the
//! parts of that tree whose dependencies actually changed. The crate
//! covers the machine itself: the register/stack core, the scope and
//! frame model, the updating-opcode tree that drives incremental
//! re-render, and keyed-list reconciliation. Template compilation lives
//! upstream; programs arrive here already encoded (see [`Program`]).
//!
//! ```
//! use std::rc::Rc;
//! use weft::{
//!     DynamicScope, Environment, Handle, Mutable, Op, Program, RenderTreeBuilder, Value, VM,
//! };
//!
//! // append one dynamic value, then finish
//! let program = Program::new(
//!     vec![Op::GetSelf, Op::AppendValue, Op::Return],
//!     vec![],
//! );
//! let env = Environment::new(program);
//! let model = Mutable::shared(Value::Text("hello".into()));
//!
//! let mut builder = RenderTreeBuilder::new();
//! let vm = VM::initial(&env, &mut builder, model.clone(), DynamicScope::new());
//! let mut result = vm.execute(Handle(0));
//! assert_eq!(builder.text(), "hello");
//!
//! // mutate the model and re-render only what changed
//! model.set(Value::Text("goodbye".into()));
//! result.rerender(&mut builder);
//! assert_eq!(builder.text(), "goodbye");
//! ```

pub mod iterator;
pub mod program;
pub mod reference;
pub mod scope;
pub mod stack;
pub mod tree;
pub mod value;
pub mod vm;

pub use iterator::{KeyBy, ListIterator};
pub use program::{Environment, Handle, Op, Program, Register};
pub use reference::{Constant, Mutable, Property, Reference, Revision, Tag};
pub use scope::{DynamicScope, Scope};
pub use stack::{EvalStack, StackValue};
pub use tree::{Destroy, Destroyable, NodeId, RegionId, RenderTreeBuilder, TreeBuilder};
pub use value::Value;
pub use vm::{RenderResult, Step, VM, VmError, render};
