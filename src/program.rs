use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::iterator::KeyBy;
use crate::value::Value;

// ── Compiled program ─────────────────────────────────────────────────
//
// One instruction per program slot; the program counter advances by one
// before each opcode is evaluated, so every relative offset in an
// instruction is relative to the instruction *after* it. Handles are
// stable identifiers for program positions, resolvable in both
// directions. The upstream compiler is trusted to emit well-formed
// control flow; out-of-range fetches are programming errors.

/// Stable identifier for a program position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(pub u32);

/// The scratch registers opcodes may address. `pc`/`ra` and the stack
/// pointers are managed by the VM itself and are not addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Register {
    S0,
    S1,
    T0,
    T1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // Stack
    /// Push a constant-pool value as a raw stack value.
    Primitive(u32),
    /// Push a constant-pool value wrapped in a constant reference.
    Constant(u32),
    Pop(u32),
    /// Duplicate the slot `n` below the top onto the top.
    Dup(u32),
    Fetch(Register),
    Load(Register),

    // Frames and control
    PushFrame,
    PopFrame,
    Call(Handle),
    Return,
    ReturnTo(i32),
    Jump(i32),
    /// Pop a reference; jump when its value is falsy.
    JumpUnless(i32),

    // Scopes
    RootScope { size: u32, bind_caller: bool },
    ChildScope,
    CallerScope { child: bool },
    PopScope,
    SetSelf,
    GetSelf,
    SetVariable(u32),
    GetVariable(u32),
    /// Pop a reference, push a derived reference to the named field.
    GetProperty(u32),
    PushDynamicScope,
    PopDynamicScope,
    BindDynamicScope(Vec<u32>),
    PushDynamicVar(u32),

    // Content
    AppendValue,
    AppendConst(u32),
    /// Peek a condition reference and plant a truthiness watch; a later
    /// flip re-runs the enclosing block.
    Assert,

    // Blocks
    Enter(u32),
    Exit,
    BeginCacheGroup,
    CommitCacheGroup,

    // Keyed lists
    PutIterator(KeyBy),
    EnterList(i32),
    Iterate(i32),
    ExitList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Op>,
    pub constants: Vec<Value>,
    /// Root scope slot count, computed by the upstream compiler.
    #[serde(default)]
    pub symbols: u32,
    /// Named entry points for embedders and the CLI.
    pub entries: HashMap<String, Handle>,
}

impl Program {
    pub fn new(code: Vec<Op>, constants: Vec<Value>) -> Program {
        Program { code, constants, symbols: 0, entries: HashMap::new() }
    }

    pub fn with_symbols(mut self, symbols: u32) -> Program {
        self.symbols = symbols;
        self
    }

    pub fn with_entry(mut self, name: impl Into<String>, handle: Handle) -> Program {
        self.entries.insert(name.into(), handle);
        self
    }

    pub fn entry(&self, name: &str) -> Option<Handle> {
        self.entries.get(name).copied()
    }

    pub fn getaddr(&self, handle: Handle) -> i32 {
        handle.0 as i32
    }

    pub fn gethandle(&self, pc: i32) -> Handle {
        debug_assert!(pc >= -1, "handle for a negative program counter");
        Handle(pc as u32)
    }

    pub fn opcode(&self, pc: i32) -> &Op {
        &self.code[pc as usize]
    }

    pub fn constant(&self, index: u32) -> &Value {
        &self.constants[index as usize]
    }
}

// ── Environment ──────────────────────────────────────────────────────

/// Owns the compiled program for one render session. The terminal render
/// result carries this reference forward for incremental re-invocation.
pub struct Environment {
    program: Program,
}

impl Environment {
    pub fn new(program: Program) -> Environment {
        Environment { program }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_resolve_both_ways() {
        let program = Program::new(vec![Op::PushFrame, Op::Return], vec![]);
        let h = program.gethandle(1);
        assert_eq!(program.getaddr(h), 1);
        assert_eq!(*program.opcode(program.getaddr(h)), Op::Return);
    }

    #[test]
    fn entries_round_trip_through_json() {
        let program = Program::new(
            vec![Op::Primitive(0), Op::Return],
            vec![Value::Number(1.0)],
        )
        .with_entry("main", Handle(0));

        let json = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entry("main"), Some(Handle(0)));
        assert_eq!(back.code, program.code);
        assert_eq!(back.constants, program.constants);
    }
}
