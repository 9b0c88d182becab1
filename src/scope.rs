use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::reference::{Constant, Reference};
use crate::value::Value;

// ── Lexical scope ────────────────────────────────────────────────────
//
// Immutable shape, mutable slots: the slot count is fixed at creation,
// the references inside change as bind opcodes run. Scopes are shared
// between the scope stack and captured VM snapshots, so slots use
// interior mutability. The caller link is a back-reference only; nested
// scopes may share one without owning it.

pub struct Scope {
    slots: RefCell<Vec<Rc<dyn Reference>>>,
    self_ref: RefCell<Rc<dyn Reference>>,
    caller: RefCell<Option<Rc<Scope>>>,
}

impl Scope {
    pub fn root(self_ref: Rc<dyn Reference>, size: u32) -> Rc<Scope> {
        let scope = Scope::sized(size);
        *scope.self_ref.borrow_mut() = self_ref;
        scope
    }

    pub fn sized(size: u32) -> Rc<Scope> {
        Rc::new(Scope {
            slots: RefCell::new(vec![Constant::shared(Value::Null); size as usize]),
            self_ref: RefCell::new(Constant::shared(Value::Null)),
            caller: RefCell::new(None),
        })
    }

    /// A nested scope starting from this scope's current bindings.
    pub fn child(self: &Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            slots: RefCell::new(self.slots.borrow().clone()),
            self_ref: RefCell::new(self.get_self()),
            caller: RefCell::new(self.caller.borrow().clone()),
        })
    }

    pub fn get_symbol(&self, symbol: u32) -> Rc<dyn Reference> {
        self.slots.borrow()[symbol as usize].clone()
    }

    pub fn bind_symbol(&self, symbol: u32, reference: Rc<dyn Reference>) {
        self.slots.borrow_mut()[symbol as usize] = reference;
    }

    pub fn get_self(&self) -> Rc<dyn Reference> {
        self.self_ref.borrow().clone()
    }

    pub fn bind_self(&self, reference: Rc<dyn Reference>) {
        *self.self_ref.borrow_mut() = reference;
    }

    pub fn bind_caller(&self, caller: Rc<Scope>) {
        *self.caller.borrow_mut() = Some(caller);
    }

    pub fn caller(&self) -> Option<Rc<Scope>> {
        self.caller.borrow().clone()
    }
}

// ── Dynamic scope ────────────────────────────────────────────────────
//
// Named contextual values threaded implicitly through nested renders.
// Independent of the lexical chain: keyed lookup, copy-on-push children.

pub struct DynamicScope {
    vars: RefCell<HashMap<String, Rc<dyn Reference>>>,
}

impl DynamicScope {
    pub fn new() -> Rc<DynamicScope> {
        Rc::new(DynamicScope { vars: RefCell::new(HashMap::new()) })
    }

    pub fn child(self: &Rc<DynamicScope>) -> Rc<DynamicScope> {
        Rc::new(DynamicScope { vars: RefCell::new(self.vars.borrow().clone()) })
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Reference>> {
        self.vars.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, reference: Rc<dyn Reference>) {
        self.vars.borrow_mut().insert(name.into(), reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Mutable;

    #[test]
    fn child_copies_slots_but_shares_references() {
        let root = Scope::sized(2);
        let shared = Mutable::shared(Value::Number(1.0));
        root.bind_symbol(0, shared.clone());

        let child = root.child();
        assert_eq!(child.get_symbol(0).value(), Value::Number(1.0));

        // rebinding in the child leaves the parent untouched
        child.bind_symbol(0, Constant::shared(Value::Number(9.0)));
        assert_eq!(root.get_symbol(0).value(), Value::Number(1.0));

        // but shared reference mutations are visible through both
        shared.set(Value::Number(5.0));
        assert_eq!(root.get_symbol(0).value(), Value::Number(5.0));
    }

    #[test]
    fn caller_link_survives_child() {
        let caller = Scope::sized(0);
        let scope = Scope::sized(1);
        scope.bind_caller(caller.clone());
        let child = scope.child();
        assert!(Rc::ptr_eq(&child.caller().expect("caller"), &caller));
    }

    #[test]
    fn dynamic_scope_is_copy_on_push() {
        let root = DynamicScope::new();
        root.set("theme", Constant::shared(Value::Text("dark".into())));

        let child = root.child();
        child.set("theme", Constant::shared(Value::Text("light".into())));
        child.set("extra", Constant::shared(Value::Bool(true)));

        assert_eq!(root.get("theme").unwrap().value(), Value::Text("dark".into()));
        assert!(root.get("extra").is_none());
        assert_eq!(child.get("theme").unwrap().value(), Value::Text("light".into()));
    }
}
