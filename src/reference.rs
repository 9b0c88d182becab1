use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::value::Value;

pub type Revision = u64;

// ── Dependency tags ──────────────────────────────────────────────────
//
// A tag is a revision-tracked handle over one or more reactive values.
// Revisions only grow; "changed" means the revision differs from a
// previously observed snapshot. Combined tags report the sum of their
// constituents so that any single bump is visible through the merge.

#[derive(Clone)]
pub struct Tag(Rc<TagKind>);

enum TagKind {
    Constant,
    Dirtyable(Cell<Revision>),
    Combined(Vec<Tag>),
    Updatable(RefCell<Tag>),
}

impl Tag {
    pub fn constant() -> Tag {
        Tag(Rc::new(TagKind::Constant))
    }

    pub fn dirtyable() -> Tag {
        Tag(Rc::new(TagKind::Dirtyable(Cell::new(1))))
    }

    /// A tag whose underlying source is swapped once known, e.g. a block
    /// opcode's tag becomes the combination of its children when sealed.
    pub fn updatable() -> Tag {
        Tag(Rc::new(TagKind::Updatable(RefCell::new(Tag::constant()))))
    }

    /// Combine an ordered slice of tags. The merged revision changes iff
    /// any constituent's revision changed. Constants drop out.
    pub fn combine(tags: Vec<Tag>) -> Tag {
        let mut live: Vec<Tag> = tags
            .into_iter()
            .filter(|t| !matches!(*t.0, TagKind::Constant))
            .collect();
        match live.len() {
            0 => Tag::constant(),
            1 => live.pop().expect("len checked"),
            _ => Tag(Rc::new(TagKind::Combined(live))),
        }
    }

    pub fn revision(&self) -> Revision {
        match &*self.0 {
            TagKind::Constant => 0,
            TagKind::Dirtyable(rev) => rev.get(),
            TagKind::Combined(tags) => tags.iter().map(Tag::revision).sum(),
            TagKind::Updatable(inner) => inner.borrow().revision(),
        }
    }

    /// Bump the revision. Only dirtyable tags move; dirtying anything
    /// else is a programming error.
    pub fn dirty(&self) {
        match &*self.0 {
            TagKind::Dirtyable(rev) => rev.set(rev.get() + 1),
            _ => panic!("dirtied a non-dirtyable tag"),
        }
    }

    pub fn update(&self, source: Tag) {
        match &*self.0 {
            TagKind::Updatable(inner) => *inner.borrow_mut() = source,
            _ => panic!("updated a non-updatable tag"),
        }
    }

    pub fn changed_since(&self, snapshot: Revision) -> bool {
        self.revision() != snapshot
    }

    /// Constant tags can never change; the VM skips planting updating
    /// opcodes for them.
    pub fn is_constant(&self) -> bool {
        matches!(*self.0, TagKind::Constant)
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.0 {
            TagKind::Constant => "constant",
            TagKind::Dirtyable(_) => "dirtyable",
            TagKind::Combined(_) => "combined",
            TagKind::Updatable(_) => "updatable",
        };
        write!(f, "Tag({}@{})", kind, self.revision())
    }
}

// ── Reactive references ──────────────────────────────────────────────

/// A reactive value reference: the VM reads values through these and
/// snapshots their tags to decide what to re-run later.
pub trait Reference {
    fn value(&self) -> Value;
    fn tag(&self) -> Tag;
}

pub struct Constant {
    value: Value,
    tag: Tag,
}

impl Constant {
    pub fn new(value: Value) -> Constant {
        Constant { value, tag: Tag::constant() }
    }

    pub fn shared(value: Value) -> Rc<dyn Reference> {
        Rc::new(Constant::new(value))
    }
}

impl Reference for Constant {
    fn value(&self) -> Value {
        self.value.clone()
    }

    fn tag(&self) -> Tag {
        self.tag.clone()
    }
}

/// An externally settable root of the data model. `set` bumps the tag so
/// dependents re-run on the next update pass.
pub struct Mutable {
    value: RefCell<Value>,
    tag: Tag,
}

impl Mutable {
    pub fn new(value: Value) -> Mutable {
        Mutable { value: RefCell::new(value), tag: Tag::dirtyable() }
    }

    pub fn shared(value: Value) -> Rc<Mutable> {
        Rc::new(Mutable::new(value))
    }

    pub fn set(&self, value: Value) {
        *self.value.borrow_mut() = value;
        self.tag.dirty();
    }
}

impl Reference for Mutable {
    fn value(&self) -> Value {
        self.value.borrow().clone()
    }

    fn tag(&self) -> Tag {
        self.tag.clone()
    }
}

/// A derived field reference. Shares the parent's tag: a parent bump
/// invalidates every property chained off it.
pub struct Property {
    parent: Rc<dyn Reference>,
    name: String,
}

impl Property {
    pub fn new(parent: Rc<dyn Reference>, name: impl Into<String>) -> Property {
        Property { parent, name: name.into() }
    }
}

impl Reference for Property {
    fn value(&self) -> Value {
        self.parent.value().field(&self.name)
    }

    fn tag(&self) -> Tag {
        self.parent.tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutable_set_changes_revision() {
        let m = Mutable::new(Value::Number(1.0));
        let tag = m.tag();
        let before = tag.revision();
        m.set(Value::Number(2.0));
        assert!(tag.changed_since(before));
        assert_eq!(m.value(), Value::Number(2.0));
    }

    #[test]
    fn constant_tag_never_changes() {
        let c = Constant::new(Value::Text("hi".into()));
        let before = c.tag().revision();
        assert!(!c.tag().changed_since(before));
        assert_eq!(before, 0);
    }

    #[test]
    fn combined_sees_any_constituent_bump() {
        let a = Mutable::new(Value::Number(1.0));
        let b = Mutable::new(Value::Number(2.0));
        let combined = Tag::combine(vec![a.tag(), b.tag()]);
        let snap = combined.revision();
        a.set(Value::Number(10.0));
        assert!(combined.changed_since(snap));
        let snap = combined.revision();
        b.set(Value::Number(20.0));
        assert!(combined.changed_since(snap));
    }

    #[test]
    fn combine_of_constants_is_constant() {
        let t = Tag::combine(vec![Tag::constant(), Tag::constant()]);
        assert_eq!(t.revision(), 0);
        let snap = t.revision();
        assert!(!t.changed_since(snap));
    }

    #[test]
    fn updatable_follows_its_source() {
        let t = Tag::updatable();
        assert_eq!(t.revision(), 0);
        let m = Mutable::new(Value::Null);
        t.update(m.tag());
        let snap = t.revision();
        m.set(Value::Bool(true));
        assert!(t.changed_since(snap));
    }

    #[test]
    fn property_shares_parent_tag() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("name".to_string(), Value::Text("a".into()));
        let root = Mutable::shared(Value::Record(fields));
        let prop = Property::new(root.clone(), "name");
        assert_eq!(prop.value(), Value::Text("a".into()));
        let snap = prop.tag().revision();

        let mut fields = std::collections::HashMap::new();
        fields.insert("name".to_string(), Value::Text("b".into()));
        root.set(Value::Record(fields));
        assert!(prop.tag().changed_since(snap));
        assert_eq!(prop.value(), Value::Text("b".into()));
    }
}
