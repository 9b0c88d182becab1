use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::reference::{Reference, Tag};
use crate::value::Value;

// ── Keyed iteration ──────────────────────────────────────────────────
//
// A keyed list render walks a snapshot of the iterable once, handing the
// VM one (key, value-ref, memo-ref) triple per item. The iterable
// reference plus the key function are the artifacts a list block keeps
// for later reconciliation. Duplicate keys within one list are undefined
// behavior; the producing layer must guarantee uniqueness.

/// How items of a keyed list derive their reconciliation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyBy {
    /// Position in the list. Items never move under this key function.
    Index,
    /// The item's own text form.
    Identity,
    /// A named field of the item.
    Property(String),
}

impl KeyBy {
    pub fn key_for(&self, index: usize, item: &Value) -> String {
        match self {
            KeyBy::Index => index.to_string(),
            KeyBy::Identity => item.key_text(),
            KeyBy::Property(name) => item.field(name).key_text(),
        }
    }
}

/// Current keyed order of an iterable's value. Non-list values iterate
/// as empty.
pub fn keyed_items(value: &Value, key_by: &KeyBy) -> Vec<(String, Value)> {
    match value {
        Value::List(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| (key_by.key_for(i, item), item.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

pub struct IterItem {
    pub key: String,
    pub value: Rc<dyn Reference>,
    pub memo: Rc<dyn Reference>,
}

/// A one-pass cursor over the iterable's current keyed order. Lives on
/// the evaluation stack for the duration of the list loop.
pub struct ListIterator {
    iterable: Rc<dyn Reference>,
    key_by: KeyBy,
    items: Vec<(String, Value)>,
    pos: usize,
}

impl ListIterator {
    pub fn new(iterable: Rc<dyn Reference>, key_by: KeyBy) -> ListIterator {
        let items = keyed_items(&iterable.value(), &key_by);
        ListIterator { iterable, key_by, items, pos: 0 }
    }

    pub fn next_item(&mut self) -> Option<IterItem> {
        let key = self.items.get(self.pos)?.0.clone();
        self.pos += 1;
        Some(item_for_key(&self.iterable, &self.key_by, key))
    }

    pub fn iterable(&self) -> Rc<dyn Reference> {
        self.iterable.clone()
    }

    pub fn key_by(&self) -> KeyBy {
        self.key_by.clone()
    }
}

/// Build the (key, value-ref, memo-ref) triple for one key of an
/// iterable. Reconciliation uses this for freshly entered keys.
pub fn item_for_key(iterable: &Rc<dyn Reference>, key_by: &KeyBy, key: String) -> IterItem {
    let value: Rc<dyn Reference> = Rc::new(ItemRef {
        list: iterable.clone(),
        key_by: key_by.clone(),
        key: key.clone(),
    });
    let memo: Rc<dyn Reference> = Rc::new(MemoRef {
        list: iterable.clone(),
        key_by: key_by.clone(),
        key: key.clone(),
    });
    IterItem { key, value, memo }
}

/// The item currently stored under a key. Tracks the list reference by
/// key, not by position, so retained items stay valid across reorders.
struct ItemRef {
    list: Rc<dyn Reference>,
    key_by: KeyBy,
    key: String,
}

impl Reference for ItemRef {
    fn value(&self) -> Value {
        keyed_items(&self.list.value(), &self.key_by)
            .into_iter()
            .find(|(k, _)| *k == self.key)
            .map(|(_, v)| v)
            .unwrap_or(Value::Null)
    }

    fn tag(&self) -> Tag {
        self.list.tag()
    }
}

/// The key's current position in the list.
struct MemoRef {
    list: Rc<dyn Reference>,
    key_by: KeyBy,
    key: String,
}

impl Reference for MemoRef {
    fn value(&self) -> Value {
        keyed_items(&self.list.value(), &self.key_by)
            .iter()
            .position(|(k, _)| *k == self.key)
            .map(|i| Value::Number(i as f64))
            .unwrap_or(Value::Null)
    }

    fn tag(&self) -> Tag {
        self.list.tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Mutable;

    fn list(items: &[&str]) -> Value {
        Value::List(items.iter().map(|s| Value::Text(s.to_string())).collect())
    }

    #[test]
    fn identity_keys_follow_item_text() {
        let items = keyed_items(&list(&["a", "b"]), &KeyBy::Identity);
        assert_eq!(items[0].0, "a");
        assert_eq!(items[1].0, "b");
    }

    #[test]
    fn index_keys_are_positions() {
        let items = keyed_items(&list(&["a", "b"]), &KeyBy::Index);
        assert_eq!(items[0].0, "0");
        assert_eq!(items[1].0, "1");
    }

    #[test]
    fn iterator_yields_in_order_then_stops() {
        let source = Mutable::shared(list(&["x", "y"]));
        let mut iter = ListIterator::new(source, KeyBy::Identity);
        assert_eq!(iter.next_item().unwrap().key, "x");
        assert_eq!(iter.next_item().unwrap().key, "y");
        assert!(iter.next_item().is_none());
    }

    #[test]
    fn item_ref_tracks_key_across_reorder() {
        let source = Mutable::shared(list(&["a", "b", "c"]));
        let mut iter = ListIterator::new(source.clone(), KeyBy::Identity);
        let first = iter.next_item().unwrap();
        assert_eq!(first.value.value(), Value::Text("a".into()));
        assert_eq!(first.memo.value(), Value::Number(0.0));

        source.set(list(&["c", "b", "a"]));
        assert_eq!(first.value.value(), Value::Text("a".into()));
        assert_eq!(first.memo.value(), Value::Number(2.0));
    }

    #[test]
    fn non_list_iterates_empty() {
        assert!(keyed_items(&Value::Number(3.0), &KeyBy::Identity).is_empty());
    }
}
