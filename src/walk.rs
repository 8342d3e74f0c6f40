//! Tree traversal and offset queries.
//!
//! `traverse` walks a loaded tree depth first, yielding regions that match
//! a predicate; `at_offset` answers "what type lives at this byte offset?"
//! for inspection tools. Pointer targets and decoded codec children appear
//! in the walk once they have been dereferenced.

use std::rc::Rc;

use crate::region::Region;

/// Predicate over regions. Boxed so composed predicates can be stored in
/// tool configuration.
pub type Predicate = Rc<dyn Fn(&Region) -> bool>;

/// Depth-first iterator over a region tree, parents before children.
pub struct Traverse {
    stack: Vec<Region>,
    pred: Predicate,
}

impl Iterator for Traverse {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        while let Some(node) = self.stack.pop() {
            let mut children = node.children();
            children.reverse();
            self.stack.extend(children);
            if (self.pred)(&node) {
                return Some(node);
            }
        }
        None
    }
}

/// Walks the tree rooted at `root` depth first, yielding every region the
/// predicate accepts.
pub fn traverse(root: &Region, pred: impl Fn(&Region) -> bool + 'static) -> Traverse {
    Traverse {
        stack: vec![root.clone()],
        pred: Rc::new(pred),
    }
}

/// Every region in the tree.
pub fn all(root: &Region) -> Traverse {
    traverse(root, |_| true)
}

/// Regions whose type carries this name.
pub fn named(root: &Region, name: &str) -> Traverse {
    let name = name.to_owned();
    traverse(root, move |r| r.ty().name() == name)
}

/// The deepest region containing the given byte offset, restricted to
/// regions over the same source as `root` (pointer targets in foreign
/// sources and decoded codec children live at unrelated offsets).
pub fn at_offset(root: &Region, offset: u64) -> Option<Region> {
    let source = root.source();
    let mut best: Option<Region> = None;
    for node in all(root) {
        if !Rc::ptr_eq(&node.source(), &source) || !node.contains(offset) {
            continue;
        }
        let better = match &best {
            Some(cur) => node.size() <= cur.size(),
            None => true,
        };
        if better {
            best = Some(node);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::{Field, Ty};
    use pretty_assertions::assert_eq;

    fn tree() -> Region {
        let inner = Ty::record(
            "inner",
            vec![Field::new("x", Ty::u8()), Field::new("y", Ty::u8())],
        )
        .unwrap();
        let outer = Ty::record(
            "outer",
            vec![
                Field::new("head", Ty::u16()),
                Field::new("body", inner),
                Field::new("tail", Ty::u8()),
            ],
        )
        .unwrap();
        outer.parse(vec![0x11, 0x22, 0x33, 0x44, 0x55])
    }

    #[test]
    fn test_traverse_is_depth_first_parents_before_children() {
        let names: Vec<String> = all(&tree()).map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec!["outer", "u16", "inner", "u8", "u8", "u8"]
        );
    }

    #[test]
    fn test_named_filter() {
        let hits: Vec<Region> = named(&tree(), "inner").collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset(), 2);
    }

    #[test]
    fn test_at_offset_finds_the_deepest_region() {
        let root = tree();
        let hit = at_offset(&root, 3).unwrap();
        assert_eq!(hit.name(), "u8");
        assert_eq!(hit.offset(), 3);
        assert!(at_offset(&root, 9).is_none());
    }

    #[test]
    fn test_navigation_soundness() {
        let root = tree();
        for node in all(&root) {
            if node.parent().is_some() {
                assert!(root.contains(node.offset()));
                assert!(node.ancestor_named("outer").is_some());
            }
        }
    }
}
