//! Operational transformation for JSON documents.
//!
//! ```text
//!   client A: op a @ v=5 ─┐
//!                         │  log already holds c5, c6 (from client B)
//!                         ▼
//!           transform(a, [c5, c6]) ──▶ a' @ v=7 ──▶ apply ──▶ commit v8
//! ```
//!
//! Transformation rewrites an incoming operation so it can be applied
//! after concurrent operations the submitter had not seen. For any two
//! concurrent operations `a` and `c` on the same base state:
//!
//! ```text
//!   apply(apply(s, c), transform(a, c)) == apply(apply(s, a), transform(c, a))
//! ```
//!
//! Concurrent object writes to the same path are resolved by source:
//! the operation whose `src` sorts strictly lower wins. The same rule
//! orders two inserts at one list index.

use crate::component::{Component, Edit, EditKind};
use crate::error::OtError;
use crate::operation::{OpKind, Operation, DEFAULT_DOC_TYPE};
use crate::path::{is_strict_prefix, PathSegment};
use serde_json::{Map, Value};

/// Type and content of a document. `doc_type: None` means the document
/// does not exist (never created, or deleted).
#[derive(Debug, Clone, PartialEq)]
pub struct DocState {
    pub doc_type: Option<String>,
    pub data: Value,
}

impl Default for DocState {
    fn default() -> Self {
        Self {
            doc_type: None,
            data: Value::Object(Map::new()),
        }
    }
}

impl DocState {
    /// Rebuilds a state by applying `ops` in order to an empty document.
    pub fn replay<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Result<Self, OtError> {
        let mut state = DocState::default();
        for op in ops {
            OtEngine::apply(&mut state, &op.kind)?;
        }
        Ok(state)
    }
}

/// Stateless OT functions over [`OpKind`] and [`Operation`].
pub struct OtEngine;

impl OtEngine {
    /// Applies `kind` to `state` atomically and returns the materialised
    /// operation kind. On error `state` is left unchanged.
    pub fn apply(state: &mut DocState, kind: &OpKind) -> Result<OpKind, OtError> {
        match kind {
            OpKind::Create { doc_type, data } => {
                if state.doc_type.is_some() {
                    return Err(OtError::DocumentExists);
                }
                state.doc_type = Some(doc_type.clone());
                state.data = data.clone();
                Ok(kind.clone())
            }
            OpKind::Delete => {
                if state.doc_type.is_none() {
                    return Err(OtError::DocumentMissing);
                }
                state.doc_type = None;
                state.data = Value::Null;
                Ok(OpKind::Delete)
            }
            OpKind::Edit { components } => {
                let mut data = state.data.clone();
                let mut applied = Vec::with_capacity(components.len());
                for component in components {
                    if let Some(done) = component.apply(&mut data)? {
                        applied.push(done);
                    }
                }
                state.data = data;
                if state.doc_type.is_none() {
                    state.doc_type = Some(DEFAULT_DOC_TYPE.to_string());
                }
                Ok(OpKind::Edit {
                    components: applied,
                })
            }
        }
    }

    /// Rewrites `op` to apply after every operation in `committed`, which
    /// must be the contiguous log suffix starting at `op.v`.
    pub fn transform(op: &Operation, committed: &[Operation]) -> Result<Operation, OtError> {
        let mut out = op.clone();
        for c in committed {
            out = Self::transform_one(out, c)?;
        }
        out.v = op.v + committed.len() as u64;
        Ok(out)
    }

    fn transform_one(a: Operation, c: &Operation) -> Result<Operation, OtError> {
        let a_wins = a.src < c.src;
        match (&a.kind, &c.kind) {
            (OpKind::Edit { components }, OpKind::Edit { components: theirs }) => {
                let mut mine = components.clone();
                for theirs in theirs {
                    mine = mine
                        .into_iter()
                        .map(|comp| transform_component(comp, theirs, a_wins))
                        .filter_map(Result::transpose)
                        .collect::<Result<Vec<_>, _>>()?;
                }
                Ok(Operation {
                    kind: OpKind::Edit { components: mine },
                    ..a
                })
            }
            (OpKind::Edit { .. }, _) => Err(OtError::incompatible(
                &[],
                "document was created or deleted concurrently",
            )),
            _ => Err(OtError::incompatible(
                &[],
                "create and delete cannot be rebased",
            )),
        }
    }

    /// Folds `second` into `first`: applying the result equals applying
    /// both in order.
    pub fn compose(first: &Operation, second: &Operation) -> Result<Operation, OtError> {
        let kind = match (&first.kind, &second.kind) {
            (OpKind::Edit { components: a }, OpKind::Edit { components: b }) => OpKind::Edit {
                components: compose_components(a.clone(), b),
            },
            (OpKind::Create { doc_type, data }, OpKind::Edit { components }) => {
                let mut data = data.clone();
                for component in components {
                    component.apply(&mut data)?;
                }
                OpKind::Create {
                    doc_type: doc_type.clone(),
                    data,
                }
            }
            (OpKind::Edit { .. }, OpKind::Delete) => OpKind::Delete,
            (a, b) => {
                return Err(OtError::CannotCompose(format!(
                    "{} followed by {}",
                    kind_name(a),
                    kind_name(b)
                )))
            }
        };
        Ok(Operation {
            kind,
            ..first.clone()
        })
    }

    /// Operation that undoes `op`. Requires a materialised operation.
    pub fn invert(op: &Operation) -> Result<Operation, OtError> {
        let kind = match &op.kind {
            OpKind::Edit { components } => OpKind::Edit {
                components: components
                    .iter()
                    .rev()
                    .map(Component::invert)
                    .collect::<Result<_, _>>()?,
            },
            OpKind::Create { .. } => OpKind::Delete,
            OpKind::Delete => {
                return Err(OtError::NotInvertible(
                    "delete does not record the removed document".into(),
                ))
            }
        };
        Ok(Operation {
            kind,
            v: op.v + 1,
            ..op.clone()
        })
    }
}

fn kind_name(kind: &OpKind) -> &'static str {
    match kind {
        OpKind::Create { .. } => "create",
        OpKind::Edit { .. } => "edit",
        OpKind::Delete => "delete",
    }
}

/// Locates the list both components index into. Returns the depth of
/// the index segment, `c`'s index and `a`'s index at that depth.
fn shared_list_index(c: &[PathSegment], a: &[PathSegment]) -> Option<(usize, usize, usize)> {
    let (last, parent) = c.split_last()?;
    let depth = parent.len();
    if a.len() <= depth || a[..depth] != *parent {
        return None;
    }
    Some((depth, last.as_index()?, a[depth].as_index()?))
}

fn with_index(mut comp: Component, depth: usize, index: usize) -> Component {
    comp.path[depth] = PathSegment::Index(index);
    comp
}

fn transform_component(
    a: Component,
    c: &Component,
    a_wins: bool,
) -> Result<Option<Component>, OtError> {
    match c.kind() {
        EditKind::ListInsert => {
            let Some((depth, i, j)) = shared_list_index(&c.path, &a.path) else {
                return Ok(Some(a));
            };
            let same_list_insert = a.kind() == EditKind::ListInsert && a.path.len() == depth + 1;
            if j > i || (j == i && !(same_list_insert && a_wins)) {
                return Ok(Some(with_index(a, depth, j + 1)));
            }
            Ok(Some(a))
        }
        EditKind::ListDelete => {
            let Some((depth, i, j)) = shared_list_index(&c.path, &a.path) else {
                return Ok(Some(a));
            };
            if j > i {
                return Ok(Some(with_index(a, depth, j - 1)));
            }
            if j < i {
                return Ok(Some(a));
            }
            let same_list = a.path.len() == depth + 1;
            match a.kind() {
                EditKind::ListInsert if same_list => Ok(Some(a)),
                EditKind::ListDelete if same_list => Ok(None),
                _ => Err(OtError::incompatible(
                    &a.path,
                    "list element was removed concurrently",
                )),
            }
        }
        EditKind::Object | EditKind::ListReplace => {
            if a.path == c.path {
                if a.kind() == EditKind::ListInsert {
                    return Ok(Some(a));
                }
                if a_wins {
                    return Ok(Some(overwrite(a, c)));
                }
                return Ok(None);
            }
            if is_strict_prefix(&c.path, &a.path) && c.deleted().is_some() {
                return Err(OtError::incompatible(
                    &a.path,
                    "an ancestor was replaced or removed concurrently",
                ));
            }
            Ok(Some(a))
        }
    }
}

/// Rebases a winning same-path write on top of the value `c` left there.
fn overwrite(mut a: Component, c: &Component) -> Component {
    let current = c.inserted().cloned();
    match &mut a.edit {
        Edit::Object { delete, .. } => *delete = current,
        Edit::ListReplace { delete, .. } | Edit::ListDelete { value: delete } => *delete = current,
        Edit::ListInsert { .. } => {}
    }
    a
}

fn compose_components(mut out: Vec<Component>, next: &[Component]) -> Vec<Component> {
    for comp in next {
        if let Some(last) = out.last_mut() {
            if let (
                Edit::Object { insert, .. },
                Edit::Object {
                    insert: next_insert,
                    ..
                },
            ) = (&mut last.edit, &comp.edit)
            {
                // Write then remove composes to a remove, never to nothing.
                if last.path == comp.path {
                    *insert = next_insert.clone();
                    continue;
                }
            }
            if let Edit::Object {
                insert: Some(value),
                ..
            } = &mut last.edit
            {
                if is_strict_prefix(&last.path, &comp.path) {
                    let relative = Component {
                        path: comp.path[last.path.len()..].to_vec(),
                        edit: comp.edit.clone(),
                    };
                    let mut folded = value.clone();
                    if relative.apply(&mut folded).is_ok() {
                        *value = folded;
                        continue;
                    }
                }
            }
        }
        out.push(comp.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    fn state(data: Value) -> DocState {
        DocState {
            doc_type: Some(DEFAULT_DOC_TYPE.into()),
            data,
        }
    }

    fn edit(src: &str, v: u64, components: Vec<Component>) -> Operation {
        Operation::edit(src, 1, v, components)
    }

    fn apply_all(base: &Value, ops: &[&Operation]) -> Value {
        let mut s = state(base.clone());
        for op in ops {
            OtEngine::apply(&mut s, &op.kind).unwrap();
        }
        s.data
    }

    /// Checks the convergence property for a pair of concurrent edits.
    fn converges(base: Value, a: Operation, c: Operation) -> Value {
        let a2 = OtEngine::transform(&a, std::slice::from_ref(&c)).unwrap();
        let c2 = OtEngine::transform(&c, std::slice::from_ref(&a)).unwrap();
        let left = apply_all(&base, &[&c, &a2]);
        let right = apply_all(&base, &[&a, &c2]);
        assert_eq!(left, right);
        left
    }

    #[test]
    fn test_disjoint_fields_both_survive() {
        let out = converges(
            json!({"fields": {}}),
            edit("a", 0, vec![Component::set(path!["fields", "x"], json!(1))]),
            edit("b", 0, vec![Component::set(path!["fields", "y"], json!(2))]),
        );
        assert_eq!(out, json!({"fields": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_same_field_lower_source_wins() {
        let out = converges(
            json!({"f": 0}),
            edit("alice", 0, vec![Component::set(path!["f"], json!("A"))]),
            edit("bob", 0, vec![Component::set(path!["f"], json!("B"))]),
        );
        assert_eq!(out, json!({"f": "A"}));
    }

    #[test]
    fn test_concurrent_inserts_at_same_index() {
        let out = converges(
            json!({"l": ["x"]}),
            edit("a", 0, vec![Component::list_insert(path!["l", 0usize], json!("a"))]),
            edit("b", 0, vec![Component::list_insert(path!["l", 0usize], json!("b"))]),
        );
        assert_eq!(out, json!({"l": ["a", "b", "x"]}));
    }

    #[test]
    fn test_insert_shifts_later_edits() {
        let out = converges(
            json!({"l": [1, 2, 3]}),
            edit("a", 0, vec![Component::list_replace(path!["l", 2usize], json!(30), None)]),
            edit("b", 0, vec![Component::list_insert(path!["l", 0usize], json!(0))]),
        );
        assert_eq!(out, json!({"l": [0, 1, 2, 30]}));
    }

    #[test]
    fn test_concurrent_delete_of_same_element_applies_once() {
        let out = converges(
            json!({"l": [1, 2, 3]}),
            edit("a", 0, vec![Component::list_delete(path!["l", 1usize], None)]),
            edit("b", 0, vec![Component::list_delete(path!["l", 1usize], None)]),
        );
        assert_eq!(out, json!({"l": [1, 3]}));
    }

    #[test]
    fn test_delete_shifts_later_indices_down() {
        let out = converges(
            json!({"l": ["a", "b", "c"]}),
            edit("a", 0, vec![Component::list_replace(path!["l", 2usize], json!("C"), None)]),
            edit("b", 0, vec![Component::list_delete(path!["l", 0usize], None)]),
        );
        assert_eq!(out, json!({"l": ["b", "C"]}));
    }

    #[test]
    fn test_edit_under_removed_element_is_incompatible() {
        let a = edit("a", 0, vec![Component::set(path!["l", 0usize, "x"], json!(1))]);
        let mut s = state(json!({"l": [{"x": 0}]}));
        let c = Operation {
            kind: OtEngine::apply(
                &mut s,
                &OpKind::Edit {
                    components: vec![Component::list_delete(path!["l", 0usize], None)],
                },
            )
            .unwrap(),
            ..edit("b", 0, vec![])
        };
        let err = OtEngine::transform(&a, &[c]).unwrap_err();
        assert!(matches!(err, OtError::IncompatibleOperation { .. }));
    }

    #[test]
    fn test_edit_under_replaced_ancestor_is_incompatible() {
        let c = edit(
            "b",
            0,
            vec![Component::object(path!["f"], Some(json!(5)), Some(json!({"x": 1})))],
        );
        let a = edit("a", 0, vec![Component::set(path!["f", "x"], json!(2))]);
        assert!(OtEngine::transform(&a, &[c]).is_err());
    }

    #[test]
    fn test_edit_under_newly_created_ancestor_proceeds() {
        let c = edit("b", 0, vec![Component::set(path!["f"], json!({"y": 1}))]);
        let a = edit("a", 0, vec![Component::set(path!["f", "x"], json!(2))]);
        let a2 = OtEngine::transform(&a, &[c]).unwrap();
        assert_eq!(a2.components().len(), 1);
        assert_eq!(a2.v, 1);
    }

    #[test]
    fn test_edit_against_create_or_delete_is_incompatible() {
        let a = edit("a", 0, vec![Component::set(path!["x"], json!(1))]);
        let c = Operation::delete("b", 1, 0);
        assert!(OtEngine::transform(&a, &[c]).is_err());
    }

    #[test]
    fn test_transform_against_multiple_ops() {
        let base = json!({"l": []});
        let c1 = edit("b", 0, vec![Component::list_insert(path!["l", 0usize], json!("b1"))]);
        let c2 = edit("b", 1, vec![Component::list_insert(path!["l", 1usize], json!("b2"))]);
        let a = edit("c", 0, vec![Component::list_insert(path!["l", 0usize], json!("c"))]);
        let a2 = OtEngine::transform(&a, &[c1.clone(), c2.clone()]).unwrap();
        assert_eq!(a2.v, 2);
        let out = apply_all(&base, &[&c1, &c2, &a2]);
        assert_eq!(out, json!({"l": ["b1", "b2", "c"]}));
    }

    #[test]
    fn test_apply_is_atomic() {
        let mut s = state(json!({"a": 1}));
        let bad = OpKind::Edit {
            components: vec![
                Component::set(path!["b"], json!(2)),
                Component::set(path!["a", "x"], json!(3)),
            ],
        };
        assert!(OtEngine::apply(&mut s, &bad).is_err());
        assert_eq!(s.data, json!({"a": 1}));
    }

    #[test]
    fn test_create_and_delete_lifecycle() {
        let mut s = DocState::default();
        OtEngine::apply(
            &mut s,
            &OpKind::Create {
                doc_type: "json0".into(),
                data: json!({"n": 1}),
            },
        )
        .unwrap();
        assert_eq!(
            OtEngine::apply(
                &mut s,
                &OpKind::Create {
                    doc_type: "json0".into(),
                    data: json!({})
                }
            ),
            Err(OtError::DocumentExists)
        );
        OtEngine::apply(&mut s, &OpKind::Delete).unwrap();
        assert_eq!(s.doc_type, None);
        assert_eq!(
            OtEngine::apply(&mut s, &OpKind::Delete),
            Err(OtError::DocumentMissing)
        );
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let base = json!({"a": 1, "l": [1]});
        let first = edit(
            "s",
            0,
            vec![
                Component::set(path!["a"], json!(2)),
                Component::set(path!["n"], json!({"x": 1})),
            ],
        );
        let second = edit(
            "s",
            1,
            vec![
                Component::set(path!["n", "y"], json!(2)),
                Component::list_insert(path!["l", 1usize], json!(2)),
            ],
        );
        let composed = OtEngine::compose(&first, &second).unwrap();
        assert_eq!(composed.components().len(), 3);
        assert_eq!(
            apply_all(&base, &[&composed]),
            apply_all(&base, &[&first, &second])
        );
    }

    #[test]
    fn test_compose_merges_adjacent_writes_to_one_key() {
        let first = edit("s", 0, vec![Component::set(path!["a"], json!(2))]);
        let second = edit("s", 1, vec![Component::set(path!["a"], json!(3))]);
        let composed = OtEngine::compose(&first, &second).unwrap();
        assert_eq!(composed.components(), &[Component::set(path!["a"], json!(3))]);

    }

    #[test]
    fn test_compose_set_then_remove_removes_existing_key() {
        let first = edit("s", 0, vec![Component::set(path!["tmp"], json!(1))]);
        let second = edit("s", 1, vec![Component::remove(path!["tmp"])]);
        let composed = OtEngine::compose(&first, &second).unwrap();
        assert_eq!(composed.components(), &[Component::remove(path!["tmp"])]);

        for base in [json!({"tmp": 0, "keep": 1}), json!({"keep": 1})] {
            assert_eq!(
                apply_all(&base, &[&composed]),
                apply_all(&base, &[&first, &second])
            );
        }
        assert_eq!(apply_all(&json!({"tmp": 0}), &[&composed]), json!({}));
    }

    #[test]
    fn test_compose_create_then_edit_yields_create() {
        let create = Operation::create("s", 1, "json0", json!({"a": 1}));
        let e = edit("s", 1, vec![Component::set(path!["b"], json!(2))]);
        let out = OtEngine::compose(&create, &e).unwrap();
        assert_eq!(
            out.kind,
            OpKind::Create {
                doc_type: "json0".into(),
                data: json!({"a": 1, "b": 2})
            }
        );
        assert!(OtEngine::compose(&Operation::delete("s", 1, 0), &create).is_err());
    }

    #[test]
    fn test_invert_undoes_materialised_edit() {
        let mut s = state(json!({"a": 1, "l": ["x", "y"]}));
        let materialised = OtEngine::apply(
            &mut s,
            &OpKind::Edit {
                components: vec![
                    Component::set(path!["a"], json!(2)),
                    Component::list_delete(path!["l", 0usize], None),
                    Component::set(path!["new", "deep"], json!(true)),
                ],
            },
        )
        .unwrap();
        let op = Operation {
            kind: materialised,
            ..edit("s", 0, vec![])
        };
        let inverse = OtEngine::invert(&op).unwrap();
        OtEngine::apply(&mut s, &inverse.kind).unwrap();
        assert_eq!(s.data, json!({"a": 1, "l": ["x", "y"]}));
    }

    #[test]
    fn test_replay_reproduces_state() {
        let ops = vec![
            Operation::create("s", 1, "json0", json!({"l": []})),
            edit("s", 1, vec![Component::list_insert(path!["l", 0usize], json!(1))]),
        ];
        let s = DocState::replay(&ops).unwrap();
        assert_eq!(s.data, json!({"l": [1]}));
        assert_eq!(s.doc_type.as_deref(), Some("json0"));
    }
}
