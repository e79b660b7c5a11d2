//! Edit components and their application to JSON values.
//!
//! ```text
//!   Component { path: ["fields", "title"], edit: Object { insert, delete } }
//!   Component { path: ["tags", 2],         edit: ListInsert { value } }
//! ```
//!
//! Object edits set or remove a key. List edits insert, remove or replace
//! an element at an index. Applying a component returns its
//! *materialised* form: the `delete` side filled with the value actually
//! removed, and, when intermediate objects were missing, the edit lifted
//! to the highest missing ancestor with the nested value folded in.

use crate::error::OtError;
use crate::path::{Path, PathSegment};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    /// Set (`insert`) or remove (`insert: None`) a key. `delete` is the
    /// value the key held before, `None` when it was absent.
    Object {
        insert: Option<Value>,
        delete: Option<Value>,
    },
    ListInsert {
        value: Value,
    },
    ListDelete {
        value: Option<Value>,
    },
    ListReplace {
        insert: Value,
        delete: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Object,
    ListInsert,
    ListDelete,
    ListReplace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub path: Path,
    pub edit: Edit,
}

impl Component {
    pub fn object(path: Path, insert: Option<Value>, delete: Option<Value>) -> Self {
        Self {
            path,
            edit: Edit::Object { insert, delete },
        }
    }

    /// Object edit that sets `path` to `value`.
    pub fn set(path: Path, value: Value) -> Self {
        Self::object(path, Some(value), None)
    }

    /// Object edit that removes the key at `path`.
    pub fn remove(path: Path) -> Self {
        Self::object(path, None, None)
    }

    pub fn list_insert(path: Path, value: Value) -> Self {
        Self {
            path,
            edit: Edit::ListInsert { value },
        }
    }

    pub fn list_delete(path: Path, value: Option<Value>) -> Self {
        Self {
            path,
            edit: Edit::ListDelete { value },
        }
    }

    pub fn list_replace(path: Path, insert: Value, delete: Option<Value>) -> Self {
        Self {
            path,
            edit: Edit::ListReplace { insert, delete },
        }
    }

    pub fn kind(&self) -> EditKind {
        match self.edit {
            Edit::Object { .. } => EditKind::Object,
            Edit::ListInsert { .. } => EditKind::ListInsert,
            Edit::ListDelete { .. } => EditKind::ListDelete,
            Edit::ListReplace { .. } => EditKind::ListReplace,
        }
    }

    pub fn inserted(&self) -> Option<&Value> {
        match &self.edit {
            Edit::Object { insert, .. } => insert.as_ref(),
            Edit::ListInsert { value } => Some(value),
            Edit::ListDelete { .. } => None,
            Edit::ListReplace { insert, .. } => Some(insert),
        }
    }

    pub fn deleted(&self) -> Option<&Value> {
        match &self.edit {
            Edit::Object { delete, .. } => delete.as_ref(),
            Edit::ListInsert { .. } => None,
            Edit::ListDelete { value } => value.as_ref(),
            Edit::ListReplace { delete, .. } => delete.as_ref(),
        }
    }

    pub fn is_list_edit(&self) -> bool {
        self.kind() != EditKind::Object
    }

    /// Inverse component. List removals must carry the removed value.
    pub fn invert(&self) -> Result<Component, OtError> {
        let edit = match &self.edit {
            Edit::Object { insert, delete } => Edit::Object {
                insert: delete.clone(),
                delete: insert.clone(),
            },
            Edit::ListInsert { value } => Edit::ListDelete {
                value: Some(value.clone()),
            },
            Edit::ListDelete { value: Some(value) } => Edit::ListInsert {
                value: value.clone(),
            },
            Edit::ListReplace {
                insert,
                delete: Some(delete),
            } => Edit::ListReplace {
                insert: delete.clone(),
                delete: Some(insert.clone()),
            },
            Edit::ListDelete { value: None } | Edit::ListReplace { delete: None, .. } => {
                return Err(OtError::NotInvertible(
                    "list edit does not record the removed value".into(),
                ))
            }
        };
        Ok(Component {
            path: self.path.clone(),
            edit,
        })
    }

    /// Applies the component to `doc` in place and returns its materialised
    /// form, or `None` when the edit changed nothing.
    pub fn apply(&self, doc: &mut Value) -> Result<Option<Component>, OtError> {
        match &self.edit {
            Edit::Object { insert, .. } => apply_object(doc, &self.path, insert.clone()),
            Edit::ListInsert { value } => {
                let (list, idx) = list_slot(doc, &self.path)?;
                if idx > list.len() {
                    return Err(OtError::incompatible(
                        &self.path,
                        format!("insert index beyond list length {}", list.len()),
                    ));
                }
                list.insert(idx, value.clone());
                Ok(Some(self.clone()))
            }
            Edit::ListDelete { .. } => {
                let (list, idx) = list_slot(doc, &self.path)?;
                if idx >= list.len() {
                    return Err(OtError::incompatible(&self.path, "no list element to remove"));
                }
                let removed = list.remove(idx);
                Ok(Some(Component::list_delete(self.path.clone(), Some(removed))))
            }
            Edit::ListReplace { insert, .. } => {
                let (list, idx) = list_slot(doc, &self.path)?;
                let slot = list
                    .get_mut(idx)
                    .ok_or_else(|| OtError::incompatible(&self.path, "no list element to replace"))?;
                let old = std::mem::replace(slot, insert.clone());
                Ok(Some(Component::list_replace(
                    self.path.clone(),
                    insert.clone(),
                    Some(old),
                )))
            }
        }
    }
}

fn apply_object(
    doc: &mut Value,
    path: &[PathSegment],
    insert: Option<Value>,
) -> Result<Option<Component>, OtError> {
    let Some((last, parent_path)) = path.split_last() else {
        let new_root = insert.clone().unwrap_or(Value::Null);
        let old = std::mem::replace(doc, new_root);
        let delete = (!old.is_null()).then_some(old);
        if insert.is_none() && delete.is_none() {
            return Ok(None);
        }
        return Ok(Some(Component::object(Vec::new(), insert, delete)));
    };

    let PathSegment::Key(key) = last else {
        return Err(OtError::incompatible(path, "object edit must end in a key"));
    };

    if doc.is_null() {
        let Some(value) = insert else {
            return Ok(None);
        };
        *doc = nest(path, value)?;
        return Ok(Some(Component::object(Vec::new(), Some(doc.clone()), None)));
    }

    let mut cursor = doc;
    for (depth, segment) in parent_path.iter().enumerate() {
        cursor = match cursor {
            Value::Object(map) => {
                let PathSegment::Key(k) = segment else {
                    return Err(OtError::incompatible(
                        &path[..=depth],
                        "list index used on an object",
                    ));
                };
                if !map.contains_key(k) {
                    let Some(value) = insert else {
                        return Ok(None);
                    };
                    let nested = nest(&path[depth + 1..], value)?;
                    map.insert(k.clone(), nested.clone());
                    return Ok(Some(Component::object(
                        path[..=depth].to_vec(),
                        Some(nested),
                        None,
                    )));
                }
                map.get_mut(k)
                    .ok_or_else(|| OtError::incompatible(&path[..=depth], "missing key"))?
            }
            Value::Array(list) => {
                let PathSegment::Index(idx) = segment else {
                    return Err(OtError::incompatible(&path[..=depth], "key used on a list"));
                };
                list.get_mut(*idx)
                    .ok_or_else(|| OtError::incompatible(&path[..=depth], "list index out of range"))?
            }
            _ => {
                return Err(OtError::incompatible(
                    &path[..depth],
                    "cannot descend into a scalar",
                ))
            }
        };
    }

    let Value::Object(map) = cursor else {
        return Err(OtError::incompatible(parent_path, "object edit on a non-object"));
    };
    let delete = match &insert {
        Some(value) => map.insert(key.clone(), value.clone()),
        None => map.remove(key),
    };
    if insert.is_none() && delete.is_none() {
        return Ok(None);
    }
    Ok(Some(Component::object(path.to_vec(), insert, delete)))
}

/// Wraps `value` in one object per remaining key.
fn nest(keys: &[PathSegment], value: Value) -> Result<Value, OtError> {
    keys.iter().rev().try_fold(value, |inner, segment| match segment {
        PathSegment::Key(k) => {
            let mut map = Map::new();
            map.insert(k.clone(), inner);
            Ok(Value::Object(map))
        }
        PathSegment::Index(_) => Err(OtError::incompatible(
            keys,
            "cannot create a missing list element",
        )),
    })
}

fn resolve_mut<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, OtError> {
    let mut cursor = doc;
    for (depth, segment) in path.iter().enumerate() {
        cursor = match (cursor, segment) {
            (Value::Object(map), PathSegment::Key(k)) => map
                .get_mut(k)
                .ok_or_else(|| OtError::incompatible(&path[..=depth], "missing key"))?,
            (Value::Array(list), PathSegment::Index(idx)) => list
                .get_mut(*idx)
                .ok_or_else(|| OtError::incompatible(&path[..=depth], "list index out of range"))?,
            _ => {
                return Err(OtError::incompatible(
                    &path[..=depth],
                    "path segment does not match the value type",
                ))
            }
        };
    }
    Ok(cursor)
}

fn list_slot<'a>(
    doc: &'a mut Value,
    path: &[PathSegment],
) -> Result<(&'a mut Vec<Value>, usize), OtError> {
    let Some((PathSegment::Index(idx), parent)) = path.split_last() else {
        return Err(OtError::incompatible(path, "list edit must end in an index"));
    };
    match resolve_mut(doc, parent)? {
        Value::Array(list) => Ok((list, *idx)),
        _ => Err(OtError::incompatible(parent, "list edit on a non-list")),
    }
}
