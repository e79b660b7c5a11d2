//! JSON wire protocol.
//!
//! Every WebSocket text frame carries one JSON object with a `type` tag:
//!
//! ```text
//!   client ──▶ server                     server ──▶ client
//!   ping        {timestamp}                pong         {timestamp}
//!   subscribe   {collection, document?}    subscribed   {data: {channel, status}}
//!   unsubscribe {collection, document?}    unsubscribed {data: {channel, status}}
//!   query       {collection, query}        queryResult  {data: [snapshot]}
//!   get         {collection, id}           snapshot     {data: snapshot}
//!   submit      {collection, id, op}       ack          {data: {v, src, seq}}
//!   presence    {collection, id, data}     op / presence / error events
//! ```
//!
//! Component edits arrive in several historical shapes and are
//! normalised here, before they reach the OT engine:
//!
//! ```text
//!   {p, t, o}     typed set          ──▶ Object / ListReplace
//!   {p, oi, od}   object insert/del  ──▶ Object, or List* when p ends in an index
//!   {p, li, ld}   list insert/del    ──▶ ListInsert / ListDelete / ListReplace
//! ```
//!
//! `null` for `oi`, `od` or `ld` means the side is absent.

use crate::error::{MalformedMessage, SyncError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use weft_core::{
    CommitRecord, Component, Edit, OpKind, Operation, PathSegment, Query, Snapshot,
    DEFAULT_DOC_TYPE,
};

/// Type tags accepted in `{p, t, o}` components.
pub const VALUE_TYPES: [&str; 6] = ["string", "number", "boolean", "object", "array", "null"];

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping {
        timestamp: Value,
    },
    Subscribe {
        collection: String,
        document: Option<String>,
        /// Replay committed ops after this version once subscribed.
        from_version: Option<u64>,
    },
    Unsubscribe {
        collection: Option<String>,
        document: Option<String>,
        subscription: Option<u64>,
    },
    Query {
        collection: String,
        query: Query,
    },
    Get {
        collection: String,
        document: String,
    },
    Submit {
        collection: String,
        document: String,
        op: SubmitOp,
    },
    Presence {
        collection: String,
        document: String,
        status: Option<String>,
        data: Value,
    },
}

/// The operation part of a submit, before the session fills defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOp {
    pub src: Option<String>,
    pub seq: Option<u64>,
    /// `None` applies the operation at whatever version is current.
    pub v: Option<u64>,
    pub kind: OpKind,
}

impl SubmitOp {
    pub fn into_operation(self, default_src: &str, default_seq: u64) -> Operation {
        Operation {
            src: self.src.unwrap_or_else(|| default_src.to_string()),
            seq: self.seq.unwrap_or(default_seq),
            v: self.v.unwrap_or(0),
            kind: self.kind,
        }
    }
}

type Object = Map<String, Value>;

/// Decodes one inbound text frame.
pub fn decode_request(text: &str) -> Result<Request, MalformedMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| MalformedMessage::new("$", format!("invalid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| MalformedMessage::new("$", "frame must be a JSON object"))?;

    match required_str(obj, "type")? {
        "ping" => Ok(Request::Ping {
            timestamp: obj
                .get("timestamp")
                .cloned()
                .ok_or_else(|| MalformedMessage::missing("timestamp"))?,
        }),
        "subscribe" => {
            let (collection, document) = target(obj)?;
            Ok(Request::Subscribe {
                collection,
                document,
                from_version: optional_u64(obj, "v")?,
            })
        }
        "unsubscribe" => {
            let subscription = optional_u64(obj, "subscription")?;
            let (collection, document) = match target(obj) {
                Ok((c, d)) => (Some(c), d),
                Err(_) if subscription.is_some() => (None, None),
                Err(e) => return Err(e),
            };
            Ok(Request::Unsubscribe {
                collection,
                document,
                subscription,
            })
        }
        "query" => {
            let collection = required_str(obj, "collection")?.to_string();
            let raw = obj
                .get("query")
                .ok_or_else(|| MalformedMessage::missing("query"))?;
            if !raw.is_object() {
                return Err(MalformedMessage::new("query", "expected an object"));
            }
            let query = serde_json::from_value(raw.clone())
                .map_err(|e| MalformedMessage::new("query", e.to_string()))?;
            Ok(Request::Query { collection, query })
        }
        "get" => Ok(Request::Get {
            collection: required_str(obj, "collection")?.to_string(),
            document: document_id(obj)?,
        }),
        "submit" => {
            let collection = required_str(obj, "collection")?.to_string();
            let document = document_id(obj)?;
            let op = match (obj.get("op"), obj.get("operation")) {
                (Some(op), _) => decode_op(op, "op")?,
                (None, Some(components)) => SubmitOp {
                    src: None,
                    seq: None,
                    v: None,
                    kind: OpKind::Edit {
                        components: decode_components(components, "operation")?,
                    },
                },
                (None, None) => return Err(MalformedMessage::missing("op")),
            };
            Ok(Request::Submit {
                collection,
                document,
                op,
            })
        }
        "presence" => {
            let collection = required_str(obj, "collection")?.to_string();
            let document = document_id(obj)?;
            Ok(Request::Presence {
                collection,
                document,
                status: optional_str(obj, "status")?.map(str::to_string),
                data: obj.get("data").cloned().unwrap_or(Value::Null),
            })
        }
        other => Err(MalformedMessage::new(
            "type",
            format!("unknown message type `{other}`"),
        )),
    }
}

fn required_str<'a>(obj: &'a Object, field: &str) -> Result<&'a str, MalformedMessage> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(MalformedMessage::new(field, "must not be empty")),
        None | Some(Value::Null) => Err(MalformedMessage::missing(field)),
        Some(_) => Err(MalformedMessage::new(field, "expected a string")),
    }
}

fn optional_str<'a>(obj: &'a Object, field: &str) -> Result<Option<&'a str>, MalformedMessage> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(MalformedMessage::new(field, "expected a string")),
    }
}

fn optional_u64(obj: &Object, field: &str) -> Result<Option<u64>, MalformedMessage> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| MalformedMessage::new(field, "expected a non-negative integer")),
    }
}

/// Document id from `document`, falling back to `id`.
fn document_id(obj: &Object) -> Result<String, MalformedMessage> {
    match optional_str(obj, "document")? {
        Some(doc) if !doc.is_empty() => Ok(doc.to_string()),
        _ => Ok(required_str(obj, "id")?.to_string()),
    }
}

/// `(collection, document?)` from explicit fields or a `channel` string
/// of the form `collection` or `collection.document`.
fn target(obj: &Object) -> Result<(String, Option<String>), MalformedMessage> {
    if !obj.contains_key("collection") {
        if let Some(channel) = optional_str(obj, "channel")? {
            return parse_channel(channel).ok_or_else(|| MalformedMessage::new("channel", "empty channel"));
        }
    }
    let collection = required_str(obj, "collection")?.to_string();
    let document = match optional_str(obj, "document")? {
        Some(doc) => Some(doc.to_string()),
        None => optional_str(obj, "id")?.map(str::to_string),
    };
    Ok((collection, document.filter(|d| !d.is_empty())))
}

/// Splits `collection.document` at the first dot.
pub fn parse_channel(channel: &str) -> Option<(String, Option<String>)> {
    if channel.is_empty() {
        return None;
    }
    Some(match channel.split_once('.') {
        Some((coll, doc)) if !doc.is_empty() => (coll.to_string(), Some(doc.to_string())),
        Some((coll, _)) => (coll.to_string(), None),
        None => (channel.to_string(), None),
    })
}

/// Channel name for a subscription target.
pub fn channel_name(collection: &str, document: Option<&str>) -> String {
    match document {
        Some(doc) => format!("{collection}.{doc}"),
        None => collection.to_string(),
    }
}

fn decode_op(value: &Value, field: &str) -> Result<SubmitOp, MalformedMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| MalformedMessage::new(field, "expected an object"))?;
    let src = optional_str(obj, "src")
        .map_err(|e| MalformedMessage::new(format!("{field}.src"), e.message))?
        .map(str::to_string);
    let seq = optional_u64(obj, "seq")
        .map_err(|e| MalformedMessage::new(format!("{field}.seq"), e.message))?;
    let v = optional_u64(obj, "v")
        .map_err(|e| MalformedMessage::new(format!("{field}.v"), e.message))?;

    let kind = if let Some(create) = obj.get("create").filter(|c| !c.is_null()) {
        let create = create
            .as_object()
            .ok_or_else(|| MalformedMessage::new(format!("{field}.create"), "expected an object"))?;
        let doc_type = optional_str(create, "type")
            .map_err(|e| MalformedMessage::new(format!("{field}.create.type"), e.message))?
            .unwrap_or(DEFAULT_DOC_TYPE)
            .to_string();
        let data = create
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        OpKind::Create { doc_type, data }
    } else if obj.get("del").and_then(Value::as_bool).unwrap_or(false) {
        OpKind::Delete
    } else if let Some(components) = obj.get("op") {
        OpKind::Edit {
            components: decode_components(components, &format!("{field}.op"))?,
        }
    } else {
        return Err(MalformedMessage::new(
            field,
            "expected one of `op`, `create` or `del`",
        ));
    };
    Ok(SubmitOp { src, seq, v, kind })
}

fn decode_components(value: &Value, field: &str) -> Result<Vec<Component>, MalformedMessage> {
    let list = value
        .as_array()
        .ok_or_else(|| MalformedMessage::new(field, "expected an array of components"))?;
    list.iter()
        .enumerate()
        .map(|(i, c)| decode_component(c, &format!("{field}[{i}]")))
        .collect()
}

fn decode_path(value: Option<&Value>, field: &str) -> Result<Vec<PathSegment>, MalformedMessage> {
    let field = format!("{field}.p");
    let segments = value
        .ok_or_else(|| MalformedMessage::missing(field.as_str()))?
        .as_array()
        .ok_or_else(|| MalformedMessage::new(field.as_str(), "path must be an array"))?;
    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| match seg {
            Value::String(key) => Ok(PathSegment::Key(key.clone())),
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(PathSegment::Index)
                .ok_or_else(|| {
                    MalformedMessage::new(format!("{field}[{i}]"), "index must be a non-negative integer")
                }),
            _ => Err(MalformedMessage::new(
                format!("{field}[{i}]"),
                "segment must be a string or an index",
            )),
        })
        .collect()
}

/// `Some(value)` unless the key is absent or `null`.
fn side(obj: &Object, key: &str) -> Option<Value> {
    obj.get(key).filter(|v| !v.is_null()).cloned()
}

/// `Some(null)` when the component carries `t: "null"`, the wire form of
/// writing an explicit null next to an `od`.
fn null_tag(obj: &Object) -> Option<Value> {
    (obj.get("t").and_then(Value::as_str) == Some("null")).then_some(Value::Null)
}

fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::Null => "null",
    }
}

/// Normalises one wire component.
pub fn decode_component(value: &Value, field: &str) -> Result<Component, MalformedMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| MalformedMessage::new(field, "component must be an object"))?;
    let path = decode_path(obj.get("p"), field)?;
    let ends_in_index = matches!(path.last(), Some(PathSegment::Index(_)));

    if obj.contains_key("li") || obj.contains_key("ld") {
        if !ends_in_index {
            return Err(MalformedMessage::new(
                format!("{field}.p"),
                "list edit path must end in an index",
            ));
        }
        let edit = match obj.get("li").cloned() {
            Some(insert) if obj.contains_key("ld") => Edit::ListReplace {
                insert,
                delete: side(obj, "ld"),
            },
            Some(value) => Edit::ListInsert { value },
            None => Edit::ListDelete {
                value: side(obj, "ld"),
            },
        };
        return Ok(Component { path, edit });
    }

    if obj.contains_key("oi") || obj.contains_key("od") {
        let insert = side(obj, "oi").or_else(|| null_tag(obj));
        let delete = side(obj, "od");
        let edit = if ends_in_index {
            match (insert, delete) {
                (Some(insert), Some(delete)) => Edit::ListReplace {
                    insert,
                    delete: Some(delete),
                },
                (Some(value), None) => Edit::ListInsert { value },
                (None, delete) => Edit::ListDelete { value: delete },
            }
        } else {
            Edit::Object { insert, delete }
        };
        return Ok(Component { path, edit });
    }

    if let Some(tag) = obj.get("t") {
        let tag = tag
            .as_str()
            .filter(|t| VALUE_TYPES.contains(t))
            .ok_or_else(|| {
                MalformedMessage::new(
                    format!("{field}.t"),
                    format!("type tag must be one of {}", VALUE_TYPES.join(", ")),
                )
            })?;
        let value = match obj.get("o") {
            Some(Value::Null) | None if tag == "null" => Some(Value::Null),
            Some(Value::Null) | None => None,
            Some(v) if type_tag(v) == tag => Some(v.clone()),
            Some(v) => {
                return Err(MalformedMessage::new(
                    format!("{field}.o"),
                    format!("value is {} but t is {tag}", type_tag(v)),
                ))
            }
        };
        let edit = match (ends_in_index, value) {
            (true, Some(insert)) => Edit::ListReplace {
                insert,
                delete: None,
            },
            (true, None) => Edit::ListDelete { value: None },
            (false, insert) => Edit::Object {
                insert,
                delete: None,
            },
        };
        return Ok(Component { path, edit });
    }

    Err(MalformedMessage::new(
        field,
        "component needs one of `oi`/`od`, `li`/`ld` or `t`/`o`",
    ))
}

/// Canonical wire form of a component: `{p, oi?, od?}` (`t: "null"` in
/// place of `oi` for a null write) or `{p, li?, ld?}`.
pub fn encode_component(component: &Component) -> Value {
    let mut obj = Map::new();
    obj.insert("p".into(), json!(component.path));
    let mut put = |key: &str, value: &Option<Value>| {
        if let Some(v) = value {
            obj.insert(key.to_string(), v.clone());
        }
    };
    match &component.edit {
        Edit::Object { insert, delete } => {
            // Explicit null travels as `t: "null"`; a removal always has `od`.
            match insert {
                Some(Value::Null) => put("t", &Some(json!("null"))),
                other => put("oi", other),
            }
            match delete {
                None if insert.is_none() => put("od", &Some(Value::Null)),
                other => put("od", other),
            }
        }
        Edit::ListInsert { value } => put("li", &Some(value.clone())),
        Edit::ListDelete { value } => put("ld", &value.clone().or(Some(Value::Null))),
        Edit::ListReplace { insert, delete } => {
            put("li", &Some(insert.clone()));
            put("ld", &delete.clone().or(Some(Value::Null)));
        }
    }
    Value::Object(obj)
}

/// Canonical wire form of an operation.
pub fn encode_operation(op: &Operation) -> Value {
    let mut obj = json!({ "src": op.src, "seq": op.seq, "v": op.v });
    if let Value::Object(map) = &mut obj {
        match &op.kind {
            OpKind::Edit { components } => {
                map.insert(
                    "op".into(),
                    Value::Array(components.iter().map(encode_component).collect()),
                );
            }
            OpKind::Create { doc_type, data } => {
                map.insert("create".into(), json!({ "type": doc_type, "data": data }));
            }
            OpKind::Delete => {
                map.insert("del".into(), Value::Bool(true));
            }
        }
    }
    obj
}

/// Decodes an operation in canonical wire form, as sent in `op` events.
pub fn decode_operation(value: &Value) -> Result<Operation, MalformedMessage> {
    Ok(decode_op(value, "op")?.into_operation("", 0))
}

/// Error payload of an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops: Option<Vec<Value>>,
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Frame {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            collection: None,
            document: None,
            data: None,
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn at(mut self, collection: &str, document: Option<&str>) -> Self {
        self.collection = Some(collection.to_string());
        self.document = document.map(str::to_string);
        self
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn pong(timestamp: Value) -> Self {
        let mut frame = Self::new("pong");
        frame.data = Some(json!({ "timestamp": timestamp }));
        frame
    }

    pub fn subscribed(collection: &str, document: Option<&str>, subscription: u64) -> Self {
        Self::new("subscribed").at(collection, document).with_data(json!({
            "channel": channel_name(collection, document),
            "status": "subscribed",
            "subscription": subscription,
        }))
    }

    pub fn unsubscribed(channel: &str, removed: usize) -> Self {
        Self::new("unsubscribed").with_data(json!({
            "channel": channel,
            "status": "unsubscribed",
            "removed": removed,
        }))
    }

    pub fn query_result(collection: &str, snapshots: &[Snapshot]) -> Self {
        Self::new("queryResult")
            .at(collection, None)
            .with_data(json!(snapshots))
    }

    pub fn snapshot(collection: &str, snapshot: &Snapshot) -> Self {
        Self::new("snapshot")
            .at(collection, Some(&snapshot.id))
            .with_data(json!(snapshot))
    }

    /// Acknowledges a committed submit.
    pub fn ack(record: &CommitRecord) -> Self {
        Self::new("ack")
            .at(&record.collection, Some(&record.document))
            .with_data(json!({
                "v": record.version,
                "src": record.operation.src,
                "seq": record.operation.seq,
            }))
    }

    /// `op` event carrying an arbitrary payload.
    pub fn op(collection: &str, document: Option<&str>, data: Value) -> Self {
        Self::new("op").at(collection, document).with_data(data)
    }

    /// Presence event; user-targeted presence has no collection.
    pub fn presence(collection: Option<&str>, document: Option<&str>, data: Value) -> Self {
        let mut frame = Self::new("presence").with_data(data);
        frame.collection = collection.map(str::to_string);
        frame.document = document.map(str::to_string);
        frame
    }

    pub fn system(message: &str, level: &str) -> Self {
        let frame = Self::new("op");
        let time = frame.timestamp;
        frame.with_data(json!({
            "type": "system",
            "message": message,
            "level": level,
            "time": time,
        }))
    }

    pub fn error(err: &SyncError) -> Self {
        let mut body = ErrorBody {
            code: err.code(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            field: None,
            current_version: None,
            ops: None,
        };
        match err {
            SyncError::MalformedMessage(m) => body.field = Some(m.field.clone()),
            SyncError::VersionConflict {
                current_version,
                missing,
            } => {
                body.current_version = Some(*current_version);
                body.ops = Some(missing.iter().map(encode_operation).collect());
            }
            _ => {}
        }
        let mut frame = Self::new("error");
        frame.error = Some(body);
        frame
    }

    /// Error frame scoped to one document.
    pub fn document_error(collection: &str, document: &str, err: &SyncError) -> Self {
        Self::error(err).at(collection, Some(document))
    }

    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::path;

    fn submit_components(frame: Value) -> Vec<Component> {
        match decode_request(&frame.to_string()).unwrap() {
            Request::Submit { op, .. } => match op.kind {
                OpKind::Edit { components } => components,
                other => panic!("not an edit: {other:?}"),
            },
            other => panic!("not a submit: {other:?}"),
        }
    }

    #[test]
    fn test_ping_requires_timestamp() {
        assert_eq!(
            decode_request(r#"{"type":"ping","timestamp":17}"#).unwrap(),
            Request::Ping {
                timestamp: json!(17)
            }
        );
        let err = decode_request(r#"{"type":"ping"}"#).unwrap_err();
        assert_eq!(err.field, "timestamp");
    }

    #[test]
    fn test_three_component_shapes_normalise_alike() {
        let typed = submit_components(json!({
            "type": "submit", "collection": "c", "id": "d",
            "op": {"src": "A", "seq": 1, "v": 0, "op": [{"p": ["name"], "t": "string", "o": "Bob"}]}
        }));
        let ot = submit_components(json!({
            "type": "submit", "collection": "c", "id": "d",
            "op": {"src": "A", "seq": 1, "v": 0, "op": [{"p": ["name"], "oi": "Bob", "od": null}]}
        }));
        assert_eq!(typed, ot);
        assert_eq!(typed[0], Component::set(path!["name"], json!("Bob")));
    }

    #[test]
    fn test_numeric_tail_becomes_list_edit() {
        let comps = submit_components(json!({
            "type": "submit", "collection": "c", "id": "d",
            "op": {"v": 0, "op": [
                {"p": ["tags", 0], "oi": "x"},
                {"p": ["tags", 1], "od": "y"},
                {"p": ["tags", 2], "li": "a", "ld": "b"},
                {"p": ["tags", 3], "ld": "z"}
            ]}
        }));
        assert_eq!(comps[0].edit, Edit::ListInsert { value: json!("x") });
        assert_eq!(comps[1].edit, Edit::ListDelete { value: Some(json!("y")) });
        assert_eq!(
            comps[2].edit,
            Edit::ListReplace {
                insert: json!("a"),
                delete: Some(json!("b"))
            }
        );
        assert_eq!(comps[3].edit, Edit::ListDelete { value: Some(json!("z")) });
    }

    #[test]
    fn test_legacy_submit_is_unversioned() {
        let req = decode_request(
            &json!({
                "type": "submit", "collection": "record_t1", "document": "rec1",
                "operation": [{"p": ["fields", "f1"], "t": "number", "o": 3}]
            })
            .to_string(),
        )
        .unwrap();
        let Request::Submit { document, op, .. } = req else {
            panic!("expected submit");
        };
        assert_eq!(document, "rec1");
        assert_eq!(op.v, None);
        let op = op.into_operation("session-1", 7);
        assert_eq!(op.src, "session-1");
        assert_eq!(op.seq, 7);
    }

    #[test]
    fn test_malformed_fields_are_named() {
        let cases = [
            (json!({"type": "submit", "id": "d", "op": {"op": []}}), "collection"),
            (json!({"type": "submit", "collection": "c", "op": {"op": []}}), "id"),
            (
                json!({"type": "submit", "collection": "c", "id": "d", "op": {"op": [{"p": "a.b", "oi": 1}]}}),
                "op.op[0].p",
            ),
            (
                json!({"type": "submit", "collection": "c", "id": "d", "op": {"op": [{"p": ["a", -1], "oi": 1}]}}),
                "op.op[0].p[1]",
            ),
            (
                json!({"type": "submit", "collection": "c", "id": "d", "op": {"op": [{"p": ["a"], "t": "text", "o": 1}]}}),
                "op.op[0].t",
            ),
            (
                json!({"type": "submit", "collection": "c", "id": "d", "op": {"op": [{"p": ["a"], "t": "number", "o": "1"}]}}),
                "op.op[0].o",
            ),
            (
                json!({"type": "submit", "collection": "c", "id": "d", "op": {"v": "0", "op": []}}),
                "op.v",
            ),
            (json!({"type": "query", "collection": "c", "query": 3}), "query"),
            (json!({"type": "teleport"}), "type"),
            (json!([1, 2]), "$"),
        ];
        for (frame, field) in cases {
            let err = decode_request(&frame.to_string()).unwrap_err();
            assert_eq!(err.field, field, "frame {frame}");
        }
    }

    #[test]
    fn test_create_and_delete_envelopes() {
        let req = decode_request(
            r#"{"type":"submit","collection":"c","id":"d","op":{"v":0,"create":{"type":"json0","data":{"a":1}}}}"#,
        )
        .unwrap();
        let Request::Submit { op, .. } = req else {
            panic!("expected submit");
        };
        assert_eq!(
            op.kind,
            OpKind::Create {
                doc_type: "json0".into(),
                data: json!({"a": 1})
            }
        );

        let req = decode_request(r#"{"type":"submit","collection":"c","id":"d","op":{"v":3,"del":true}}"#)
            .unwrap();
        let Request::Submit { op, .. } = req else {
            panic!("expected submit");
        };
        assert_eq!(op.kind, OpKind::Delete);
        assert_eq!(op.v, Some(3));
    }

    #[test]
    fn test_subscribe_targets() {
        assert_eq!(
            decode_request(r#"{"type":"subscribe","collection":"record_t1"}"#).unwrap(),
            Request::Subscribe {
                collection: "record_t1".into(),
                document: None,
                from_version: None
            }
        );
        assert_eq!(
            decode_request(r#"{"type":"subscribe","channel":"record_t1.rec1","v":4}"#).unwrap(),
            Request::Subscribe {
                collection: "record_t1".into(),
                document: Some("rec1".into()),
                from_version: Some(4)
            }
        );
        assert_eq!(
            decode_request(r#"{"type":"unsubscribe","subscription":9}"#).unwrap(),
            Request::Unsubscribe {
                collection: None,
                document: None,
                subscription: Some(9)
            }
        );
    }

    #[test]
    fn test_operation_wire_roundtrip() {
        let op = Operation::edit(
            "A",
            2,
            5,
            vec![
                Component::object(path!["name"], Some(json!("Bob")), Some(json!("Al"))),
                Component::list_delete(path!["tags", 0usize], Some(json!("x"))),
            ],
        );
        let wire = encode_operation(&op);
        assert_eq!(wire["op"][0], json!({"p": ["name"], "oi": "Bob", "od": "Al"}));
        assert_eq!(wire["op"][1], json!({"p": ["tags", 0], "ld": "x"}));
        assert_eq!(decode_operation(&wire).unwrap(), op);
    }

    #[test]
    fn test_removal_and_null_write_survive_the_wire() {
        let op = Operation::edit(
            "A",
            1,
            3,
            vec![
                Component::remove(path!["tmp"]),
                Component::set(path!["note"], Value::Null),
                Component::object(path!["old"], Some(Value::Null), Some(json!(4))),
            ],
        );
        let wire = encode_operation(&op);
        assert_eq!(wire["op"][0], json!({"p": ["tmp"], "od": null}));
        assert_eq!(wire["op"][1], json!({"p": ["note"], "t": "null"}));
        assert_eq!(wire["op"][2], json!({"p": ["old"], "t": "null", "od": 4}));
        assert_eq!(decode_operation(&wire).unwrap(), op);

        // A relayed removal still removes the key on the receiving side.
        let mut doc = weft_core::DocState::default();
        weft_core::OtEngine::apply(
            &mut doc,
            &OpKind::Create {
                doc_type: "json0".into(),
                data: json!({"tmp": 1, "note": "x", "old": 4}),
            },
        )
        .unwrap();
        let relayed = decode_operation(&wire).unwrap();
        weft_core::OtEngine::apply(&mut doc, &relayed.kind).unwrap();
        assert_eq!(doc.data, json!({"note": null, "old": null}));
    }

    #[test]
    fn test_error_frame_carries_conflict_details() {
        let err = SyncError::VersionConflict {
            current_version: 1,
            missing: vec![Operation::edit("A", 1, 0, vec![])],
        };
        let frame = Frame::document_error("c", "d", &err);
        let body = frame.error.as_ref().unwrap();
        assert_eq!(body.code, 409);
        assert_eq!(body.current_version, Some(1));
        assert_eq!(body.ops.as_ref().unwrap().len(), 1);

        let text = frame.encode().unwrap();
        let back = Frame::decode(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_channel_parsing() {
        assert_eq!(parse_channel("coll"), Some(("coll".into(), None)));
        assert_eq!(
            parse_channel("coll.doc.x"),
            Some(("coll".into(), Some("doc.x".into())))
        );
        assert_eq!(parse_channel(""), None);
        assert_eq!(channel_name("c", Some("d")), "c.d");
    }
}
