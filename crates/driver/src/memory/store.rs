//! Document storage and query evaluation for the simulated deployment.
//!
//! Supports the subset of the query language the runner's suites use:
//! equality and comparison operators, `$in`/`$nin`/`$exists`/`$not`/`$size`,
//! `$and`/`$or`/`$nor`, the common update operators, inclusion/exclusion
//! projections, and a handful of aggregation stages.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde_json::{json, Map, Value};

pub(crate) use crate::error::NAMESPACE_NOT_FOUND;
use crate::error::{DriverError, DriverResult};
use crate::options::UpdateModifications;
use crate::{Document, Namespace};

pub(crate) const BAD_VALUE: i32 = 2;
pub(crate) const FAILED_TO_PARSE: i32 = 9;
pub(crate) const INDEX_NOT_FOUND: i32 = 27;
pub(crate) const NAMESPACE_EXISTS: i32 = 48;
pub(crate) const COMMAND_NOT_FOUND: i32 = 59;
pub(crate) const IMMUTABLE_FIELD: i32 = 66;
pub(crate) const DUPLICATE_KEY: i32 = 11000;
pub(crate) const UNRECOGNIZED_STAGE: i32 = 40324;

/// Extended JSON wrapper keys that denote a literal value, not a query operator.
const EXTENDED_JSON_KEYS: &[&str] = &[
    "$oid",
    "$date",
    "$binary",
    "$numberInt",
    "$numberLong",
    "$numberDouble",
    "$numberDecimal",
    "$uuid",
    "$timestamp",
];

/// Code name reported alongside a numeric server error code.
pub(crate) fn code_name(code: i32) -> &'static str {
    match code {
        BAD_VALUE => "BadValue",
        FAILED_TO_PARSE => "FailedToParse",
        13 => "Unauthorized",
        NAMESPACE_NOT_FOUND => "NamespaceNotFound",
        INDEX_NOT_FOUND => "IndexNotFound",
        NAMESPACE_EXISTS => "NamespaceExists",
        COMMAND_NOT_FOUND => "CommandNotFound",
        IMMUTABLE_FIELD => "ImmutableField",
        91 => "ShutdownInProgress",
        112 => "WriteConflict",
        189 => "PrimarySteppedDown",
        251 => "NoSuchTransaction",
        10107 => "NotWritablePrimary",
        11600 => "InterruptedAtShutdown",
        11601 => "Interrupted",
        DUPLICATE_KEY => "DuplicateKey",
        UNRECOGNIZED_STAGE => "Location40324",
        _ => "UnknownError",
    }
}

pub(crate) fn server_error(code: i32, message: impl Into<String>) -> DriverError {
    DriverError::command(code, code_name(code), message)
}

// ── Object ids ───────────────────────────────────────────────────────────────

static OBJECT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A fresh ObjectId in extended JSON form: `{"$oid": "<24 hex chars>"}`.
pub(crate) fn new_object_id() -> Value {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let random: [u8; 5] = rand::thread_rng().gen();
    let counter = OBJECT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed) & 0x00ff_ffff;

    let mut hex = format!("{:08x}", secs);
    for b in random {
        hex.push_str(&format!("{:02x}", b));
    }
    hex.push_str(&format!("{:06x}", counter));
    json!({ "$oid": hex })
}

// ── Storage ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct IndexSpec {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexSpec {
    fn to_document(&self) -> Document {
        let mut doc = Map::new();
        doc.insert("v".to_string(), json!(2));
        doc.insert("key".to_string(), Value::Object(self.keys.clone()));
        doc.insert("name".to_string(), json!(self.name));
        if self.unique {
            doc.insert("unique".to_string(), json!(true));
        }
        doc
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CollectionState {
    pub documents: Vec<Document>,
    pub indexes: Vec<IndexSpec>,
    pub options: Document,
}

impl CollectionState {
    fn with_options(options: Document) -> Self {
        let mut id_key = Map::new();
        id_key.insert("_id".to_string(), json!(1));
        CollectionState {
            documents: Vec::new(),
            indexes: vec![IndexSpec {
                name: "_id_".to_string(),
                keys: id_key,
                unique: true,
            }],
            options,
        }
    }

    /// Reject `candidate` if it collides with another document on a unique index.
    /// `position` is the candidate's own slot when it is already stored.
    fn check_unique(
        &self,
        ns: &Namespace,
        candidate: &Document,
        position: Option<usize>,
    ) -> DriverResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(&index.keys, candidate);
            let clash = self
                .documents
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != position)
                .any(|(_, other)| {
                    let other_key = index_key(&index.keys, other);
                    other_key
                        .iter()
                        .zip(&key)
                        .all(|(a, b)| values_equal(a, b))
                });
            if clash {
                return Err(server_error(
                    DUPLICATE_KEY,
                    format!(
                        "E11000 duplicate key error collection: {} index: {} dup key: {}",
                        ns,
                        index.name,
                        Value::Array(key)
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn index_key(keys: &Document, doc: &Document) -> Vec<Value> {
    keys.keys()
        .map(|k| get_path(doc, k).cloned().unwrap_or(Value::Null))
        .collect()
}

/// A write as observed by change streams.
#[derive(Debug, Clone)]
pub(crate) struct ChangeRecord {
    pub ns: Namespace,
    pub operation_type: &'static str,
    pub document_key: Option<Value>,
    pub full_document: Option<Document>,
    pub update_description: Option<Value>,
}

impl ChangeRecord {
    fn new(ns: &Namespace, operation_type: &'static str) -> Self {
        ChangeRecord {
            ns: ns.clone(),
            operation_type,
            document_key: None,
            full_document: None,
            update_description: None,
        }
    }
}

/// Outcome of an update or replace against the store.
#[derive(Debug, Clone, Default)]
pub(crate) struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

/// Parameters shared by update, replace and findAndModify.
pub(crate) struct WriteSpec<'a> {
    pub filter: &'a Document,
    pub sort: Option<&'a Document>,
    pub multi: bool,
    pub upsert: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    databases: BTreeMap<String, BTreeMap<String, CollectionState>>,
}

impl Store {
    pub fn collection(&self, ns: &Namespace) -> Option<&CollectionState> {
        self.databases.get(&ns.db)?.get(&ns.coll)
    }

    fn collection_mut(&mut self, ns: &Namespace) -> &mut CollectionState {
        self.databases
            .entry(ns.db.clone())
            .or_default()
            .entry(ns.coll.clone())
            .or_insert_with(|| CollectionState::with_options(Map::new()))
    }

    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.collection(ns)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub fn collection_names(&self, db: &str) -> Vec<String> {
        self.databases
            .get(db)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn collection_options(&self, ns: &Namespace) -> Option<Document> {
        self.collection(ns).map(|c| c.options.clone())
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases
            .iter()
            .filter(|(_, colls)| !colls.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn create_collection(
        &mut self,
        ns: &Namespace,
        options: Document,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<()> {
        let db = self.databases.entry(ns.db.clone()).or_default();
        if db.contains_key(&ns.coll) {
            return Err(server_error(
                NAMESPACE_EXISTS,
                format!("Collection {} already exists.", ns),
            ));
        }
        db.insert(ns.coll.clone(), CollectionState::with_options(options));
        changes.push(ChangeRecord::new(ns, "create"));
        Ok(())
    }

    /// Returns whether the collection existed.
    pub fn drop_collection(&mut self, ns: &Namespace, changes: &mut Vec<ChangeRecord>) -> bool {
        let dropped = self
            .databases
            .get_mut(&ns.db)
            .and_then(|db| db.remove(&ns.coll))
            .is_some();
        if dropped {
            changes.push(ChangeRecord::new(ns, "drop"));
        }
        dropped
    }

    pub fn drop_database(&mut self, db: &str, changes: &mut Vec<ChangeRecord>) {
        if let Some(colls) = self.databases.remove(db) {
            for coll in colls.keys() {
                changes.push(ChangeRecord::new(&Namespace::new(db, coll.clone()), "drop"));
            }
        }
    }

    pub fn rename(
        &mut self,
        ns: &Namespace,
        to: &Namespace,
        drop_target: bool,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<()> {
        if self.collection(ns).is_none() {
            return Err(server_error(
                NAMESPACE_NOT_FOUND,
                format!("Source collection {} does not exist", ns),
            ));
        }
        if self.collection(to).is_some() {
            if !drop_target {
                return Err(server_error(
                    NAMESPACE_EXISTS,
                    format!("target namespace {} exists", to),
                ));
            }
            self.drop_collection(to, changes);
        }
        let state = self
            .databases
            .get_mut(&ns.db)
            .and_then(|db| db.remove(&ns.coll))
            .unwrap_or_default();
        self.databases
            .entry(to.db.clone())
            .or_default()
            .insert(to.coll.clone(), state);
        changes.push(ChangeRecord::new(ns, "rename"));
        Ok(())
    }

    /// Insert one document, assigning an ObjectId `_id` when absent.
    pub fn insert(
        &mut self,
        ns: &Namespace,
        mut document: Document,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<Value> {
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = new_object_id();
                let mut with_id = Map::new();
                with_id.insert("_id".to_string(), id.clone());
                with_id.extend(document);
                document = with_id;
                id
            }
        };
        let coll = self.collection_mut(ns);
        coll.check_unique(ns, &document, None)?;
        coll.documents.push(document.clone());

        let mut change = ChangeRecord::new(ns, "insert");
        change.document_key = Some(json!({ "_id": id.clone() }));
        change.full_document = Some(document);
        changes.push(change);
        Ok(id)
    }

    pub fn find(
        &self,
        ns: &Namespace,
        filter: &Document,
        sort: Option<&Document>,
        skip: Option<u64>,
        limit: Option<i64>,
        projection: Option<&Document>,
    ) -> DriverResult<Vec<Document>> {
        let mut docs = Vec::new();
        for doc in self.collection(ns).map(|c| c.documents.as_slice()).unwrap_or(&[]) {
            if matches_filter(doc, filter)? {
                docs.push(doc.clone());
            }
        }
        if let Some(sort) = sort {
            sort_documents(&mut docs, sort);
        }
        let skip = skip.unwrap_or(0) as usize;
        let mut docs: Vec<Document> = docs.into_iter().skip(skip).collect();
        if let Some(limit) = limit.filter(|l| *l != 0) {
            docs.truncate(limit.unsigned_abs() as usize);
        }
        if let Some(projection) = projection {
            docs = docs.iter().map(|d| project(d, projection)).collect();
        }
        Ok(docs)
    }

    fn matching_positions(
        &self,
        ns: &Namespace,
        filter: &Document,
        sort: Option<&Document>,
    ) -> DriverResult<Vec<usize>> {
        let Some(coll) = self.collection(ns) else {
            return Ok(Vec::new());
        };
        let mut positions = Vec::new();
        for (i, doc) in coll.documents.iter().enumerate() {
            if matches_filter(doc, filter)? {
                positions.push(i);
            }
        }
        if let Some(sort) = sort {
            positions.sort_by(|a, b| compare_by_sort(&coll.documents[*a], &coll.documents[*b], sort));
        }
        Ok(positions)
    }

    /// Apply `update` to matching documents, upserting when asked.
    pub fn update(
        &mut self,
        ns: &Namespace,
        spec: &WriteSpec<'_>,
        update: &UpdateModifications,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<UpdateOutcome> {
        self.modify(ns, spec, changes, |doc, is_insert| {
            apply_update(doc, update, is_insert)
        })
    }

    pub fn replace(
        &mut self,
        ns: &Namespace,
        spec: &WriteSpec<'_>,
        replacement: &Document,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<UpdateOutcome> {
        if let Some(key) = replacement.keys().find(|k| k.starts_with('$')) {
            return Err(DriverError::invalid_argument(format!(
                "replacement document must not contain update operators (found '{}')",
                key
            )));
        }
        self.modify(ns, spec, changes, |doc, _| {
            let id = doc.get("_id").cloned();
            *doc = replacement.clone();
            if let Some(id) = id {
                if let Some(new_id) = doc.get("_id") {
                    if !values_equal(new_id, &id) {
                        return Err(server_error(
                            IMMUTABLE_FIELD,
                            "After applying the update, the (immutable) field '_id' was found to have been altered",
                        ));
                    }
                } else {
                    let mut with_id = Map::new();
                    with_id.insert("_id".to_string(), id);
                    with_id.extend(std::mem::take(doc));
                    *doc = with_id;
                }
            }
            Ok(())
        })
    }

    fn modify<F>(
        &mut self,
        ns: &Namespace,
        spec: &WriteSpec<'_>,
        changes: &mut Vec<ChangeRecord>,
        mut apply: F,
    ) -> DriverResult<UpdateOutcome>
    where
        F: FnMut(&mut Document, bool) -> DriverResult<()>,
    {
        let positions = self.matching_positions(ns, spec.filter, spec.sort)?;
        let mut outcome = UpdateOutcome::default();

        if positions.is_empty() {
            if spec.upsert {
                let mut doc = equality_fields(spec.filter);
                apply(&mut doc, true)?;
                let id = self.insert(ns, doc, changes)?;
                outcome.upserted_id = Some(id);
            }
            return Ok(outcome);
        }

        let targets = if spec.multi {
            positions
        } else {
            positions.into_iter().take(1).collect()
        };
        let coll = self.collection_mut(ns);
        for position in targets {
            let before = coll.documents[position].clone();
            let mut after = before.clone();
            apply(&mut after, false)?;
            outcome.matched += 1;
            if let (Some(old_id), Some(new_id)) = (before.get("_id"), after.get("_id")) {
                if !values_equal(old_id, new_id) {
                    return Err(server_error(
                        IMMUTABLE_FIELD,
                        "After applying the update, the (immutable) field '_id' was found to have been altered",
                    ));
                }
            }
            if !documents_equal(&before, &after) {
                coll.check_unique(ns, &after, Some(position))?;
                coll.documents[position] = after.clone();
                outcome.modified += 1;

                let mut change = ChangeRecord::new(ns, "update");
                change.document_key = before.get("_id").map(|id| json!({ "_id": id }));
                change.update_description = Some(update_description(&before, &after));
                change.full_document = Some(after);
                changes.push(change);
            }
        }
        Ok(outcome)
    }

    pub fn delete(
        &mut self,
        ns: &Namespace,
        filter: &Document,
        multi: bool,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<u64> {
        let positions = self.matching_positions(ns, filter, None)?;
        let targets: Vec<usize> = if multi {
            positions
        } else {
            positions.into_iter().take(1).collect()
        };
        let count = targets.len() as u64;
        if count == 0 {
            return Ok(0);
        }
        let coll = self.collection_mut(ns);
        for position in targets.into_iter().rev() {
            let removed = coll.documents.remove(position);
            let mut change = ChangeRecord::new(ns, "delete");
            change.document_key = removed.get("_id").map(|id| json!({ "_id": id }));
            changes.push(change);
        }
        Ok(count)
    }

    /// Atomically find one document and update, replace or remove it.
    /// Returns `(pre-image, post-image)`.
    pub fn find_and_modify(
        &mut self,
        ns: &Namespace,
        spec: &WriteSpec<'_>,
        action: &crate::options::FindAndModifyAction,
        changes: &mut Vec<ChangeRecord>,
    ) -> DriverResult<(Option<Document>, Option<Document>)> {
        use crate::options::FindAndModifyAction;

        let positions = self.matching_positions(ns, spec.filter, spec.sort)?;
        let first = positions.first().copied();
        let before = first.and_then(|p| self.collection(ns).map(|c| c.documents[p].clone()));

        match action {
            FindAndModifyAction::Remove => {
                if let Some(position) = first {
                    let coll = self.collection_mut(ns);
                    let removed = coll.documents.remove(position);
                    let mut change = ChangeRecord::new(ns, "delete");
                    change.document_key = removed.get("_id").map(|id| json!({ "_id": id }));
                    changes.push(change);
                }
                Ok((before, None))
            }
            FindAndModifyAction::Update(update) => {
                let outcome = self.update(ns, spec, update, changes)?;
                let after = self.reload(ns, before.as_ref(), outcome.upserted_id.as_ref());
                Ok((before, after))
            }
            FindAndModifyAction::Replace(replacement) => {
                let outcome = self.replace(ns, spec, replacement, changes)?;
                let after = self.reload(ns, before.as_ref(), outcome.upserted_id.as_ref());
                Ok((before, after))
            }
        }
    }

    fn reload(
        &self,
        ns: &Namespace,
        before: Option<&Document>,
        upserted_id: Option<&Value>,
    ) -> Option<Document> {
        let id = upserted_id.or_else(|| before.and_then(|b| b.get("_id")))?;
        self.collection(ns)?
            .documents
            .iter()
            .find(|d| d.get("_id").is_some_and(|v| values_equal(v, id)))
            .cloned()
    }

    pub fn create_index(
        &mut self,
        ns: &Namespace,
        keys: &Document,
        name: Option<String>,
        unique: bool,
    ) -> DriverResult<String> {
        let name = name.unwrap_or_else(|| default_index_name(keys));
        let coll = self.collection_mut(ns);
        if let Some(existing) = coll.indexes.iter().find(|i| i.name == name) {
            if !documents_equal(&existing.keys, keys) {
                return Err(server_error(
                    85,
                    format!("An existing index has the same name ({}) with different keys", name),
                ));
            }
            return Ok(name);
        }
        let spec = IndexSpec {
            name: name.clone(),
            keys: keys.clone(),
            unique,
        };
        if unique {
            for (i, doc) in coll.documents.iter().enumerate() {
                let mut candidate = coll.clone();
                candidate.indexes = vec![spec.clone()];
                candidate.check_unique(ns, doc, Some(i))?;
            }
        }
        coll.indexes.push(spec);
        Ok(name)
    }

    pub fn list_indexes(&self, ns: &Namespace) -> DriverResult<Vec<Document>> {
        let coll = self.collection(ns).ok_or_else(|| {
            server_error(NAMESPACE_NOT_FOUND, format!("ns does not exist: {}", ns))
        })?;
        Ok(coll.indexes.iter().map(IndexSpec::to_document).collect())
    }

    pub fn distinct(&self, ns: &Namespace, field: &str, filter: &Document) -> DriverResult<Vec<Value>> {
        let mut values: Vec<Value> = Vec::new();
        for doc in self.find(ns, filter, None, None, None, None)? {
            let found = match get_path(&doc, field) {
                Some(Value::Array(items)) => items.clone(),
                Some(v) => vec![v.clone()],
                None => Vec::new(),
            };
            for v in found {
                if !values.iter().any(|seen| values_equal(seen, &v)) {
                    values.push(v);
                }
            }
        }
        values.sort_by(compare_values);
        Ok(values)
    }
}

fn default_index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(k, v)| format!("{}_{}", k, v))
        .collect::<Vec<_>>()
        .join("_")
}

/// Top-level equality conditions of a filter, used to seed an upserted document.
fn equality_fields(filter: &Document) -> Document {
    let mut doc = Map::new();
    for (key, cond) in filter {
        if key.starts_with('$') || key.contains('.') {
            continue;
        }
        match cond {
            Value::Object(ops) if is_operator_doc(ops) => {
                if let Some(v) = ops.get("$eq") {
                    doc.insert(key.clone(), v.clone());
                }
            }
            other => {
                doc.insert(key.clone(), other.clone());
            }
        }
    }
    doc
}

fn update_description(before: &Document, after: &Document) -> Value {
    let mut updated = Map::new();
    for (k, v) in after {
        if before.get(k).map_or(true, |old| !values_equal(old, v)) {
            updated.insert(k.clone(), v.clone());
        }
    }
    let removed: Vec<Value> = before
        .keys()
        .filter(|k| !after.contains_key(*k))
        .map(|k| json!(k))
        .collect();
    json!({ "updatedFields": updated, "removedFields": removed })
}

// ── Paths and comparison ─────────────────────────────────────────────────────

pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> DriverResult<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return Err(server_error(BAD_VALUE, "empty field path"));
    };
    let mut current = doc;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(server_error(
                    28,
                    format!("Cannot create field '{}' in a non-object element", part),
                ))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = doc;
    for part in parents {
        current = match current.get_mut(*part) {
            Some(Value::Object(map)) => map,
            _ => return,
        };
    }
    current.remove(*last);
}

/// Equality with numeric normalization (`1 == 1.0`) and order-insensitive objects.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => documents_equal(x, y),
        _ => a == b,
    }
}

pub(crate) fn documents_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(map) if map.contains_key("$oid") => 7,
        Value::Object(map) if map.contains_key("$date") => 9,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Total order used for sorting: type rank first, then value.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (a, b) in x.iter().zip(y) {
                let ord = compare_values(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Comparison for range operators: only values of the same type class compare.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    if type_rank(a) != type_rank(b) {
        return None;
    }
    Some(compare_values(a, b))
}

fn compare_by_sort(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, direction) in sort {
        let descending = direction.as_f64().is_some_and(|d| d < 0.0);
        let va = get_path(a, field).unwrap_or(&Value::Null);
        let vb = get_path(b, field).unwrap_or(&Value::Null);
        let mut ord = compare_values(va, vb);
        if descending {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub(crate) fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| compare_by_sort(a, b, sort));
}

// ── Filters ──────────────────────────────────────────────────────────────────

fn is_operator_doc(map: &Document) -> bool {
    !map.is_empty()
        && map
            .keys()
            .all(|k| k.starts_with('$') && !EXTENDED_JSON_KEYS.contains(&k.as_str()))
}

pub(crate) fn matches_filter(doc: &Document, filter: &Document) -> DriverResult<bool> {
    for (key, cond) in filter {
        let matched = match key.as_str() {
            "$and" => logical_clauses(cond)?
                .iter()
                .map(|c| matches_filter(doc, c))
                .collect::<DriverResult<Vec<bool>>>()?
                .into_iter()
                .all(|m| m),
            "$or" => logical_clauses(cond)?
                .iter()
                .map(|c| matches_filter(doc, c))
                .collect::<DriverResult<Vec<bool>>>()?
                .into_iter()
                .any(|m| m),
            "$nor" => !logical_clauses(cond)?
                .iter()
                .map(|c| matches_filter(doc, c))
                .collect::<DriverResult<Vec<bool>>>()?
                .into_iter()
                .any(|m| m),
            other if other.starts_with('$') => {
                return Err(server_error(
                    BAD_VALUE,
                    format!("unknown top level operator: {}", other),
                ))
            }
            path => match_condition(get_path(doc, path), cond)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_clauses(cond: &Value) -> DriverResult<Vec<&Document>> {
    let Value::Array(items) = cond else {
        return Err(server_error(BAD_VALUE, "$and/$or/$nor must be an array"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(server_error(BAD_VALUE, "$and/$or/$nor entries must be objects")),
        })
        .collect()
}

fn equals_with_arrays(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(v) => {
            values_equal(v, expected)
                || matches!(v, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        }
    }
}

fn any_element<F: Fn(&Value) -> bool>(actual: Option<&Value>, pred: F) -> bool {
    match actual {
        None => false,
        Some(Value::Array(items)) => pred(actual.unwrap_or(&Value::Null)) || items.iter().any(pred),
        Some(v) => pred(v),
    }
}

fn match_condition(actual: Option<&Value>, cond: &Value) -> DriverResult<bool> {
    let Value::Object(ops) = cond else {
        return Ok(equals_with_arrays(actual, cond));
    };
    if !is_operator_doc(ops) {
        return Ok(equals_with_arrays(actual, cond));
    }
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_with_arrays(actual, arg),
            "$ne" => !equals_with_arrays(actual, arg),
            "$gt" => any_element(actual, |v| compare_same_type(v, arg) == Some(Ordering::Greater)),
            "$gte" => any_element(actual, |v| {
                matches!(compare_same_type(v, arg), Some(Ordering::Greater | Ordering::Equal))
            }),
            "$lt" => any_element(actual, |v| compare_same_type(v, arg) == Some(Ordering::Less)),
            "$lte" => any_element(actual, |v| {
                matches!(compare_same_type(v, arg), Some(Ordering::Less | Ordering::Equal))
            }),
            "$in" => in_list(actual, arg)?,
            "$nin" => !in_list(actual, arg)?,
            "$exists" => {
                let wanted = arg.as_bool().unwrap_or_else(|| arg.as_f64().is_some_and(|n| n != 0.0));
                actual.is_some() == wanted
            }
            "$not" => !match_condition(actual, arg)?,
            "$size" => match (actual, arg.as_u64()) {
                (Some(Value::Array(items)), Some(n)) => items.len() as u64 == n,
                _ => false,
            },
            other => {
                return Err(server_error(BAD_VALUE, format!("unknown operator: {}", other)))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(actual: Option<&Value>, arg: &Value) -> DriverResult<bool> {
    let Value::Array(candidates) = arg else {
        return Err(server_error(BAD_VALUE, "$in/$nin needs an array"));
    };
    Ok(candidates.iter().any(|c| equals_with_arrays(actual, c)))
}

// ── Updates ──────────────────────────────────────────────────────────────────

fn apply_update(doc: &mut Document, update: &UpdateModifications, is_insert: bool) -> DriverResult<()> {
    match update {
        UpdateModifications::Document(ops) => {
            if ops.is_empty() || !ops.keys().all(|k| k.starts_with('$')) {
                return Err(DriverError::invalid_argument(
                    "update document requires atomic operators",
                ));
            }
            for (op, fields) in ops {
                let Value::Object(fields) = fields else {
                    return Err(server_error(
                        FAILED_TO_PARSE,
                        format!("Modifiers operate on fields but we found a non-object for {}", op),
                    ));
                };
                apply_operator(doc, op, fields, is_insert)?;
            }
            Ok(())
        }
        UpdateModifications::Pipeline(stages) => {
            for stage in stages {
                let (name, spec) = single_entry(stage)?;
                match (name, spec) {
                    ("$set" | "$addFields", Value::Object(fields)) => {
                        for (path, expr) in fields {
                            let value = eval_expression(doc, expr);
                            set_path(doc, path, value)?;
                        }
                    }
                    ("$unset", Value::String(path)) => remove_path(doc, path),
                    ("$unset", Value::Array(paths)) => {
                        for path in paths.iter().filter_map(Value::as_str) {
                            remove_path(doc, path);
                        }
                    }
                    (other, _) => {
                        return Err(server_error(
                            UNRECOGNIZED_STAGE,
                            format!("Unsupported update pipeline stage: {}", other),
                        ))
                    }
                }
            }
            Ok(())
        }
    }
}

fn apply_operator(doc: &mut Document, op: &str, fields: &Document, is_insert: bool) -> DriverResult<()> {
    for (path, arg) in fields {
        match op {
            "$set" => set_path(doc, path, arg.clone())?,
            "$setOnInsert" => {
                if is_insert {
                    set_path(doc, path, arg.clone())?;
                }
            }
            "$unset" => remove_path(doc, path),
            "$inc" => {
                let current = get_path(doc, path).cloned().unwrap_or(json!(0));
                set_path(doc, path, add_numbers(&current, arg)?)?;
            }
            "$push" => {
                let mut items = match get_path(doc, path) {
                    Some(Value::Array(items)) => items.clone(),
                    None => Vec::new(),
                    Some(_) => {
                        return Err(server_error(
                            BAD_VALUE,
                            format!("The field '{}' must be an array", path),
                        ))
                    }
                };
                match arg {
                    Value::Object(spec) if spec.contains_key("$each") => {
                        if let Some(Value::Array(each)) = spec.get("$each") {
                            items.extend(each.iter().cloned());
                        }
                    }
                    other => items.push(other.clone()),
                }
                set_path(doc, path, Value::Array(items))?;
            }
            other => {
                return Err(server_error(
                    FAILED_TO_PARSE,
                    format!("Unknown modifier: {}", other),
                ))
            }
        }
    }
    Ok(())
}

fn add_numbers(a: &Value, b: &Value) -> DriverResult<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Ok(json!(x + y))
            } else {
                Ok(json!(x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0)))
            }
        }
        _ => Err(server_error(
            14,
            "Cannot apply $inc to a value of non-numeric type",
        )),
    }
}

fn eval_expression(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(map) if map.len() == 1 && map.contains_key("$literal") => {
            map.get("$literal").cloned().unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

fn single_entry(stage: &Document) -> DriverResult<(&str, &Value)> {
    match stage.iter().next() {
        Some((k, v)) if stage.len() == 1 => Ok((k.as_str(), v)),
        _ => Err(server_error(
            40323,
            "A pipeline stage specification object must contain exactly one field.",
        )),
    }
}

// ── Projection and aggregation ───────────────────────────────────────────────

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

pub(crate) fn project(doc: &Document, projection: &Document) -> Document {
    let inclusion = projection
        .iter()
        .any(|(k, v)| k != "_id" && is_truthy(v));
    let keep_id = projection.get("_id").map_or(true, is_truthy);

    if inclusion {
        let mut out = Map::new();
        if keep_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (field, flag) in projection {
            if field == "_id" || !is_truthy(flag) {
                continue;
            }
            if let Some(v) = get_path(doc, field) {
                // Dotted projections are flattened onto their full path.
                let _ = set_path(&mut out, field, v.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (field, flag) in projection {
            if !is_truthy(flag) {
                remove_path(&mut out, field);
            }
        }
        if !keep_id {
            out.remove("_id");
        }
        out
    }
}

/// Run an aggregation pipeline over `docs`.
pub(crate) fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> DriverResult<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = single_entry(stage)?;
        docs = match (name, spec) {
            ("$match", Value::Object(filter)) => {
                let mut kept = Vec::new();
                for doc in docs {
                    if matches_filter(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            ("$sort", Value::Object(sort)) => {
                sort_documents(&mut docs, sort);
                docs
            }
            ("$skip", n) => docs.into_iter().skip(n.as_u64().unwrap_or(0) as usize).collect(),
            ("$limit", n) => {
                docs.truncate(n.as_u64().unwrap_or(0) as usize);
                docs
            }
            ("$project", Value::Object(projection)) => {
                docs.iter().map(|d| project(d, projection)).collect()
            }
            ("$addFields" | "$set", Value::Object(fields)) => {
                let mut out = Vec::with_capacity(docs.len());
                for mut doc in docs {
                    for (path, expr) in fields {
                        let value = eval_expression(&doc, expr);
                        set_path(&mut doc, path, value)?;
                    }
                    out.push(doc);
                }
                out
            }
            ("$unset", spec) => {
                let paths: Vec<String> = match spec {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                docs.into_iter()
                    .map(|mut d| {
                        for p in &paths {
                            remove_path(&mut d, p);
                        }
                        d
                    })
                    .collect()
            }
            ("$count", Value::String(field)) => {
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Map::new();
                    out.insert(field.clone(), json!(docs.len()));
                    vec![out]
                }
            }
            ("$group", Value::Object(spec)) => group(docs, spec)?,
            (other, _) => {
                return Err(server_error(
                    UNRECOGNIZED_STAGE,
                    format!("Unrecognized pipeline stage name: '{}'", other),
                ))
            }
        };
    }
    Ok(docs)
}

/// `$group` with `$sum`, `$first`, `$last` and `$push` accumulators.
fn group(docs: Vec<Document>, spec: &Document) -> DriverResult<Vec<Document>> {
    let id_expr = spec.get("_id").cloned().unwrap_or(Value::Null);
    let mut groups: Vec<(Value, Vec<Document>)> = Vec::new();
    for doc in docs {
        let key = eval_expression(&doc, &id_expr);
        match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut result = Map::new();
        result.insert("_id".to_string(), key);
        for (field, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            let (op, expr) = match acc {
                Value::Object(m) if m.len() == 1 => single_entry(m)?,
                _ => {
                    return Err(server_error(
                        40234,
                        format!("The field '{}' must be an accumulator object", field),
                    ))
                }
            };
            let values: Vec<Value> = members.iter().map(|d| eval_expression(d, expr)).collect();
            let value = match op {
                "$sum" => {
                    let mut total = json!(0);
                    for v in values.iter().filter(|v| v.is_number()) {
                        total = add_numbers(&total, v)?;
                    }
                    total
                }
                "$first" => values.first().cloned().unwrap_or(Value::Null),
                "$last" => values.last().cloned().unwrap_or(Value::Null),
                "$push" => Value::Array(values),
                other => {
                    return Err(server_error(
                        15952,
                        format!("unknown group operator '{}'", other),
                    ))
                }
            };
            result.insert(field.clone(), value);
        }
        out.push(result);
    }
    Ok(out)
}
