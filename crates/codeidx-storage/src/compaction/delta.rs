//! Delta (tuple) encoding
//!
//! A row becomes `[mask, v0, v1, ...]`: bit `i` of `mask` is set when the
//! `i`-th schema field is present, and the present values follow in schema
//! order. Interned fields store an index into a per-field string table and
//! file-reference fields store the file's id. `null` is kept as `null`, so
//! absent and null stay distinct.
//!
//! Encoding is all-or-nothing per artifact: the first row that does not fit
//! the schema disables the encoder for the rest of the stream.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use codeidx_common::error::{Error, Result, RowError};

use super::Interner;
use crate::source::Row;

/// Largest schema a tuple mask can describe
pub const MAX_DELTA_FIELDS: usize = 32;

/// Manifest tag for the tuple layout
pub const DELTA_FORMAT: &str = "tuple-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    /// String (or null) replaced by a table index
    Interned,
    /// File path replaced by its id
    FileRef,
    /// Stored as-is
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaField {
    pub name: String,
    pub kind: FieldKind,
}

impl DeltaField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Fixed tuple layout for one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSchema {
    fields: Vec<DeltaField>,
    positions: HashMap<String, usize>,
}

impl DeltaSchema {
    pub fn new(fields: Vec<DeltaField>) -> Result<Self> {
        if fields.is_empty() || fields.len() > MAX_DELTA_FIELDS {
            return Err(Error::InvalidParameter(format!(
                "delta schema must have 1..={MAX_DELTA_FIELDS} fields, got {}",
                fields.len()
            )));
        }
        let mut positions = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if positions.insert(field.name.clone(), i).is_some() {
                return Err(Error::InvalidParameter(format!(
                    "duplicate delta field {:?}",
                    field.name
                )));
            }
        }
        Ok(Self { fields, positions })
    }

    /// Layout used by `repo_map`
    pub fn repo_map() -> Self {
        let fields = vec![
            DeltaField::new("file", FieldKind::FileRef),
            DeltaField::new("name", FieldKind::Plain),
            DeltaField::new("kind", FieldKind::Interned),
            DeltaField::new("signature", FieldKind::Interned),
            DeltaField::new("startLine", FieldKind::Plain),
        ];
        let positions = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self { fields, positions }
    }

    pub fn fields(&self) -> &[DeltaField] {
        &self.fields
    }
}

/// Bidirectional file path / id mapping supplied by the row producer
#[derive(Debug, Clone, Default)]
pub struct FileIdLookup {
    by_path: HashMap<String, u64>,
    by_id: BTreeMap<u64, String>,
}

impl FileIdLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign ids `0..n` in iteration order, skipping repeats
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lookup = Self::new();
        for path in paths {
            let path = path.into();
            if !lookup.by_path.contains_key(&path) {
                let id = lookup.by_path.len() as u64;
                lookup.insert(path, id);
            }
        }
        lookup
    }

    pub fn insert(&mut self, path: impl Into<String>, id: u64) {
        let path = path.into();
        self.by_id.insert(id, path.clone());
        self.by_path.insert(path, id);
    }

    pub fn id_of(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    pub fn path_of(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// Measures and encodes rows against a schema, building the intern tables
#[derive(Debug)]
pub struct DeltaEncoder<'a> {
    schema: &'a DeltaSchema,
    files: &'a FileIdLookup,
    tables: Vec<Interner>,
    disabled: Option<String>,
}

impl<'a> DeltaEncoder<'a> {
    pub fn new(schema: &'a DeltaSchema, files: &'a FileIdLookup) -> Self {
        Self {
            schema,
            files,
            tables: vec![Interner::new(); schema.fields.len()],
            disabled: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.is_none()
    }

    /// Why the encoder was disabled, if it was
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    pub fn disable(&mut self, reason: impl Into<String>) {
        if self.disabled.is_none() {
            self.disabled = Some(reason.into());
        }
    }

    /// Encode one row. Returns `None`, and disables the encoder, when the
    /// row does not fit the schema. Both writer passes call this, so the
    /// measured and written tuples are the same bytes.
    pub fn encode_row(&mut self, row: &Row) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }
        match self.try_encode(row) {
            Ok(tuple) => Some(tuple),
            Err(reason) => {
                self.disable(reason);
                None
            }
        }
    }

    fn try_encode(&mut self, row: &Row) -> std::result::Result<Value, String> {
        let mut mask: u64 = 0;
        let mut values = Vec::with_capacity(row.len() + 1);
        values.push(Value::Null);
        let mut last: Option<usize> = None;

        for (key, value) in row {
            let position = *self
                .schema
                .positions
                .get(key)
                .ok_or_else(|| format!("field {key:?} is not in the delta layout"))?;
            if last.is_some_and(|prev| position <= prev) {
                return Err(format!("field {key:?} is out of layout order"));
            }
            last = Some(position);
            mask |= 1 << position;

            let encoded = match (self.schema.fields[position].kind, value) {
                (_, Value::Null) => Value::Null,
                (FieldKind::Plain, v) => v.clone(),
                (FieldKind::Interned, Value::String(s)) => Value::from(self.tables[position].intern(s)),
                (FieldKind::Interned, _) => {
                    return Err(format!("field {key:?} is not a string"));
                }
                (FieldKind::FileRef, Value::String(path)) => {
                    let id = self
                        .files
                        .id_of(path)
                        .ok_or_else(|| format!("file {path:?} has no id"))?;
                    Value::from(id)
                }
                (FieldKind::FileRef, _) => {
                    return Err(format!("field {key:?} is not a file path"));
                }
            };
            values.push(encoded);
        }
        values[0] = Value::from(mask);
        Ok(Value::Array(values))
    }

    /// Manifest block describing the layout and the tables built so far
    pub fn extension(&self) -> DeltaExtension {
        let mut tables = BTreeMap::new();
        for (field, table) in self.schema.fields.iter().zip(&self.tables) {
            if field.kind == FieldKind::Interned {
                tables.insert(field.name.clone(), table.table().to_vec());
            }
        }
        DeltaExtension {
            format: DELTA_FORMAT.to_string(),
            row: self.schema.fields.iter().map(|f| f.name.clone()).collect(),
            kinds: self.schema.fields.iter().map(|f| f.kind).collect(),
            tables,
        }
    }
}

/// `extensions.delta` in a sharded meta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaExtension {
    pub format: String,
    /// Field names in tuple order
    pub row: Vec<String>,
    pub kinds: Vec<FieldKind>,
    pub tables: BTreeMap<String, Vec<String>>,
}

impl DeltaExtension {
    /// Rebuild a row from its tuple
    pub fn inflate(&self, tuple: &Value, files: &FileIdLookup, index: usize) -> Result<Row> {
        let malformed = |reason: String| Error::from(RowError::Malformed { index, reason });
        if self.kinds.len() != self.row.len() {
            return Err(Error::Manifest(
                "delta extension has mismatched row and kinds".to_string(),
            ));
        }
        if self.row.len() > MAX_DELTA_FIELDS {
            return Err(Error::Manifest(format!(
                "delta extension lists {} fields, at most {MAX_DELTA_FIELDS} are supported",
                self.row.len()
            )));
        }
        let items = tuple
            .as_array()
            .ok_or_else(|| malformed("delta row is not an array".to_string()))?;
        let mask = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("delta row has no presence mask".to_string()))?;

        if mask.checked_shr(self.row.len() as u32).unwrap_or(0) != 0 {
            return Err(malformed("delta row mask names fields outside the layout".to_string()));
        }

        let mut row = Row::new();
        let mut values = items.iter().skip(1);
        for (position, (name, kind)) in self.row.iter().zip(&self.kinds).enumerate() {
            let bit = u32::try_from(position)
                .ok()
                .and_then(|p| 1u64.checked_shl(p))
                .ok_or_else(|| malformed(format!("field {name:?} is outside the presence mask")))?;
            if mask & bit == 0 {
                continue;
            }
            let value = values
                .next()
                .ok_or_else(|| malformed(format!("delta row is missing {name:?}")))?;
            let decoded = match (kind, value) {
                (_, Value::Null) => Value::Null,
                (FieldKind::Plain, v) => v.clone(),
                (FieldKind::Interned, v) => {
                    let table = self.tables.get(name);
                    let text = v
                        .as_u64()
                        .and_then(|i| table.and_then(|t| t.get(usize::try_from(i).ok()?)))
                        .ok_or_else(|| malformed(format!("bad table index for {name:?}")))?;
                    Value::String(text.clone())
                }
                (FieldKind::FileRef, v) => {
                    let path = v
                        .as_u64()
                        .and_then(|id| files.path_of(id))
                        .ok_or_else(|| malformed(format!("unknown file id for {name:?}")))?;
                    Value::String(path.to_string())
                }
            };
            row.insert(name.clone(), decoded);
        }
        if values.next().is_some() {
            return Err(malformed("delta row has trailing values".to_string()));
        }
        Ok(row)
    }
}
