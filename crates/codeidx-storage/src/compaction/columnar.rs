//! Columnar (struct-of-arrays) encoding
//!
//! Payload shape:
//!
//! ```json
//! {"format":"columnar","columns":["file","kind"],"length":2,
//!  "arrays":{"file":["a.rs","b.rs"],"kind":[0,0]},
//!  "tables":{"kind":["fn"]},"absent":{}}
//! ```
//!
//! A column with a table stores indexes into it; `null` stays `null`.
//! `absent` lists, per column, the rows that did not carry the field.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use codeidx_common::error::{Error, Result, RowError};

use super::Interner;
use crate::source::Row;

pub const COLUMNAR_FORMAT: &str = "columnar";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarPayload {
    pub format: String,
    pub columns: Vec<String>,
    pub length: usize,
    pub arrays: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub absent: BTreeMap<String, Vec<usize>>,
}

impl ColumnarPayload {
    /// Rebuild row `i`. Fails on a short column or an out-of-range table index.
    pub fn row(&self, i: usize, absent: &[HashSet<usize>]) -> Result<Row> {
        let malformed = |reason: String| Error::from(RowError::Malformed { index: i, reason });
        let mut row = Row::new();
        for (column, skipped) in self.columns.iter().zip(absent) {
            if skipped.contains(&i) {
                continue;
            }
            let value = self
                .arrays
                .get(column)
                .and_then(|values| values.get(i))
                .ok_or_else(|| malformed(format!("column {column:?} has no value")))?;
            let value = match (self.tables.get(column), value) {
                (Some(table), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|idx| table.get(usize::try_from(idx).ok()?))
                    .map(|s| Value::String(s.clone()))
                    .ok_or_else(|| malformed(format!("bad table index {n} for {column:?}")))?,
                _ => value.clone(),
            };
            row.insert(column.clone(), value);
        }
        Ok(row)
    }

    /// Rebuild every row
    pub fn inflate(&self) -> Result<Vec<Row>> {
        if self.format != COLUMNAR_FORMAT {
            return Err(Error::Manifest(format!(
                "unexpected columnar format tag {:?}",
                self.format
            )));
        }
        let absent = self.absent_sets();
        (0..self.length).map(|i| self.row(i, &absent)).collect()
    }

    /// Absent row sets in column order
    pub fn absent_sets(&self) -> Vec<HashSet<usize>> {
        self.columns
            .iter()
            .map(|c| {
                self.absent
                    .get(c)
                    .map(|rows| rows.iter().copied().collect())
                    .unwrap_or_default()
            })
            .collect()
    }
}

struct Column {
    name: String,
    values: Vec<Value>,
    absent: Vec<usize>,
}

/// Accumulates rows column by column.
///
/// Columns are ordered by first appearance. A row whose fields appear in a
/// different relative order than the columns cannot be rebuilt with the
/// same key order, so it makes the whole artifact ineligible.
pub struct ColumnarBuilder {
    columns: Vec<Column>,
    length: usize,
    ineligible: Option<String>,
}

impl Default for ColumnarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnarBuilder {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            length: 0,
            ineligible: None,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.ineligible.is_none()
    }

    pub fn ineligible_reason(&self) -> Option<&str> {
        self.ineligible.as_deref()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Add one row; returns whether the builder is still eligible
    pub fn push(&mut self, row: &Row) -> bool {
        if !self.is_eligible() {
            return false;
        }
        let mut last: Option<usize> = None;
        let mut seen = vec![false; self.columns.len()];
        for (key, value) in row {
            let position = match self.columns.iter().position(|c| &c.name == key) {
                Some(p) => p,
                None => {
                    self.columns.push(Column {
                        name: key.clone(),
                        values: vec![Value::Null; self.length],
                        absent: (0..self.length).collect(),
                    });
                    seen.push(false);
                    self.columns.len() - 1
                }
            };
            if last.is_some_and(|prev| position <= prev) {
                self.ineligible = Some(format!("field {key:?} breaks column order at row {}", self.length));
                return false;
            }
            last = Some(position);
            seen[position] = true;
            self.columns[position].values.push(value.clone());
        }
        for (column, present) in self.columns.iter_mut().zip(seen) {
            if !present {
                column.values.push(Value::Null);
                column.absent.push(self.length);
            }
        }
        self.length += 1;
        true
    }

    /// Finish the payload. String columns with repeated values get a table.
    pub fn finish(self) -> Result<ColumnarPayload> {
        if let Some(reason) = self.ineligible {
            return Err(Error::InvalidParameter(format!("rows are not columnar: {reason}")));
        }
        let mut payload = ColumnarPayload {
            format: COLUMNAR_FORMAT.to_string(),
            columns: Vec::with_capacity(self.columns.len()),
            length: self.length,
            arrays: BTreeMap::new(),
            tables: BTreeMap::new(),
            absent: BTreeMap::new(),
        };
        for column in self.columns {
            let values = match tabulate(&column.values) {
                Some((table, indexed)) => {
                    payload.tables.insert(column.name.clone(), table);
                    indexed
                }
                None => column.values,
            };
            if !column.absent.is_empty() {
                payload.absent.insert(column.name.clone(), column.absent);
            }
            payload.arrays.insert(column.name.clone(), values);
            payload.columns.push(column.name);
        }
        Ok(payload)
    }
}

/// Table-encode a column whose present values are all strings or null and
/// where at least one string repeats.
fn tabulate(values: &[Value]) -> Option<(Vec<String>, Vec<Value>)> {
    let mut interner = Interner::new();
    let mut strings = 0usize;
    let mut indexed = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::String(s) => {
                strings += 1;
                indexed.push(Value::from(interner.intern(s)));
            }
            Value::Null => indexed.push(Value::Null),
            _ => return None,
        }
    }
    if strings == 0 || interner.len() == strings {
        return None;
    }
    Some((interner.table().to_vec(), indexed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn build(rows: &[Row]) -> Option<ColumnarPayload> {
        let mut builder = ColumnarBuilder::new();
        for row in rows {
            if !builder.push(row) {
                return None;
            }
        }
        builder.finish().ok()
    }

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| match v {
                Value::Object(m) => m,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_tables_and_absent() {
        let input = rows(vec![
            json!({"file": "a.rs", "kind": "fn", "lines": 3}),
            json!({"file": "b.rs", "kind": "fn"}),
            json!({"file": "c.rs", "kind": null, "lines": 9}),
        ]);
        let payload = build(&input).unwrap();
        assert_eq!(payload.columns, vec!["file", "kind", "lines"]);
        assert_eq!(payload.tables["kind"], vec!["fn".to_string()]);
        assert!(!payload.tables.contains_key("file"));
        assert_eq!(payload.arrays["kind"], vec![json!(0), json!(0), Value::Null]);
        assert_eq!(payload.absent["lines"], vec![1]);
        assert_eq!(payload.inflate().unwrap(), input);
    }

    #[test]
    fn test_late_column_marks_earlier_rows_absent() {
        let input = rows(vec![json!({"a": 1}), json!({"a": 2, "b": true})]);
        let payload = build(&input).unwrap();
        assert_eq!(payload.absent["b"], vec![0]);
        assert_eq!(payload.inflate().unwrap(), input);
    }

    #[test]
    fn test_inconsistent_order_is_ineligible() {
        let input = rows(vec![json!({"a": 1, "b": 2}), json!({"b": 3, "a": 4})]);
        assert!(build(&input).is_none());

        let mut builder = ColumnarBuilder::new();
        for row in &input {
            builder.push(row);
        }
        assert!(builder.ineligible_reason().unwrap().contains("\"a\""));
        assert!(builder.finish().is_err());
    }

    #[test]
    fn test_payload_json_roundtrip() {
        let input = rows(vec![json!({"k": "x"}), json!({"k": "x"})]);
        let payload = build(&input).unwrap();
        let text = serde_json::to_string(&payload).unwrap();
        let parsed: ColumnarPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.inflate().unwrap(), input);
    }

    #[test]
    fn test_out_of_range_table_index_is_rejected() {
        let input = rows(vec![json!({"k": "x"}), json!({"k": "x"})]);
        let mut payload = build(&input).unwrap();
        payload.arrays.insert("k".to_string(), vec![json!(0), json!(5)]);
        let err = payload.inflate().unwrap_err();
        assert!(matches!(err, Error::Row(RowError::Malformed { index: 1, .. })));

        payload.arrays.insert("k".to_string(), vec![json!(0)]);
        assert!(payload.inflate().is_err());
    }

    proptest! {
        #[test]
        fn prop_columnar_is_invertible(
            entries in proptest::collection::vec(
                (
                    proptest::option::of(prop_oneof![Just("a.rs"), Just("b.rs"), Just("c.rs")]),
                    proptest::option::of(proptest::option::of(0i64..100)),
                    proptest::option::of(proptest::option::of("[a-z]{0,3}")),
                ),
                0..30,
            )
        ) {
            // first row fixes the column order
            let header = json!({"file": "a.rs", "count": 0, "tag": "x"});
            let input: Vec<Row> = std::iter::once(rows(vec![header]).remove(0))
                .chain(entries.into_iter()
                .map(|(file, count, tag)| {
                    let mut row = Row::new();
                    if let Some(f) = file { row.insert("file".into(), json!(f)); }
                    if let Some(c) = count { row.insert("count".into(), json!(c)); }
                    if let Some(t) = tag { row.insert("tag".into(), json!(t)); }
                    row
                }))
                .collect();
            let payload = build(&input).unwrap();
            let inflated = payload.inflate().unwrap();
            prop_assert_eq!(
                serde_json::to_string(&inflated).unwrap(),
                serde_json::to_string(&input).unwrap()
            );
        }
    }
}
