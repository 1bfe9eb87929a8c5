//! Row compaction
//!
//! Two exactly invertible encodings used by the writer:
//! - [`delta`]: rows become fixed-layout tuples with interned strings and
//!   file references replaced by ids
//! - [`columnar`]: rows become one array per column with optional lookup
//!   tables for string columns

pub mod columnar;
pub mod delta;

use std::collections::HashMap;

pub use columnar::{ColumnarBuilder, ColumnarPayload};
pub use delta::{DeltaEncoder, DeltaExtension, DeltaField, DeltaSchema, FieldKind, FileIdLookup};

/// Append-only string table
#[derive(Debug, Clone, Default)]
pub struct Interner {
    table: Vec<String>,
    index: HashMap<String, u32>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value`, adding it on first sight
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.index.get(value) {
            return idx;
        }
        let idx = self.table.len() as u32;
        self.table.push(value.to_string());
        self.index.insert(value.to_string(), idx);
        idx
    }

    pub fn table(&self) -> &[String] {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
