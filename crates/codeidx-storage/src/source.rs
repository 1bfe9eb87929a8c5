//! Row producers
//!
//! The writer measures an artifact in one pass and writes it in a second.
//! A [`RowSource`] therefore hands out a fresh iterator each time it is
//! opened; sources that cannot restart should buffer their rows (see
//! [`VecSource`]) before being handed to the writer.

use serde_json::{Map, Value};

use codeidx_common::error::{Result, RowError};

/// One record: an ordered mapping of field name to JSON value
pub type Row = Map<String, Value>;

/// Iterator over rows produced by a source
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row>> + Send + 'a>;

/// A finite sequence of rows that can be opened more than once.
///
/// Every call to [`RowSource::open`] must yield the same rows in the same
/// order. The writer opens a source at most twice per write.
pub trait RowSource: Send + Sync {
    fn open(&self) -> Result<RowIter<'_>>;

    /// Row count when known without iterating
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Rows held in memory
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    rows: Vec<Row>,
}

impl VecSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Build from JSON values, rejecting anything that is not an object
    pub fn from_values(values: Vec<Value>) -> Result<Self> {
        let rows = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Object(row) => Ok(row),
                _ => Err(RowError::NotAnObject { index }.into()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

impl RowSource for VecSource {
    fn open(&self) -> Result<RowIter<'_>> {
        Ok(Box::new(self.rows.iter().cloned().map(Ok)))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

/// Source backed by a closure that builds a fresh iterator per open
pub struct FnSource<F> {
    make: F,
}

impl<F, I> FnSource<F>
where
    F: Fn() -> Result<I> + Send + Sync,
    I: Iterator<Item = Result<Row>> + Send + 'static,
{
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

impl<F, I> RowSource for FnSource<F>
where
    F: Fn() -> Result<I> + Send + Sync,
    I: Iterator<Item = Result<Row>> + Send + 'static,
{
    fn open(&self) -> Result<RowIter<'_>> {
        Ok(Box::new((self.make)()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vec_source_reopens() {
        let source = VecSource::from_values(vec![json!({"a": 1}), json!({"a": 2})]).unwrap();
        let first: Vec<Row> = source.open().unwrap().collect::<Result<_>>().unwrap();
        let second: Vec<Row> = source.open().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
        assert_eq!(source.len_hint(), Some(2));
    }

    #[test]
    fn test_from_values_rejects_scalars() {
        let err = VecSource::from_values(vec![json!({"a": 1}), json!(3)]).unwrap_err();
        assert_eq!(err.code(), "ERR_ROW_INVALID");
    }

    #[test]
    fn test_fn_source() {
        let source = FnSource::new(|| {
            Ok((0..3).map(|i| {
                let mut row = Row::new();
                row.insert("i".to_string(), json!(i));
                Ok(row)
            }))
        });
        assert_eq!(source.open().unwrap().count(), 3);
    }
}
