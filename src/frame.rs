// src/frame.rs

use serde_json::Value;
use std::collections::HashMap;

use crate::fetch::Record;

/// Column-ordered, string-typed table built from fetched records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Frame {
    /// Columns appear in the order they are first seen; absent keys are null.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for rec in records {
            for key in rec.keys() {
                if !index.contains_key(key) {
                    index.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|rec| {
                let mut row = vec![None; columns.len()];
                for (key, value) in rec {
                    row[index[key]] = cell_text(value);
                }
                row
            })
            .collect();

        Self { columns, rows }
    }

    /// Rows shorter than `columns` are padded with nulls.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, None);
                r
            })
            .collect();
        Self { columns, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// `(rows, columns)`
    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows(), self.num_columns())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let idx = self.column_index(name)?;
        Some(self.column_at(idx).collect())
    }

    pub fn column_at(&self, idx: usize) -> impl Iterator<Item = Option<&str>> + '_ {
        self.rows.iter().map(move |r| r[idx].as_deref())
    }

    pub fn null_count(&self, name: &str) -> Option<usize> {
        let idx = self.column_index(name)?;
        Some(self.column_at(idx).filter(|v| v.is_none()).count())
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // e.g. `geolocation: {"latitude": .., "longitude": ..}`
        nested => Some(nested.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn union_of_columns_in_first_seen_order() {
        let records = vec![
            rec(json!({"year": "2020", "topic": "Stress"})),
            rec(json!({"year": "2021", "data_value": "3.2"})),
        ];
        let f = Frame::from_records(&records);
        assert_eq!(f.columns(), &["year", "topic", "data_value"]);
        assert_eq!(f.shape(), (2, 3));
        assert_eq!(f.column("topic").unwrap(), vec![Some("Stress"), None]);
        assert_eq!(f.null_count("data_value"), Some(1));
        assert_eq!(f.null_count("nope"), None);
    }

    #[test]
    fn scalars_and_nested_values_become_text() {
        let records = vec![rec(json!({
            "sample_size": 1200,
            "flag": true,
            "missing": null,
            "geolocation": {"latitude": "37.6", "longitude": "-120.9"}
        }))];
        let f = Frame::from_records(&records);
        assert_eq!(f.column("sample_size").unwrap(), vec![Some("1200")]);
        assert_eq!(f.column("flag").unwrap(), vec![Some("true")]);
        assert_eq!(f.column("missing").unwrap(), vec![None]);
        let geo = f.column("geolocation").unwrap()[0].unwrap().to_string();
        assert!(geo.contains("\"latitude\":\"37.6\""));
    }

    #[test]
    fn from_rows_pads_short_rows() {
        let f = Frame::from_rows(
            vec!["a".into(), "b".into()],
            vec![vec![Some("1".into())], vec![Some("2".into()), Some("x".into())]],
        );
        assert_eq!(f.column("b").unwrap(), vec![None, Some("x")]);
    }

    #[test]
    fn empty_frame() {
        let f = Frame::from_records(&[]);
        assert_eq!(f.shape(), (0, 0));
    }
}
