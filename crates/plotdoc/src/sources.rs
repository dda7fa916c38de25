//! Columnar data operations.
//!
//! A column data source holds a mapping of column name to an equal-length
//! column (a list, a typed array or a 1-d nd-array). Streaming appends rows
//! and optionally discards the oldest ones; patching overwrites cells, ranges
//! of cells, or sub-regions of multi-dimensional cells.
//!
//! All operations validate every input before mutating, so a failed call
//! leaves the columns untouched.

use std::collections::BTreeSet;

use crate::events::{ColumnData, ColumnPatches};
use crate::value::{NdArray, Slice, Value};

#[derive(Debug, thiserror::Error)]
pub enum ColumnError {
    #[error("must stream updates to all existing columns (missing: {})", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("must stream updates to all existing columns (extra: {})", .0.join(", "))]
    ExtraColumns(Vec<String>),
    #[error("all streaming column updates must be the same length")]
    LengthMismatch,
    #[error("can only patch existing columns (extra: {0})")]
    UnknownColumn(String),
    #[error("column '{0}' is not a sequence")]
    NotAColumn(String),
    #[error("out-of-bounds index ({index}) in patch for column: {column}")]
    OutOfBounds { column: String, index: i64 },
    #[error("invalid patch for column '{column}': {reason}")]
    InvalidPatch { column: String, reason: String },
    #[error("incompatible values for column '{0}'")]
    Incompatible(String),
}

// ── Stream ──────────────────────────────────────────────────────────────────

/// Appends `new` to `columns`, then keeps at most `rollover` rows.
///
/// A rollover of zero is treated as unbounded.
pub fn stream_columns(
    columns: &mut ColumnData,
    new: &ColumnData,
    rollover: Option<usize>,
) -> Result<(), ColumnError> {
    if !columns.is_empty() {
        let old: BTreeSet<&str> = columns.keys().map(String::as_str).collect();
        let fresh: BTreeSet<&str> = new.keys().map(String::as_str).collect();
        let missing: Vec<String> = old.difference(&fresh).map(|s| s.to_string()).collect();
        let extra: Vec<String> = fresh.difference(&old).map(|s| s.to_string()).collect();
        if !missing.is_empty() {
            return Err(ColumnError::MissingColumns(missing));
        }
        if !extra.is_empty() {
            return Err(ColumnError::ExtraColumns(extra));
        }
    }

    let mut lengths = BTreeSet::new();
    for (name, values) in new {
        if let Value::NdArray(nd) = values {
            if nd.shape.len() != 1 {
                return Err(ColumnError::Incompatible(name.clone()));
            }
        }
        lengths.insert(values.column_len().ok_or_else(|| ColumnError::NotAColumn(name.clone()))?);
    }
    if lengths.len() > 1 {
        return Err(ColumnError::LengthMismatch);
    }

    let mut staged = Vec::with_capacity(new.len());
    for (name, values) in new {
        let column = match columns.get(name) {
            Some(current) => append(name, current, values)?,
            None => values.clone(),
        };
        staged.push((name.clone(), roll(column, rollover)));
    }
    for (name, column) in staged {
        columns.insert(name, column);
    }
    Ok(())
}

fn flatten(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(items) => Some(items.clone()),
        Value::TypedArray(array) => Some(array.to_values()),
        Value::NdArray(nd) => Some(nd.array.to_values()),
        _ => None,
    }
}

fn append(name: &str, current: &Value, new: &Value) -> Result<Value, ColumnError> {
    let incoming = flatten(new).ok_or_else(|| ColumnError::NotAColumn(name.to_owned()))?;
    let incompatible = || ColumnError::Incompatible(name.to_owned());
    match current {
        Value::List(items) => {
            let mut items = items.clone();
            items.extend(incoming);
            Ok(Value::List(items))
        }
        Value::TypedArray(array) => {
            let mut array = array.clone();
            if !array.extend(&incoming) {
                return Err(incompatible());
            }
            Ok(Value::TypedArray(array))
        }
        Value::NdArray(nd) if nd.shape.len() == 1 => {
            let mut array = nd.array.clone();
            if !array.extend(&incoming) {
                return Err(incompatible());
            }
            let len = array.len();
            Ok(Value::NdArray(NdArray::new(array, vec![len])))
        }
        Value::NdArray(_) => Err(incompatible()),
        _ => Err(ColumnError::NotAColumn(name.to_owned())),
    }
}

fn roll(column: Value, rollover: Option<usize>) -> Value {
    let Some(limit) = rollover.filter(|&n| n > 0) else {
        return column;
    };
    let len = column.column_len().unwrap_or(0);
    if len <= limit {
        return column;
    }
    let excess = len - limit;
    match column {
        Value::List(mut items) => {
            items.drain(..excess);
            Value::List(items)
        }
        Value::TypedArray(mut array) => {
            array.drain_front(excess);
            Value::TypedArray(array)
        }
        Value::NdArray(mut nd) => {
            nd.array.drain_front(excess * nd.row_size());
            nd.shape[0] = limit;
            Value::NdArray(nd)
        }
        other => other,
    }
}

// ── Patch ───────────────────────────────────────────────────────────────────

/// Applies `(index, value)` patches to existing columns.
///
/// An index is a row (`Int`), a range of rows (`Slice`, values given as a
/// sequence), or `[row, i, j]` addressing a sub-region of a 1-d or 2-d cell
/// (values given flattened in row-major order).
pub fn patch_columns(columns: &mut ColumnData, patches: &ColumnPatches) -> Result<(), ColumnError> {
    if let Some(extra) = patches.keys().find(|k| !columns.contains_key(*k)) {
        return Err(ColumnError::UnknownColumn(extra.clone()));
    }

    let mut staged = Vec::with_capacity(patches.len());
    for (name, items) in patches {
        let mut column = columns[name].clone();
        for (index, value) in items {
            patch_one(name, &mut column, index, value)?;
        }
        staged.push((name.clone(), column));
    }
    for (name, column) in staged {
        columns.insert(name, column);
    }
    Ok(())
}

fn invalid(column: &str, reason: impl Into<String>) -> ColumnError {
    ColumnError::InvalidPatch {
        column: column.to_owned(),
        reason: reason.into(),
    }
}

fn row_index(name: &str, index: i64, len: usize) -> Result<usize, ColumnError> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| ColumnError::OutOfBounds {
            column: name.to_owned(),
            index,
        })
}

fn slice_indices(name: &str, slice: &Slice, len: usize) -> Result<Vec<usize>, ColumnError> {
    let negative = [slice.start, slice.stop, slice.step]
        .into_iter()
        .flatten()
        .any(|v| v < 0);
    if negative {
        return Err(invalid(name, "negative slice bounds are not supported"));
    }
    if let (Some(start), Some(stop)) = (slice.start, slice.stop) {
        if start > stop {
            return Err(invalid(name, "slice start is greater than stop"));
        }
    }
    if let Some(stop) = slice.stop {
        if stop as usize > len {
            return Err(ColumnError::OutOfBounds {
                column: name.to_owned(),
                index: stop,
            });
        }
    }
    slice
        .indices(len)
        .ok_or_else(|| invalid(name, "slice step must be positive"))
}

/// Resolves a single sub-index (an integer or a slice) against an axis.
fn axis_indices(name: &str, index: &Value, len: usize) -> Result<Vec<usize>, ColumnError> {
    match index {
        Value::Slice(slice) => slice_indices(name, slice, len),
        other => match other.as_i64() {
            Some(i) => Ok(vec![row_index(name, i, len)?]),
            None => Err(invalid(name, format!("invalid sub-index {}", other.type_name()))),
        },
    }
}

/// The replacement values for `count` positions.
fn values_for(name: &str, value: &Value, count: usize) -> Result<Vec<Value>, ColumnError> {
    let values = match flatten(value) {
        Some(values) => values,
        None if count == 1 => vec![value.clone()],
        None => return Err(invalid(name, "expected a sequence of new values")),
    };
    if values.len() != count {
        return Err(invalid(
            name,
            format!("expected {count} new values, got {}", values.len()),
        ));
    }
    Ok(values)
}

fn set_item(name: &str, column: &mut Value, row: usize, value: &Value) -> Result<(), ColumnError> {
    let ok = match column {
        Value::List(items) => {
            items[row] = value.clone();
            true
        }
        Value::TypedArray(array) => array.set(row, value),
        Value::NdArray(nd) if nd.shape.len() == 1 => nd.array.set(row, value),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ColumnError::Incompatible(name.to_owned()))
    }
}

fn patch_one(name: &str, column: &mut Value, index: &Value, value: &Value) -> Result<(), ColumnError> {
    let len = column
        .column_len()
        .ok_or_else(|| ColumnError::NotAColumn(name.to_owned()))?;
    match index {
        Value::Slice(slice) => {
            let rows = slice_indices(name, slice, len)?;
            let values = values_for(name, value, rows.len())?;
            for (row, v) in rows.into_iter().zip(&values) {
                set_item(name, column, row, v)?;
            }
            Ok(())
        }
        Value::List(multi) => patch_cell(name, column, multi, value),
        other => match other.as_i64() {
            Some(i) => {
                let row = row_index(name, i, len)?;
                set_item(name, column, row, value)
            }
            None => Err(invalid(name, format!("invalid index {}", other.type_name()))),
        },
    }
}

fn patch_cell(name: &str, column: &mut Value, multi: &[Value], value: &Value) -> Result<(), ColumnError> {
    let (first, rest) = match multi.split_first() {
        Some((first, rest)) if !rest.is_empty() => (first, rest),
        _ => return Err(invalid(name, "multi-index must contain more than one sub-index")),
    };
    let row = match first {
        Value::Int(i) => *i,
        _ => return Err(invalid(name, "initial sub-index may only be an integer")),
    };
    let Value::List(items) = column else {
        return Err(invalid(name, "sub-region patches need a column of arrays"));
    };
    let row = row_index(name, row, items.len())?;
    let cell = &mut items[row];

    match (cell, rest) {
        (Value::NdArray(nd), [i, j]) if nd.shape.len() == 2 => {
            let (height, width) = (nd.shape[0], nd.shape[1]);
            let rows = axis_indices(name, i, height)?;
            let cols = axis_indices(name, j, width)?;
            let values = values_for(name, value, rows.len() * cols.len())?;
            let mut values = values.iter();
            for r in &rows {
                for c in &cols {
                    let v = values.next().unwrap_or(&Value::Null);
                    if !nd.array.set(r * width + c, v) {
                        return Err(ColumnError::Incompatible(name.to_owned()));
                    }
                }
            }
            Ok(())
        }
        (Value::List(grid), [i, j]) => {
            let rows = axis_indices(name, i, grid.len())?;
            let mut targets = Vec::new();
            for &r in &rows {
                let width = grid[r]
                    .column_len()
                    .ok_or_else(|| invalid(name, "cell rows must be sequences"))?;
                for c in axis_indices(name, j, width)? {
                    targets.push((r, c));
                }
            }
            let values = values_for(name, value, targets.len())?;
            for ((r, c), v) in targets.into_iter().zip(&values) {
                set_item(name, &mut grid[r], c, v)?;
            }
            Ok(())
        }
        (cell, [i]) => {
            let len = cell
                .column_len()
                .ok_or_else(|| invalid(name, "cell is not a sequence"))?;
            let targets = axis_indices(name, i, len)?;
            let values = values_for(name, value, targets.len())?;
            for (c, v) in targets.into_iter().zip(&values) {
                set_item(name, cell, c, v)?;
            }
            Ok(())
        }
        _ => Err(invalid(name, "unsupported sub-index depth")),
    }
}

// ── Sparse replace ──────────────────────────────────────────────────────────

/// Replaces columns with `data`. When `cols` is given, columns absent from
/// `data` are carried over from `current`.
pub fn merge_sparse(current: &ColumnData, mut data: ColumnData, cols: Option<&[String]>) -> ColumnData {
    if cols.is_some() {
        for (name, column) in current {
            if !data.contains_key(name) {
                data.insert(name.clone(), column.clone());
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DType, TypedArray};

    fn cols(entries: Vec<(&str, Value)>) -> ColumnData {
        entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    #[test]
    fn stream_appends_and_rolls_over() {
        let mut data = cols(vec![
            ("x", Value::list([1, 2, 3])),
            ("y", Value::TypedArray(TypedArray::from_f64s(&[1.0, 2.0, 3.0]))),
        ]);
        let new = cols(vec![
            ("x", Value::list([4, 5])),
            ("y", Value::TypedArray(TypedArray::from_f64s(&[4.0, 5.0]))),
        ]);
        stream_columns(&mut data, &new, Some(4)).unwrap();
        assert_eq!(data["x"], Value::list([2, 3, 4, 5]));
        assert_eq!(
            data["y"],
            Value::TypedArray(TypedArray::from_f64s(&[2.0, 3.0, 4.0, 5.0]))
        );
    }

    #[test]
    fn stream_requires_all_columns() {
        let mut data = cols(vec![("x", Value::list([1])), ("y", Value::list([2]))]);
        let err = stream_columns(&mut data, &cols(vec![("x", Value::list([3]))]), None).unwrap_err();
        assert!(matches!(err, ColumnError::MissingColumns(m) if m == vec!["y".to_owned()]));

        let err = stream_columns(
            &mut data,
            &cols(vec![
                ("x", Value::list([3])),
                ("y", Value::list([4])),
                ("z", Value::list([5])),
            ]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ColumnError::ExtraColumns(_)));
        assert_eq!(data["x"], Value::list([1]));
    }

    #[test]
    fn stream_rejects_ragged_updates() {
        let mut data = cols(vec![("x", Value::list([1])), ("y", Value::list([2]))]);
        let err = stream_columns(
            &mut data,
            &cols(vec![("x", Value::list([3, 4])), ("y", Value::list([5]))]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ColumnError::LengthMismatch));
    }

    #[test]
    fn patch_by_index_and_slice() {
        let mut data = cols(vec![
            ("foo", Value::list([10, 20, 30])),
            ("bar", Value::list([100, 200, 300])),
        ]);
        let mut patches = ColumnPatches::new();
        patches.insert(
            "foo".into(),
            vec![(
                Value::Slice(Slice::new(None, Some(2), None)),
                Value::list([11, 12]),
            )],
        );
        patches.insert(
            "bar".into(),
            vec![(Value::Int(0), Value::Int(101)), (Value::Int(2), Value::Int(301))],
        );
        patch_columns(&mut data, &patches).unwrap();
        assert_eq!(data["foo"], Value::list([11, 12, 30]));
        assert_eq!(data["bar"], Value::list([101, 200, 301]));
    }

    #[test]
    fn patch_slice_with_huge_step_touches_one_row() {
        let mut data = cols(vec![("foo", Value::list([1, 2, 3]))]);
        let mut patches = ColumnPatches::new();
        patches.insert(
            "foo".into(),
            vec![(
                Value::Slice(Slice::new(Some(1), None, Some(i64::MAX))),
                Value::list([5]),
            )],
        );
        patch_columns(&mut data, &patches).unwrap();
        assert_eq!(data["foo"], Value::list([1, 5, 3]));
    }

    #[test]
    fn patch_out_of_bounds_leaves_data_untouched() {
        let mut data = cols(vec![("foo", Value::list([1, 2]))]);
        let mut patches = ColumnPatches::new();
        patches.insert(
            "foo".into(),
            vec![(Value::Int(0), Value::Int(9)), (Value::Int(5), Value::Int(9))],
        );
        let err = patch_columns(&mut data, &patches).unwrap_err();
        assert!(matches!(err, ColumnError::OutOfBounds { index: 5, .. }));
        assert_eq!(data["foo"], Value::list([1, 2]));
    }

    #[test]
    fn patch_sub_region_of_image_cell() {
        let image = NdArray::new(TypedArray::from_f64s(&[0.0; 6]), vec![2, 3]);
        let mut data = cols(vec![("image", Value::List(vec![Value::NdArray(image)]))]);
        let mut patches = ColumnPatches::new();
        patches.insert(
            "image".into(),
            vec![(
                Value::list([
                    Value::Int(0),
                    Value::Slice(Slice::default()),
                    Value::Int(2),
                ]),
                Value::list([7.0, 8.0]),
            )],
        );
        patch_columns(&mut data, &patches).unwrap();
        let Value::NdArray(nd) = &data["image"].as_list().unwrap()[0] else {
            panic!("expected ndarray cell");
        };
        assert_eq!(nd.array.dtype(), DType::Float64);
        assert_eq!(
            nd.array.to_values(),
            vec![0.0, 0.0, 7.0, 0.0, 0.0, 8.0]
                .into_iter()
                .map(Value::Float)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn patch_unknown_column_fails() {
        let mut data = cols(vec![("a", Value::list([1]))]);
        let mut patches = ColumnPatches::new();
        patches.insert("b".into(), vec![(Value::Int(0), Value::Int(1))]);
        assert!(matches!(
            patch_columns(&mut data, &patches),
            Err(ColumnError::UnknownColumn(c)) if c == "b"
        ));
    }

    #[test]
    fn sparse_merge_keeps_unmentioned_columns() {
        let current = cols(vec![("a", Value::list([1, 2])), ("b", Value::list([3, 4]))]);
        let data = cols(vec![("a", Value::list([9, 9]))]);
        let cols_ = vec!["a".to_owned()];
        let merged = merge_sparse(&current, data.clone(), Some(&cols_));
        assert_eq!(merged["a"], Value::list([9, 9]));
        assert_eq!(merged["b"], Value::list([3, 4]));
        assert!(!merge_sparse(&current, data, None).contains_key("b"));
    }
}
