/// Result merging for statements executed on several nodes

use crate::error::{ShardGateError, ShardGateResult};
use crate::protocol::{ColumnType, OkPacket, QueryResult, ResultSet, Row};
use crate::sql::{SortKey, Statement};
use bytes::Bytes;
use std::cmp::Ordering;

/// Combine per-node results of one statement, given in node-list order
pub fn merge_results(results: Vec<QueryResult>, statement: &Statement) -> ShardGateResult<QueryResult> {
    if results.iter().all(|r| matches!(r, QueryResult::Ok(_))) {
        let oks = results
            .into_iter()
            .filter_map(|r| match r {
                QueryResult::Ok(ok) => Some(ok),
                QueryResult::Rows(_) => None,
            })
            .collect();
        return Ok(QueryResult::Ok(merge_exec(oks)));
    }

    let mut sets = Vec::with_capacity(results.len());
    for result in results {
        match result {
            QueryResult::Rows(rows) => sets.push(rows),
            QueryResult::Ok(_) => {
                return Err(ShardGateError::merge(
                    "nodes returned both result sets and OK packets",
                ))
            }
        }
    }
    merge_select(sets, statement).map(QueryResult::Rows)
}

/// Sum affected rows, OR status flags and keep the smallest non-zero
/// insert id.
pub fn merge_exec(results: Vec<OkPacket>) -> OkPacket {
    let mut merged = OkPacket::default();
    for ok in results {
        merged.affected_rows = merged.affected_rows.saturating_add(ok.affected_rows);
        merged.status |= ok.status;
        merged.warnings = merged.warnings.saturating_add(ok.warnings);
        if ok.last_insert_id != 0
            && (merged.last_insert_id == 0 || ok.last_insert_id < merged.last_insert_id)
        {
            merged.last_insert_id = ok.last_insert_id;
        }
    }
    merged
}

/// Concatenate rows in node order, then apply ORDER BY and LIMIT
pub fn merge_select(results: Vec<ResultSet>, statement: &Statement) -> ShardGateResult<ResultSet> {
    let mut results = results.into_iter();
    let mut merged = results
        .next()
        .ok_or_else(|| ShardGateError::merge("no result sets to merge"))?;

    for next in results {
        check_fields(&merged, &next)?;
        merged.status |= next.status;
        merged.rows.extend(next.rows);
    }

    if !statement.order_by.is_empty() {
        sort_rows(&mut merged, statement)?;
    }

    if let Some(limit) = &statement.limit {
        let (offset, count) = limit.bounds()?;
        let len = merged.rows.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start
            .saturating_add(usize::try_from(count).unwrap_or(usize::MAX))
            .min(len);
        merged.rows.truncate(end);
        merged.rows.drain(..start);
    }

    Ok(merged)
}

fn check_fields(first: &ResultSet, other: &ResultSet) -> ShardGateResult<()> {
    if first.fields.len() != other.fields.len() {
        return Err(ShardGateError::merge(format!(
            "shards returned {} and {} columns",
            first.fields.len(),
            other.fields.len()
        )));
    }
    for (a, b) in first.fields.iter().zip(&other.fields) {
        if !a.name.eq_ignore_ascii_case(&b.name) {
            return Err(ShardGateError::merge(format!(
                "shards returned different columns '{}' and '{}'",
                a.name, b.name
            )));
        }
    }
    Ok(())
}

struct SortColumn {
    index: usize,
    kind: Option<ColumnType>,
    descending: bool,
}

fn sort_rows(result: &mut ResultSet, statement: &Statement) -> ShardGateResult<()> {
    let mut columns = Vec::with_capacity(statement.order_by.len());
    for item in &statement.order_by {
        let index = match &item.key {
            SortKey::Column(name) | SortKey::Expr(name) => result.column_index(name),
            SortKey::Position(position) => Some(position - 1).filter(|i| *i < result.fields.len()),
        }
        .ok_or_else(|| {
            ShardGateError::merge(format!("ORDER BY {:?} is not in the select list", item.key))
        })?;
        columns.push(SortColumn {
            index,
            kind: result.fields[index].kind(),
            descending: item.descending,
        });
    }

    result.rows.sort_by(|a, b| compare_rows(a, b, &columns));
    Ok(())
}

fn compare_rows(a: &Row, b: &Row, columns: &[SortColumn]) -> Ordering {
    for column in columns {
        let left = a.get(column.index).and_then(Option::as_ref);
        let right = b.get(column.index).and_then(Option::as_ref);
        let ordering = compare_values(left, right, column.kind);
        let ordering = if column.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// NULL sorts before every value
fn compare_values(a: Option<&Bytes>, b: Option<&Bytes>, kind: Option<ColumnType>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match kind {
            Some(kind) if kind.is_integer() => compare_integers(a, b),
            Some(kind) if kind.is_fractional() => compare_floats(a, b),
            _ => a.cmp(b),
        },
    }
}

fn compare_integers(a: &[u8], b: &[u8]) -> Ordering {
    match (btoi::btoi::<i64>(a), btoi::btoi::<i64>(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => match (btoi::btou::<u64>(a), btoi::btou::<u64>(b)) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            // one negative, one beyond i64
            (Err(_), Ok(_)) => Ordering::Less,
            (Ok(_), Err(_)) => Ordering::Greater,
            _ => a.cmp(b),
        },
    }
}

fn compare_floats(a: &[u8], b: &[u8]) -> Ordering {
    let parse = |v: &[u8]| std::str::from_utf8(v).ok().and_then(|s| s.trim().parse::<f64>().ok());
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Field;
    use crate::sql::analyze;

    fn int_field(name: &str) -> Field {
        let mut field = Field::text(name);
        field.column_type = ColumnType::LongLong as u8;
        field
    }

    fn result(ids: &[Option<i64>]) -> ResultSet {
        let mut rs = ResultSet::new(vec![int_field("id"), Field::text("name")]);
        rs.rows = ids
            .iter()
            .map(|id| {
                vec![
                    id.map(|v| Bytes::from(v.to_string())),
                    Some(Bytes::from(format!("n{}", id.unwrap_or(0)))),
                ]
            })
            .collect();
        rs
    }

    fn ids(rs: &ResultSet) -> Vec<Option<i64>> {
        rs.rows
            .iter()
            .map(|row| row[0].as_ref().map(|v| btoi::btoi::<i64>(v).unwrap()))
            .collect()
    }

    #[test]
    fn test_merge_exec() {
        let merged = merge_exec(vec![
            OkPacket {
                affected_rows: 2,
                last_insert_id: 0,
                status: 0x0002,
                ..Default::default()
            },
            OkPacket {
                affected_rows: 3,
                last_insert_id: 5,
                status: 0x0001,
                ..Default::default()
            },
        ]);
        assert_eq!(merged.affected_rows, 5);
        assert_eq!(merged.last_insert_id, 5);
        assert_eq!(merged.status, 0x0003);

        let merged = merge_exec(vec![
            OkPacket {
                last_insert_id: 9,
                ..Default::default()
            },
            OkPacket {
                last_insert_id: 4,
                ..Default::default()
            },
        ]);
        assert_eq!(merged.last_insert_id, 4);
    }

    #[test]
    fn test_merge_exec_saturates_affected_rows() {
        let huge = OkPacket {
            affected_rows: u64::MAX - 1,
            ..Default::default()
        };
        let small = OkPacket {
            affected_rows: 7,
            ..Default::default()
        };
        let merged = merge_exec(vec![huge, small]);
        assert_eq!(merged.affected_rows, u64::MAX);
    }

    #[test]
    fn test_merge_select_concatenates_in_node_order() {
        let statement = analyze("SELECT id, name FROM users").unwrap();
        let merged = merge_select(
            vec![result(&[Some(3), Some(1)]), result(&[Some(4), Some(2)])],
            &statement,
        )
        .unwrap();
        assert_eq!(ids(&merged), vec![Some(3), Some(1), Some(4), Some(2)]);
    }

    #[test]
    fn test_merge_select_order_and_limit() {
        let statement = analyze("SELECT id, name FROM users ORDER BY id ASC LIMIT 1,2").unwrap();
        let merged = merge_select(
            vec![result(&[Some(3), Some(1)]), result(&[Some(4), Some(2)])],
            &statement,
        )
        .unwrap();
        assert_eq!(ids(&merged), vec![Some(2), Some(3)]);
    }

    #[test]
    fn test_numeric_sort_and_nulls() {
        let statement = analyze("SELECT id, name FROM users ORDER BY 1").unwrap();
        let merged = merge_select(
            vec![result(&[Some(10), None]), result(&[Some(9), Some(-1)])],
            &statement,
        )
        .unwrap();
        assert_eq!(ids(&merged), vec![None, Some(-1), Some(9), Some(10)]);

        let statement = analyze("SELECT id, name FROM users ORDER BY id DESC").unwrap();
        let merged = merge_select(
            vec![result(&[Some(10), None]), result(&[Some(9), Some(-1)])],
            &statement,
        )
        .unwrap();
        assert_eq!(ids(&merged), vec![Some(10), Some(9), Some(-1), None]);
    }

    #[test]
    fn test_limit_clamps_to_available_rows() {
        let statement = analyze("SELECT id, name FROM users LIMIT 3, 100").unwrap();
        let merged =
            merge_select(vec![result(&[Some(1), Some(2)]), result(&[Some(3), Some(4)])], &statement)
                .unwrap();
        assert_eq!(ids(&merged), vec![Some(4)]);

        let statement = analyze("SELECT id, name FROM users LIMIT 10, 1").unwrap();
        let merged = merge_select(vec![result(&[Some(1)])], &statement).unwrap();
        assert!(merged.rows.is_empty());
    }

    #[test]
    fn test_invalid_limit_and_order_by() {
        let statement = analyze("SELECT id, name FROM users LIMIT -1").unwrap();
        let err = merge_select(vec![result(&[Some(1)])], &statement).unwrap_err();
        assert!(matches!(err, ShardGateError::Merge { .. }));

        let statement = analyze("SELECT id, name FROM users ORDER BY missing").unwrap();
        let err = merge_select(vec![result(&[Some(1)])], &statement).unwrap_err();
        assert!(matches!(err, ShardGateError::Merge { .. }));

        let statement = analyze("SELECT id, name FROM users ORDER BY 5").unwrap();
        assert!(merge_select(vec![result(&[Some(1)])], &statement).is_err());
    }

    #[test]
    fn test_field_mismatch_is_rejected() {
        let statement = analyze("SELECT * FROM users").unwrap();
        let other = ResultSet::new(vec![int_field("id")]);
        assert!(merge_select(vec![result(&[Some(1)]), other], &statement).is_err());

        let renamed = ResultSet::new(vec![int_field("ID"), Field::text("other")]);
        assert!(merge_select(vec![result(&[Some(1)]), renamed], &statement).is_err());

        let same = ResultSet::new(vec![int_field("ID"), Field::text("NAME")]);
        assert!(merge_select(vec![result(&[Some(1)]), same], &statement).is_ok());
    }

    #[test]
    fn test_mixed_results_are_rejected() {
        let statement = analyze("SELECT * FROM users").unwrap();
        let err = merge_results(
            vec![
                QueryResult::Rows(result(&[Some(1)])),
                QueryResult::Ok(OkPacket::default()),
            ],
            &statement,
        )
        .unwrap_err();
        assert!(matches!(err, ShardGateError::Merge { .. }));
    }
}
