/// Server-side prepared statements
///
/// Statements are kept as text. On execute the binary parameters are rendered
/// as SQL literals and substituted for the `?` markers, so an executed
/// statement takes the same routing path as a plain query.

use crate::error::{ServerError, ShardGateError, ShardGateResult};
use crate::protocol::codes::ER_UNKNOWN_STMT_HANDLER;
use crate::protocol::{ColumnType, Field, PayloadReader};
use crate::sql::{bind_placeholders, count_placeholders};
use crate::utils::quote_string;
use bytes::BytesMut;
use fnv::FnvHashMap;

/// Unsigned flag in the high byte of a parameter type
const UNSIGNED_FLAG: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub sql: String,
    pub params: u16,
    /// (type, flags) sent with the last execute that bound new types
    param_types: Vec<(u8, u8)>,
    long_data: FnvHashMap<u16, BytesMut>,
}

/// Prepared statements of one session
#[derive(Debug, Default)]
pub struct StatementTable {
    last_id: u32,
    statements: FnvHashMap<u32, PreparedStatement>,
}

impl StatementTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn prepare(&mut self, sql: &str) -> ShardGateResult<&PreparedStatement> {
        let params = u16::try_from(count_placeholders(sql)?)
            .map_err(|_| ShardGateError::syntax("too many placeholders"))?;
        self.last_id = self.last_id.wrapping_add(1).max(1);
        let id = self.last_id;
        let statement = PreparedStatement {
            id,
            sql: sql.to_string(),
            params,
            param_types: Vec::new(),
            long_data: FnvHashMap::default(),
        };
        Ok(self.statements.entry(id).or_insert(statement))
    }

    pub fn get(&self, id: u32) -> ShardGateResult<&PreparedStatement> {
        self.statements.get(&id).ok_or_else(|| unknown_statement(id))
    }

    /// COM_STMT_CLOSE
    pub fn close(&mut self, payload: &[u8]) -> ShardGateResult<()> {
        let id = PayloadReader::new(payload).read_u32_le()?;
        self.statements.remove(&id);
        Ok(())
    }

    /// COM_STMT_RESET drops buffered long data
    pub fn reset(&mut self, payload: &[u8]) -> ShardGateResult<()> {
        let id = PayloadReader::new(payload).read_u32_le()?;
        let statement = self.statements.get_mut(&id).ok_or_else(|| unknown_statement(id))?;
        statement.long_data.clear();
        Ok(())
    }

    /// COM_STMT_SEND_LONG_DATA takes no reply, so problems are only logged
    pub fn send_long_data(&mut self, payload: &[u8]) {
        let mut reader = PayloadReader::new(payload);
        let (id, param) = match (reader.read_u32_le(), reader.read_u16_le()) {
            (Ok(id), Ok(param)) => (id, param),
            _ => {
                log::debug!("Ignoring truncated COM_STMT_SEND_LONG_DATA");
                return;
            }
        };
        match self.statements.get_mut(&id) {
            Some(statement) if param < statement.params => {
                statement
                    .long_data
                    .entry(param)
                    .or_default()
                    .extend_from_slice(reader.read_rest());
            }
            _ => log::debug!("Ignoring long data for statement {} parameter {}", id, param),
        }
    }

    /// Decode a COM_STMT_EXECUTE payload into the statement text to run
    pub fn bind(&mut self, payload: &[u8]) -> ShardGateResult<String> {
        let mut reader = PayloadReader::new(payload);
        let id = reader.read_u32_le()?;
        let statement = self.statements.get_mut(&id).ok_or_else(|| unknown_statement(id))?;
        let _flags = reader.read_u8()?;
        let _iterations = reader.read_u32_le()?;

        let params = statement.params as usize;
        if params == 0 {
            return Ok(statement.sql.clone());
        }

        let null_bitmap = reader.read_bytes((params + 7) / 8)?;
        if reader.read_u8()? == 1 {
            statement.param_types = (0..params)
                .map(|_| -> ShardGateResult<(u8, u8)> { Ok((reader.read_u8()?, reader.read_u8()?)) })
                .collect::<ShardGateResult<Vec<_>>>()?;
        }
        if statement.param_types.len() != params {
            return Err(ShardGateError::protocol(format!(
                "statement {} executed without parameter types",
                id
            )));
        }

        let mut values = Vec::with_capacity(params);
        for (index, &(column_type, flags)) in statement.param_types.iter().enumerate() {
            if null_bitmap[index / 8] & (1 << (index % 8)) != 0 {
                values.push("NULL".to_string());
                continue;
            }
            if let Some(data) = statement.long_data.get(&(index as u16)) {
                values.push(quote_string(data));
                continue;
            }
            values.push(read_param(&mut reader, column_type, flags & UNSIGNED_FLAG != 0)?);
        }
        statement.long_data.clear();

        bind_placeholders(&statement.sql, &values)
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }
}

fn unknown_statement(id: u32) -> ShardGateError {
    ServerError::new(
        ER_UNKNOWN_STMT_HANDLER,
        "HY000",
        format!("Unknown prepared statement handler ({}) given to mysqld_stmt_execute", id),
    )
    .into()
}

/// Render one binary-protocol parameter as a SQL literal
fn read_param(reader: &mut PayloadReader<'_>, column_type: u8, unsigned: bool) -> ShardGateResult<String> {
    let value = match ColumnType::from_u8(column_type) {
        Some(ColumnType::Null) => "NULL".to_string(),
        Some(ColumnType::Tiny) => {
            let v = reader.read_u8()?;
            if unsigned {
                v.to_string()
            } else {
                (v as i8).to_string()
            }
        }
        Some(ColumnType::Short) | Some(ColumnType::Year) => {
            let v = reader.read_u16_le()?;
            if unsigned {
                v.to_string()
            } else {
                (v as i16).to_string()
            }
        }
        Some(ColumnType::Long) | Some(ColumnType::Int24) => {
            let v = reader.read_u32_le()?;
            if unsigned {
                v.to_string()
            } else {
                (v as i32).to_string()
            }
        }
        Some(ColumnType::LongLong) => {
            let v = reader.read_u64_le()?;
            if unsigned {
                v.to_string()
            } else {
                (v as i64).to_string()
            }
        }
        Some(ColumnType::Float) => float_literal(f32::from_bits(reader.read_u32_le()?) as f64),
        Some(ColumnType::Double) => float_literal(f64::from_bits(reader.read_u64_le()?)),
        Some(ColumnType::Date) | Some(ColumnType::DateTime) | Some(ColumnType::Timestamp) => {
            datetime_literal(reader, column_type == ColumnType::Date as u8)?
        }
        Some(ColumnType::Time) => time_literal(reader)?,
        _ => {
            let data = reader.read_lenenc_bytes()?;
            data.map_or_else(|| "NULL".to_string(), quote_string)
        }
    };
    Ok(value)
}

fn float_literal(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        "NULL".to_string()
    }
}

fn datetime_literal(reader: &mut PayloadReader<'_>, date_only: bool) -> ShardGateResult<String> {
    let len = reader.read_u8()?;
    let (mut year, mut month, mut day) = (0, 0, 0);
    let (mut hour, mut minute, mut second, mut micros) = (0, 0, 0, 0);
    if len >= 4 {
        year = reader.read_u16_le()?;
        month = reader.read_u8()?;
        day = reader.read_u8()?;
    }
    if len >= 7 {
        hour = reader.read_u8()?;
        minute = reader.read_u8()?;
        second = reader.read_u8()?;
    }
    if len >= 11 {
        micros = reader.read_u32_le()?;
    }

    let date = format!("{:04}-{:02}-{:02}", year, month, day);
    let text = if date_only {
        date
    } else if micros > 0 {
        format!("{} {:02}:{:02}:{:02}.{:06}", date, hour, minute, second, micros)
    } else {
        format!("{} {:02}:{:02}:{:02}", date, hour, minute, second)
    };
    Ok(format!("'{}'", text))
}

fn time_literal(reader: &mut PayloadReader<'_>) -> ShardGateResult<String> {
    let len = reader.read_u8()?;
    let (mut negative, mut days, mut hour, mut minute, mut second, mut micros) = (false, 0u32, 0u8, 0u8, 0u8, 0u32);
    if len >= 8 {
        negative = reader.read_u8()? == 1;
        days = reader.read_u32_le()?;
        hour = reader.read_u8()?;
        minute = reader.read_u8()?;
        second = reader.read_u8()?;
    }
    if len >= 12 {
        micros = reader.read_u32_le()?;
    }

    let hours = days * 24 + hour as u32;
    let sign = if negative { "-" } else { "" };
    let text = if micros > 0 {
        format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, minute, second, micros)
    } else {
        format!("{}{:02}:{:02}:{:02}", sign, hours, minute, second)
    };
    Ok(format!("'{}'", text))
}

/// Column definitions for a binary result: every value is sent as a string
pub fn string_fields(fields: &[Field]) -> Vec<Field> {
    fields
        .iter()
        .map(|field| {
            let mut described = Field::text(&field.name);
            described.schema = field.schema.clone();
            described.table = field.table.clone();
            described.org_table = field.org_table.clone();
            described.org_name = field.org_name.clone();
            described
        })
        .collect()
}
