/// Response packets: OK, ERR, EOF, column definitions and result rows

use super::capability::CLIENT_PROTOCOL_41;
use super::codec::{PayloadReader, PayloadWriter, NULL_VALUE};
use super::header;
use super::DEFAULT_CHARSET;
use crate::error::{ShardGateError, ShardGateResult};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn encode(&self, capabilities: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16 + self.info.len());
        buf.put_u8(header::OK);
        buf.put_lenenc_int(self.affected_rows);
        buf.put_lenenc_int(self.last_insert_id);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status);
            buf.put_u16_le(self.warnings);
        }
        buf.put_slice(self.info.as_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> ShardGateResult<Self> {
        let mut reader = PayloadReader::new(payload);
        reader.skip(1)?;
        let affected_rows = reader.read_lenenc_u64()?;
        let last_insert_id = reader.read_lenenc_u64()?;
        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            ..Default::default()
        };
        if reader.remaining() >= 4 {
            ok.status = reader.read_u16_le()?;
            ok.warnings = reader.read_u16_le()?;
            ok.info = String::from_utf8_lossy(reader.read_rest()).into_owned();
        }
        Ok(ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn new<S: Into<String>>(code: u16, state: &str, message: S) -> Self {
        Self {
            code,
            state: state.to_string(),
            message: message.into(),
        }
    }

    pub fn encode(&self, capabilities: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16 + self.message.len());
        buf.put_u8(header::ERR);
        buf.put_u16_le(self.code);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            let mut state = [b'0'; 5];
            for (dst, src) in state.iter_mut().zip(self.state.bytes()) {
                *dst = src;
            }
            buf.put_slice(&state);
        }
        buf.put_slice(self.message.as_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> ShardGateResult<Self> {
        let mut reader = PayloadReader::new(payload);
        reader.skip(1)?;
        let code = reader.read_u16_le()?;
        let mut state = "HY000".to_string();
        if reader.peek_u8() == Some(b'#') {
            reader.skip(1)?;
            state = String::from_utf8_lossy(reader.read_bytes(5)?).into_owned();
        }
        let message = String::from_utf8_lossy(reader.read_rest()).into_owned();
        Ok(Self {
            code,
            state,
            message,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: u16,
}

impl EofPacket {
    pub fn new(status: u16) -> Self {
        Self {
            warnings: 0,
            status,
        }
    }

    pub fn encode(&self, capabilities: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(header::EOF);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.warnings);
            buf.put_u16_le(self.status);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> ShardGateResult<Self> {
        let mut reader = PayloadReader::new(payload);
        reader.skip(1)?;
        if reader.remaining() >= 4 {
            let warnings = reader.read_u16_le()?;
            let status = reader.read_u16_le()?;
            return Ok(Self { warnings, status });
        }
        Ok(Self::default())
    }
}

/// An EOF packet is 0xfe with a payload shorter than 9 bytes; longer
/// packets starting with 0xfe are length-encoded integers.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&header::EOF) && payload.len() < 9
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&header::ERR)
}

/// Column types as carried in column definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    VarChar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use ColumnType::*;
        let ty = match value {
            0x00 => Decimal,
            0x01 => Tiny,
            0x02 => Short,
            0x03 => Long,
            0x04 => Float,
            0x05 => Double,
            0x06 => Null,
            0x07 => Timestamp,
            0x08 => LongLong,
            0x09 => Int24,
            0x0a => Date,
            0x0b => Time,
            0x0c => DateTime,
            0x0d => Year,
            0x0f => VarChar,
            0x10 => Bit,
            0xf5 => Json,
            0xf6 => NewDecimal,
            0xf7 => Enum,
            0xf8 => Set,
            0xf9 => TinyBlob,
            0xfa => MediumBlob,
            0xfb => LongBlob,
            0xfc => Blob,
            0xfd => VarString,
            0xfe => String,
            0xff => Geometry,
            _ => return None,
        };
        Some(ty)
    }

    /// Integer column types, compared as signed integers when sorting
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Int24
                | ColumnType::Year
        )
    }

    /// Fractional numeric types, compared as floats when sorting
    pub fn is_fractional(self) -> bool {
        matches!(
            self,
            ColumnType::Float | ColumnType::Double | ColumnType::Decimal | ColumnType::NewDecimal
        )
    }
}

/// Column definition (protocol 4.1 layout)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    /// Text column with no table, used for locally answered statements
    pub fn text(name: &str) -> Self {
        Self {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: DEFAULT_CHARSET as u16,
            column_length: 256,
            column_type: ColumnType::VarString as u8,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn kind(&self) -> Option<ColumnType> {
        ColumnType::from_u8(self.column_type)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            32 + self.schema.len() + self.table.len() * 2 + self.name.len() * 2,
        );
        buf.put_lenenc_bytes(self.catalog.as_bytes());
        buf.put_lenenc_bytes(self.schema.as_bytes());
        buf.put_lenenc_bytes(self.table.as_bytes());
        buf.put_lenenc_bytes(self.org_table.as_bytes());
        buf.put_lenenc_bytes(self.name.as_bytes());
        buf.put_lenenc_bytes(self.org_name.as_bytes());
        buf.put_u8(0x0c);
        buf.put_u16_le(self.charset);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);
        buf
    }

    pub fn decode(payload: &[u8]) -> ShardGateResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let catalog = reader.read_lenenc_string()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let org_table = reader.read_lenenc_string()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        // length of the fixed-size block, always 0x0c
        reader.read_lenenc_u64()?;
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = reader.read_u8()?;
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;
        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }
}

/// One text-protocol row; `None` is SQL NULL
pub type Row = Vec<Option<Bytes>>;

pub fn decode_text_row(payload: &Bytes, columns: usize) -> ShardGateResult<Row> {
    let mut reader = PayloadReader::new(payload);
    let mut row = Vec::with_capacity(columns);
    for _ in 0..columns {
        match reader.read_lenenc_bytes()? {
            Some(value) => row.push(Some(payload.slice_ref(value))),
            None => row.push(None),
        }
    }
    Ok(row)
}

pub fn encode_text_row(row: &[Option<Bytes>]) -> BytesMut {
    let len: usize = row
        .iter()
        .map(|v| v.as_ref().map_or(1, |v| v.len() + 9))
        .sum();
    let mut buf = BytesMut::with_capacity(len);
    for value in row {
        match value {
            Some(value) => buf.put_lenenc_bytes(value),
            None => buf.put_u8(NULL_VALUE),
        }
    }
    buf
}

/// Binary-protocol row where every column was announced as a string type.
///
/// Layout: 0x00 header, NULL bitmap with a 2-bit offset, then one
/// length-encoded string per non-NULL column.
pub fn encode_binary_row(row: &[Option<Bytes>]) -> BytesMut {
    let bitmap_len = (row.len() + 7 + 2) / 8;
    let mut bitmap = vec![0u8; bitmap_len];
    let mut values = BytesMut::new();
    for (i, value) in row.iter().enumerate() {
        match value {
            Some(value) => values.put_lenenc_bytes(value),
            None => {
                let bit = i + 2;
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
        }
    }

    let mut buf = BytesMut::with_capacity(1 + bitmap_len + values.len());
    buf.put_u8(header::OK);
    buf.put_slice(&bitmap);
    buf.put_slice(&values);
    buf
}

/// Rows returned by a SELECT-like statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub status: u16,
}

impl ResultSet {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            rows: Vec::new(),
            status: 0,
        }
    }

    /// Single-column text result built from string values
    pub fn from_strings(column: &str, values: &[String]) -> Self {
        let mut result = Self::new(vec![Field::text(column)]);
        result.rows = values
            .iter()
            .map(|v| vec![Some(Bytes::copy_from_slice(v.as_bytes()))])
            .collect();
        result
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| {
            f.name.eq_ignore_ascii_case(name) || f.org_name.eq_ignore_ascii_case(name)
        })
    }
}

/// Outcome of one statement on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Ok(OkPacket),
    Rows(ResultSet),
}

impl QueryResult {
    pub fn status(&self) -> u16 {
        match self {
            QueryResult::Ok(ok) => ok.status,
            QueryResult::Rows(rs) => rs.status,
        }
    }
}

/// Reply to COM_STMT_PREPARE, followed by parameter definitions
pub fn encode_prepare_ok(statement_id: u32, columns: u16, params: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(header::OK);
    buf.put_u32_le(statement_id);
    buf.put_u16_le(columns);
    buf.put_u16_le(params);
    buf.put_u8(0);
    buf.put_u16_le(0);
    buf
}

/// Map an unexpected first byte of a reply to an error
pub fn unexpected_packet(context: &str, payload: &[u8]) -> ShardGateError {
    match payload.first() {
        Some(first) => ShardGateError::protocol(format!(
            "unexpected packet 0x{:02x} while {}",
            first, context
        )),
        None => ShardGateError::protocol(format!("empty packet while {}", context)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capability::DEFAULT_SERVER_CAPABILITY;

    #[test]
    fn test_ok_packet_layout() {
        let ok = OkPacket {
            affected_rows: 5,
            last_insert_id: 300,
            status: 0x0002,
            ..Default::default()
        };
        let payload = ok.encode(DEFAULT_SERVER_CAPABILITY);
        assert_eq!(
            &payload[..],
            &[0x00, 0x05, 0xfc, 0x2c, 0x01, 0x02, 0x00, 0x00, 0x00]
        );
        assert_eq!(OkPacket::decode(&payload).unwrap(), ok);

        // without protocol 4.1 there are no status and warning words
        assert_eq!(ok.encode(0).len(), 5);
    }

    #[test]
    fn test_err_packet_layout() {
        let err = ErrPacket::new(1045, "28000", "Access denied");
        let payload = err.encode(DEFAULT_SERVER_CAPABILITY);
        assert_eq!(&payload[..4], &[0xff, 0x15, 0x04, b'#']);
        assert_eq!(&payload[4..9], b"28000");
        assert_eq!(&payload[9..], b"Access denied");
        assert_eq!(ErrPacket::decode(&payload).unwrap(), err);

        let legacy = err.encode(0);
        assert_eq!(&legacy[3..], b"Access denied");
    }

    #[test]
    fn test_eof_detection() {
        let eof = EofPacket::new(0x0002).encode(DEFAULT_SERVER_CAPABILITY);
        assert!(is_eof_packet(&eof));
        assert_eq!(EofPacket::decode(&eof).unwrap().status, 0x0002);
        // a row starting with an 8-byte length prefix is not an EOF
        let mut row = BytesMut::new();
        row.put_lenenc_int(1 << 32);
        assert!(!is_eof_packet(&row));
    }

    #[test]
    fn test_field_roundtrip() {
        let mut field = Field::text("id");
        field.table = "users".to_string();
        field.column_type = ColumnType::LongLong as u8;
        let decoded = Field::decode(&field.encode()).unwrap();
        assert_eq!(decoded, field);
        assert_eq!(decoded.kind(), Some(ColumnType::LongLong));
        assert!(ColumnType::LongLong.is_integer());
    }

    #[test]
    fn test_text_row_with_null() {
        let row = vec![Some(Bytes::from_static(b"42")), None, Some(Bytes::new())];
        let payload = encode_text_row(&row).freeze();
        assert_eq!(&payload[..], &[0x02, b'4', b'2', 0xfb, 0x00]);
        assert_eq!(decode_text_row(&payload, 3).unwrap(), row);
    }

    #[test]
    fn test_binary_row_null_bitmap() {
        let row = vec![None, Some(Bytes::from_static(b"x")), None];
        let payload = encode_binary_row(&row);
        // columns 0 and 2 are NULL: bits 2 and 4
        assert_eq!(&payload[..], &[0x00, 0b0001_0100, 0x01, b'x']);
    }
}
