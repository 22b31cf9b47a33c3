//! TDS wire protocol message encoding and token decoding.
//!
//! This module implements the client side of a lean TDS subset: packet
//! framing, the PRELOGIN/LOGIN7 handshake, SQL batch and RPC requests, and
//! the server's token stream.
//! Reference: MS-TDS (Tabular Data Stream Protocol).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mssql::types::{ensure, utf16le_bytes, utf16le_string, DataType, MssqlValue};

// ============================================================================
// Packet Framing
// ============================================================================

/// Size of the TDS packet header in bytes.
pub(crate) const PACKET_HEADER_LEN: usize = 8;

/// Default negotiated packet size.
pub(crate) const DEFAULT_PACKET_SIZE: u32 = 4096;

/// Packet status: last packet of a message.
pub(crate) const STATUS_END_OF_MESSAGE: u8 = 0x01;

/// TDS packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    SqlBatch = 0x01,
    Rpc = 0x03,
    /// Server response (tabular result).
    Reply = 0x04,
    Login7 = 0x10,
    PreLogin = 0x12,
}

/// Write a packet header.
///
/// Length and SPID are big-endian; everything inside the token stream is
/// little-endian.
pub(crate) fn put_packet_header(
    buf: &mut BytesMut,
    ty: PacketType,
    status: u8,
    length: u16,
    packet_id: u8,
) {
    buf.put_u8(ty as u8);
    buf.put_u8(status);
    buf.put_u16(length);
    buf.put_u16(0); // SPID
    buf.put_u8(packet_id);
    buf.put_u8(0); // window
}

// ============================================================================
// Client (Request) Messages
// ============================================================================

/// Trait for encoding client messages.
///
/// The message body is framed into packets by the connection.
pub trait ClientMessage {
    fn packet_type(&self) -> PacketType;
    fn encode_body(&self) -> Result<BytesMut>;
}

/// PRELOGIN handshake message.
///
/// Advertises client version and declares that encryption is not supported
/// (TLS negotiation is out of scope for this client).
#[derive(Debug, Clone, Copy)]
pub struct PreloginMessage;

/// PRELOGIN option tokens.
mod prelogin {
    pub const VERSION: u8 = 0x00;
    pub const ENCRYPTION: u8 = 0x01;
    pub const MARS: u8 = 0x04;
    pub const TERMINATOR: u8 = 0xFF;

    pub const ENCRYPT_OFF: u8 = 0x00;
    pub const ENCRYPT_ON: u8 = 0x01;
    pub const ENCRYPT_NOT_SUP: u8 = 0x02;
    pub const ENCRYPT_REQ: u8 = 0x03;
}

impl ClientMessage for PreloginMessage {
    fn packet_type(&self) -> PacketType {
        PacketType::PreLogin
    }

    fn encode_body(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();

        // Option table: three options of 5 bytes each plus the terminator,
        // then the option data at the recorded offsets.
        let data_start: u16 = 3 * 5 + 1;

        buf.put_u8(prelogin::VERSION);
        buf.put_u16(data_start);
        buf.put_u16(6);

        buf.put_u8(prelogin::ENCRYPTION);
        buf.put_u16(data_start + 6);
        buf.put_u16(1);

        buf.put_u8(prelogin::MARS);
        buf.put_u16(data_start + 7);
        buf.put_u16(1);

        buf.put_u8(prelogin::TERMINATOR);

        // VERSION: major, minor, build, sub-build
        buf.put_slice(&[0, 1, 0, 0, 0, 0]);
        // ENCRYPTION
        buf.put_u8(prelogin::ENCRYPT_NOT_SUP);
        // MARS: off
        buf.put_u8(0);

        Ok(buf)
    }
}

/// Inspect a PRELOGIN response and reject servers that require TLS.
pub(crate) fn check_prelogin_response(mut buf: Bytes) -> Result<()> {
    let full = buf.clone();

    loop {
        ensure(&buf, 1)?;
        let token = buf.get_u8();
        if token == prelogin::TERMINATOR {
            return Ok(());
        }

        ensure(&buf, 4)?;
        let offset = buf.get_u16() as usize;
        let len = buf.get_u16() as usize;

        if token == prelogin::ENCRYPTION {
            if len < 1 || offset + len > full.len() {
                return Err(Error::Protocol("malformed PRELOGIN response".to_string()));
            }
            return match full[offset] {
                prelogin::ENCRYPT_OFF | prelogin::ENCRYPT_NOT_SUP => Ok(()),
                prelogin::ENCRYPT_ON | prelogin::ENCRYPT_REQ => Err(Error::Auth(
                    "server requires TLS, which this client does not support".to_string(),
                )),
                other => Err(Error::Protocol(format!(
                    "unknown PRELOGIN encryption value: {other}"
                ))),
            };
        }
    }
}

/// LOGIN7 message carrying SQL authentication credentials.
#[derive(Debug, Clone)]
pub struct Login7Message {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
    pub server_name: String,
    pub database: String,
    pub packet_size: u32,
}

/// TDS 7.4.
const TDS_VERSION: u32 = 0x7400_0004;

impl ClientMessage for Login7Message {
    fn packet_type(&self) -> PacketType {
        PacketType::Login7
    }

    fn encode_body(&self) -> Result<BytesMut> {
        // Fixed header (36 bytes) + offset table (58 bytes) + string data.
        const FIXED_LEN: usize = 94;

        let mut data = BytesMut::new();
        let mut offsets: Vec<(u16, u16)> = Vec::with_capacity(9);

        let push = |data: &mut BytesMut, offsets: &mut Vec<(u16, u16)>, s: &str, scramble: bool| {
            let offset = (FIXED_LEN + data.len()) as u16;
            let mut bytes = utf16le_bytes(s);
            if scramble {
                for b in &mut bytes {
                    *b = (*b << 4 | *b >> 4) ^ 0xA5;
                }
            }
            data.put_slice(&bytes);
            offsets.push((offset, s.encode_utf16().count() as u16));
        };

        push(&mut data, &mut offsets, &self.hostname, false);
        push(&mut data, &mut offsets, &self.username, false);
        push(&mut data, &mut offsets, &self.password, true);
        push(&mut data, &mut offsets, &self.app_name, false);
        push(&mut data, &mut offsets, &self.server_name, false);
        push(&mut data, &mut offsets, "", false); // extension
        push(&mut data, &mut offsets, &self.app_name, false); // client library
        push(&mut data, &mut offsets, "", false); // language
        push(&mut data, &mut offsets, &self.database, false);

        let mut buf = BytesMut::with_capacity(FIXED_LEN + data.len());
        buf.put_u32_le((FIXED_LEN + data.len()) as u32);
        buf.put_u32_le(TDS_VERSION);
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(0); // client program version
        buf.put_u32_le(std::process::id());
        buf.put_u32_le(0); // connection id
        buf.put_u8(0xE0); // use db, initial db fatal, set lang
        buf.put_u8(0x03); // initial lang fatal, ODBC
        buf.put_u8(0); // type flags: default SQL, TSQL
        buf.put_u8(0);
        buf.put_i32_le(0); // client time zone
        buf.put_u32_le(0x0409); // client LCID

        for (offset, len) in &offsets[..6] {
            buf.put_u16_le(*offset);
            buf.put_u16_le(*len);
        }
        buf.put_slice(&[0u8; 6]); // client MAC
        for (offset, len) in &offsets[6..] {
            buf.put_u16_le(*offset);
            buf.put_u16_le(*len);
        }
        // SSPI, attach-db-file, change-password: absent
        let end = (FIXED_LEN + data.len()) as u16;
        for _ in 0..3 {
            buf.put_u16_le(end);
            buf.put_u16_le(0);
        }
        buf.put_u32_le(0); // SSPI long

        buf.put_slice(&data);

        Ok(buf)
    }
}

/// SQL batch message: ALL_HEADERS followed by UTF-16LE statement text.
#[derive(Debug, Clone)]
pub struct SqlBatchMessage {
    pub sql: String,
}

impl ClientMessage for SqlBatchMessage {
    fn packet_type(&self) -> PacketType {
        PacketType::SqlBatch
    }

    fn encode_body(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        put_all_headers(&mut buf);
        buf.put_slice(&utf16le_bytes(&self.sql));
        Ok(buf)
    }
}

/// An RPC request: a stored-procedure name plus positional parameters.
///
/// Parameter order must match the procedure's declared signature; this
/// layer performs no named-parameter reordering.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub procedure: String,
    pub params: Vec<MssqlValue>,
}

impl RpcRequest {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            params: Vec::new(),
        }
    }

    /// Append a positional parameter.
    pub fn param(mut self, value: impl Into<MssqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl ClientMessage for RpcRequest {
    fn packet_type(&self) -> PacketType {
        PacketType::Rpc
    }

    fn encode_body(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        put_all_headers(&mut buf);

        let name = utf16le_bytes(&self.procedure);
        buf.put_u16_le(self.procedure.encode_utf16().count() as u16);
        buf.put_slice(&name);
        buf.put_u16_le(0); // option flags

        for value in &self.params {
            buf.put_u8(0); // unnamed (positional) parameter
            buf.put_u8(0); // status flags: by value
            value.encode_param(&mut buf)?;
        }

        Ok(buf)
    }
}

/// Write the ALL_HEADERS block required on batch and RPC requests:
/// a single transaction-descriptor header, outside any transaction.
fn put_all_headers(buf: &mut BytesMut) {
    buf.put_u32_le(22); // total length
    buf.put_u32_le(18); // header length
    buf.put_u16_le(0x0002); // transaction descriptor
    buf.put_u64_le(0);
    buf.put_u32_le(1); // outstanding request count
}

// ============================================================================
// Server Tokens
// ============================================================================

/// Token identifiers in a server response stream.
mod token_id {
    pub const RETURNSTATUS: u8 = 0x79;
    pub const COLMETADATA: u8 = 0x81;
    pub const TABNAME: u8 = 0xA4;
    pub const COLINFO: u8 = 0xA5;
    pub const ORDER: u8 = 0xA9;
    pub const ERROR: u8 = 0xAA;
    pub const INFO: u8 = 0xAB;
    pub const RETURNVALUE: u8 = 0xAC;
    pub const LOGINACK: u8 = 0xAD;
    pub const ROW: u8 = 0xD1;
    pub const NBCROW: u8 = 0xD2;
    pub const ENVCHANGE: u8 = 0xE3;
    pub const DONE: u8 = 0xFD;
    pub const DONEPROC: u8 = 0xFE;
    pub const DONEINPROC: u8 = 0xFF;
}

/// A result-set column description from COLMETADATA.
#[derive(Debug, Clone)]
pub struct MssqlColumn {
    pub name: String,
    pub ty: DataType,
    pub nullable: bool,
}

/// Completion summary carried by DONE / DONEPROC / DONEINPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneToken {
    pub status: u16,
    pub cur_cmd: u16,
    pub rows: u64,
}

impl DoneToken {
    pub const MORE: u16 = 0x01;
    pub const ERROR: u16 = 0x02;
    pub const COUNT: u16 = 0x10;

    /// More result sets follow in this response.
    pub fn more(&self) -> bool {
        self.status & Self::MORE != 0
    }

    /// The row count field is valid.
    pub fn has_count(&self) -> bool {
        self.status & Self::COUNT != 0
    }
}

/// An ERROR or INFO token.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub message: String,
    pub server: String,
    pub procedure: String,
    pub line: u32,
}

impl ServerMessage {
    pub(crate) fn into_error(self) -> Error {
        Error::Server {
            number: self.number,
            state: self.state,
            class: self.class,
            message: self.message,
            server: self.server,
            procedure: self.procedure,
            line: self.line,
        }
    }
}

/// LOGINACK: the server accepted the login.
#[derive(Debug, Clone)]
pub struct LoginAck {
    pub interface: u8,
    pub tds_version: u32,
    pub prog_name: String,
    pub prog_version: u32,
}

/// Environment change notifications we act on or acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvChange {
    PacketSize(u32),
    Database(String),
    Other(u8),
}

/// A decoded server token.
#[derive(Debug, Clone)]
pub enum Token {
    ColMetaData(Arc<Vec<MssqlColumn>>),
    Row(Vec<MssqlValue>),
    ReturnStatus(i32),
    ReturnValue { name: String, value: MssqlValue },
    Done(DoneToken),
    DoneProc(DoneToken),
    DoneInProc(DoneToken),
    Error(ServerMessage),
    Info(ServerMessage),
    LoginAck(LoginAck),
    EnvChange(EnvChange),
    Order,
}

// ============================================================================
// Token Stream
// ============================================================================

/// Decoder over one complete, reassembled server response.
///
/// Row decoding is stateful: cells are typed by the most recent
/// COLMETADATA token.
pub struct TokenStream {
    buf: Bytes,
    columns: Option<Arc<Vec<MssqlColumn>>>,
}

impl TokenStream {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, columns: None }
    }

    /// Columns of the current result set, if metadata has been seen.
    pub fn columns(&self) -> Option<&Arc<Vec<MssqlColumn>>> {
        self.columns.as_ref()
    }

    /// Decode the next token, or `None` at end of stream.
    pub fn next_token(&mut self) -> Result<Option<Token>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        let ty = self.buf.get_u8();
        let token = match ty {
            token_id::COLMETADATA => self.decode_colmetadata()?,
            token_id::ROW => self.decode_row(false)?,
            token_id::NBCROW => self.decode_row(true)?,
            token_id::RETURNSTATUS => {
                ensure(&self.buf, 4)?;
                Token::ReturnStatus(self.buf.get_i32_le())
            }
            token_id::RETURNVALUE => self.decode_return_value()?,
            token_id::DONE => Token::Done(self.decode_done()?),
            token_id::DONEPROC => Token::DoneProc(self.decode_done()?),
            token_id::DONEINPROC => Token::DoneInProc(self.decode_done()?),
            token_id::ERROR => Token::Error(self.decode_server_message()?),
            token_id::INFO => Token::Info(self.decode_server_message()?),
            token_id::LOGINACK => self.decode_loginack()?,
            token_id::ENVCHANGE => self.decode_envchange()?,
            token_id::ORDER | token_id::TABNAME | token_id::COLINFO => {
                self.skip_length_prefixed()?;
                Token::Order
            }
            _ => {
                return Err(Error::Protocol(format!("unknown token: 0x{ty:02X}")));
            }
        };

        Ok(Some(token))
    }

    fn decode_colmetadata(&mut self) -> Result<Token> {
        ensure(&self.buf, 2)?;
        let count = self.buf.get_u16_le();
        // 0xFFFF means "no metadata"
        let count = if count == 0xFFFF { 0 } else { count as usize };

        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            ensure(&self.buf, 6)?;
            let _user_type = self.buf.get_u32_le();
            let flags = self.buf.get_u16_le();
            let ty = DataType::decode(&mut self.buf)?;
            let name = read_b_varchar(&mut self.buf)?;
            columns.push(MssqlColumn {
                name,
                ty,
                nullable: flags & 0x01 != 0,
            });
        }

        let columns = Arc::new(columns);
        self.columns = Some(Arc::clone(&columns));
        Ok(Token::ColMetaData(columns))
    }

    fn decode_row(&mut self, null_bitmap: bool) -> Result<Token> {
        let columns = self
            .columns
            .clone()
            .ok_or_else(|| Error::Protocol("row received before metadata".to_string()))?;

        let nulls = if null_bitmap {
            let n = (columns.len() + 7) / 8;
            ensure(&self.buf, n)?;
            self.buf.split_to(n)
        } else {
            Bytes::new()
        };

        let mut values = Vec::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            if null_bitmap && nulls[i / 8] & (1 << (i % 8)) != 0 {
                values.push(MssqlValue::Null);
            } else {
                values.push(MssqlValue::decode_cell(&col.ty, &mut self.buf)?);
            }
        }

        Ok(Token::Row(values))
    }

    fn decode_return_value(&mut self) -> Result<Token> {
        ensure(&self.buf, 2)?;
        let _ordinal = self.buf.get_u16_le();
        let name = read_b_varchar(&mut self.buf)?;
        ensure(&self.buf, 7)?;
        let _status = self.buf.get_u8();
        let _user_type = self.buf.get_u32_le();
        let _flags = self.buf.get_u16_le();
        let ty = DataType::decode(&mut self.buf)?;
        let value = MssqlValue::decode_cell(&ty, &mut self.buf)?;
        Ok(Token::ReturnValue { name, value })
    }

    fn decode_done(&mut self) -> Result<DoneToken> {
        ensure(&self.buf, 12)?;
        Ok(DoneToken {
            status: self.buf.get_u16_le(),
            cur_cmd: self.buf.get_u16_le(),
            rows: self.buf.get_u64_le(),
        })
    }

    fn decode_server_message(&mut self) -> Result<ServerMessage> {
        ensure(&self.buf, 2)?;
        let len = self.buf.get_u16_le() as usize;
        ensure(&self.buf, len)?;
        let mut body = self.buf.split_to(len);

        ensure(&body, 6)?;
        let number = body.get_i32_le();
        let state = body.get_u8();
        let class = body.get_u8();
        let message = read_us_varchar(&mut body)?;
        let server = read_b_varchar(&mut body)?;
        let procedure = read_b_varchar(&mut body)?;
        ensure(&body, 4)?;
        let line = body.get_u32_le();

        Ok(ServerMessage {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    fn decode_loginack(&mut self) -> Result<Token> {
        ensure(&self.buf, 2)?;
        let len = self.buf.get_u16_le() as usize;
        ensure(&self.buf, len)?;
        let mut body = self.buf.split_to(len);

        ensure(&body, 5)?;
        let interface = body.get_u8();
        let tds_version = body.get_u32_le();
        let prog_name = read_b_varchar(&mut body)?;
        ensure(&body, 4)?;
        let prog_version = body.get_u32_le();

        Ok(Token::LoginAck(LoginAck {
            interface,
            tds_version,
            prog_name,
            prog_version,
        }))
    }

    fn decode_envchange(&mut self) -> Result<Token> {
        ensure(&self.buf, 2)?;
        let len = self.buf.get_u16_le() as usize;
        ensure(&self.buf, len)?;
        let mut body = self.buf.split_to(len);

        ensure(&body, 1)?;
        let kind = body.get_u8();
        let change = match kind {
            1 => {
                let new = read_b_varchar(&mut body)?;
                EnvChange::Database(new)
            }
            4 => {
                let new = read_b_varchar(&mut body)?;
                let size = new
                    .parse::<u32>()
                    .map_err(|_| Error::Protocol(format!("invalid packet size: {new}")))?;
                EnvChange::PacketSize(size)
            }
            other => EnvChange::Other(other),
        };

        Ok(Token::EnvChange(change))
    }

    fn skip_length_prefixed(&mut self) -> Result<()> {
        ensure(&self.buf, 2)?;
        let len = self.buf.get_u16_le() as usize;
        ensure(&self.buf, len)?;
        self.buf.advance(len);
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read a B_VARCHAR: u8 length in characters, UTF-16LE data.
fn read_b_varchar(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 1)?;
    let chars = buf.get_u8() as usize;
    let bytes = chars * 2;
    ensure(buf, bytes)?;
    utf16le_string(&buf.split_to(bytes))
}

/// Read a US_VARCHAR: u16 length in characters, UTF-16LE data.
fn read_us_varchar(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 2)?;
    let chars = buf.get_u16_le() as usize;
    let bytes = chars * 2;
    ensure(buf, bytes)?;
    utf16le_string(&buf.split_to(bytes))
}
