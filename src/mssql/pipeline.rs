//! Result pipeline: folds a server token stream into structured results.
//!
//! One decoder, two consumption modes. The query fold forwards rows to the
//! caller; the procedure fold discards rows and metadata and keeps only the
//! completion summary and the procedure's return status. Both record the
//! RETURNSTATUS token wherever it appears, and neither invents a status
//! when the token is absent.

use std::sync::Arc;

use crate::error::Result;
use crate::mssql::protocol::{MssqlColumn, Token, TokenStream};
use crate::mssql::types::MssqlValue;

// ============================================================================
// Results
// ============================================================================

/// Result of a query execution.
#[derive(Debug)]
pub struct QueryResult {
    /// Column descriptions, shared with the decoder.
    pub columns: Arc<Vec<MssqlColumn>>,
    /// Row data.
    pub rows: Vec<Vec<MssqlValue>>,
    /// Affected-row count from the completion token, where reported.
    pub rows_affected: u64,
    /// Procedure return status, if one was observed in the stream.
    pub return_status: Option<i32>,
}

impl QueryResult {
    fn new() -> Self {
        Self {
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            rows_affected: 0,
            return_status: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty() && self.rows_affected == 0
    }
}

/// Result of a stored-procedure invocation.
///
/// `return_status` is `None` only when the status token was not observed;
/// callers must treat that as unknown, never as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureResult {
    pub rows_affected: u64,
    pub return_status: Option<i32>,
}

// ============================================================================
// Folds
// ============================================================================

/// Rows mode: fold a batch response into one result per result set.
///
/// Result sets are delimited by DONE tokens. A response that ends without a
/// terminal summary is valid for plain queries; any pending rows are still
/// returned.
pub(crate) fn collect_query(stream: &mut TokenStream) -> Result<Vec<QueryResult>> {
    let mut results = Vec::new();
    let mut current = QueryResult::new();

    while let Some(token) = stream.next_token()? {
        match token {
            Token::ColMetaData(columns) => {
                current.columns = columns;
            }
            Token::Row(values) => {
                current.rows.push(values);
            }
            Token::ReturnStatus(status) => {
                current.return_status = Some(status);
            }
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                if done.has_count() {
                    current.rows_affected = done.rows;
                }
                results.push(std::mem::replace(&mut current, QueryResult::new()));
            }
            Token::Error(message) => {
                return Err(message.into_error());
            }
            _ => {}
        }
    }

    if !current.is_empty() {
        results.push(current);
    }

    Ok(results)
}

/// Rows mode for a single-statement call (the `sp_executesql` path):
/// merge the response into one result.
pub(crate) fn collect_single(stream: &mut TokenStream) -> Result<QueryResult> {
    let mut result = QueryResult::new();

    while let Some(token) = stream.next_token()? {
        match token {
            Token::ColMetaData(columns) => {
                if result.columns.is_empty() {
                    result.columns = columns;
                }
            }
            Token::Row(values) => {
                result.rows.push(values);
            }
            Token::ReturnStatus(status) => {
                result.return_status = Some(status);
            }
            Token::Done(done) | Token::DoneInProc(done) => {
                if done.has_count() {
                    result.rows_affected += done.rows;
                }
            }
            Token::Error(message) => {
                return Err(message.into_error());
            }
            _ => {}
        }
    }

    Ok(result)
}

/// Summary mode: fold a procedure response, discarding rows and metadata.
pub(crate) fn collect_procedure(stream: &mut TokenStream) -> Result<ProcedureResult> {
    let mut rows_affected = 0;
    let mut return_status = None;

    while let Some(token) = stream.next_token()? {
        match token {
            Token::ReturnStatus(status) => {
                return_status = Some(status);
            }
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                if done.has_count() {
                    rows_affected += done.rows;
                }
            }
            Token::Error(message) => {
                return Err(message.into_error());
            }
            // Rows and metadata are not meaningful for a call made for its
            // side effect and status code.
            _ => {}
        }
    }

    Ok(ProcedureResult {
        rows_affected,
        return_status,
    })
}
