//! Extended query protocol state machine (text format only).
//!
//! Drives Parse/Bind/Describe/Execute/Sync. Parameters and results are
//! always text; binary encoding and statement pipelining are not
//! implemented.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::backend::{
    BindComplete, CloseComplete, CommandComplete, DataRow, EmptyQueryResponse, ErrorResponse,
    NoData, ParameterDescription, ParseComplete, PortalSuspended, RawMessage, ReadyForQuery,
    RowDescription, msg_type,
};
use crate::protocol::frontend::{
    write_bind, write_close_statement, write_describe_portal, write_describe_statement,
    write_execute, write_parse, write_sync,
};
use crate::protocol::types::{Oid, TransactionStatus};
use crate::row::{ColumnMetadata, Row};

use super::StateMachine;
use super::action::{Action, AsyncMessage};
use crate::buffer_set::BufferSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingParse,
    WaitingDescribeStatement,
    WaitingStatementRowDesc,
    WaitingBind,
    WaitingDescribePortal,
    ProcessingRows,
    WaitingReady,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Parse + DescribeStatement + Sync. Produces a `PreparedStatement`, no rows.
    Prepare,
    /// Bind + DescribePortal + Execute + Sync against an already-parsed statement.
    Execute,
    /// Parse + Bind + DescribePortal + Execute + Sync against raw, unnamed SQL.
    ExecuteSql,
    /// Close + Sync for a previously prepared statement.
    CloseStatement,
}

/// A statement prepared on the server, addressable by its wire name.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    wire_name: String,
    param_oids: Vec<Oid>,
}

impl PreparedStatement {
    /// The name this statement was registered under on the wire.
    pub fn wire_name(&self) -> &str {
        &self.wire_name
    }

    /// Parameter type OIDs the server inferred for this statement.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }
}

/// Extended query protocol state machine.
pub struct QueryStateMachine {
    state: State,
    mode: Mode,
    transaction_status: TransactionStatus,
    columns: Option<Arc<[ColumnMetadata]>>,
    rows: Vec<Row>,
    command_tag: Option<String>,
    prepared: Option<PreparedStatement>,
    /// An `ErrorResponse` seen mid-query, held until the trailing
    /// `ReadyForQuery` has actually been read off the wire.
    pending_error: Option<Error>,
}

impl QueryStateMachine {
    /// Prepare a statement under `wire_name`.
    ///
    /// Writes Parse + DescribeStatement + Sync to `buffer_set.write_buffer`.
    pub fn prepare(buffer_set: &mut BufferSet, wire_name: &str, sql: &str) -> Self {
        buffer_set.write_buffer.clear();
        write_parse(&mut buffer_set.write_buffer, wire_name, sql, &[]);
        write_describe_statement(&mut buffer_set.write_buffer, wire_name);
        write_sync(&mut buffer_set.write_buffer);

        Self {
            state: State::Initial,
            mode: Mode::Prepare,
            transaction_status: TransactionStatus::Idle,
            columns: None,
            rows: Vec::new(),
            command_tag: None,
            prepared: Some(PreparedStatement {
                wire_name: wire_name.to_string(),
                param_oids: Vec::new(),
            }),
            pending_error: None,
        }
    }

    /// Execute a previously prepared statement against an unnamed portal.
    ///
    /// Writes Bind + DescribePortal + Execute + Sync to `buffer_set.write_buffer`.
    pub fn execute(
        buffer_set: &mut BufferSet,
        wire_name: &str,
        params: &[Option<&str>],
    ) -> Result<Self> {
        buffer_set.write_buffer.clear();
        write_bind(&mut buffer_set.write_buffer, "", wire_name, params);
        write_describe_portal(&mut buffer_set.write_buffer, "");
        write_execute(&mut buffer_set.write_buffer, "", 0);
        write_sync(&mut buffer_set.write_buffer);

        Ok(Self {
            state: State::Initial,
            mode: Mode::Execute,
            transaction_status: TransactionStatus::Idle,
            columns: None,
            rows: Vec::new(),
            command_tag: None,
            prepared: None,
            pending_error: None,
        })
    }

    /// Execute raw SQL against an unnamed statement and unnamed portal.
    ///
    /// Writes Parse + Bind + DescribePortal + Execute + Sync to
    /// `buffer_set.write_buffer`.
    pub fn execute_sql(buffer_set: &mut BufferSet, sql: &str, params: &[Option<&str>]) -> Result<Self> {
        buffer_set.write_buffer.clear();
        write_parse(&mut buffer_set.write_buffer, "", sql, &[]);
        write_bind(&mut buffer_set.write_buffer, "", "", params);
        write_describe_portal(&mut buffer_set.write_buffer, "");
        write_execute(&mut buffer_set.write_buffer, "", 0);
        write_sync(&mut buffer_set.write_buffer);

        Ok(Self {
            state: State::Initial,
            mode: Mode::ExecuteSql,
            transaction_status: TransactionStatus::Idle,
            columns: None,
            rows: Vec::new(),
            command_tag: None,
            prepared: None,
            pending_error: None,
        })
    }

    /// Close a prepared statement.
    ///
    /// Writes Close + Sync to `buffer_set.write_buffer`.
    pub fn close_statement(buffer_set: &mut BufferSet, wire_name: &str) -> Self {
        buffer_set.write_buffer.clear();
        write_close_statement(&mut buffer_set.write_buffer, wire_name);
        write_sync(&mut buffer_set.write_buffer);

        Self {
            state: State::Initial,
            mode: Mode::CloseStatement,
            transaction_status: TransactionStatus::Idle,
            columns: None,
            rows: Vec::new(),
            command_tag: None,
            prepared: None,
            pending_error: None,
        }
    }

    /// Take the prepared statement (after a `prepare()` run completes).
    pub fn take_prepared_statement(&mut self) -> Option<PreparedStatement> {
        self.prepared.take()
    }

    /// Take the rows buffered during an `execute()`/`execute_sql()` run.
    pub fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    /// Command tag from the last CommandComplete, if any.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    fn handle_parse(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        if type_byte != msg_type::PARSE_COMPLETE {
            return Err(Error::Protocol(format!(
                "Expected ParseComplete, got '{}'",
                type_byte as char
            )));
        }
        ParseComplete::parse(&buffer_set.read_buffer)?;
        self.state = match self.mode {
            Mode::ExecuteSql => State::WaitingBind,
            Mode::Prepare => State::WaitingDescribeStatement,
            _ => unreachable!("handle_parse called for non-parse operation"),
        };
        Ok(Action::ReadMessage)
    }

    fn handle_describe_statement(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        if type_byte != msg_type::PARAMETER_DESCRIPTION {
            return Err(Error::Protocol(format!(
                "Expected ParameterDescription, got '{}'",
                type_byte as char
            )));
        }
        let param_desc = ParameterDescription::parse(&buffer_set.read_buffer)?;
        if let Some(stmt) = &mut self.prepared {
            stmt.param_oids = param_desc.oids().to_vec();
        }
        self.state = State::WaitingStatementRowDesc;
        Ok(Action::ReadMessage)
    }

    fn handle_statement_row_desc(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                RowDescription::parse(&buffer_set.read_buffer)?;
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            msg_type::NO_DATA => {
                NoData::parse(&buffer_set.read_buffer)?;
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            _ => Err(Error::Protocol(format!(
                "Expected RowDescription or NoData, got '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_bind(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        if type_byte != msg_type::BIND_COMPLETE {
            return Err(Error::Protocol(format!(
                "Expected BindComplete, got '{}'",
                type_byte as char
            )));
        }
        BindComplete::parse(&buffer_set.read_buffer)?;
        self.state = State::WaitingDescribePortal;
        Ok(Action::ReadMessage)
    }

    fn handle_describe_portal(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                buffer_set.column_buffer.clear();
                buffer_set
                    .column_buffer
                    .extend_from_slice(&buffer_set.read_buffer);
                let desc = RowDescription::parse(&buffer_set.column_buffer)?;
                self.columns = Some(Arc::from(ColumnMetadata::from_description(&desc)));
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            msg_type::NO_DATA => {
                NoData::parse(&buffer_set.read_buffer)?;
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            _ => Err(Error::Protocol(format!(
                "Expected RowDescription or NoData, got '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_rows(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::DATA_ROW => {
                let columns = self
                    .columns
                    .clone()
                    .ok_or_else(|| Error::Protocol("DataRow without RowDescription".to_string()))?;
                let data_row = DataRow::parse(payload)?;
                let values: Vec<Option<String>> = data_row
                    .iter()
                    .map(|value| value.map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
                    .collect();
                self.rows.push(Row::new(columns, values));
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                self.command_tag = Some(complete.tag.to_string());
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                EmptyQueryResponse::parse(payload)?;
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            msg_type::PORTAL_SUSPENDED => {
                PortalSuspended::parse(payload)?;
                self.state = State::WaitingReady;
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Finished;
                Ok(Action::Finished)
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected message while processing rows: '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_ready(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Finished;
                if let Some(error) = self.pending_error.take() {
                    return Err(error);
                }
                Ok(Action::Finished)
            }
            msg_type::CLOSE_COMPLETE => {
                CloseComplete::parse(payload)?;
                Ok(Action::ReadMessage)
            }
            _ => Err(Error::Protocol(format!(
                "Expected ReadyForQuery, got '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_async_message(&self, msg: &RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::NOTICE_RESPONSE => {
                let notice = crate::protocol::backend::NoticeResponse::parse(msg.payload)?;
                Ok(Action::HandleAsyncMessageAndReadMessage(
                    AsyncMessage::Notice(notice.fields),
                ))
            }
            msg_type::PARAMETER_STATUS => {
                let param = crate::protocol::backend::auth::ParameterStatus::parse(msg.payload)?;
                Ok(Action::HandleAsyncMessageAndReadMessage(
                    AsyncMessage::ParameterChanged {
                        name: param.name.to_string(),
                        value: param.value.to_string(),
                    },
                ))
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let notification =
                    crate::protocol::backend::auth::NotificationResponse::parse(msg.payload)?;
                Ok(Action::HandleAsyncMessageAndReadMessage(
                    AsyncMessage::Notification {
                        pid: notification.pid,
                        channel: notification.channel.to_string(),
                        payload: notification.payload.to_string(),
                    },
                ))
            }
            _ => Err(Error::Protocol(format!(
                "Unknown async message type: '{}'",
                msg.type_byte as char
            ))),
        }
    }
}

impl StateMachine for QueryStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.state == State::Initial {
            self.state = match self.mode {
                Mode::Prepare | Mode::ExecuteSql => State::WaitingParse,
                Mode::Execute => State::WaitingBind,
                Mode::CloseStatement => State::WaitingReady,
            };
            return Ok(Action::WriteAndReadMessage);
        }

        let type_byte = buffer_set.type_byte;

        if RawMessage::is_async_type(type_byte) {
            let msg = RawMessage::new(type_byte, &buffer_set.read_buffer);
            return self.handle_async_message(&msg);
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?;
            self.pending_error = Some(error.into_error());
            self.state = State::WaitingReady;
            return Ok(Action::ReadMessage);
        }

        match self.state {
            State::WaitingParse => self.handle_parse(buffer_set),
            State::WaitingDescribeStatement => self.handle_describe_statement(buffer_set),
            State::WaitingStatementRowDesc => self.handle_statement_row_desc(buffer_set),
            State::WaitingBind => self.handle_bind(buffer_set),
            State::WaitingDescribePortal => self.handle_describe_portal(buffer_set),
            State::ProcessingRows => self.handle_rows(buffer_set),
            State::WaitingReady => self.handle_ready(buffer_set),
            _ => Err(Error::Protocol(format!(
                "Unexpected state {:?}",
                self.state
            ))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
