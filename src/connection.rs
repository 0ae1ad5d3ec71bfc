//! Asynchronous PostgreSQL connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;

use crate::buffer_pool::{GLOBAL_BUFFER_POOL, PooledBufferSet};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::{write_query, write_terminate};
use crate::protocol::types::TransactionStatus;
use crate::row::Row;
use crate::state::StateMachine;
use crate::state::action::{Action, AsyncMessage};
use crate::state::connection::ConnectionStateMachine;
use crate::state::query::{PreparedStatement, QueryStateMachine};

/// Callback for server-initiated messages: `NotificationResponse`, `NoticeResponse`
/// and `ParameterStatus` changes arriving outside of startup.
pub trait AsyncMessageHandler: Send {
    fn handle(&mut self, message: &AsyncMessage);
}

enum Transport {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
}

/// Upper bound on a single message's declared length, guarding against a
/// corrupted or hostile length prefix driving an unbounded allocation.
/// Comfortably above the largest message this client expects (a `DataRow`
/// or `CommandComplete` for a large result row) without being large enough
/// to matter as a real limit.
const MAX_MESSAGE_LENGTH: usize = 256 * 1024 * 1024;

impl Transport {
    async fn read_u8(&mut self) -> std::io::Result<u8> {
        match self {
            Self::Plain(r) => r.read_u8().await,
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.read_u8().await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.read_exact(buf).await.map(|_| ()),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().write_all(buf).await,
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.get_mut().write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().flush().await,
            #[cfg(feature = "tls")]
            Self::Tls(r) => r.get_mut().flush().await,
        }
    }

    /// Read a full PostgreSQL message into the buffer set.
    async fn read_message(&mut self, buffer_set: &mut crate::buffer_set::BufferSet) -> std::io::Result<()> {
        buffer_set.type_byte = self.read_u8().await?;

        let mut length_bytes = [0u8; 4];
        self.read_exact(&mut length_bytes).await?;
        let length = u32::from_be_bytes(length_bytes) as usize;

        let payload_len = length.saturating_sub(4);
        if payload_len > MAX_MESSAGE_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("server declared a {payload_len}-byte message, exceeding the {MAX_MESSAGE_LENGTH}-byte sanity cap"),
            ));
        }
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.resize(payload_len, 0);
        self.read_exact(&mut buffer_set.read_buffer).await?;

        Ok(())
    }

    #[cfg(feature = "tls")]
    async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        match self {
            Self::Plain(reader) => {
                let tcp = reader.into_inner();
                let connector =
                    tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
                let tls = connector.connect(host, tcp).await.map_err(|e| {
                    Error::Tls(native_tls::Error::from(std::io::Error::other(e)))
                })?;
                Ok(Self::Tls(BufReader::new(tls)))
            }
            Self::Tls(_) => Err(Error::InvalidUsage("stream is already TLS".into())),
        }
    }
}

/// A live connection to a PostgreSQL server.
///
/// Not safe for concurrent use by multiple callers: operations take `&mut self`
/// and must be driven to completion one at a time. At most one `Statement`
/// borrows the connection at a time, enforced by the borrow checker (see
/// [`crate::statement`]).
pub struct Connection {
    transport: Transport,
    buffer_set: PooledBufferSet,
    host: String,
    port: u16,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    is_broken: bool,
    statement_counter: u64,
    /// Wire name of the named statement currently parsed on the server, if
    /// any. At most one may be open at a time; `prepare()` closes it before
    /// parsing the next.
    open_statement: Option<String>,
    async_message_handler: Option<Box<dyn AsyncMessageHandler>>,
}

impl Connection {
    /// Connect to a PostgreSQL server and run it through startup and authentication.
    pub async fn connect(config: &Config) -> Result<Self> {
        if config.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }

        let addr = format!("{}:{}", config.host, config.port);
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;
        let mut transport = Transport::Plain(BufReader::new(tcp));

        let mut buffer_set = GLOBAL_BUFFER_POOL.get_buffer_set();
        let mut state_machine = ConnectionStateMachine::new(config.clone());

        loop {
            match state_machine.step(&mut buffer_set)? {
                Action::WriteAndReadByte => {
                    transport.write_all(&buffer_set.write_buffer).await?;
                    transport.flush().await?;
                    let byte = transport.read_u8().await?;
                    state_machine.set_ssl_response(byte);
                }
                Action::ReadMessage => {
                    transport.read_message(&mut buffer_set).await?;
                }
                Action::Write => {
                    transport.write_all(&buffer_set.write_buffer).await?;
                    transport.flush().await?;
                }
                Action::WriteAndReadMessage => {
                    transport.write_all(&buffer_set.write_buffer).await?;
                    transport.flush().await?;
                    transport.read_message(&mut buffer_set).await?;
                }
                Action::TlsHandshake => {
                    #[cfg(feature = "tls")]
                    {
                        transport = transport.upgrade_to_tls(&config.host).await?;
                    }
                    #[cfg(not(feature = "tls"))]
                    {
                        return Err(Error::Unsupported("TLS requested but the tls feature is not enabled".into()));
                    }
                }
                Action::HandleAsyncMessageAndReadMessage(_) => {
                    transport.read_message(&mut buffer_set).await?;
                }
                Action::Finished => break,
            }
        }

        Ok(Self {
            transport,
            buffer_set,
            host: config.host.clone(),
            port: config.port,
            backend_key: state_machine.backend_key().cloned(),
            server_params: state_machine.take_server_params(),
            transaction_status: state_machine.transaction_status(),
            is_broken: false,
            statement_counter: 0,
            open_statement: None,
            async_message_handler: None,
        })
    }

    /// Cancellation token for this connection's current (or future) query.
    ///
    /// Independent of this connection's lifetime; may be handed to another
    /// task and used after this connection has moved on to a different query.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key
            .as_ref()
            .map(|key| CancelToken::new(self.host.clone(), self.port, key.process_id(), key.secret()))
    }

    /// Backend process id, for diagnostics. Returns 0 before startup completes.
    pub fn connection_id(&self) -> u32 {
        self.backend_key.as_ref().map_or(0, |k| k.process_id())
    }

    /// Server parameters reported during startup (and updated thereafter).
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Current transaction status as of the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// True once an unrecoverable error has been observed; the connection
    /// must not be used again and should be dropped or closed.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    pub(crate) fn next_statement_name(&mut self) -> String {
        self.statement_counter += 1;
        format!("_pgwire_s_{}", self.statement_counter)
    }

    pub fn set_async_message_handler<H: AsyncMessageHandler + 'static>(&mut self, handler: H) {
        self.async_message_handler = Some(Box::new(handler));
    }

    pub fn clear_async_message_handler(&mut self) {
        self.async_message_handler = None;
    }

    /// Drive any sans-I/O state machine on this connection's transport to `Action::Finished`.
    pub(crate) async fn drive<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<()> {
        loop {
            let action = match state_machine.step(&mut self.buffer_set) {
                Ok(action) => action,
                Err(e) => {
                    // The state machine may have just consumed the trailing
                    // ReadyForQuery for a recovered SQL error; pick up its
                    // transaction status before propagating.
                    self.transaction_status = state_machine.transaction_status();
                    return Err(e);
                }
            };
            match action {
                Action::WriteAndReadByte | Action::TlsHandshake => {
                    return Err(Error::Protocol(
                        "unexpected startup-only action outside of connect()".into(),
                    ));
                }
                Action::ReadMessage => {
                    self.transport.read_message(&mut self.buffer_set).await?;
                }
                Action::Write => {
                    self.transport.write_all(&self.buffer_set.write_buffer).await?;
                    self.transport.flush().await?;
                }
                Action::WriteAndReadMessage => {
                    self.transport.write_all(&self.buffer_set.write_buffer).await?;
                    self.transport.flush().await?;
                    self.transport.read_message(&mut self.buffer_set).await?;
                }
                Action::HandleAsyncMessageAndReadMessage(ref msg) => {
                    if let Some(handler) = &mut self.async_message_handler {
                        handler.handle(msg);
                    }
                    self.transport.read_message(&mut self.buffer_set).await?;
                }
                Action::Finished => {
                    self.transaction_status = state_machine.transaction_status();
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_query(&mut self, mut state_machine: QueryStateMachine) -> Result<QueryStateMachine> {
        let result = self.drive(&mut state_machine).await;
        if let Err(e) = &result {
            if e.is_fatal_to_connection() {
                self.is_broken = true;
            }
        }
        result.map(|()| state_machine)
    }

    /// Parse and describe a statement, returning a `Statement` handle that
    /// exclusively borrows this connection until it is dropped or closed.
    pub async fn statement(&mut self, sql: &str) -> Result<crate::statement::Statement<'_>> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        let prepared = self.prepare(sql).await?;
        Ok(crate::statement::Statement::new(self, prepared))
    }

    /// Parse and describe a statement using the extended query protocol.
    ///
    /// Closes the previously prepared statement on this connection, if any,
    /// before parsing the new one: only one named statement is kept open at
    /// a time.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        if let Some(previous) = self.open_statement.take() {
            self.close_statement_by_name(&previous).await?;
        }

        let name = self.next_statement_name();
        let state_machine = QueryStateMachine::prepare(&mut self.buffer_set, &name, sql);
        let mut state_machine = self.run_query(state_machine).await?;
        let prepared = state_machine
            .take_prepared_statement()
            .ok_or_else(|| Error::Protocol("no prepared statement produced".into()))?;
        self.open_statement = Some(prepared.wire_name().to_string());
        Ok(prepared)
    }

    async fn close_statement_by_name(&mut self, wire_name: &str) -> Result<()> {
        let state_machine = QueryStateMachine::close_statement(&mut self.buffer_set, wire_name);
        self.run_query(state_machine).await?;
        Ok(())
    }

    /// Execute a previously `prepare`d statement, returning its result rows.
    pub async fn execute(&mut self, statement: &PreparedStatement, params: &[Option<&str>]) -> Result<Vec<Row>> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        let state_machine = QueryStateMachine::execute(&mut self.buffer_set, statement.wire_name(), params)?;
        let mut state_machine = self.run_query(state_machine).await?;
        Ok(state_machine.take_rows())
    }

    /// Parse, bind and execute raw SQL in one round trip, against an unnamed statement.
    pub async fn execute_sql(&mut self, sql: &str, params: &[Option<&str>]) -> Result<Vec<Row>> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        let state_machine = QueryStateMachine::execute_sql(&mut self.buffer_set, sql, params)?;
        let mut state_machine = self.run_query(state_machine).await?;
        Ok(state_machine.take_rows())
    }

    /// Close a previously prepared statement.
    pub async fn close_statement(&mut self, statement: &PreparedStatement) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        if self.open_statement.as_deref() == Some(statement.wire_name()) {
            self.open_statement = None;
        }
        self.close_statement_by_name(statement.wire_name()).await
    }

    async fn simple_query(&mut self, sql: &str) -> Result<()> {
        self.buffer_set.write_buffer.clear();
        write_query(&mut self.buffer_set.write_buffer, sql);
        self.transport.write_all(&self.buffer_set.write_buffer).await?;
        self.transport.flush().await?;

        let mut pending_error = None;

        loop {
            self.transport.read_message(&mut self.buffer_set).await?;
            let type_byte = self.buffer_set.type_byte;
            match type_byte {
                crate::protocol::backend::msg_type::READY_FOR_QUERY => {
                    let ready = crate::protocol::backend::ReadyForQuery::parse(&self.buffer_set.read_buffer)?;
                    self.transaction_status = ready.transaction_status().unwrap_or_default();
                    if let Some(error) = pending_error {
                        return Err(error);
                    }
                    return Ok(());
                }
                crate::protocol::backend::msg_type::ERROR_RESPONSE => {
                    let error = crate::protocol::backend::ErrorResponse::parse(&self.buffer_set.read_buffer)?;
                    let error = error.into_error();
                    if error.is_fatal_to_connection() {
                        self.is_broken = true;
                    }
                    // The server still owes us a trailing ReadyForQuery; keep
                    // reading until it arrives before surfacing the error.
                    pending_error = Some(error);
                }
                _ if crate::protocol::backend::RawMessage::is_async_type(type_byte) => {
                    if type_byte == crate::protocol::backend::msg_type::NOTICE_RESPONSE {
                        let notice = crate::protocol::backend::NoticeResponse::parse(&self.buffer_set.read_buffer)?;
                        if let Some(handler) = &mut self.async_message_handler {
                            handler.handle(&AsyncMessage::Notice(notice.fields));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Issue `BEGIN` and update `transaction_status` from the reply.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        self.simple_query("BEGIN").await
    }

    pub async fn commit_transaction(&mut self) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        if !self.in_transaction() {
            return Err(Error::NotInTransaction);
        }
        self.simple_query("COMMIT").await
    }

    pub async fn rollback_transaction(&mut self) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        if !self.in_transaction() {
            return Err(Error::NotInTransaction);
        }
        self.simple_query("ROLLBACK").await
    }

    /// Close the connection gracefully: send `Terminate` and drop the socket.
    pub async fn close(mut self) -> Result<()> {
        self.buffer_set.write_buffer.clear();
        write_terminate(&mut self.buffer_set.write_buffer);
        self.transport.write_all(&self.buffer_set.write_buffer).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Close the connection without sending `Terminate`.
    pub fn close_abruptly(self) {
        drop(self);
    }
}
