//! Integration tests against an in-process mock PostgreSQL server.
//!
//! Each test scripts raw protocol bytes over a loopback `TcpListener` so the
//! connection state machine and pool can be exercised without a live
//! PostgreSQL instance.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pgwire_client::protocol::backend::msg_type;
use pgwire_client::protocol::codec::MessageBuilder;
use pgwire_client::{Config, ConnectionPool, PoolConfig, SslMode};

async fn spawn_server<F, Fut>(handler: F) -> std::net::SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handler(stream));
        }
    });

    addr
}

fn config_for(addr: std::net::SocketAddr) -> Config {
    Config {
        host: addr.ip().to_string(),
        port: addr.port(),
        user: "alice".to_string(),
        database: Some("appdb".to_string()),
        password: None,
        application_name: None,
        ssl_mode: SslMode::Disable,
        params: Vec::new(),
    }
}

/// Read and discard a full message: 1 type byte + 4-byte length + payload.
async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte).await.unwrap();
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.unwrap();
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut payload).await.unwrap();
    (type_byte[0], payload)
}

/// Read and discard a StartupMessage: 4-byte length + payload (no type byte).
async fn read_startup(stream: &mut TcpStream) {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.unwrap();
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut payload).await.unwrap();
}

async fn send_authentication_ok(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut msg = MessageBuilder::new(&mut buf, msg_type::AUTHENTICATION);
    msg.write_i32(0);
    msg.finish();
    stream.write_all(&buf).await.unwrap();
}

async fn send_backend_key_data(stream: &mut TcpStream, pid: u32, secret: u32) {
    let mut buf = Vec::new();
    let mut msg = MessageBuilder::new(&mut buf, msg_type::BACKEND_KEY_DATA);
    msg.write_u32(pid);
    msg.write_u32(secret);
    msg.finish();
    stream.write_all(&buf).await.unwrap();
}

async fn send_ready_for_query(stream: &mut TcpStream, status: u8) {
    let mut buf = Vec::new();
    let mut msg = MessageBuilder::new(&mut buf, msg_type::READY_FOR_QUERY);
    msg.write_u8(status);
    msg.finish();
    stream.write_all(&buf).await.unwrap();
}

/// Drive a connection through startup with trust auth, up through the first
/// `ReadyForQuery`.
async fn complete_startup(stream: &mut TcpStream) {
    read_startup(stream).await;
    send_authentication_ok(stream).await;
    send_backend_key_data(stream, 4242, 99).await;
    send_ready_for_query(stream, b'I').await;
}

/// Read and discard frontend messages up to and including `Sync`, as the
/// server would while servicing an extended-query round trip.
async fn drain_until_sync(stream: &mut TcpStream) -> Vec<u8> {
    let mut types = Vec::new();
    loop {
        let (type_byte, _payload) = read_message(stream).await;
        types.push(type_byte);
        if type_byte == b'S' {
            return types;
        }
    }
}

#[tokio::test]
async fn connect_and_execute_sql_round_trip() {
    let addr = spawn_server(|mut stream| async move {
        complete_startup(&mut stream).await;

        // Parse + Bind + Describe + Execute + Sync for `execute_sql`.
        drain_until_sync(&mut stream).await;

        let mut buf = Vec::new();
        MessageBuilder::new(&mut buf, msg_type::PARSE_COMPLETE).finish();
        MessageBuilder::new(&mut buf, msg_type::BIND_COMPLETE).finish();

        {
            let mut row_desc = MessageBuilder::new(&mut buf, msg_type::ROW_DESCRIPTION);
            row_desc.write_u16(1);
            row_desc.write_cstr("n");
            row_desc.write_u32(0); // table_oid
            row_desc.write_i16(0); // column_id
            row_desc.write_u32(23); // INT4
            row_desc.write_i16(4); // type_size
            row_desc.write_i32(-1); // type_modifier
            row_desc.write_u16(0); // format: text
            row_desc.finish();
        }
        {
            let mut data_row = MessageBuilder::new(&mut buf, msg_type::DATA_ROW);
            data_row.write_u16(1);
            data_row.write_i32(1);
            data_row.write_bytes(b"1");
            data_row.finish();
        }
        {
            let mut complete = MessageBuilder::new(&mut buf, msg_type::COMMAND_COMPLETE);
            complete.write_cstr("SELECT 1");
            complete.finish();
        }
        stream.write_all(&buf).await.unwrap();
        send_ready_for_query(&mut stream, b'I').await;
    })
    .await;

    let config = config_for(addr);
    let mut conn = pgwire_client::Connection::connect(&config).await.unwrap();
    let rows = conn.execute_sql("SELECT 1 AS n", &[]).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some("1"));
    assert_eq!(rows[0].get_by_name("n"), Some("1"));
}

#[tokio::test]
async fn recoverable_sql_error_does_not_corrupt_the_connection() {
    let addr = spawn_server(|mut stream| async move {
        complete_startup(&mut stream).await;

        // First query: the server aborts the extended-query round trip with
        // an ErrorResponse, then still sends the trailing ReadyForQuery.
        drain_until_sync(&mut stream).await;
        let mut buf = Vec::new();
        {
            let mut err = MessageBuilder::new(&mut buf, msg_type::ERROR_RESPONSE);
            err.write_u8(b'S');
            err.write_cstr("ERROR");
            err.write_u8(b'V');
            err.write_cstr("ERROR");
            err.write_u8(b'C');
            err.write_cstr("42601");
            err.write_u8(b'M');
            err.write_cstr("syntax error");
            err.write_u8(0);
            err.finish();
        }
        stream.write_all(&buf).await.unwrap();
        send_ready_for_query(&mut stream, b'I').await;

        // Second query, on the same connection, succeeds cleanly.
        drain_until_sync(&mut stream).await;
        let mut buf = Vec::new();
        MessageBuilder::new(&mut buf, msg_type::PARSE_COMPLETE).finish();
        MessageBuilder::new(&mut buf, msg_type::BIND_COMPLETE).finish();
        MessageBuilder::new(&mut buf, msg_type::NO_DATA).finish();
        {
            let mut complete = MessageBuilder::new(&mut buf, msg_type::COMMAND_COMPLETE);
            complete.write_cstr("SELECT 0");
            complete.finish();
        }
        stream.write_all(&buf).await.unwrap();
        send_ready_for_query(&mut stream, b'I').await;
    })
    .await;

    let config = config_for(addr);
    let mut conn = pgwire_client::Connection::connect(&config).await.unwrap();

    let err = conn.execute_sql("GARBAGE SQL", &[]).await.unwrap_err();
    assert!(matches!(err, pgwire_client::Error::SqlError(_)));
    assert!(!conn.is_broken());

    // The stray ReadyForQuery from the first query must not be misread as
    // the reply to this second one.
    let rows = conn.execute_sql("SELECT 1", &[]).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn pool_reuses_a_released_connection_for_the_next_acquire() {
    let addr = spawn_server(|mut stream| async move {
        complete_startup(&mut stream).await;
        // Hold the connection open; the test closes the pool when done.
        let mut discard = [0u8; 1];
        let _ = stream.read_exact(&mut discard).await;
    })
    .await;

    let db_config = config_for(addr);
    let pool_config = PoolConfig {
        maximum_connections: 1,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::new(db_config, pool_config);

    let first = pool.acquire_connection().await.unwrap();
    drop(first);

    // Give the background release task a chance to run before the second acquire.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let _second = pool.acquire_connection().await.unwrap();

    let metrics = pool.metrics(false).await;
    assert_eq!(metrics.connections_created, 1);
    assert_eq!(metrics.successful_requests, 2);
}
