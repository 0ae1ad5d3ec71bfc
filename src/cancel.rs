//! Out-of-band query cancellation.
//!
//! PostgreSQL cancels a running query by opening a second connection and
//! sending a `CancelRequest` carrying the original connection's backend PID
//! and secret key, then closing without waiting for a reply. This lets a
//! cancel be issued from a different task while the original query is still
//! streaming results.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::protocol::frontend::write_cancel_request;

/// The data needed to cancel a query running on a particular connection.
///
/// Independent of the originating [`crate::connection::Connection`]'s lifetime:
/// `Send + Sync`, so it can be handed to another task.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: String,
    port: u16,
    process_id: u32,
    secret_key: u32,
}

impl CancelToken {
    pub(crate) fn new(host: String, port: u16, process_id: u32, secret_key: u32) -> Self {
        Self {
            host,
            port,
            process_id,
            secret_key,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }
}

/// Open a throwaway connection to the same server and send a `CancelRequest`.
///
/// The server closes the cancel connection immediately with no response, so
/// this returns once the request has been written, without waiting to read
/// anything back. A failure here means the cancel request could not be sent;
/// it does not necessarily mean the target query is still running.
pub async fn cancel_query(token: &CancelToken) -> Result<()> {
    let addr = format!("{}:{}", token.host, token.port);
    let mut stream = TcpStream::connect(&addr).await?;

    let mut buf = Vec::with_capacity(16);
    write_cancel_request(&mut buf, token.process_id, token.secret_key);

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_carries_process_id() {
        let token = CancelToken::new("localhost".to_string(), 5432, 42, 99);
        assert_eq!(token.process_id(), 42);
    }
}
