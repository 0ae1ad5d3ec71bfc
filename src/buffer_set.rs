//! Buffer set for state machine operations.

/// Buffers reused across the lifetime of a connection.
///
/// A single `BufferSet` is threaded through every [`StateMachine::step`](crate::state::StateMachine::step)
/// call so that a connection performs no per-message heap allocation once warmed up.
pub struct BufferSet {
    /// Read buffer for incoming messages
    pub read_buffer: Vec<u8>,
    /// Write buffer for outgoing messages, built up by a [`MessageBuilder`](crate::protocol::codec::MessageBuilder)
    pub write_buffer: Vec<u8>,
    /// Scratch copy of the last `RowDescription` payload, held so a cursor can keep
    /// decoding rows against it after the original message bytes are overwritten.
    pub column_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(4096),
            column_buffer: Vec::new(),
            type_byte: 0,
        }
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
