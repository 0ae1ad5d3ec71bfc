//! Prepared statements and result cursors.
//!
//! `Statement<'c>` borrows its `Connection` exclusively: the borrow checker
//! enforces that at most one statement is active on a connection at a time,
//! rather than the connection tracking that invariant at runtime.

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::types::Oid;
use crate::row::Row;
use crate::state::query::PreparedStatement;

/// A statement parsed and described on the server, bound to the connection
/// that owns it.
pub struct Statement<'c> {
    conn: &'c mut Connection,
    prepared: PreparedStatement,
}

impl<'c> Statement<'c> {
    pub(crate) fn new(conn: &'c mut Connection, prepared: PreparedStatement) -> Self {
        Self { conn, prepared }
    }

    /// Parameter type OIDs the server inferred for this statement.
    pub fn param_oids(&self) -> &[Oid] {
        self.prepared.param_oids()
    }

    /// Bind `params` to an unnamed portal and execute it, returning a cursor
    /// over the result rows.
    pub async fn execute(&mut self, params: &[Option<&str>]) -> Result<Cursor> {
        let rows = self.conn.execute(&self.prepared, params).await?;
        Ok(Cursor::new(rows))
    }

    /// Close this statement on the server.
    pub async fn close(self) -> Result<()> {
        self.conn.close_statement(&self.prepared).await
    }
}

/// A lazy, forward-only iterator over a statement's result rows.
///
/// Rows for a single `execute` are fetched from the server in one round trip
/// (this client does not chunk via `PortalSuspended`) and buffered, then
/// handed to the caller one at a time through `next()` to match the
/// forward-only, close-discards-the-rest contract. Because the rows are
/// already buffered, a `Cursor` holds no borrow on its `Statement`; the
/// one-active-statement-per-connection invariant is what `Statement<'c>`'s
/// exclusive borrow of the connection actually enforces.
pub struct Cursor {
    rows: std::vec::IntoIter<Row>,
    done: bool,
}

impl Cursor {
    fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
            done: false,
        }
    }

    /// Return the next row, or `None` once the result set is exhausted.
    ///
    /// Once `None` has been returned, subsequent calls keep returning `None`.
    pub fn next(&mut self) -> Option<Result<Row>> {
        if self.done {
            return None;
        }
        match self.rows.next() {
            Some(row) => Some(Ok(row)),
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Discard any unread rows. A no-op beyond marking the cursor exhausted,
    /// since all rows for this cursor were already buffered by `execute`.
    pub fn close(mut self) {
        self.done = true;
        self.rows = Vec::new().into_iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::ColumnMetadata;

    fn sample_rows() -> Vec<Row> {
        let columns: std::sync::Arc<[ColumnMetadata]> = std::sync::Arc::from(vec![ColumnMetadata {
            name: "n".to_string(),
            type_oid: crate::protocol::types::oid::INT4,
        }]);
        vec![
            Row::new(columns.clone(), vec![Some("1".to_string())]),
            Row::new(columns, vec![Some("2".to_string())]),
        ]
    }

    #[test]
    fn cursor_yields_rows_then_none() {
        let mut cursor = Cursor::new(sample_rows());
        assert_eq!(cursor.next().unwrap().unwrap().get(0), Some("1"));
        assert_eq!(cursor.next().unwrap().unwrap().get(0), Some("2"));
        assert!(cursor.next().is_none());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn closing_a_cursor_discards_remaining_rows() {
        let mut cursor = Cursor::new(sample_rows());
        assert!(cursor.next().is_some());
        cursor.close();
    }
}
