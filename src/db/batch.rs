//! Statement batches.
//!
//! A [`Batch`] is created by a backend strategy and is bound to that
//! backend's dialect; [`Connection::send_batch`](crate::db::Connection::send_batch)
//! refuses to run it on a connection of another backend.

use crate::models::{DatabaseType, QueryParam};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

#[derive(Debug, Clone)]
pub struct Batch {
    database_type: DatabaseType,
    statements: Vec<BatchStatement>,
}

impl Batch {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            statements: Vec::new(),
        }
    }

    /// Append a statement.
    pub fn queue(&mut self, sql: impl Into<String>, params: Vec<QueryParam>) -> &mut Self {
        self.statements.push(BatchStatement {
            sql: sql.into(),
            params,
        });
        self
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    pub fn statements(&self) -> &[BatchStatement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Per-statement outcome of a batch, in queue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResults {
    pub rows_affected: Vec<u64>,
}

impl BatchResults {
    pub fn total_rows_affected(&self) -> u64 {
        self.rows_affected.iter().sum()
    }
}
