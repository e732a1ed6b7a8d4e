//! Purpose: Single error type shared by the store, every collection, the LRU cache and the CLI.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Builder-style error carrying a stable kind plus optional table/position context.
//! Invariants: Not-found is never an error; lookups return `Ok(None)` or `false` instead.
//! Invariants: Rollback failures are folded into the error that triggered the rollback.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    StoreUnavailable,
    StoreClosed,
    Schema,
    Codec,
    PositionNotFound,
    Transaction,
    Query,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    table: Option<String>,
    position: Option<usize>,
    rollback: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            table: None,
            position: None,
            rollback: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Description of a rollback that failed while this error was being handled.
    pub fn rollback_failure(&self) -> Option<&str> {
        self.rollback.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_rollback_failure(mut self, rollback: impl fmt::Display) -> Self {
        self.rollback = Some(rollback.to_string());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(table) = &self.table {
            write!(f, " (table: {table})")?;
        }
        if let Some(position) = self.position {
            write!(f, " (position: {position})")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        if let Some(rollback) = &self.rollback {
            write!(f, "; rollback transaction: {rollback}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::StoreUnavailable => 3,
        ErrorKind::StoreClosed => 4,
        ErrorKind::Schema => 5,
        ErrorKind::Codec => 6,
        ErrorKind::PositionNotFound => 7,
        ErrorKind::Transaction => 8,
        ErrorKind::Query => 9,
    }
}
