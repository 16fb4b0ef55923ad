//! Purpose: Shared error model for the control plane and its transports.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Single error type crossing module boundaries; builder-style context.
//! Invariants: Kinds are stable; exit codes derived from kinds never change.
//! Invariants: Probe/normalizer outcomes are not errors and never use this type.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    AlreadyRunning,
    EngineCreation,
    Engine,
    TestFailed,
    Cancelled,
    Io,
    Permission,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Text handed back to RPC callers: the message when present, otherwise
    /// the kind, followed by the source chain head.
    pub fn wire_message(&self) -> String {
        let mut out = match &self.message {
            Some(message) => message.clone(),
            None => format!("{:?}", self.kind),
        };
        if let Some(source) = &self.source {
            out.push_str(": ");
            out.push_str(&source.to_string());
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
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
        ErrorKind::AlreadyRunning => 3,
        ErrorKind::EngineCreation => 4,
        ErrorKind::Engine => 5,
        ErrorKind::TestFailed => 6,
        ErrorKind::Cancelled => 7,
        ErrorKind::Io => 8,
        ErrorKind::Permission => 9,
    }
}
