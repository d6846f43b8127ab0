//! Failure taxonomy shared by every actor in the core.
//!
//! Producers wrap an `NvrError` into `anyhow::Error`; supervisors call
//! [`NvrError::classify`] to decide between retrying, skipping the unit of
//! work, and parking the owning component in ERROR.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NvrError {
    /// Open/read/write failure on a media source or sink. Retried with backoff.
    Transport(String),
    /// Missing or non-monotonic timestamp. Recovered inline.
    Timestamp(String),
    /// Header/trailer/packet write failure. Abandons the current file or segment.
    Mux(String),
    /// No pool slot, no model slot, or detection capacity exceeded. Degrades to skip.
    ResourceExhausted(String),
    /// Unknown model, missing file, invalid stream settings. Parks the stream in ERROR.
    Config(String),
    /// A handle was torn down by another thread while in use.
    ShutdownRaced(String),
}

/// What a supervisor should do with a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    Retry,
    Skip,
    Park,
    Abort,
}

impl NvrError {
    pub fn transport(msg: impl Into<String>) -> anyhow::Error {
        NvrError::Transport(msg.into()).into()
    }

    pub fn mux(msg: impl Into<String>) -> anyhow::Error {
        NvrError::Mux(msg.into()).into()
    }

    pub fn exhausted(msg: impl Into<String>) -> anyhow::Error {
        NvrError::ResourceExhausted(msg.into()).into()
    }

    pub fn config(msg: impl Into<String>) -> anyhow::Error {
        NvrError::Config(msg.into()).into()
    }

    /// Finds the taxonomy entry for an error, if it carries one.
    pub fn classify(err: &anyhow::Error) -> Option<&NvrError> {
        err.chain().find_map(|cause| cause.downcast_ref::<NvrError>())
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            NvrError::Transport(_) => Recovery::Retry,
            NvrError::Timestamp(_) | NvrError::ResourceExhausted(_) => Recovery::Skip,
            NvrError::Mux(_) | NvrError::Config(_) => Recovery::Park,
            NvrError::ShutdownRaced(_) => Recovery::Abort,
        }
    }
}

/// Recovery for an arbitrary error; untyped failures are treated as transport trouble.
pub fn recovery_for(err: &anyhow::Error) -> Recovery {
    NvrError::classify(err)
        .map(NvrError::recovery)
        .unwrap_or(Recovery::Retry)
}

impl fmt::Display for NvrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvrError::Transport(msg) => write!(f, "transport error: {}", msg),
            NvrError::Timestamp(msg) => write!(f, "timestamp error: {}", msg),
            NvrError::Mux(msg) => write!(f, "mux error: {}", msg),
            NvrError::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            NvrError::Config(msg) => write!(f, "config error: {}", msg),
            NvrError::ShutdownRaced(msg) => write!(f, "shutdown raced: {}", msg),
        }
    }
}

impl std::error::Error for NvrError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_wrapped_taxonomy() {
        let err: anyhow::Result<()> = Err(NvrError::config("unknown model 'x.bin'"));
        let err = err.context("start stream cam1").unwrap_err();
        assert_eq!(
            NvrError::classify(&err),
            Some(&NvrError::Config("unknown model 'x.bin'".to_string()))
        );
        assert_eq!(recovery_for(&err), Recovery::Park);
    }

    #[test]
    fn untyped_errors_are_retried() {
        let err = anyhow::anyhow!("connection reset");
        assert!(NvrError::classify(&err).is_none());
        assert_eq!(recovery_for(&err), Recovery::Retry);
    }
}
