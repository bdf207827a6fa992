// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    borrow::Cow,
    error::Error,
    fmt,
};
use trellis_metadata::ErrorMetadata;

/// The result type returned by test bodies, hooks, fixture constructors and teardowns.
pub type TestResult<T = ()> = Result<T, CapturedError>;

/// An error captured from a test, a fixture, a hook or an extension.
///
/// `CapturedError` can be created from any [`std::error::Error`] through `?` or `From`, from a
/// plain message with [`CapturedError::msg`], and from a panic payload. It records the Rust type
/// name of the original error where one is known, the error's source chain, and a backtrace when
/// backtraces are enabled (`RUST_BACKTRACE=1`).
///
/// Unlike the error it was created from, `CapturedError` is `Clone`: errors captured at one level
/// of the run are copied into the aggregators of every child level.
#[derive(Clone, Debug)]
pub struct CapturedError {
    kind: CapturedErrorKind,
    message: String,
    stack_trace: Option<String>,
    inner: Vec<CapturedError>,
}

/// What a [`CapturedError`] was created from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapturedErrorKind {
    /// A Rust error value, or a message.
    Error {
        /// The Rust type name of the error, if known.
        type_name: Option<Cow<'static, str>>,
    },

    /// A panic.
    Panic,

    /// Several independent failures combined into one. The failures are the inner errors.
    Multiple,
}

impl CapturedError {
    /// The type name reported for panics.
    pub const PANIC_TYPE: &'static str = "panic";

    /// The type name reported for combined failures.
    pub const MULTIPLE_FAILURES_TYPE: &'static str = "multiple failures";

    /// Captures an error value, along with its source chain.
    pub fn new<E: Error + Send + Sync + 'static>(err: E) -> Self {
        let inner = err.source().map(Self::from_source).into_iter().collect();
        Self {
            kind: CapturedErrorKind::Error {
                type_name: Some(Cow::Borrowed(std::any::type_name::<E>())),
            },
            message: err.to_string(),
            stack_trace: capture_backtrace(),
            inner,
        }
    }

    /// Creates an error from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            kind: CapturedErrorKind::Error { type_name: None },
            message: message.to_string(),
            stack_trace: capture_backtrace(),
            inner: Vec::new(),
        }
    }

    /// Creates an error from a message, reporting it with the given type name.
    pub fn with_type_name(
        type_name: impl Into<Cow<'static, str>>,
        message: impl fmt::Display,
    ) -> Self {
        Self {
            kind: CapturedErrorKind::Error {
                type_name: Some(type_name.into()),
            },
            message: message.to_string(),
            stack_trace: capture_backtrace(),
            inner: Vec::new(),
        }
    }

    /// Captures the payload of a panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self {
            kind: CapturedErrorKind::Panic,
            message: panic_message(payload.as_ref()),
            stack_trace: None,
            inner: Vec::new(),
        }
    }

    /// Combines several errors into one.
    ///
    /// A single error is returned unchanged.
    pub fn multiple(errors: Vec<CapturedError>) -> Self {
        match <[CapturedError; 1]>::try_from(errors) {
            Ok([error]) => error,
            Err(errors) => Self {
                kind: CapturedErrorKind::Multiple,
                message: format!("{} failures occurred", errors.len()),
                stack_trace: None,
                inner: errors,
            },
        }
    }

    /// Attaches an error that caused this one.
    pub fn with_inner(mut self, inner: CapturedError) -> Self {
        self.inner.push(inner);
        self
    }

    /// What this error was created from.
    pub fn kind(&self) -> &CapturedErrorKind {
        &self.kind
    }

    /// The name reported as this error's type.
    pub fn type_name(&self) -> Option<&str> {
        match &self.kind {
            CapturedErrorKind::Error { type_name } => type_name.as_deref(),
            CapturedErrorKind::Panic => Some(Self::PANIC_TYPE),
            CapturedErrorKind::Multiple => Some(Self::MULTIPLE_FAILURES_TYPE),
        }
    }

    /// The error's message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The backtrace captured with this error, if any.
    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    /// Errors contained in this one: the source chain, or the failures of a combined error.
    pub fn inner(&self) -> &[CapturedError] {
        &self.inner
    }

    /// Flattens this error and everything it contains into [`ErrorMetadata`].
    ///
    /// Errors are listed depth-first, with the root at index 0.
    pub fn to_error_metadata(&self) -> ErrorMetadata {
        let mut metadata = ErrorMetadata::default();
        self.push_metadata(&mut metadata, -1);
        metadata
    }

    fn push_metadata(&self, metadata: &mut ErrorMetadata, parent_index: i32) {
        let index = metadata.push(
            self.type_name().map(|s| s.to_owned()),
            self.message.clone(),
            self.stack_trace.clone(),
            parent_index,
        );
        for inner in &self.inner {
            inner.push_metadata(metadata, index);
        }
    }

    fn from_source(source: &(dyn Error + 'static)) -> Self {
        Self {
            kind: CapturedErrorKind::Error { type_name: None },
            message: source.to_string(),
            stack_trace: None,
            inner: source.source().map(Self::from_source).into_iter().collect(),
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.kind == CapturedErrorKind::Multiple {
            for (idx, inner) in self.inner.iter().enumerate() {
                write!(f, "\n  {}. {}", idx + 1, inner)?;
            }
        } else if f.alternate() {
            for inner in &self.inner {
                write!(f, "\n  caused by: {inner:#}")?;
            }
        }
        Ok(())
    }
}

impl<E: Error + Send + Sync + 'static> From<E> for CapturedError {
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

/// Extracts a message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

fn capture_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
