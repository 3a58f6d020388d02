//! Error reporting for serialization runs.
//!
//! Every failure funnels into a single [`Error`] carrying an
//! [`ErrorKind`] and a message. Whether a reported error aborts the run
//! is decided by the installed [`ErrorCallback`]: the throw policy
//! propagates it, the do-nothing policy swallows it and lets the
//! operation continue with a kind-specific default value.

use std::fmt;
use std::rc::Rc;

/// Result type of all serialization operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Classification of a serialization failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The value's type cannot be archived and no custom serializer is
    /// registered for it.
    NotSerializable,
    /// A polymorphic runtime type was encountered without a matching
    /// class registration.
    UnregisteredType,
    /// The document is structurally invalid: a missing element or
    /// attribute, a duplicate key within a scope, or an unparseable
    /// literal.
    MalformedArchive,
    /// A public operation was called in a state that does not allow it.
    ApiMisuse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NotSerializable => "value not serializable",
            ErrorKind::UnregisteredType => "unregistered runtime type",
            ErrorKind::MalformedArchive => "malformed archive",
            ErrorKind::ApiMisuse => "api misuse",
        };
        f.write_str(text)
    }
}

/// A serialization failure.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable context.
    pub message: String,
    // Set once the error has passed through the error callback, so that
    // a propagating error is never reported twice.
    pub(crate) reported: bool,
}

impl Error {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            reported: false,
        }
    }

    /// Shorthand for a [`ErrorKind::NotSerializable`] error.
    pub fn not_serializable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSerializable, message)
    }

    /// Shorthand for a [`ErrorKind::UnregisteredType`] error.
    pub fn unregistered(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnregisteredType, message)
    }

    /// Shorthand for a [`ErrorKind::MalformedArchive`] error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedArchive, message)
    }

    /// Shorthand for an [`ErrorKind::ApiMisuse`] error.
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiMisuse, message)
    }
}

/// Decides whether a reported error aborts the run.
///
/// Returning `true` propagates the error out of the current operation;
/// returning `false` swallows it and substitutes the kind-specific
/// default value at the failure site.
pub type ErrorCallback = Rc<dyn Fn(&Error) -> bool>;

/// The callback that propagates every error.
pub fn throw_on_error() -> ErrorCallback {
    Rc::new(|_| true)
}

/// The callback that swallows every error.
pub fn do_nothing_on_error() -> ErrorCallback {
    Rc::new(|_| false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let error = Error::malformed("missing `id` attribute");
        assert_eq!(
            error.to_string(),
            "malformed archive: missing `id` attribute"
        );
    }

    #[test]
    fn callbacks_decide_propagation() {
        let error = Error::misuse("nope");
        assert!(throw_on_error()(&error));
        assert!(!do_nothing_on_error()(&error));
    }
}
