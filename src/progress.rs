//! Transfer lifecycle events (C8).
//!
//! A tagged variant over subclassing: each transfer client emits a total
//! order of these events ending in exactly one terminal event.

use crate::error::HotlineError;
use crate::rate::Progress;

/// One entry of a transfer's `transfer(...)` event: a fork-level byte count
/// folded into the overall rate-estimated progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSample {
    pub name: String,
    /// Size of the fork/item currently in flight.
    pub size: u64,
    pub progress: Progress,
}

/// The uniform event taxonomy every transfer client emits, in total order,
/// ending in exactly one terminal event (`Completed` or `Error`).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Preparing,
    Connecting,
    Connected,
    Transfer(TransferSample),
    Completed(Option<String>),
    Error(ErrorKind),
}

/// A caller-facing summary of a [`HotlineError`], flattened to the kind the
/// progress callback is documented to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotReady,
    Closed,
    InvalidPort,
    Io,
    InsufficientData,
    FramingExceeded,
    DecodeFailed,
    EncodeFailed,
    FailedToTransfer,
    Cancelled,
}

impl From<&HotlineError> for ErrorKind {
    fn from(err: &HotlineError) -> Self {
        match err {
            HotlineError::NotReady => ErrorKind::NotReady,
            HotlineError::Closed => ErrorKind::Closed,
            HotlineError::InvalidPort(_) => ErrorKind::InvalidPort,
            HotlineError::Io(_) => ErrorKind::Io,
            HotlineError::InsufficientData { .. } => ErrorKind::InsufficientData,
            HotlineError::FramingExceeded { .. } => ErrorKind::FramingExceeded,
            HotlineError::DecodeFailed(_) => ErrorKind::DecodeFailed,
            HotlineError::EncodeFailed(_) => ErrorKind::EncodeFailed,
            HotlineError::FailedToTransfer(_) => ErrorKind::FailedToTransfer,
            HotlineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// A progress callback: every transfer client handle consumes one so callers
/// can observe a transfer's lifecycle without polling. Boxed so clients can
/// accept closures or channel senders interchangeably.
pub type ProgressSink = Box<dyn FnMut(TransferEvent) + Send>;

/// Calls `sink` if present; transfer clients use this at every emission
/// point so a missing callback is a no-op rather than a branch at each call
/// site.
pub(crate) fn emit(sink: &mut Option<ProgressSink>, event: TransferEvent) {
    if let Some(sink) = sink.as_mut() {
        sink(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_flattens_from_hotline_error() {
        let err = HotlineError::FramingExceeded { max: 8 };
        assert_eq!(ErrorKind::from(&err), ErrorKind::FramingExceeded);
    }

    #[test]
    fn emit_is_a_no_op_without_a_sink() {
        let mut sink: Option<ProgressSink> = None;
        emit(&mut sink, TransferEvent::Preparing);
    }

    #[test]
    fn emit_calls_the_sink() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_for_sink = seen.clone();
        let mut sink: Option<ProgressSink> =
            Some(Box::new(move |event| seen_for_sink.lock().unwrap().push(format!("{event:?}"))));
        emit(&mut sink, TransferEvent::Connecting);
        drop(sink);
        assert_eq!(*seen.lock().unwrap(), vec!["Connecting".to_string()]);
    }
}
