//! definition of the general ethercat error type

use std::sync::Arc;
use core::fmt;
use crate::registers::AlState;

/**
    general object reporting an unexpected result regarding ethercat communication

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it.

    Errors raised during the bus cycle never escape the engine: they end in the terminal state of the request that suffered them, and are observed by polling that request. Only submission can return them directly.

    [Self::ProtocolReject] variant should not be used without an appropriate type for `T`, `T` depend on the operation the slave reports for, and is usually an error code, or an enum.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// error caused by communication support
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// no matching answer came before the deadline of an operation
    ///
    /// these errors are generally contextual and the operation can be retried.
    Timeout(&'static str),

    /// a datagram has timed out as many times as the retry ceiling allows
    RetryExhausted,

    /// a payload is bigger than what a single datagram can carry, it has been rejected at submission
    OversizedPayload {size: usize, max: usize},

    /// the slave did not reach the requested state before the state change deadline
    UnexpectedState {requested: AlState, reported: Option<AlState>},

    /// error reported by a slave, its type depend on the operation returning this error
    ///
    /// it is passed through verbatim and never retried, since retrying would not change the slave's opinion
    ProtocolReject(T),

    /// the request has been cancelled before being processed
    Cancelled,

    /// error reported by the master
    ///
    /// these errors can generally be handled and fixed by using the master differently
    Master(&'static str),

    /// a frame or a slave answer does not follow the protocol
    Malformed(&'static str),
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io: {}", error),
            Self::Timeout(context) => write!(f, "timeout: {}", context),
            Self::RetryExhausted => write!(f, "timeout: retries exhausted"),
            Self::OversizedPayload {size, max} => write!(f, "master: payload of {} bytes exceeds {} bytes", size, max),
            Self::UnexpectedState {requested, reported: Some(reported)} => write!(f, "slave: reached {} instead of {}", reported, requested),
            Self::UnexpectedState {requested, reported: None} => write!(f, "slave: did not report a state while switching to {}", requested),
            Self::ProtocolReject(value) => write!(f, "slave: rejected with {:?}", value),
            Self::Cancelled => write!(f, "master: cancelled"),
            Self::Master(message) => write!(f, "master: {}", message),
            Self::Malformed(message) => write!(f, "protocol: {}", message),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

/// io errors are compared by kind
impl<T: PartialEq> PartialEq for EthercatError<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::RetryExhausted, Self::RetryExhausted) => true,
            (Self::OversizedPayload {size: a, max: b}, Self::OversizedPayload {size: c, max: d}) => a == c && b == d,
            (Self::UnexpectedState {requested: a, reported: b}, Self::UnexpectedState {requested: c, reported: d}) => a == c && b == d,
            (Self::ProtocolReject(a), Self::ProtocolReject(b)) => a == b,
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::Master(a), Self::Master(b)) => a == b,
            (Self::Malformed(a), Self::Malformed(b)) => a == b,
            _ => false,
        }
    }
}
impl<T: Eq> Eq for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Malformed(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

// because rust doesn't allow specialization and already implements `From<T> for T`, we cannot write smart conversions for generic EthercatError<T>, so these are manual conversion methods
impl<E> EthercatError<E> {
    /// convert the error if the slave specific error type allows it
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(|e| F::from(e))
    }
    /// convert the error with a callback handling the case of slave-specific error
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::ProtocolReject(value) => EthercatError::ProtocolReject(callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::RetryExhausted => EthercatError::RetryExhausted,
            EthercatError::OversizedPayload {size, max} => EthercatError::OversizedPayload {size, max},
            EthercatError::UnexpectedState {requested, reported} => EthercatError::UnexpectedState {requested, reported},
            EthercatError::Cancelled => EthercatError::Cancelled,
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Malformed(message) => EthercatError::Malformed(message),
        }
    }
}
impl EthercatError<()> {
    /// convert an error with no slave-specific type into an error with a slave-specific type
    pub fn upgrade<F>(self) -> EthercatError<F> {
        self.map(|_|  unreachable!("an ethercat error with no slave-specific error type cannot report a slave error"))
    }
}
