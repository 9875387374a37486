/*!
    Uniform lifecycle of the asynchronous requests of the master.

    Every operation that spans several cycles (a slave state change, a mailbox exchange, a dictionary fetch) is tracked by a [RequestState] going

    ```text
    Queued ──> Busy ──> Completed(result)
       │         └────> Error(reason)
       └──────────────> Error(reason)
    ```

    `Completed` and `Error` are terminal, no further transition is accepted from them.
*/

use core::fmt;
use std::collections::HashMap;


/// state of a request, generic over what it produces and how it fails
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestState<T, E> {
    /// waiting for its turn, nothing has been sent yet
    Queued,
    /// a datagram of this request is on the bus
    Busy,
    /// the request succeeded
    Completed(T),
    /// the request failed
    Error(E),
}

impl<T, E> RequestState<T, E> {
    /// true for [Self::Completed] and [Self::Error]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Error(_))
    }
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
    /// convert a terminal state into a result
    pub fn result(self) -> Option<Result<T, E>> {
        match self {
            Self::Completed(value) => Some(Ok(value)),
            Self::Error(error) => Some(Err(error)),
            _ => None,
        }
    }
}

impl<T, E> fmt::Display for RequestState<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Busy => "busy",
            Self::Completed(_) => "completed",
            Self::Error(_) => "error",
        })
    }
}

/// identifier of a request, unique in the [Requests] table that issued it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl fmt::Display for RequestHandle {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// a transition has been refused because the request already reached a terminal state
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Terminated;

/**
    table of requests indexed by handle

    terminal requests are kept until their owner takes them, so their outcome can be polled at any time after completion
*/
#[derive(Debug)]
pub struct Requests<T, E> {
    states: HashMap<RequestHandle, RequestState<T, E>>,
    next: u64,
}

impl<T, E> Default for Requests<T, E> {
    fn default() -> Self {
        Self {states: HashMap::new(), next: 0}
    }
}

impl<T, E> Requests<T, E> {
    pub fn new() -> Self {Self::default()}

    /// register a new request in [RequestState::Queued]
    pub fn insert(&mut self) -> RequestHandle {
        let handle = RequestHandle(self.next);
        self.next += 1;
        self.states.insert(handle, RequestState::Queued);
        handle
    }
    pub fn get(&self, handle: RequestHandle) -> Option<&RequestState<T, E>> {
        self.states.get(&handle)
    }
    /// move a request to the given state, unless it is already terminal
    pub fn set(&mut self, handle: RequestHandle, state: RequestState<T, E>) -> Result<(), Terminated> {
        match self.states.get_mut(&handle) {
            Some(current) if ! current.is_terminal() => {
                *current = state;
                Ok(())
            },
            _ => Err(Terminated),
        }
    }
    /// mark a request busy, shorthand for [Self::set]
    pub fn busy(&mut self, handle: RequestHandle) -> Result<(), Terminated> {
        self.set(handle, RequestState::Busy)
    }
    pub fn complete(&mut self, handle: RequestHandle, value: T) -> Result<(), Terminated> {
        self.set(handle, RequestState::Completed(value))
    }
    pub fn fail(&mut self, handle: RequestHandle, error: E) -> Result<(), Terminated> {
        self.set(handle, RequestState::Error(error))
    }
    /// remove a terminal request from the table and return its final state
    pub fn take(&mut self, handle: RequestHandle) -> Option<RequestState<T, E>> {
        if self.states.get(&handle)?.is_terminal()
            {self.states.remove(&handle)}
        else
            {None}
    }
    /// number of requests not yet terminated
    pub fn active(&self) -> usize {
        self.states.values().filter(|state| ! state.is_terminal()).count()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        let mut requests = Requests::<u8, &str>::new();
        let a = requests.insert();
        let b = requests.insert();
        assert_ne!(a, b);
        assert_eq!(requests.get(a), Some(&RequestState::Queued));
        assert_eq!(requests.active(), 2);

        requests.busy(a).unwrap();
        requests.complete(a, 5).unwrap();
        assert_eq!(requests.busy(a), Err(Terminated));
        assert_eq!(requests.fail(a, "late"), Err(Terminated));
        assert_eq!(requests.get(a), Some(&RequestState::Completed(5)));

        requests.fail(b, "refused").unwrap();
        assert_eq!(requests.complete(b, 1), Err(Terminated));
        assert_eq!(requests.active(), 0);
    }

    #[test]
    fn only_terminal_requests_are_taken() {
        let mut requests = Requests::<(), ()>::new();
        let handle = requests.insert();
        assert_eq!(requests.take(handle), None);
        requests.complete(handle, ()).unwrap();
        assert_eq!(requests.take(handle).and_then(RequestState::result), Some(Ok(())));
        assert_eq!(requests.get(handle), None);
        assert_eq!(requests.busy(handle), Err(Terminated));
    }
}
