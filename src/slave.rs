/*!
    Application layer lifecycle of the slaves.

    Each slave has a current state, a requested state, and the engine drives the slave toward its requested state one datagram at a time, across as many master cycles as needed:

    ```text
    write AL control ──> read AL status ──> reached the step ? ──> next step or done
                              │    └── not yet ──> read AL status again on next cycle, until the deadline
                              └── error flag ──> read AL status code ──> slave in error
    ```

    Going up the state progression is done one state at a time (INIT, PREOP, SAFEOP, OP), going down is done directly.

    A slave in error stays in error until it is explicitly [reset](Lifecycle::reset), no automatic transition is attempted meanwhile.
*/

use std::{
    time::Instant,
    collections::BTreeMap,
    };
use core::{fmt, time::Duration};
use log::{info, error};

use crate::{
    config::MasterConfig,
    registers::{self, AlControlRequest, AlError, AlState, AlStatus},
    datagram::{Datagram, Response, SlaveAddress},
    transport::{Transport, DatagramId, DatagramState},
    request::{Requests, RequestHandle, RequestState},
    error::{EthercatError, EthercatResult},
    };


/// outcome of a state request, the state reached or the reason it could not
pub type StateRequest = RequestState<AlState, EthercatError<AlError>>;

/// lifecycle state of a slave as seen by the master
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveState {
    /// the slave is in the given state and accepts requests
    Nominal(AlState),
    /// the last state change failed, this is sticky until [Lifecycle::reset]
    Error(SlaveFault),
}

impl SlaveState {
    /// state of the slave, if it is known
    pub fn al_state(&self) -> Option<AlState> {
        match self {
            Self::Nominal(state) => Some(*state),
            Self::Error(fault) => fault.reported,
        }
    }
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for SlaveState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Nominal(state) => write!(f, "{}", state),
            Self::Error(fault) => match fault.reported {
                Some(state) => write!(f, "{} + ERROR", state),
                None => f.write_str("ERROR"),
            },
        }
    }
}

/// circumstances of a failed state change
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlaveFault {
    /// state the slave was requested to switch to
    pub requested: AlState,
    /// last state reported by the slave, if any
    pub reported: Option<AlState>,
    /// status code reported by the slave, if it reported one
    pub code: Option<AlError>,
}

/// datagram exchange in progress in a state change
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    /// writing the requested state
    Control,
    /// reading the current state
    Status,
    /// reading the reason of a failure
    Code,
}

#[derive(Clone, Debug)]
struct Change {
    handle: RequestHandle,
    target: AlState,
    /// state currently requested on the slave, one step toward target
    step: AlState,
    phase: Phase,
    /// start of the current step, for its deadline
    since: Instant,
    datagram: Option<DatagramId>,
    reported: Option<AlState>,
    /// the request has been cancelled while busy, the slave still completes its step but the result is discarded
    cancelled: bool,
}

/// record of a slave on the bus
#[derive(Clone, Debug)]
pub struct Slave {
    position: u16,
    station: u16,
    state: SlaveState,
    requested: AlState,
    last_code: Option<AlError>,
    entered_at: Instant,
    /// entry in the configuration state or above, for the dictionary guard
    configured_since: Option<Instant>,

    pending: Option<RequestHandle>,
    change: Option<Change>,
}

impl Slave {
    /// position in the ring
    pub fn position(&self) -> u16 {self.position}
    /// fixed address the slave answers to
    pub fn station(&self) -> u16 {self.station}
    pub fn state(&self) -> SlaveState {self.state}
    /// state the engine is driving the slave toward
    pub fn requested(&self) -> AlState {self.requested}
    /// last status code reported by the slave
    pub fn last_code(&self) -> Option<AlError> {self.last_code}
    /// instant of entry in the current state
    pub fn entered_at(&self) -> Instant {self.entered_at}
    /// number of state requests not yet terminated
    pub fn active_requests(&self) -> usize {
        usize::from(self.pending.is_some()) + usize::from(self.change.is_some())
    }

    fn enter(&mut self, state: AlState, now: Instant) {
        if state.rank() == 0 {
            self.configured_since = None;
        }
        else if self.configured_since.is_none() {
            self.configured_since = Some(now);
        }
        self.state = SlaveState::Nominal(state);
        self.entered_at = now;
    }
}


/**
    engine driving the application layer state of all slaves of a bus

    It never waits on anything: [Self::update] has to be called every master cycle, after the transport received and before it sends.
*/
pub struct Lifecycle {
    slaves: BTreeMap<u16, Slave>,
    requests: Requests<AlState, EthercatError<AlError>>,
    state_change_timeout: Duration,
    sdo_dictionary_delay: Duration,
}

impl Lifecycle {
    pub fn new(config: &MasterConfig) -> Self {
        Self {
            slaves: BTreeMap::new(),
            requests: Requests::new(),
            state_change_timeout: config.state_change_timeout,
            sdo_dictionary_delay: config.sdo_dictionary_delay,
        }
    }

    /**
        register the slave at the given ring position, answering to the given station address.

        The slave is assumed in [AlState::Init], which is the state of any slave after power on.
    */
    pub fn add(&mut self, position: u16, station: u16, now: Instant) -> EthercatResult {
        if self.slaves.contains_key(&position)
            {return Err(EthercatError::Master("a slave is already registered at this position"))}
        if self.slaves.values().any(|slave| slave.station == station)
            {return Err(EthercatError::Master("station address already in use"))}
        self.slaves.insert(position, Slave {
            position,
            station,
            state: SlaveState::Nominal(AlState::Init),
            requested: AlState::Init,
            last_code: None,
            entered_at: now,
            configured_since: None,
            pending: None,
            change: None,
            });
        Ok(())
    }
    pub fn slave(&self, position: u16) -> Option<&Slave> {
        self.slaves.get(&position)
    }
    /// slave answering to the given station address
    pub fn by_station(&self, station: u16) -> Option<&Slave> {
        self.slaves.values().find(|slave| slave.station == station)
    }
    pub fn slaves(&self) -> impl Iterator<Item=&Slave> {
        self.slaves.values()
    }

    /**
        request the given slave to switch to the given state

        A slave in error refuses any request. A request still queued for this slave is superseded by this one and ends [Cancelled](EthercatError::Cancelled).
    */
    pub fn request_state(&mut self, position: u16, target: AlState) -> EthercatResult<RequestHandle> {
        let slave = self.slaves.get_mut(&position)
            .ok_or(EthercatError::Master("no slave at this position"))?;
        if slave.state.is_error()
            {return Err(EthercatError::Master("slave is in error, it must be reset first"))}
        let handle = self.requests.insert();
        if let Some(former) = slave.pending.replace(handle) {
            self.requests.fail(former, EthercatError::Cancelled).ok();
        }
        slave.requested = target;
        Ok(handle)
    }
    /// current state of a state request
    pub fn poll(&self, handle: RequestHandle) -> Option<&StateRequest> {
        self.requests.get(handle)
    }
    /// retire a terminated state request and return its outcome
    pub fn take(&mut self, handle: RequestHandle) -> Option<StateRequest> {
        self.requests.take(handle)
    }
    /**
        cancel a state request

        A queued request is cancelled immediately and true is returned. A busy request keeps driving the slave until its change terminates, so that the slave state stays known, then its result is discarded and it ends [Cancelled](EthercatError::Cancelled).
    */
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        for slave in self.slaves.values_mut() {
            if slave.pending == Some(handle) {
                slave.pending = None;
                return self.requests.fail(handle, EthercatError::Cancelled).is_ok();
            }
            if let Some(change) = slave.change.as_mut().filter(|change| change.handle == handle) {
                change.cancelled = true;
            }
        }
        false
    }

    /**
        leave the error state of a slave

        The slave is assumed in the last state it reported, the next state request will acknowledge its error indication.
    */
    pub fn reset(&mut self, position: u16, now: Instant) -> EthercatResult {
        let slave = self.slaves.get_mut(&position)
            .ok_or(EthercatError::Master("no slave at this position"))?;
        if let SlaveState::Error(fault) = slave.state {
            let state = fault.reported.unwrap_or(AlState::Init);
            info!("slave {}: reset in {}", slave.position, state);
            slave.requested = state;
            slave.enter(state, now);
        }
        Ok(())
    }

    /// true once the slave spent enough time in the configuration state or above for its object dictionary to be fetched
    pub fn dictionary_ready(&self, station: u16, now: Instant) -> bool {
        self.by_station(station)
            .filter(|slave| ! slave.state.is_error())
            .and_then(|slave| slave.configured_since)
            .map_or(false, |since| now.saturating_duration_since(since) >= self.sdo_dictionary_delay)
    }

    /// advance the state changes of all slaves with the datagrams answered since the last call
    pub fn update(&mut self, transport: &mut Transport, now: Instant) {
        let Self {slaves, requests, state_change_timeout, ..} = self;
        for slave in slaves.values_mut() {
            // start the next request
            if slave.change.is_none() {
                if let Some(handle) = slave.pending.take() {
                    let current = slave.state.al_state().unwrap_or(AlState::Init);
                    let target = slave.requested;
                    requests.busy(handle).ok();
                    slave.change = Some(Change {
                        handle,
                        target,
                        step: current.step_toward(target),
                        phase: Phase::Control,
                        since: now,
                        datagram: None,
                        reported: None,
                        cancelled: false,
                        });
                }
            }
            if let Some(outcome) = advance(slave, transport, *state_change_timeout, now) {
                let Some(change) = slave.change.take()  else {continue};
                match outcome {
                    Ok(_) if change.cancelled => {requests.fail(change.handle, EthercatError::Cancelled).ok();},
                    Ok(state) => {requests.complete(change.handle, state).ok();},
                    Err(err) => {
                        error!("slave {}: failed to switch to {}: {}", slave.position, change.step, err);
                        let err = if change.cancelled {EthercatError::Cancelled} else {err};
                        requests.fail(change.handle, err).ok();
                        if let Some(handle) = slave.pending.take() {
                            requests.fail(handle, EthercatError::Master("slave switched to error")).ok();
                        }
                    },
                }
            }
        }
    }
}

/// step reached by an answer in a state change
enum Progress {
    Continue,
    Done(AlState),
}

/// run the state change of a slave as far as possible in this cycle, returns its outcome once terminated
fn advance(slave: &mut Slave, transport: &mut Transport, timeout: Duration, now: Instant) -> Option<EthercatResult<AlState, AlError>> {
    let change = slave.change.as_mut()?;

    if let Some(id) = change.datagram {
        let answer = match transport.take(id)? {
            DatagramState::Received(answer) => answer,
            _ => {
                let fault = SlaveFault {requested: change.step, reported: slave.state.al_state(), code: None};
                slave.state = SlaveState::Error(fault);
                return Some(Err(EthercatError::RetryExhausted));
            },
        };
        change.datagram = None;
        match receive(slave, answer, timeout, now) {
            Ok(Progress::Continue) => {},
            Ok(Progress::Done(state)) => return Some(Ok(state)),
            Err(err) => {
                let change = slave.change.as_ref()?;
                let code = match err {
                    EthercatError::ProtocolReject(code) => Some(code),
                    _ => None,
                };
                slave.state = SlaveState::Error(SlaveFault {
                    requested: change.step,
                    reported: change.reported,
                    code,
                    });
                return Some(Err(err));
            },
        }
    }

    // send the datagram of the current phase
    let change = slave.change.as_mut()?;
    let address = SlaveAddress::Fixed(slave.station);
    let datagram = match change.phase {
        Phase::Control => Datagram::write(address, registers::al::control, AlControlRequest::switch(change.step)),
        Phase::Status => Ok(Datagram::read(address, registers::al::status)),
        Phase::Code => Ok(Datagram::read(address, registers::al::error)),
    };
    match datagram.map_err(EthercatError::from)
                .and_then(|datagram| transport.queue(datagram).map_err(EthercatError::upgrade)) {
        Ok(id) => change.datagram = Some(id),
        Err(err) => return Some(Err(err)),
    }
    None
}

/// process the answer to the datagram of the current phase
fn receive(slave: &mut Slave, answer: Response, timeout: Duration, now: Instant) -> EthercatResult<Progress, AlError> {
    let Some(change) = slave.change.as_mut()  else {return Ok(Progress::Continue)};
    if answer.working_count != 1
        {return Err(EthercatError::UnexpectedState {requested: change.step, reported: None})}

    match change.phase {
        Phase::Control => {
            change.phase = Phase::Status;
        },
        Phase::Status => {
            let status = answer.value::<AlStatus>()?;
            change.reported = status.al_state();
            if status.error() {
                change.phase = Phase::Code;
            }
            else if change.reported == Some(change.step) {
                let step = change.step;
                let target = change.target;
                change.step = step.step_toward(target);
                change.phase = Phase::Control;
                change.since = now;
                let from = slave.state;
                slave.enter(step, now);
                info!("slave {}: {} -> {}", slave.position, from, step);
                if step == target
                    {return Ok(Progress::Done(step))}
            }
            else if now.saturating_duration_since(change.since) >= timeout {
                return Err(EthercatError::UnexpectedState {requested: change.step, reported: change.reported});
            }
        },
        Phase::Code => {
            let code = answer.value::<AlError>()?;
            slave.last_code = Some(code);
            return Err(EthercatError::ProtocolReject(code));
        },
    }
    Ok(Progress::Continue)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_request_supersedes_queued_one() {
        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(&MasterConfig::default());
        lifecycle.add(0, 0x1001, now).unwrap();
        assert!(lifecycle.add(0, 0x1002, now).is_err());
        assert!(lifecycle.add(1, 0x1001, now).is_err());

        let first = lifecycle.request_state(0, AlState::PreOperational).unwrap();
        let second = lifecycle.request_state(0, AlState::Operational).unwrap();
        assert!(matches!(lifecycle.poll(first), Some(RequestState::Error(EthercatError::Cancelled))));
        assert_eq!(lifecycle.poll(second), Some(&RequestState::Queued));
        assert_eq!(lifecycle.slave(0).unwrap().requested(), AlState::Operational);
        assert_eq!(lifecycle.slave(0).unwrap().active_requests(), 1);

        assert!(lifecycle.cancel(second));
        assert!(! lifecycle.cancel(second));
        assert_eq!(lifecycle.slave(0).unwrap().active_requests(), 0);
        assert!(lifecycle.request_state(5, AlState::Init).is_err());
    }

    #[test]
    fn dictionary_guard() {
        let now = Instant::now();
        let config = MasterConfig::default();
        let mut lifecycle = Lifecycle::new(&config);
        lifecycle.add(0, 0x1001, now).unwrap();
        assert!(! lifecycle.dictionary_ready(0x1001, now + config.sdo_dictionary_delay));

        let slave = lifecycle.slaves.get_mut(&0).unwrap();
        slave.enter(AlState::PreOperational, now);
        // climbing further keeps the instant of entry in the configuration state
        slave.enter(AlState::SafeOperational, now + Duration::from_secs(1));
        assert!(! lifecycle.dictionary_ready(0x1001, now + Duration::from_millis(2999)));
        assert!(lifecycle.dictionary_ready(0x1001, now + Duration::from_secs(3)));

        lifecycle.slaves.get_mut(&0).unwrap().enter(AlState::Init, now + Duration::from_secs(4));
        assert!(! lifecycle.dictionary_ready(0x1001, now + Duration::from_secs(10)));
    }

    #[test]
    fn faulted_slave_refuses_requests_until_reset() {
        let now = Instant::now();
        let mut lifecycle = Lifecycle::new(&MasterConfig::default());
        lifecycle.add(0, 0x1001, now).unwrap();
        lifecycle.slaves.get_mut(&0).unwrap().state = SlaveState::Error(SlaveFault {
            requested: AlState::SafeOperational,
            reported: Some(AlState::PreOperational),
            code: Some(AlError::InvalidSyncConfig),
            });
        assert_eq!(lifecycle.slave(0).unwrap().state().to_string(), "PREOP + ERROR");
        assert!(lifecycle.request_state(0, AlState::Operational).is_err());

        lifecycle.reset(0, now).unwrap();
        assert_eq!(lifecycle.slave(0).unwrap().state(), SlaveState::Nominal(AlState::PreOperational));
        assert!(lifecycle.request_state(0, AlState::Operational).is_ok());
    }
}
