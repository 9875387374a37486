use std::time::Instant;
use core::fmt;
use bilge::prelude::*;

use crate::{
    config::MasterConfig,
    socket::EthercatSocket,
    registers::{AlError, AlMixedState, AlState},
    transport::{Transport, TransportStats},
    slave::{Lifecycle, SlaveState, StateRequest},
    mailbox::{Mailboxes, MailboxConfig, MailboxRequest, Operation},
    tunnel::{TunnelScheduler, TunnelStats},
    request::RequestHandle,
    error::{EthercatError, EthercatResult},
    };


/**
    This struct drives a whole ethercat segment: it owns the transport over the segment's socket and the state machines of its slaves.

    Nothing here blocks: the requests are queued by the methods of this struct, and are only progressing when [Self::cycle] is called. It must be called periodically, typically by [crate::driver::run] or by the user's own realtime loop. Independent segments are driven by independent masters.

    ## Example

    ```ignore
    let mut master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::default());
    master.add_slave(0, 0x1001, Some(mailbox), Instant::now())?;
    let switch = master.request_state(0, AlState::PreOperational)?;
    loop {
        master.cycle(Instant::now());
        if let Some(state) = master.take_state_request(switch) {
            break state
        }
        // wait for next period
    }
    ```
*/
pub struct Master {
    config: MasterConfig,
    transport: Transport,
    lifecycle: Lifecycle,
    mailboxes: Mailboxes,
    tunnels: TunnelScheduler,
    cycles: u64,
}

/// read-only view of a slave, for monitoring
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveStatus {
    pub position: u16,
    pub station: u16,
    pub state: SlaveState,
    pub requested: AlState,
    /// last AL status code reported by the slave
    pub last_code: Option<AlError>,
    /// state requests not terminated
    pub state_requests: usize,
    /// mailbox requests not terminated
    pub mailbox_requests: usize,
    pub tunneling: bool,
}

impl fmt::Display for SlaveStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} 0x{:04x} {}", self.position, self.station, self.state)?;
        if self.requested != self.state.al_state().unwrap_or(AlState::Init) {
            write!(f, " -> {}", self.requested)?;
        }
        if let Some(code) = self.last_code {
            write!(f, " {}", code)?;
        }
        Ok(())
    }
}

impl Master {
    /// initialize an ethercat master on the given socket
    pub fn new<S: EthercatSocket + Send + 'static>(socket: S, config: MasterConfig) -> Self {
        Self {
            transport: Transport::new(socket, &config),
            lifecycle: Lifecycle::new(&config),
            mailboxes: Mailboxes::new(&config),
            tunnels: TunnelScheduler::new(&config),
            cycles: 0,
            config,
        }
    }
    pub fn config(&self) -> &MasterConfig {&self.config}
    /// number of cycles run so far
    pub fn cycles(&self) -> u64 {self.cycles}

    /**
        run one master cycle: collect the answers received since the last cycle, advance every state machine, and send the resulting datagrams
    */
    pub fn cycle(&mut self, now: Instant) {
        self.transport.receive(now);
        self.lifecycle.update(&mut self.transport, now);

        let lifecycle = &self.lifecycle;
        self.tunnels.update(&mut self.mailboxes, now, |station| lifecycle.by_station(station)
            .and_then(|slave| match slave.state() {
                SlaveState::Nominal(state) => Some(state.rank() >= 1),
                SlaveState::Error(_) => None,
            })
            .unwrap_or(false));
        self.mailboxes.update(&mut self.transport, now, |station, now| lifecycle.dictionary_ready(station, now));

        self.transport.send(now);
        self.cycles += 1;
    }

    /**
        register the slave at the given ring position, answering to the given station address. Its mailbox layout shall be given if the slave has one.

        The slave must have been addressed and its mailbox sync managers configured beforehand.
    */
    pub fn add_slave(&mut self, position: u16, station: u16, mailbox: Option<MailboxConfig>, now: Instant) -> EthercatResult {
        self.lifecycle.add(position, station, now)?;
        if let Some(mailbox) = mailbox {
            self.mailboxes.configure(station, mailbox);
        }
        Ok(())
    }
    fn station(&self, position: u16) -> EthercatResult<u16> {
        self.lifecycle.slave(position)
            .map(|slave| slave.station())
            .ok_or(EthercatError::Master("no slave at this position"))
    }

    /// request the slave at the given position to switch to the given state
    pub fn request_state(&mut self, position: u16, target: AlState) -> EthercatResult<RequestHandle> {
        self.lifecycle.request_state(position, target)
    }
    pub fn state_request(&self, handle: RequestHandle) -> Option<&StateRequest> {
        self.lifecycle.poll(handle)
    }
    /// retire a terminated state request, `None` if it is not terminated
    pub fn take_state_request(&mut self, handle: RequestHandle) -> Option<StateRequest> {
        self.lifecycle.take(handle)
    }
    pub fn cancel_state_request(&mut self, handle: RequestHandle) -> bool {
        self.lifecycle.cancel(handle)
    }
    /// leave the error state of the slave at the given position
    pub fn reset(&mut self, position: u16, now: Instant) -> EthercatResult {
        self.lifecycle.reset(position, now)
    }

    /// queue an operation on the mailbox of the slave at the given position
    pub fn submit(&mut self, position: u16, operation: Operation) -> EthercatResult<RequestHandle> {
        let station = self.station(position)?;
        self.mailboxes.submit(station, operation)
    }
    /// fetch the object dictionary of the slave, this is only done once the slave has been in PREOP for the configured delay
    pub fn fetch_dictionary(&mut self, position: u16) -> EthercatResult<RequestHandle> {
        self.submit(position, Operation::Dictionary)
    }
    pub fn poll(&self, handle: RequestHandle) -> Option<&MailboxRequest> {
        self.mailboxes.poll(handle)
    }
    /// retire a terminated mailbox request, `None` if it is not terminated
    pub fn take(&mut self, handle: RequestHandle) -> Option<MailboxRequest> {
        self.mailboxes.take(handle)
    }
    /// cancel a mailbox request, see [Mailboxes::cancel]
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        self.mailboxes.cancel(handle)
    }

    /// start tunneling ethernet frames with the slave at the given position, it must have a mailbox
    pub fn enable_tunnel(&mut self, position: u16) -> EthercatResult {
        let station = self.station(position)?;
        let capacity = self.mailboxes.config(station)
            .ok_or(EthercatError::Master("slave has no mailbox configured"))?
            .max_write();
        self.tunnels.enable(station, capacity);
        Ok(())
    }
    /// queue an ethernet frame to the slave at the given position
    pub fn tunnel_send(&mut self, position: u16, frame: Vec<u8>) -> EthercatResult {
        let station = self.station(position)?;
        self.tunnels.send(station, frame)
    }
    /// pop an ethernet frame received from the slave at the given position
    pub fn tunnel_receive(&mut self, position: u16) -> Option<Vec<u8>> {
        let station = self.station(position).ok()?;
        self.tunnels.receive(station)
    }
    pub fn tunnel_stats(&self, position: u16) -> Option<&TunnelStats> {
        self.tunnels.stats(self.station(position).ok()?)
    }
    /// number of tunneling ticks run
    pub fn tunnel_ticks(&self) -> u64 {
        self.tunnels.ticks()
    }
    /// number of tunneling ticks missed and coalesced
    pub fn tunnel_skipped(&self) -> u64 {
        self.tunnels.skipped()
    }

    /// status of the slave at the given position
    pub fn status(&self, position: u16) -> Option<SlaveStatus> {
        let slave = self.lifecycle.slave(position)?;
        Some(SlaveStatus {
            position,
            station: slave.station(),
            state: slave.state(),
            requested: slave.requested(),
            last_code: slave.last_code(),
            state_requests: slave.active_requests(),
            mailbox_requests: self.mailboxes.active(slave.station()),
            tunneling: self.tunnels.enabled(slave.station()),
        })
    }
    /// status of every slave, in ring order
    pub fn statuses(&self) -> Vec<SlaveStatus> {
        self.lifecycle.slaves()
            .filter_map(|slave| self.status(slave.position()))
            .collect()
    }
    /// combination of the states of all slaves
    pub fn mixed_state(&self) -> AlMixedState {
        let bits = self.lifecycle.slaves()
            .filter_map(|slave| slave.state().al_state())
            .fold(0u8, |bits, state| bits | u4::from(state).value());
        AlMixedState::from(u4::new(bits))
    }
    pub fn transport_stats(&self) -> &TransportStats {
        self.transport.stats()
    }
}
