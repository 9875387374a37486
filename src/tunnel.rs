/*!
    EoE (Ethernet over EtherCAT): tunneling of ethernet frames through the slaves mailboxes.

    Ethernet frames are cut in fragments small enough for the slave mailbox, each with a [EoeHeader]. The [TunnelScheduler] runs at a fixed rate and, on each tick, gives every tunneling slave without an outstanding exchange either its next outgoing fragment, or a fetch of its incoming fragments.

    When ticks are missed because the master cycle was late, they are not replayed: the next call runs a single tick covering all the pending work, and the following tick is scheduled one period after it. The number of skipped ticks is counted for diagnostics.

    ETG.1000.6 5.7
*/

use std::{
    time::Instant,
    collections::{BTreeMap, VecDeque},
    };
use core::time::Duration;
use bilge::prelude::*;
use log::{debug, warn};

use crate::{
    config::MasterConfig,
    data::{self, PduData, Cursor, MacAddress},
    mailbox::{Mailboxes, MailboxType, MailboxReply, MailboxReject, Operation},
    request::{RequestHandle, RequestState},
    error::{EthercatError, EthercatResult},
    };


/// maximum size of a tunneled ethernet frame, its ethernet header included
pub const MAX_FRAME_SIZE: usize = 1518;
/// fragments offsets and sizes are counted in units of this size
const FRAGMENT_UNIT: usize = 32;

/// EoE header, preceding each fragment in a mailbox message
///
/// ETG.1000.6 table 54
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct EoeHeader {
    pub ty: EoeType,
    /// ethernet port of the slave, 0 for its only or default port
    pub port: u4,
    pub last_fragment: bool,
    pub time_appended: bool,
    pub time_request: bool,
    reserved: u5,
    /// index of the fragment in its frame
    pub fragment_number: u6,
    /// for the first fragment, total size of the frame in 32 bytes units rounded up, for the next ones, offset of the fragment in 32 bytes units
    pub offset: u6,
    /// number of the frame the fragment belongs to, cycling
    pub frame_number: u4,
}
data::bilge_pdudata!(EoeHeader, u32, u32);

/// ETG.1000.6 table 55
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EoeType {
    FrameFragment = 0,
    TimestampResponse = 1,
    InitRequest = 2,
    InitResponse = 3,
    FilterRequest = 4,
    FilterResponse = 5,
    #[fallback]
    Unknown = 0xf,
}

/**
    build the fragment starting at `offset` in the given frame, returns it with the offset of the next fragment

    `capacity` is the maximum payload of a mailbox message, every fragment but the last has a size multiple of 32 bytes.
*/
pub fn fragment(frame: &[u8], offset: usize, fragment_number: u8, frame_number: u8, capacity: usize) -> EthercatResult<(Vec<u8>, usize)> {
    let room = capacity.saturating_sub(EoeHeader::packed_size());
    let remain = frame.len().saturating_sub(offset);
    let size = if remain <= room {remain} else {room / FRAGMENT_UNIT * FRAGMENT_UNIT};
    if size == 0 && remain != 0
        {return Err(EthercatError::Master("mailbox too small for ethernet tunneling"))}
    let last = offset + size >= frame.len();

    let mut header = EoeHeader::default();
    header.set_ty(EoeType::FrameFragment);
    header.set_last_fragment(last);
    header.set_fragment_number(u6::new(fragment_number & 0x3f));
    header.set_offset(u6::new(if fragment_number == 0 {
            (frame.len() + FRAGMENT_UNIT - 1) / FRAGMENT_UNIT
        } else {
            offset / FRAGMENT_UNIT
        } as u8 & 0x3f));
    header.set_frame_number(u4::new(frame_number & 0xf));

    let mut data = vec![0; EoeHeader::packed_size() + size];
    let mut cursor = Cursor::new(data.as_mut_slice());
    cursor.pack(&header)?;
    cursor.write(&frame[offset .. offset + size])?;
    Ok((data, offset + size))
}

/// frame being reassembled from incoming fragments
#[derive(Clone, Debug)]
struct Reassembly {
    frame_number: u8,
    next_fragment: u8,
    data: Vec<u8>,
}

/// frame being fragmented
#[derive(Clone, Debug)]
struct Outgoing {
    frame: Vec<u8>,
    offset: usize,
    fragment_number: u8,
    frame_number: u8,
}

/// mailbox exchange in progress for a tunnel
#[derive(Copy, Clone, Debug)]
enum Pending {
    /// a fragment is being sent, ending at this offset
    Send(RequestHandle, usize),
    /// incoming fragments are being fetched
    Fetch(RequestHandle),
}

/// counters of a tunnel activity
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TunnelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    /// frames dropped because a fragment was lost or a mailbox exchange failed
    pub dropped: u64,
}

/// ethernet tunnel to one slave
#[derive(Clone, Debug, Default)]
struct Tunnel {
    capacity: usize,
    outgoing: VecDeque<Vec<u8>>,
    sending: Option<Outgoing>,
    frame_number: u8,
    incoming: Option<Reassembly>,
    received: VecDeque<Vec<u8>>,
    pending: Option<Pending>,
    stats: TunnelStats,
}

impl Tunnel {
    /// process a terminated mailbox exchange
    fn complete(&mut self, station: u16, pending: Pending, outcome: Result<MailboxReply, EthercatError<MailboxReject>>) {
        match (pending, outcome) {
            (Pending::Send(_, next), Ok(_)) => {
                self.stats.fragments_sent += 1;
                if let Some(sending) = self.sending.as_mut() {
                    if next >= sending.frame.len() {
                        self.sending = None;
                        self.stats.frames_sent += 1;
                    }
                    else {
                        sending.offset = next;
                        sending.fragment_number += 1;
                    }
                }
            },
            (Pending::Send(..), Err(err)) => {
                self.sending = None;
                self.stats.dropped += 1;
                warn!("tunnel to slave 0x{:04x}: outgoing frame dropped: {}", station, err);
            },
            (Pending::Fetch(_), Ok(MailboxReply::Data(payload))) => self.reassemble(station, &payload),
            (Pending::Fetch(_), Ok(_)) => {},
            (Pending::Fetch(_), Err(err)) => {
                if self.incoming.take().is_some() {
                    self.stats.dropped += 1;
                }
                warn!("tunnel to slave 0x{:04x}: failed to fetch fragments: {}", station, err);
            },
        }
    }

    /// add an incoming fragment to the frame being reassembled
    fn reassemble(&mut self, station: u16, payload: &[u8]) {
        let mut cursor = Cursor::new(payload);
        let Ok(header) = cursor.unpack::<EoeHeader>()  else {
            self.stats.dropped += 1;
            return
        };
        if header.ty() != EoeType::FrameFragment
            {return}
        self.stats.fragments_received += 1;
        let content = cursor.remain();
        let fragment_number = header.fragment_number().value();
        let frame_number = header.frame_number().value();

        if fragment_number == 0 {
            if self.incoming.is_some() {
                self.stats.dropped += 1;
                warn!("tunnel to slave 0x{:04x}: incomplete frame dropped", station);
            }
            let mut data = Vec::with_capacity(usize::from(header.offset().value()) * FRAGMENT_UNIT);
            data.extend_from_slice(content);
            self.incoming = Some(Reassembly {frame_number, next_fragment: 1, data});
        }
        else {
            let consistent = self.incoming.as_ref().map_or(false, |incoming|
                incoming.frame_number == frame_number
                && incoming.next_fragment == fragment_number
                && incoming.data.len() == usize::from(header.offset().value()) * FRAGMENT_UNIT);
            match self.incoming.as_mut() {
                Some(incoming) if consistent => {
                    incoming.data.extend_from_slice(content);
                    incoming.next_fragment += 1;
                },
                _ => {
                    self.incoming = None;
                    self.stats.dropped += 1;
                    warn!("tunnel to slave 0x{:04x}: fragment {} of frame {} out of sequence", station, fragment_number, frame_number);
                    return
                },
            }
        }
        if header.last_fragment() {
            if let Some(incoming) = self.incoming.take() {
                if let (Some(source), Some(destination)) = (MacAddress::source(&incoming.data), MacAddress::destination(&incoming.data)) {
                    debug!("tunnel to slave 0x{:04x}: received {} bytes from {} to {}", station, incoming.data.len(), source, destination);
                }
                self.stats.frames_received += 1;
                self.received.push_back(incoming.data);
            }
        }
    }
}


/**
    fixed rate scheduler of the ethernet tunnels

    [Self::update] is to be called every master cycle, it collects the terminated exchanges every call but only submits new ones on ticks.
*/
pub struct TunnelScheduler {
    tunnels: BTreeMap<u16, Tunnel>,
    period: Duration,
    next_tick: Option<Instant>,
    ticks: u64,
    skipped: u64,
}

impl TunnelScheduler {
    pub fn new(config: &MasterConfig) -> Self {
        Self {
            tunnels: BTreeMap::new(),
            period: config.eoe_period(),
            next_tick: None,
            ticks: 0,
            skipped: 0,
        }
    }

    /// start tunneling with the slave at the given station address, `capacity` is the maximum payload of its write mailbox
    pub fn enable(&mut self, station: u16, capacity: usize) {
        self.tunnels.entry(station).or_default().capacity = capacity;
    }
    pub fn enabled(&self, station: u16) -> bool {
        self.tunnels.contains_key(&station)
    }
    /// queue an ethernet frame to send to the given slave
    pub fn send(&mut self, station: u16, frame: Vec<u8>) -> EthercatResult {
        if frame.len() > MAX_FRAME_SIZE
            {return Err(EthercatError::OversizedPayload {size: frame.len(), max: MAX_FRAME_SIZE})}
        let tunnel = self.tunnels.get_mut(&station)
            .ok_or(EthercatError::Master("tunneling not enabled for this slave"))?;
        match MacAddress::destination(&frame) {
            Some(destination) if destination.is_zero() =>
                debug!("tunnel to slave 0x{:04x}: sending frame with no destination address", station),
            _ => {},
        }
        tunnel.outgoing.push_back(frame);
        Ok(())
    }
    /// pop the next ethernet frame received from the given slave
    pub fn receive(&mut self, station: u16) -> Option<Vec<u8>> {
        self.tunnels.get_mut(&station)?.received.pop_front()
    }
    pub fn stats(&self, station: u16) -> Option<&TunnelStats> {
        self.tunnels.get(&station).map(|tunnel| &tunnel.stats)
    }
    /// number of ticks run
    pub fn ticks(&self) -> u64 {self.ticks}
    /// number of ticks missed and coalesced into later ones
    pub fn skipped(&self) -> u64 {self.skipped}

    /// true if a tick is due at this instant, and schedule the next one
    fn tick(&mut self, now: Instant) -> bool {
        if let Some(next) = self.next_tick {
            if now < next
                {return false}
            let late = now.duration_since(next);
            self.skipped += (late.as_nanos() / self.period.as_nanos().max(1)) as u64;
        }
        self.next_tick = Some(now + self.period);
        self.ticks += 1;
        true
    }

    /**
        collect the terminated exchanges and, if a tick is due, submit the next exchange of every idle tunnel

        `active` tells whether a slave is in a state allowing tunneled traffic
    */
    pub fn update<F>(&mut self, mailboxes: &mut Mailboxes, now: Instant, active: F)
    where F: Fn(u16) -> bool
    {
        for (&station, tunnel) in self.tunnels.iter_mut() {
            let Some(pending) = tunnel.pending  else {continue};
            let handle = match pending {
                Pending::Send(handle, _) | Pending::Fetch(handle) => handle,
            };
            let outcome = match mailboxes.take(handle) {
                Some(RequestState::Completed(reply)) => Ok(reply),
                Some(RequestState::Error(err)) => Err(err),
                _ => continue,
            };
            tunnel.pending = None;
            tunnel.complete(station, pending, outcome);
        }

        if ! self.tick(now)
            {return}

        for (&station, tunnel) in self.tunnels.iter_mut() {
            if tunnel.pending.is_some() || ! active(station)
                {continue}
            if tunnel.sending.is_none() {
                if let Some(frame) = tunnel.outgoing.pop_front() {
                    tunnel.frame_number = (tunnel.frame_number + 1) & 0xf;
                    tunnel.sending = Some(Outgoing {
                        frame,
                        offset: 0,
                        fragment_number: 0,
                        frame_number: tunnel.frame_number,
                        });
                }
            }
            let submitted = match &tunnel.sending {
                Some(sending) => fragment(&sending.frame, sending.offset, sending.fragment_number, sending.frame_number, tunnel.capacity)
                    .and_then(|(data, next)| mailboxes.submit(station, Operation::Write {ty: MailboxType::Ethernet, data})
                        .map(|handle| Pending::Send(handle, next))),
                None => mailboxes.submit(station, Operation::Fetch {ty: MailboxType::Ethernet})
                    .map(Pending::Fetch),
            };
            match submitted {
                Ok(pending) => tunnel.pending = Some(pending),
                Err(err) => {
                    if tunnel.sending.take().is_some() {
                        tunnel.stats.dropped += 1;
                    }
                    warn!("tunnel to slave 0x{:04x}: cannot submit exchange: {}", station, err);
                },
            }
        }
    }
}
