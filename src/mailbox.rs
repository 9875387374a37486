/*!
    Mailbox request engine: asynchronous exchanges with the mailboxes of the slaves.

    A slave mailbox is a pair of single-buffer sync managers: one written by the master, one read by the master. Since each buffer holds only one message, the exchanges with one slave are strictly serialized, while the exchanges with different slaves proceed independently.

    Every operation submitted is a request following the [uniform lifecycle](crate::request), made of as many datagrams as it needs:

    ```text
    write ──> poll read sync manager ──> read mailbox
                     └── not full ──> poll again on next cycle, until the mailbox deadline
    ```

    A datagram timing out fails its whole request, a partial exchange is never resumed.
*/

use std::{
    time::Instant,
    collections::{BTreeMap, VecDeque},
    };
use core::{fmt, time::Duration};
use bilge::prelude::*;
use log::warn;

use crate::{
    config::MasterConfig,
    registers,
    coe::{self, DictionaryFragment, DictionaryList, SdoAbortCode},
    data::{self, PduData, Cursor},
    datagram::{Datagram, Response, SlaveAddress},
    transport::{Transport, DatagramId, DatagramState},
    request::{Requests, RequestHandle, RequestState},
    error::{EthercatError, EthercatResult},
    };


/// position and size of the mailbox buffers in a slave's physical memory, as configured in its sync managers
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxConfig {
    /// buffer written by the master
    pub write_offset: u16,
    pub write_size: u16,
    /// buffer read by the master
    pub read_offset: u16,
    pub read_size: u16,
}

impl MailboxConfig {
    /// maximum payload of a message sent to the slave
    pub fn max_write(&self) -> usize {
        usize::from(self.write_size).saturating_sub(MailboxHeader::packed_size())
    }
}

/// operation on a slave mailbox
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// send a message
    Write {ty: MailboxType, data: Vec<u8>},
    /// wait for a message from the slave and read it
    Read {ty: MailboxType},
    /// send a message and wait for the answer
    Exchange {ty: MailboxType, data: Vec<u8>},
    /// read a message if the slave has one ready, without waiting
    Fetch {ty: MailboxType},
    /// fetch the list of objects in the CoE dictionary of the slave. It is deferred until the slave is ready for it
    Dictionary,
}

impl Operation {
    fn ty(&self) -> MailboxType {
        match self {
            Self::Write {ty, ..}
            | Self::Read {ty}
            | Self::Exchange {ty, ..}
            | Self::Fetch {ty} => *ty,
            Self::Dictionary => MailboxType::Can,
        }
    }
}

/// result of a mailbox operation
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MailboxReply {
    /// the operation returns nothing, or a fetch found the mailbox empty
    Empty,
    /// payload of the message read
    Data(Vec<u8>),
    /// indices of the objects in the dictionary
    Dictionary(Vec<u16>),
}

/// error reported by a slave about a mailbox operation, passed through as is
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxReject {
    /// the mailbox protocol itself failed
    Mailbox(MailboxError),
    /// the CoE service refused the operation
    Sdo(SdoAbortCode),
}

impl fmt::Display for MailboxReject {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Mailbox(error) => write!(f, "mailbox error {:?}", error),
            Self::Sdo(code) => write!(f, "SDO abort {}", code),
        }
    }
}

/// state of a mailbox request
pub type MailboxRequest = RequestState<MailboxReply, EthercatError<MailboxReject>>;


/// step of an exchange in progress
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Step {
    /// writing the message in the slave mailbox
    Write,
    /// checking whether the slave mailbox has a message ready
    Poll,
    /// reading the message
    Read,
}

struct Exchange {
    handle: RequestHandle,
    operation: Operation,
    step: Step,
    /// start of the current step, for its deadline
    since: Instant,
    datagram: Option<DatagramId>,
    /// mailbox counter of the message written
    count: Option<u8>,
    /// the request has been cancelled while busy, its result will be discarded
    cancelled: bool,
    /// objects already received for a dictionary fetch, and number of fragments
    objects: Vec<u16>,
    fragments: usize,
}

struct MailboxSlave {
    config: MailboxConfig,
    /// last counter used, cycling from 1 to 7
    count: u8,
    queue: VecDeque<(RequestHandle, Operation)>,
    current: Option<Exchange>,
}

/**
    engine serializing mailbox exchanges per slave

    It never waits on anything: [Self::update] has to be called every master cycle, after the transport received and before it sends.
*/
pub struct Mailboxes {
    slaves: BTreeMap<u16, MailboxSlave>,
    requests: Requests<MailboxReply, EthercatError<MailboxReject>>,
    timeout: Duration,
}

impl Mailboxes {
    pub fn new(config: &MasterConfig) -> Self {
        Self {
            slaves: BTreeMap::new(),
            requests: Requests::new(),
            timeout: config.mailbox_timeout,
        }
    }

    /// declare the mailbox of the slave at the given station address
    pub fn configure(&mut self, station: u16, config: MailboxConfig) {
        self.slaves.insert(station, MailboxSlave {
            config,
            count: 0,
            queue: VecDeque::new(),
            current: None,
        });
    }
    pub fn config(&self, station: u16) -> Option<&MailboxConfig> {
        self.slaves.get(&station).map(|slave| &slave.config)
    }

    /// queue an operation on the mailbox of the given slave
    pub fn submit(&mut self, station: u16, operation: Operation) -> EthercatResult<RequestHandle> {
        let slave = self.slaves.get_mut(&station)
            .ok_or(EthercatError::Master("slave has no mailbox configured"))?;
        if let Operation::Write {data, ..} | Operation::Exchange {data, ..} = &operation {
            if data.len() > slave.config.max_write() {
                return Err(EthercatError::OversizedPayload {
                    size: data.len(),
                    max: slave.config.max_write(),
                    });
            }
        }
        let handle = self.requests.insert();
        slave.queue.push_back((handle, operation));
        Ok(handle)
    }
    pub fn poll(&self, handle: RequestHandle) -> Option<&MailboxRequest> {
        self.requests.get(handle)
    }
    /// retire a terminated request and return its outcome
    pub fn take(&mut self, handle: RequestHandle) -> Option<MailboxRequest> {
        self.requests.take(handle)
    }
    /**
        cancel a request

        A queued request is cancelled immediately and true is returned. A busy request finishes its current exchange, then its result is discarded and it ends [Cancelled](EthercatError::Cancelled).
    */
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        for slave in self.slaves.values_mut() {
            if let Some(position) = slave.queue.iter().position(|(queued, _)| *queued == handle) {
                slave.queue.remove(position);
                return self.requests.fail(handle, EthercatError::Cancelled).is_ok();
            }
            if let Some(exchange) = slave.current.as_mut().filter(|exchange| exchange.handle == handle) {
                exchange.cancelled = true;
            }
        }
        false
    }
    /// true if an exchange with this slave is in progress
    pub fn busy(&self, station: u16) -> bool {
        self.slaves.get(&station).map_or(false, |slave| slave.current.is_some())
    }
    /// number of requests on this slave not yet terminated
    pub fn active(&self, station: u16) -> usize {
        self.slaves.get(&station).map_or(0, |slave| slave.queue.len() + usize::from(slave.current.is_some()))
    }

    /**
        advance the exchanges of all slaves with the datagrams answered since the last call

        `dictionary_ready` tells whether a slave can be asked for its dictionary at this instant. Dictionary fetches on a slave not ready stay queued, and other operations on the same slave are allowed to pass them.
    */
    pub fn update<F>(&mut self, transport: &mut Transport, now: Instant, dictionary_ready: F)
    where F: Fn(u16, Instant) -> bool
    {
        let Self {slaves, requests, timeout, ..} = self;
        for (&station, slave) in slaves.iter_mut() {
            if slave.current.is_none() {
                let eligible = slave.queue.iter().position(|(_, operation)|
                    *operation != Operation::Dictionary || dictionary_ready(station, now));
                if let Some((handle, operation)) = eligible.and_then(|index| slave.queue.remove(index)) {
                    requests.busy(handle).ok();
                    let step = match operation {
                        Operation::Write {..} | Operation::Exchange {..} | Operation::Dictionary => Step::Write,
                        Operation::Read {..} | Operation::Fetch {..} => Step::Poll,
                    };
                    slave.current = Some(Exchange {
                        handle,
                        operation,
                        step,
                        since: now,
                        datagram: None,
                        count: None,
                        cancelled: false,
                        objects: Vec::new(),
                        fragments: 0,
                        });
                }
            }
            if let Some(outcome) = advance(station, slave, transport, *timeout, now) {
                let Some(exchange) = slave.current.take()  else {continue};
                let outcome = if exchange.cancelled {Err(EthercatError::Cancelled)} else {outcome};
                match outcome {
                    Ok(reply) => {requests.complete(exchange.handle, reply).ok();},
                    Err(err) => {
                        if ! matches!(err, EthercatError::Cancelled) {
                            warn!("mailbox of slave 0x{:04x}: {:?} failed: {}", station, exchange.operation.ty(), err);
                        }
                        requests.fail(exchange.handle, err).ok();
                    },
                }
            }
        }
    }
}

/// outcome of an answer in an exchange
enum Progress {
    Continue,
    Done(MailboxReply),
}

/// run the current exchange of a slave as far as possible in this cycle, returns its outcome once terminated
fn advance(station: u16, slave: &mut MailboxSlave, transport: &mut Transport, timeout: Duration, now: Instant)
    -> Option<EthercatResult<MailboxReply, MailboxReject>>
{
    let exchange = slave.current.as_mut()?;
    if let Some(id) = exchange.datagram {
        let answer = match transport.take(id)? {
            DatagramState::Received(answer) => answer,
            _ => return Some(Err(EthercatError::RetryExhausted)),
        };
        exchange.datagram = None;
        match receive(exchange, answer, timeout, now) {
            Ok(Progress::Continue) => {},
            Ok(Progress::Done(reply)) => return Some(Ok(reply)),
            Err(err) => return Some(Err(err)),
        }
    }

    let address = SlaveAddress::Fixed(station);
    let datagram = match exchange.step {
        Step::Write => {
            let data = match &exchange.operation {
                Operation::Write {data, ..} | Operation::Exchange {data, ..} => data.clone(),
                Operation::Dictionary => match coe::dictionary_request(DictionaryList::All) {
                    Ok(data) => data,
                    Err(err) => return Some(Err(err.into())),
                },
                _ => Vec::new(),
            };
            // a new counter is used only for a new message, not for a rewrite of the same one
            let count = *exchange.count.get_or_insert_with(|| {
                slave.count = slave.count % 7 + 1;
                slave.count
            });
            match message(&slave.config, exchange.operation.ty(), count, &data) {
                Ok(frame) => Datagram::write_slice(address, slave.config.write_offset, frame),
                Err(err) => return Some(Err(err.upgrade())),
            }
        },
        Step::Poll => Datagram::read(address, registers::sync_manager::status(registers::sync_manager::mailbox_read)),
        Step::Read => Datagram::read_slice(address, slave.config.read_offset, usize::from(slave.config.read_size)),
    };
    match transport.queue(datagram) {
        Ok(id) => exchange.datagram = Some(id),
        Err(err) => return Some(Err(err.upgrade())),
    }
    None
}

/// process the answer to the datagram of the current step
fn receive(exchange: &mut Exchange, answer: Response, timeout: Duration, now: Instant) -> EthercatResult<Progress, MailboxReject> {
    let expired = now.saturating_duration_since(exchange.since) >= timeout;
    match exchange.step {
        Step::Write => {
            if answer.working_count != 1 {
                // the slave did not take the message, its mailbox is still full
                if expired
                    {return Err(EthercatError::Timeout("slave mailbox stayed full"))}
                return Ok(Progress::Continue)
            }
            if let Operation::Write {..} = exchange.operation
                {return Ok(Progress::Done(MailboxReply::Empty))}
            exchange.step = Step::Poll;
            exchange.since = now;
        },
        Step::Poll => {
            let full = answer.working_count == 1
                && answer.value::<registers::SyncManagerStatus>()?.mailbox_full();
            if full {
                exchange.step = Step::Read;
            }
            else if let Operation::Fetch {..} = exchange.operation {
                return Ok(Progress::Done(MailboxReply::Empty))
            }
            else if expired {
                return Err(EthercatError::Timeout("no answer in slave mailbox"))
            }
        },
        Step::Read => {
            if answer.working_count != 1 {
                exchange.step = Step::Poll;
                return Ok(Progress::Continue)
            }
            let (header, payload) = unpack_message(&answer.data)?;
            if header.ty() == MailboxType::Exception {
                let error = MailboxErrorFrame::unpack(payload)?;
                return Err(EthercatError::ProtocolReject(MailboxReject::Mailbox(error.detail())))
            }
            if header.ty() != exchange.operation.ty()
                {return Err(EthercatError::Malformed("unexpected mailbox message type"))}

            if exchange.operation != Operation::Dictionary
                {return Ok(Progress::Done(MailboxReply::Data(payload.to_vec())))}
            match coe::dictionary_response(payload, exchange.fragments == 0)? {
                DictionaryFragment::Abort(code) =>
                    return Err(EthercatError::ProtocolReject(MailboxReject::Sdo(SdoAbortCode(code)))),
                DictionaryFragment::Indices {indices, incomplete} => {
                    exchange.fragments += 1;
                    exchange.objects.extend(indices);
                    if ! incomplete {
                        return Ok(Progress::Done(MailboxReply::Dictionary(core::mem::take(&mut exchange.objects))))
                    }
                    exchange.step = Step::Poll;
                    exchange.since = now;
                },
            }
        },
    }
    Ok(Progress::Continue)
}

/// build the content of the write mailbox, padded to its full size since the sync manager only triggers once its last byte is written
fn message(config: &MailboxConfig, ty: MailboxType, count: u8, data: &[u8]) -> EthercatResult<Vec<u8>> {
    if data.len() > config.max_write() {
        return Err(EthercatError::OversizedPayload {size: data.len(), max: config.max_write()});
    }
    let mut frame = vec![0; usize::from(config.write_size)];
    let mut cursor = Cursor::new(frame.as_mut_slice());
    cursor.pack(&MailboxHeader::new(
        data.len() as u16,
        0,  // address of master
        u6::new(0),  // this value has no effect and is reserved for future use
        u2::new(0),
        ty,
        u3::new(count),
        ))?;
    cursor.write(data)?;
    Ok(frame)
}

/// split the content of the read mailbox in its header and payload
fn unpack_message(frame: &[u8]) -> EthercatResult<(MailboxHeader, &[u8])> {
    let mut cursor = Cursor::new(frame);
    let header = cursor.unpack::<MailboxHeader>()?;
    let payload = cursor.read(usize::from(header.length()))
        .map_err(|_| EthercatError::Malformed("mailbox message longer than the mailbox"))?;
    Ok((header, payload))
}


/// ETG 1000.4 table 29
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    /// reserved for future
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    pub ty: MailboxType,
    /// Counter of the mailbox services (0 reserved, this should roll from 1 to 7 and overflow to 1 after 7)
    pub count: u3,
    reserved: u1,
}
data::bilge_pdudata!(MailboxHeader, u48, u64);

/// ETG 1000.4 table 29
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    #[fallback]
    Specific = 0xf,
}

/// ETG 1000.4 table 30
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
struct MailboxErrorFrame {
    ty: u16,
    detail: MailboxError,
}
data::bilge_pdudata!(MailboxErrorFrame, u32, u32);

/// ETG 1000.4 table 30
#[bitsize(16)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxError {
    Syntax = 0x1,
    UnsupportedProtocol = 0x2,
    InvalidChannel = 0x3,
    ServiceNotSupported = 0x4,
    InvalidHeader = 0x5,
    SizeTooShort = 0x6,
    NoMoreMemory = 0x7,
    InvalidSize = 0x8,
    ServiceInWork = 0x9,
    #[fallback]
    Unknown = 0xffff,
}
