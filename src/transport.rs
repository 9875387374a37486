/*!
	low level ethercat communication: scheduling, sending and receiving frames of datagrams.

	The transport has no notion of slave, it is just executing the datagrams queued by the upper state machines. It is driven by the master cycle:

	- [Transport::receive] collects the frames that came back since the last cycle, matches their datagrams to the outstanding ones, and handles timeouts of the datagrams that did not come back in time
	- [Transport::send] packs all queued datagrams into frames and sends them

	Nothing here ever waits on the medium. A datagram whose deadline has elapsed is detected by the next cycle, and sent again in that cycle with a fresh index, until it has been sent as many times as the retry ceiling allows.
*/

use std::{
    time::Instant,
    collections::{BTreeMap, BTreeSet, HashMap},
    };
use core::time::Duration;
use log::{trace, debug, warn, error};

use crate::{
    config::{MasterConfig, ETH_DATA_LEN},
    socket::EthercatSocket,
    datagram::{Datagram, PduCommand, Response},
    frame::{self, FrameAssembler, ReceivedDatagram},
    data::{HexDump, HexDiff},
    error::EthercatResult,
    };


/// identifier of a datagram queued in a [Transport]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DatagramId(u64);

/// progress of a datagram in the transport
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DatagramState {
    /// waiting to be sent by the next cycle
    Queued,
    /// sent, waiting for its answer
    Sent,
    /// the answer came back, this is terminal
    Received(Response),
    /// no answer came back after the maximum number of transmissions, this is terminal
    TimedOut,
}

impl DatagramState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Received(_) | Self::TimedOut)
    }
}

/// counters of the transport activity, for diagnostics
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    /// transmissions of datagrams, retries included
    pub datagrams_sent: u64,
    /// datagrams sent again after a timeout
    pub retries: u64,
    /// elapsed deadlines
    pub timeouts: u64,
    /// datagrams that reached the retry ceiling
    pub failures: u64,
    /// answers matching no outstanding datagram, like answers to a datagram already retried
    pub stale: u64,
    /// frames received that could not be parsed
    pub malformed: u64,
    pub io_errors: u64,
}

struct Entry {
    datagram: Datagram,
    state: DatagramState,
    /// consecutive timeouts
    timeouts: u32,
    /// index the datagram has been sent with, while it is outstanding
    index: Option<u8>,
    sent_at: Option<Instant>,
}

/**
    datagram transport over one socket

    The transport owns every queued datagram until its outcome is taken with [Self::take].
*/
pub struct Transport {
    socket: Box<dyn EthercatSocket + Send>,
    assembler: FrameAssembler,
    io_timeout: Duration,
    retries: u32,

    entries: BTreeMap<DatagramId, Entry>,
    /// datagrams to send in the next cycle, in submission order
    queue: BTreeSet<DatagramId>,
    /// datagrams sent and waiting for their answer, by index
    outstanding: HashMap<u8, DatagramId>,
    next_id: u64,
    next_index: u8,

    buffer: Vec<u8>,
    stats: TransportStats,
}

impl Transport {
    pub fn new<S: EthercatSocket + Send + 'static>(socket: S, config: &MasterConfig) -> Self {
        let frame_size = config.frame_size.min(socket.max_frame());
        Self {
            socket: Box::new(socket),
            assembler: FrameAssembler::new(frame_size),
            io_timeout: config.io_timeout,
            retries: config.retries.max(1),

            entries: BTreeMap::new(),
            queue: BTreeSet::new(),
            outstanding: HashMap::new(),
            next_id: 0,
            next_index: 0,

            buffer: vec![0; frame_size.max(ETH_DATA_LEN)],
            stats: TransportStats::default(),
        }
    }

    /// maximum data a datagram can carry on this transport
    pub fn max_payload(&self) -> usize {self.assembler.max_payload()}
    pub fn stats(&self) -> &TransportStats {&self.stats}
    /// number of datagrams waiting for the next send
    pub fn queued(&self) -> usize {self.queue.len()}
    /// number of datagrams sent and waiting for their answer
    pub fn outstanding(&self) -> usize {self.outstanding.len()}

    /// queue a datagram for the next send, a datagram too big for a frame is rejected and never queued
    pub fn queue(&mut self, datagram: Datagram) -> EthercatResult<DatagramId> {
        self.assembler.check(&datagram)?;
        let id = DatagramId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Entry {
            datagram,
            state: DatagramState::Queued,
            timeouts: 0,
            index: None,
            sent_at: None,
            });
        self.queue.insert(id);
        Ok(id)
    }
    /// current state of a datagram, `None` if unknown or already taken
    pub fn state(&self, id: DatagramId) -> Option<&DatagramState> {
        self.entries.get(&id).map(|entry| &entry.state)
    }
    /// retire a datagram that reached a terminal state, returning its outcome
    pub fn take(&mut self, id: DatagramId) -> Option<DatagramState> {
        if self.entries.get(&id)?.state.is_terminal()
            {self.entries.remove(&id).map(|entry| entry.state)}
        else
            {None}
    }
    /**
        withdraw a datagram that has never been sent. Returns false if the datagram already went on the bus, in which case it will finish its retry cycle and its outcome shall be taken normally.
    */
    pub fn cancel(&mut self, id: DatagramId) -> bool {
        match self.entries.get(&id) {
            Some(entry) if entry.state == DatagramState::Queued && entry.sent_at.is_none() => {
                self.queue.remove(&id);
                self.entries.remove(&id);
                true
            },
            _ => false,
        }
    }

    /// receive all frames available on the socket and handle the elapsed deadlines
    pub fn receive(&mut self, now: Instant) {
        loop {
            match self.socket.receive(&mut self.buffer) {
                Ok(Some(size)) => {
                    self.stats.frames_received += 1;
                    self.dispatch(size);
                },
                Ok(None) => break,
                Err(err) => {
                    self.stats.io_errors += 1;
                    error!("failed to receive frame: {}", err);
                    break
                },
            }
        }
        self.expire(now);
    }

    /// match the datagrams of a received frame to the outstanding ones
    fn dispatch(&mut self, size: usize) {
        let Self {buffer, entries, outstanding, stats, ..} = self;
        let received = match frame::decode(&buffer[.. size]) {
            Ok(received) => received,
            Err(err) => {
                stats.malformed += 1;
                debug!("dropping received frame: {}", err);
                trace!("dropped frame content:\n{}", HexDump(&buffer[.. size]));
                return
            },
        };
        for answer in received {
            let entry = outstanding.get(&answer.index)
                .and_then(|id| entries.get_mut(id));
            if let Some(entry) = entry.as_ref().filter(|entry| ! matches(&entry.datagram, &answer)) {
                trace!("answer with index {} differs from {} to 0x{:04x}:0x{:04x} sent with it:\n{}",
                    answer.index, entry.datagram.command, entry.datagram.slave, entry.datagram.memory,
                    HexDiff {old: &entry.datagram.data, new: answer.data});
            }
            match entry.filter(|entry| matches(&entry.datagram, &answer)) {
                Some(entry) => {
                    outstanding.remove(&answer.index);
                    entry.index = None;
                    entry.state = DatagramState::Received(Response {
                        data: answer.data.to_vec(),
                        working_count: answer.working_count,
                        });
                },
                None => {
                    stats.stale += 1;
                    debug!("discarding stale answer to {} with index {}", answer.command, answer.index);
                    trace!("stale answer data:\n{}", HexDump(answer.data));
                },
            }
        }
    }

    /// retry or fail the datagrams whose deadline elapsed
    fn expire(&mut self, now: Instant) {
        let mut expired = self.outstanding.iter()
            .filter(|(_, id)| self.entries[id].sent_at
                .map_or(false, |sent| now.saturating_duration_since(sent) >= self.io_timeout))
            .map(|(index, id)| (*id, *index))
            .collect::<Vec<_>>();
        expired.sort();

        for (id, index) in expired {
            self.outstanding.remove(&index);
            self.stats.timeouts += 1;
            let Some(entry) = self.entries.get_mut(&id)  else {continue};
            entry.index = None;
            entry.timeouts += 1;
            if entry.timeouts < self.retries {
                self.stats.retries += 1;
                entry.state = DatagramState::Queued;
                self.queue.insert(id);
                debug!("{} to 0x{:04x}:0x{:04x} timed out, retry {}/{}",
                    entry.datagram.command, entry.datagram.slave, entry.datagram.memory,
                    entry.timeouts, self.retries - 1);
            }
            else {
                self.stats.failures += 1;
                entry.state = DatagramState::TimedOut;
                warn!("{} to 0x{:04x}:0x{:04x} timed out {} times, giving up",
                    entry.datagram.command, entry.datagram.slave, entry.datagram.memory,
                    entry.timeouts);
            }
        }
    }

    /// pick an index not used by any outstanding datagram
    fn allocate_index(&mut self) -> Option<u8> {
        for _ in 0 ..= u8::MAX {
            let index = self.next_index;
            self.next_index = self.next_index.wrapping_add(1);
            if ! self.outstanding.contains_key(&index)
                {return Some(index)}
        }
        None
    }

    /// send all queued datagrams in submission order, returns the number of frames sent
    pub fn send(&mut self, now: Instant) -> usize {
        // give an index to as many queued datagrams as possible
        let mut batch = Vec::with_capacity(self.queue.len());
        let pending = self.queue.iter().copied().collect::<Vec<_>>();
        for id in pending {
            let Some(index) = self.allocate_index()  else {break};
            self.outstanding.insert(index, id);
            self.queue.remove(&id);
            batch.push((index, id));
        }
        if batch.is_empty()
            {return 0}

        let Self {socket, assembler, entries, buffer, stats, ..} = self;
        let frames = match assembler.assemble(batch.iter().map(|(index, id)| (*index, &entries[id].datagram))) {
            Ok(frames) => frames,
            Err(err) => {
                // unreachable since datagrams are checked at submission
                error!("cannot assemble frames: {}", err);
                Vec::new()
            },
        };
        let sent = frames.len();
        for frame in frames {
            match frame.encode(buffer) {
                Ok(size) => match socket.send(&buffer[.. size]) {
                    Ok(()) => stats.frames_sent += 1,
                    // datagrams of a lost frame will time out and be sent again
                    Err(err) => {
                        stats.io_errors += 1;
                        error!("failed to send frame: {}", err);
                    },
                },
                Err(err) => error!("cannot encode frame: {}", err),
            }
        }

        for (index, id) in batch {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.index = Some(index);
                entry.sent_at = Some(now);
                entry.state = DatagramState::Sent;
                self.stats.datagrams_sent += 1;
            }
        }
        sent
    }
}

/**
    check an answer corresponds to the given datagram

    auto-incremented and broadcast commands see their slave address incremented by every slave they pass through, so it cannot be used to identify them
*/
fn matches(datagram: &Datagram, answer: &ReceivedDatagram) -> bool {
    use PduCommand::*;
    let address_preserved = ! matches!(datagram.command, APRD | APWR | APRW | ARMW | BRD | BWR | BRW);
    datagram.command == answer.command
        && datagram.memory == answer.memory
        && datagram.data.len() == answer.data.len()
        && (! address_preserved || datagram.slave == answer.slave)
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        io,
        collections::VecDeque,
        sync::{Arc, Mutex},
        };
    use crate::{
        registers,
        datagram::SlaveAddress,
        error::EthercatError,
        };

    /// socket keeping sent frames and returning the frames pushed by the test
    #[derive(Clone, Default)]
    pub(crate) struct Loopback {
        inner: Arc<Mutex<LoopbackInner>>,
    }
    #[derive(Default)]
    struct LoopbackInner {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }
    impl Loopback {
        pub fn sent(&self) -> Vec<Vec<u8>> {self.inner.lock().unwrap().sent.clone()}
        pub fn reply(&self, frame: Vec<u8>) {self.inner.lock().unwrap().replies.push_back(frame)}
    }
    impl EthercatSocket for Loopback {
        fn receive(&self, data: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(self.inner.lock().unwrap().replies.pop_front().map(|frame| {
                data[.. frame.len()].copy_from_slice(&frame);
                frame.len()
            }))
        }
        fn send(&self, data: &[u8]) -> io::Result<()> {
            self.inner.lock().unwrap().sent.push(data.to_vec());
            Ok(())
        }
        fn max_frame(&self) -> usize {ETH_DATA_LEN}
    }

    /// copy of a sent frame, as processed by the given number of slaves
    pub(crate) fn answered(frame: &[u8], working_count: u16) -> Vec<u8> {
        let mut frame = frame.to_vec();
        let mut offset = 2;
        loop {
            let len = usize::from(u16::from_le_bytes([frame[offset+6], frame[offset+7]]) & 0x7ff);
            let next = frame[offset+7] & 0x80 != 0;
            let footer = offset + 10 + len;
            frame[footer .. footer+2].copy_from_slice(&working_count.to_le_bytes());
            offset = footer + 2;
            if ! next {break}
        }
        frame
    }

    fn transport() -> (Transport, Loopback) {
        let socket = Loopback::default();
        (Transport::new(socket.clone(), &MasterConfig::default()), socket)
    }

    fn write() -> Datagram {
        Datagram::write(SlaveAddress::Fixed(0x1001), registers::address::alias, 5).unwrap()
    }

    #[test]
    fn answer_completes_datagram() {
        let (mut transport, socket) = transport();
        let start = Instant::now();
        let id = transport.queue(write()).unwrap();
        assert_eq!(transport.state(id), Some(&DatagramState::Queued));
        assert_eq!(transport.send(start), 1);
        assert_eq!(transport.state(id), Some(&DatagramState::Sent));

        socket.reply(answered(&socket.sent()[0], 1));
        transport.receive(start + Duration::from_micros(100));
        assert_eq!(transport.state(id), Some(&DatagramState::Received(Response {
            data: vec![5, 0],
            working_count: 1,
            })));
        assert!(transport.take(id).is_some());
        assert_eq!(transport.state(id), None);
        assert_eq!(transport.outstanding(), 0);
    }

    #[test]
    fn timeouts_up_to_retry_ceiling() {
        let (mut transport, socket) = transport();
        let start = Instant::now();
        let step = Duration::from_micros(600);
        let id = transport.queue(write()).unwrap();

        transport.send(start);
        // first and second timeouts leave the datagram eligible for one more transmission
        for attempt in 1 .. 3 {
            transport.receive(start + step * attempt);
            assert_eq!(transport.state(id), Some(&DatagramState::Queued));
            transport.send(start + step * attempt);
        }
        // the third timeout is the retry ceiling
        transport.receive(start + step * 3);
        assert_eq!(transport.state(id), Some(&DatagramState::TimedOut));
        assert_eq!(transport.send(start + step * 3), 0);

        assert_eq!(socket.sent().len(), 3);
        assert_eq!(transport.stats().retries, 2);
        assert_eq!(transport.stats().timeouts, 3);
        assert_eq!(transport.stats().failures, 1);
    }

    #[test]
    fn deadline_not_elapsed() {
        let (mut transport, _socket) = transport();
        let start = Instant::now();
        let id = transport.queue(write()).unwrap();
        transport.send(start);
        transport.receive(start + Duration::from_micros(499));
        assert_eq!(transport.state(id), Some(&DatagramState::Sent));
        transport.receive(start + Duration::from_micros(500));
        assert_eq!(transport.state(id), Some(&DatagramState::Queued));
    }

    #[test]
    fn stale_answer_is_discarded() {
        let (mut transport, socket) = transport();
        let start = Instant::now();
        let id = transport.queue(write()).unwrap();
        transport.send(start);
        transport.receive(start + Duration::from_micros(600));
        transport.send(start + Duration::from_micros(600));
        let sent = socket.sent();
        assert_ne!(sent[0][3], sent[1][3], "a retry must be sent with a fresh index");

        // the answer to the first transmission comes too late
        socket.reply(answered(&sent[0], 1));
        transport.receive(start + Duration::from_micros(700));
        assert_eq!(transport.state(id), Some(&DatagramState::Sent));
        assert_eq!(transport.stats().stale, 1);

        socket.reply(answered(&sent[1], 1));
        socket.reply(answered(&sent[1], 1));
        transport.receive(start + Duration::from_micros(800));
        assert!(matches!(transport.state(id), Some(DatagramState::Received(_))));
        // duplicates are stale as well
        assert_eq!(transport.stats().stale, 2);
    }

    #[test]
    fn oversized_rejected_at_submission() {
        let (mut transport, _socket) = transport();
        let datagram = Datagram::write_slice(SlaveAddress::Fixed(1), 0x1000, vec![0; transport.max_payload() + 1]);
        assert!(matches!(transport.queue(datagram), Err(EthercatError::OversizedPayload {..})));
        assert_eq!(transport.queued(), 0);
    }

    #[test]
    fn submission_order_and_cancel() {
        let (mut transport, socket) = transport();
        let start = Instant::now();
        let a = transport.queue(Datagram::read(SlaveAddress::Fixed(1), registers::al::status)).unwrap();
        let b = transport.queue(Datagram::read(SlaveAddress::Fixed(2), registers::al::status)).unwrap();
        let c = transport.queue(Datagram::read(SlaveAddress::Fixed(3), registers::al::status)).unwrap();
        assert!(transport.cancel(b));
        transport.send(start);
        assert!(! transport.cancel(a));

        let sent = socket.sent();
        assert_eq!(sent.len(), 1);
        let datagrams = frame::decode(&sent[0]).unwrap();
        assert_eq!(datagrams.iter().map(|d| d.slave).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(transport.state(c), Some(&DatagramState::Sent));
    }

    #[test]
    fn auto_increment_answers_match() {
        let (mut transport, socket) = transport();
        let start = Instant::now();
        let id = transport.queue(Datagram::read(SlaveAddress::AutoIncremented(0), registers::al::status)).unwrap();
        transport.send(start);
        let mut answer = answered(&socket.sent()[0], 1);
        // one slave incremented the address on its way
        answer[4] = answer[4].wrapping_add(1);
        socket.reply(answer);
        transport.receive(start);
        assert!(matches!(transport.state(id), Some(DatagramState::Received(_))));
    }
}
