//! simulated ethercat segment, answering the master's frames like a ring of slaves would
#![allow(dead_code)]

use std::{
    io,
    time::{Duration, Instant},
    collections::VecDeque,
    sync::{Arc, Mutex},
    };
use ethercycle::{
    EthercatSocket, Master, MasterConfig, MailboxConfig,
    config::ETH_DATA_LEN,
    };


pub const CYCLE: Duration = Duration::from_millis(1);

pub const MAILBOX: MailboxConfig = MailboxConfig {
    write_offset: 0x1000,
    write_size: 128,
    read_offset: 0x1080,
    read_size: 128,
};

const AL_CONTROL: usize = 0x0120;
const AL_STATUS: usize = 0x0130;
const AL_ERROR: usize = 0x0134;
const MAILBOX_READ_STATUS: usize = 0x080d;
const MEMORY_SIZE: usize = 0x2000;

pub fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// run the given number of cycles, one millisecond apart
pub fn run(master: &mut Master, now: &mut Instant, cycles: usize) {
    for _ in 0 .. cycles {
        master.cycle(*now);
        *now += CYCLE;
    }
}

/// how a simulated slave reacts to AL control writes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlBehaviour {
    /// switch to the requested state immediately
    Follow,
    /// stay in the current state and raise the error flag with the given status code
    Refuse(u16),
    /// never change state
    Ignore,
}

/// produces the messages a slave puts in its read mailbox when receiving a message, from its mailbox type and payload
pub type Responder = Box<dyn FnMut(u8, &[u8]) -> Vec<(u8, Vec<u8>)> + Send>;

/// slave sending back every message it receives
pub fn echo() -> Responder {
    Box::new(|ty: u8, payload: &[u8]| vec![(ty, payload.to_vec())])
}

/// slave answering SDO information dictionary requests with the given indices in 2 fragments, and echoing other messages
pub fn dictionary(indices: &'static [u16]) -> Responder {
    Box::new(move |ty: u8, payload: &[u8]| {
        let request = ty == 0x3
            && payload.len() >= 8
            && payload[1] & 0xf0 == 0x80
            && payload[2] & 0x7f == 0x01;
        if ! request
            {return vec![(ty, payload.to_vec())]}

        let (first, second) = indices.split_at(indices.len() / 2);
        let mut head = vec![0x00, 0x80, 0x82, 0x00, 0x01, 0x00, payload[6], payload[7]];
        head.extend(first.iter().flat_map(|index| index.to_le_bytes()));
        let mut tail = vec![0x00, 0x80, 0x02, 0x00, 0x00, 0x00];
        tail.extend(second.iter().flat_map(|index| index.to_le_bytes()));
        vec![(0x3, head), (0x3, tail)]
    })
}

struct SimulatedSlave {
    station: u16,
    memory: Vec<u8>,
    al: AlBehaviour,
    mailbox: Option<MailboxConfig>,
    responder: Option<Responder>,
    /// messages waiting in the read mailbox
    outbox: VecDeque<Vec<u8>>,
    count: u8,
    /// the write mailbox takes new messages
    accept: bool,
    writes: usize,
}

impl SimulatedSlave {
    fn read(&mut self, address: usize, data: &mut [u8]) -> bool {
        if let Some(mailbox) = self.mailbox {
            if address == usize::from(mailbox.read_offset) {
                let Some(message) = self.outbox.pop_front()  else {return false};
                data.fill(0);
                let len = message.len().min(data.len());
                data[.. len].copy_from_slice(&message[.. len]);
                return true
            }
            self.memory[MAILBOX_READ_STATUS] = if self.outbox.is_empty() {0} else {0x08};
        }
        match self.memory.get(address .. address + data.len()) {
            Some(content) => {data.copy_from_slice(content); true},
            None => false,
        }
    }

    fn write(&mut self, address: usize, data: &[u8]) -> bool {
        if let Some(mailbox) = self.mailbox {
            if address == usize::from(mailbox.write_offset) {
                if ! self.accept || data.len() < 6
                    {return false}
                self.writes += 1;
                let length = usize::from(u16::from_le_bytes([data[0], data[1]]));
                let ty = data[5] & 0x0f;
                let payload = &data[6 .. (6 + length).min(data.len())];
                let answers = self.responder.as_mut()
                    .map(|responder| responder(ty, payload))
                    .unwrap_or_default();
                for (ty, payload) in answers {
                    self.count = self.count % 7 + 1;
                    let mut message = Vec::with_capacity(6 + payload.len());
                    message.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                    message.extend_from_slice(&[0, 0, 0, ty | (self.count << 4)]);
                    message.extend_from_slice(&payload);
                    self.outbox.push_back(message);
                }
                return true
            }
        }
        if address == AL_CONTROL && data.len() == 1 {
            self.memory[AL_CONTROL] = data[0];
            let requested = data[0] & 0x0f;
            match self.al {
                AlBehaviour::Follow => self.memory[AL_STATUS] = requested,
                AlBehaviour::Refuse(code) => {
                    self.memory[AL_STATUS] = (self.memory[AL_STATUS] & 0x0f) | 0x10;
                    self.memory[AL_ERROR .. AL_ERROR+2].copy_from_slice(&code.to_le_bytes());
                },
                AlBehaviour::Ignore => {},
            }
            return true
        }
        match self.memory.get_mut(address .. address + data.len()) {
            Some(content) => {content.copy_from_slice(data); true},
            None => false,
        }
    }
}

#[derive(Default)]
struct BusState {
    slaves: Vec<SimulatedSlave>,
    answers: VecDeque<Vec<u8>>,
    held: Vec<Vec<u8>>,
    frames: usize,
    drop: bool,
    hold_next: bool,
}

impl BusState {
    /// execute the datagrams of a frame on the slaves, returning the frame as it comes back to the master
    fn process(&mut self, sent: &[u8]) -> Vec<u8> {
        let mut frame = sent.to_vec();
        let mut offset = 2;
        while offset + 12 <= frame.len() {
            let command = frame[offset];
            let address = u16::from_le_bytes([frame[offset+2], frame[offset+3]]);
            let memory = usize::from(u16::from_le_bytes([frame[offset+4], frame[offset+5]]));
            let flags = u16::from_le_bytes([frame[offset+6], frame[offset+7]]);
            let len = usize::from(flags & 0x7ff);
            let data = offset + 10 .. offset + 10 + len;
            let footer = data.end;
            if footer + 2 > frame.len()
                {break}

            let slave = match command {
                // auto-increment: each slave increments the address, the one seeing zero is concerned
                0x01 ..= 0x03 => {
                    let position = usize::from(0u16.wrapping_sub(address));
                    let passed = address.wrapping_add(self.slaves.len() as u16);
                    frame[offset+2 .. offset+4].copy_from_slice(&passed.to_le_bytes());
                    self.slaves.get_mut(position)
                },
                0x04 ..= 0x06 => self.slaves.iter_mut().find(|slave| slave.station == address),
                _ => None,
            };
            let processed = match (command, slave) {
                (0x01 | 0x04, Some(slave)) => slave.read(memory, &mut frame[data]),
                (0x02 | 0x05, Some(slave)) => slave.write(memory, &frame[data]),
                _ => false,
            };
            let count = u16::from_le_bytes([frame[footer], frame[footer+1]]) + u16::from(processed);
            frame[footer .. footer+2].copy_from_slice(&count.to_le_bytes());

            if flags & 0x8000 == 0
                {break}
            offset = footer + 2;
        }
        frame
    }
    fn slave(&mut self, station: u16) -> &mut SimulatedSlave {
        self.slaves.iter_mut()
            .find(|slave| slave.station == station)
            .expect("no simulated slave with this station address")
    }
}

/// socket connected to simulated slaves, cloning it gives a handle to control the simulation
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {Self::default()}

    /// append a slave at the end of the ring, in INIT
    pub fn add_slave(&self, station: u16, al: AlBehaviour, mailbox: Option<MailboxConfig>, responder: Option<Responder>) {
        let mut memory = vec![0; MEMORY_SIZE];
        memory[AL_STATUS] = 0x1;
        memory[0x0010 .. 0x0012].copy_from_slice(&station.to_le_bytes());
        self.state.lock().unwrap().slaves.push(SimulatedSlave {
            station,
            memory,
            al,
            mailbox,
            responder,
            outbox: VecDeque::new(),
            count: 0,
            accept: true,
            writes: 0,
        });
    }
    pub fn set_al(&self, station: u16, al: AlBehaviour) {
        self.state.lock().unwrap().slave(station).al = al;
    }
    /// AL status register of a slave
    pub fn al_status(&self, station: u16) -> u8 {
        self.state.lock().unwrap().slave(station).memory[AL_STATUS]
    }
    /// put a message in the read mailbox of a slave, as if the slave produced it
    pub fn push_message(&self, station: u16, ty: u8, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let slave = state.slave(station);
        slave.count = slave.count % 7 + 1;
        let mut message = (payload.len() as u16).to_le_bytes().to_vec();
        message.extend_from_slice(&[0, 0, 0, ty | (slave.count << 4)]);
        message.extend_from_slice(payload);
        slave.outbox.push_back(message);
    }
    pub fn set_accept(&self, station: u16, accept: bool) {
        self.state.lock().unwrap().slave(station).accept = accept;
    }
    /// number of messages a slave took from its write mailbox
    pub fn mailbox_writes(&self, station: u16) -> usize {
        self.state.lock().unwrap().slave(station).writes
    }
    /// lose every frame from now on
    pub fn set_drop(&self, drop: bool) {
        self.state.lock().unwrap().drop = drop;
    }
    /// delay the answer to the next frame until [Self::release]
    pub fn hold_next(&self) {
        self.state.lock().unwrap().hold_next = true;
    }
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        let held = core::mem::take(&mut state.held);
        state.answers.extend(held);
    }
    /// number of frames the master sent
    pub fn frames(&self) -> usize {
        self.state.lock().unwrap().frames
    }
}

impl EthercatSocket for SimulatedBus {
    fn receive(&self, data: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.answers.pop_front().map(|frame| {
            data[.. frame.len()].copy_from_slice(&frame);
            frame.len()
        }))
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.frames += 1;
        if state.drop
            {return Ok(())}
        let answer = state.process(data);
        if state.hold_next {
            state.hold_next = false;
            state.held.push(answer);
        }
        else {
            state.answers.push_back(answer);
        }
        Ok(())
    }
    fn max_frame(&self) -> usize {ETH_DATA_LEN}
}

/// master on a new simulated bus
pub fn master(config: MasterConfig) -> (Master, SimulatedBus) {
    let bus = SimulatedBus::new();
    (Master::new(bus.clone(), config), bus)
}
