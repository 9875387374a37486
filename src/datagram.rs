/*!
    EtherCAT datagrams (aka. PDU, Process Data Unit) and their wire headers.

    A datagram is one command acting on one of the 2 memories types of the slaves:

    - **Physical Memory** (aka. registers)

        each slave has its own physical memory, commands for physical memory (`*P*`, `B*`) are addressing a specific slave, or combining the memory reads from all slaves

    - **Logical Memory** (aka. fieldbus memory)

        this memory doesn't physically exist anywhere, but can be read/write using `L*` commands with each slave contributing to the record according to its FMMU configuration.

    Each datagram returns with a working counter telling how many slaves processed it.
*/

use core::fmt;
use bilge::prelude::*;
use crate::data::{self, Field, PduData, PackingResult};


/// dynamically specifies a destination address on the ethercat loop
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlaveAddress {
	/// every slave will receive and execute
	Broadcast,
	/// address will be determined by the topology (index of the slave in the ethernet loop)
	AutoIncremented(u16),
	/// address has been set by the master previously
	Fixed(u16),
	/// the logical memory is the destination, all slaves are concerned
	Logical,
}

/// kind of memory access requested by a datagram
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Exchange,
}

impl SlaveAddress {
    /// command and slave address field corresponding to an access at this address
    pub fn command(self, access: Access) -> (PduCommand, u16) {
        use PduCommand::*;
        let pick = |read, write, exchange| match access {
            Access::Read => read,
            Access::Write => write,
            Access::Exchange => exchange,
        };
        match self {
            Self::Broadcast => (pick(BRD, BWR, BRW), 0),
            // auto-increment addresses are counted down by each slave, the targeted one sees zero
            Self::AutoIncremented(position) => (pick(APRD, APWR, APRW), 0u16.wrapping_sub(position)),
            Self::Fixed(address) => (pick(FPRD, FPWR, FPRW), address),
            Self::Logical => (pick(LRD, LWR, LRW), 0),
        }
    }
}

/**
    a single addressed operation, ready to be packed in a frame

    Memory addresses of logical commands are 32 bits, they are split over `slave` (low word) and `memory` (high word) like on the wire.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub command: PduCommand,
    /// ADP field of the header
    pub slave: u16,
    /// ADO field of the header
    pub memory: u16,
    /// data sent, the answer will have the same size
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn new(command: PduCommand, slave: u16, memory: u16, data: Vec<u8>) -> Self {
        Self {command, slave, memory, data}
    }
    /// read a register, the answer will contain its value
    pub fn read<T: PduData>(slave: SlaveAddress, field: Field<T>) -> Self {
        let (command, slave) = slave.command(Access::Read);
        Self::new(command, slave, field.byte as u16, vec![0; field.len])
    }
    /// write a register
    pub fn write<T: PduData>(slave: SlaveAddress, field: Field<T>, value: T) -> PackingResult<Self> {
        let (command, slave) = slave.command(Access::Write);
        let mut data = vec![0; field.len];
        value.pack(&mut data)?;
        Ok(Self::new(command, slave, field.byte as u16, data))
    }
    /// read a slice of physical memory
    pub fn read_slice(slave: SlaveAddress, memory: u16, len: usize) -> Self {
        let (command, slave) = slave.command(Access::Read);
        Self::new(command, slave, memory, vec![0; len])
    }
    /// write a slice of physical memory
    pub fn write_slice(slave: SlaveAddress, memory: u16, data: Vec<u8>) -> Self {
        let (command, slave) = slave.command(Access::Write);
        Self::new(command, slave, memory, data)
    }
    /// size taken by this datagram in a frame, header and footer included
    pub fn packed_size(&self) -> usize {
        PduHeader::packed_size() + self.data.len() + PduFooter::packed_size()
    }
}

/// answer to a datagram
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub data: Vec<u8>,
    /// number of slaves who processed the datagram
    pub working_count: u16,
}

impl Response {
    /// extract a value from the answered data
    pub fn value<T: PduData>(&self) -> PackingResult<T> {
        T::unpack(&self.data)
    }
}


/// ethercat frame header (common to ethernet or UDP mediums) as described in ETG 1000.4 table 11
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub(crate) struct EthercatHeader {
    /// length of the ethercat frame (minus 2 bytes, which is the header)
    pub len: u11,
    reserved: u1,
    /// frame type
    pub ty: EthercatType,
}
data::bilge_pdudata!(EthercatHeader, u16, u16);

/// type of ethercat frame
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EthercatType {
    /// process data unit, use to exchange with physical and logical memory in realtime or not
    /// the mailbox content sent to slaves shall be written to the physical memory through these
    ///
    /// See ETG.1000.4
    PDU = 0x1,

    NetworkVariable = 0x4,

    /// mailbox gateway communication, between the master and non-slave devices
    ///
    /// See ETG.8200
    Mailbox = 0x5,

    #[fallback]
    Unknown = 0xf,
}


/// header of a datagram in a PDU frame
#[bitsize(80)]
#[derive(FromBits, DebugBits, Clone, Default)]
pub(crate) struct PduHeader {
    /// PDU command, specifying whether logical or physical memory is accesses, addressing type, and what read/write operation
    pub command: u8,
    /// PDU index, identifying the answer
    pub index: u8,
    /// slave address, its meaning depend on the command
    pub slave_address: u16,
    /// memory address of the data to access, which memory is accessed depend on the command
    pub memory_address: u16,
    /// data length following the header, excluding the footer. starting from `memory_address` in the addressed memory
    pub len: u11,
    reserved: u3,
    /// set by slaves if the frame circulated once without being processed
    pub circulating: bool,
    /// true if there is an other PDU in the same PDU frame
    pub next: bool,
    pub interrupt: u16,
}
data::bilge_pdudata!(PduHeader, u80, u128);

/// footer for PDU exchange
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub(crate) struct PduFooter {
    pub working_count: u16,
}
data::bilge_pdudata!(PduFooter, u16, u16);

/// the possible PDU commands
#[bitsize(8)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PduCommand {
    /// no operation
    NOP = 0x0,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// auto-incremented slave read
    APRD = 0x01,
    /// auto-incremented slave write
    APWR = 0x02,
    /// auto-incremented slave read & write
    APRW = 0x03,

    /// fixed slave read
    FPRD = 0x04,
    /// fixed slave write
    FPWR = 0x05,
    /// fixed slave read & write
    FPRW = 0x06,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,

    /// auto-incremented slave read multiple write
    ARMW = 0x0D,
    /// fixed slave read multiple write
    FRMW = 0x0E,

    /// reserved command codes
    #[fallback]
    Reserved = 0xff,
}

impl fmt::Display for PduCommand {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
