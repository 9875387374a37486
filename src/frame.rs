/*!
    Packing of datagrams into EtherCAT frames, and parsing of the frames returning from the ring.

    An EtherCAT frame is a 2 bytes header followed by any number of datagrams, each with its own 10 bytes header and 2 bytes footer (the working counter). Datagrams are chained by the `next` bit of their header.
*/

use bilge::prelude::*;
use crate::{
    config::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, DATAGRAM_HEADER_SIZE, DATAGRAM_FOOTER_SIZE},
    datagram::{Datagram, PduCommand, PduHeader, PduFooter, EthercatHeader, EthercatType},
    data::{PduData, Cursor},
    error::{EthercatError, EthercatResult},
    };


/**
    greedy frame packer

    datagrams are packed in submission order, a datagram that would overflow the current frame starts a new one. No datagram is ever split across frames.
*/
#[derive(Copy, Clone, Debug)]
pub struct FrameAssembler {
    frame_size: usize,
}

impl FrameAssembler {
    /**
        `frame_size` is the maximum byte size of a frame, its EtherCAT header included

        it is bounded to [MAX_FRAME_SIZE] since bigger frames cannot be described by their header
    */
    pub fn new(frame_size: usize) -> Self {
        Self {frame_size: frame_size.min(MAX_FRAME_SIZE)}
    }
    /// maximum byte size of a frame
    pub fn frame_size(&self) -> usize {self.frame_size}
    /// maximum data size a single datagram can carry
    pub fn max_payload(&self) -> usize {
        self.frame_size.saturating_sub(FRAME_HEADER_SIZE + DATAGRAM_HEADER_SIZE + DATAGRAM_FOOTER_SIZE)
    }
    /// check a datagram can be sent, payloads too big for a frame are rejected instead of being truncated
    pub fn check(&self, datagram: &Datagram) -> EthercatResult {
        if datagram.data.len() > self.max_payload() {
            return Err(EthercatError::OversizedPayload {
                size: datagram.data.len(),
                max: self.max_payload(),
                });
        }
        Ok(())
    }

    /// pack the given datagrams with their index into as many frames as necessary
    pub fn assemble<'a>(&self, datagrams: impl IntoIterator<Item=(u8, &'a Datagram)>) -> EthercatResult<Vec<Frame<'a>>> {
        let mut frames = Vec::new();
        let mut current = Frame::new();
        for (index, datagram) in datagrams {
            self.check(datagram)?;
            if current.size() + datagram.packed_size() > self.frame_size {
                frames.push(core::mem::replace(&mut current, Frame::new()));
            }
            current.push(index, datagram);
        }
        if ! current.is_empty() {
            frames.push(current);
        }
        Ok(frames)
    }
}


/// a frame being assembled, referencing the datagrams it contains
#[derive(Clone, Debug)]
pub struct Frame<'a> {
    datagrams: Vec<(u8, &'a Datagram)>,
    size: usize,
}

impl<'a> Frame<'a> {
    fn new() -> Self {
        Self {datagrams: Vec::new(), size: FRAME_HEADER_SIZE}
    }
    fn push(&mut self, index: u8, datagram: &'a Datagram) {
        self.size += datagram.packed_size();
        self.datagrams.push((index, datagram));
    }
    /// byte size of the frame once encoded, EtherCAT header included
    pub fn size(&self) -> usize {self.size}
    /// number of datagrams in the frame
    pub fn len(&self) -> usize {self.datagrams.len()}
    pub fn is_empty(&self) -> bool {self.datagrams.is_empty()}
    /// datagrams in the frame, with the index they are sent with
    pub fn datagrams(&self) -> &[(u8, &'a Datagram)] {&self.datagrams}

    /// write the frame in the given buffer, returning the written size
    pub fn encode(&self, dst: &mut [u8]) -> EthercatResult<usize> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&EthercatHeader::new(
            u11::new((self.size - FRAME_HEADER_SIZE) as u16),
            EthercatType::PDU,
            ))?;
        for (i, (index, datagram)) in self.datagrams.iter().enumerate() {
            let mut header = PduHeader::default();
            header.set_command(u8::from(datagram.command));
            header.set_index(*index);
            header.set_slave_address(datagram.slave);
            header.set_memory_address(datagram.memory);
            header.set_len(u11::new(datagram.data.len() as u16));
            header.set_next(i+1 < self.datagrams.len());
            cursor.pack(&header)?;
            cursor.write(&datagram.data)?;
            cursor.pack(&PduFooter::new(0))?;
        }
        Ok(cursor.position())
    }
}


/// a datagram extracted from a returning frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedDatagram<'a> {
    pub command: PduCommand,
    pub index: u8,
    pub slave: u16,
    pub memory: u16,
    pub data: &'a [u8],
    pub working_count: u16,
}

/// parse a frame returning from the ring into its datagrams
pub fn decode(frame: &[u8]) -> EthercatResult<Vec<ReceivedDatagram<'_>>> {
    let mut cursor = Cursor::new(frame);
    let header = cursor.unpack::<EthercatHeader>()?;
    if header.ty() != EthercatType::PDU
        {return Err(EthercatError::Malformed("frame does not contain datagrams"))}
    let content = cursor.read(usize::from(header.len().value()))
        .map_err(|_| EthercatError::Malformed("frame is shorter than its header claims"))?;

    let mut cursor = Cursor::new(content);
    let mut datagrams = Vec::new();
    loop {
        let header = cursor.unpack::<PduHeader>()
            .map_err(|_| EthercatError::Malformed("truncated datagram header"))?;
        let data = cursor.read(usize::from(header.len().value()))
            .map_err(|_| EthercatError::Malformed("truncated datagram data"))?;
        let footer = cursor.unpack::<PduFooter>()
            .map_err(|_| EthercatError::Malformed("truncated datagram footer"))?;
        datagrams.push(ReceivedDatagram {
            command: PduCommand::from(header.command()),
            index: header.index(),
            slave: header.slave_address(),
            memory: header.memory_address(),
            data,
            working_count: footer.working_count(),
            });
        if ! header.next() {break}
    }
    Ok(datagrams)
}
