/*!
    This module provide the trait [EthercatSocket], and several implementors allowing to use different physical layers for ethercat communication.

    - UDP socket allows to run multiple master, one ethercat segment each, on the same ethernet network (and same machine ethernet port). But exposes the ethercat network to possible delays due to ethernet packet collisions.
    - Raw socket allows one only master with one only ethercat segment on the ethernet network. It ensure no communication delay with an ethercat segment.

    Both socket types allows the use of the same master ethernet port for other ethernet protocols such as normal internet operations.

    | socket type |  allowed masters on network  |  allowed EC segments on network |  possible jitter |  other protocols allowed on same network |
    |-------------|----------------------------------------|-------------------------------------------|------------------|------------------------------------------|
    | [EthernetSocket] | 1                                 | 1                                         | none             | all non-ethercat protocols               |
    | [UdpSocket] | 2^32                                    | 2^32                                       | depend on trafic | all                                      |

    Sockets are non-blocking: the master cycle must never wait on the medium, a frame that has not come back yet is simply not received in this cycle.
*/

mod udp;
#[cfg(target_os = "linux")]
mod ethernet;

pub use udp::UdpSocket;
#[cfg(target_os = "linux")]
pub use ethernet::EthernetSocket;

use std::io;

/// ethernet type of EtherCAT frames, also used as UDP port
pub const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/**
    trait implementing the ethercat frame encapsulation into some medium

    This allows to send or receive ethercat frames over any network, but according to ETG 1000.4, only Ethernet and UDP are officially supported
*/
pub trait EthercatSocket {
    /**
        receive an ethercat frame into the given buffer (starting from ethercat header), if one is available

        Returns the number of bytes read, or `None` if no frame is pending. This must not block.

        The implementor is responsible from assembling the whole packet, and hiding the details of socket-specific headers, footers, checks, fragmentation ...
    */
    fn receive(&self, data: &mut [u8]) -> io::Result<Option<usize>>;

    /**
        send an ethercat frame contained in the given buffer.

        The whole buffer will be sent, the user has to tail it to the exact data size to send.

        the buffer passed must contain the data with the ethercat header.
        The implentor of this trait is responsible of encapsulating the data into the specific socket by adding the necessary specific headers, footers, checks, fragmentation ...
    */
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// maximum frame size tolerated for sending by this socket
    fn max_frame(&self) -> usize;
}

impl<S: EthercatSocket + ?Sized> EthercatSocket for Box<S> {
    fn receive(&self, data: &mut [u8]) -> io::Result<Option<usize>> {(**self).receive(data)}
    fn send(&self, data: &[u8]) -> io::Result<()> {(**self).send(data)}
    fn max_frame(&self) -> usize {(**self).max_frame()}
}
