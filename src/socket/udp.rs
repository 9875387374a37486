use std::io;
use std::net::{SocketAddr, SocketAddrV4, IpAddr, Ipv4Addr};
use super::{EthercatSocket, ETHERCAT_ETHERTYPE};
use crate::config::ETH_DATA_LEN;

/**
    UDP socket with fixed port, allowing ethercat com through a regular switch
*/
pub struct UdpSocket {
    socket: std::net::UdpSocket,
    address: SocketAddrV4,

    filter_address: bool,
}

impl UdpSocket {
    /// according to ETG.1000.4 only IPv4 is supported, and port is fixed, hence this function only requires the host address
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let address = SocketAddrV4::new(segment, ETHERCAT_ETHERTYPE);
        let socket = std::net::UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ETHERCAT_ETHERTYPE,
                ))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            address,
            socket,
            filter_address: false,
        })
    }
    /// if enabled, datagrams coming from another host than the segment are ignored
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn receive(&self, data: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match self.socket.recv_from(data) {
                // ignore wrong hosts
                Ok((_, src)) if self.filter_address && src != SocketAddr::V4(self.address) => continue,
                Ok((size, _)) => return Ok(Some(size)),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) => return Err(error),
            }
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(data, self.address)?;
        if sent != data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "frame partially sent"));
        }
        Ok(())
    }
    // IPv4 and UDP headers are taking place in the ethernet payload
    fn max_frame(&self) -> usize {ETH_DATA_LEN - 28}
}
