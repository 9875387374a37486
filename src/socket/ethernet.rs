use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use packed_struct::prelude::*;
use log::trace;
use super::{EthercatSocket, ETHERCAT_ETHERTYPE};
use crate::{
    config::ETH_DATA_LEN,
    data::MacAddress,
    };

/**
    MAC address used as source for frames sent by the master

    every slave processing a frame sets the locally administered bit (bit 1 of the first byte) of its source, so it must be clear here for returning frames to be told apart from the sent ones
*/
const MASTER_MAC: [u8; 6] = [0x10, 0x10, 0x10, 0x10, 0x10, 0x10];
/// broadcast destination, every slave processes EtherCAT frames regardless of their destination
const BROADCAST_MAC: [u8; 6] = [0xff; 6];
/// minimum size of an ethernet frame without its checksum
const ETH_MIN_FRAME: usize = 60;
const ETH_HEADER_SIZE: usize = 14;

/**
    Raw socket allowing direct ethercat com, but only one segment on the ethernet network

    Raw sockets are not implemented in std::net, so here is an implementation found in `smoltcp` and `ethercrab`.
    This implementation is linux-specific
*/
#[derive(Debug)]
pub struct EthernetSocket {
    lower: libc::c_int,
}

impl EthernetSocket {
    pub fn new(interface: &str) -> io::Result<Self> {
        if interface.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
        }

        // create
        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ETHERCAT_ETHERTYPE.to_be() as i32,
            );
            if lower == -1 {
                return Err(io::Error::last_os_error());
            }
            lower
        };
        // from now on, the descriptor is closed on drop
        let new = EthernetSocket {lower};

        // bind
        let mut ifreq = ifreq_for(interface);
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETHERCAT_ETHERTYPE.to_be(),
            sll_ifindex: ifreq_ioctl(new.lower, &mut ifreq, libc::SIOCGIFINDEX)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };

        unsafe {
            #[allow(trivial_casts)]
            let res = libc::bind(
                new.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(new)
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl EthercatSocket for EthernetSocket {
    fn receive(&self, data: &mut [u8]) -> io::Result<Option<usize>> {
        let mut packed = [0u8; ETH_HEADER_SIZE + ETH_DATA_LEN + 4];
        loop {
            let mut address: libc::sockaddr_ll = unsafe {std::mem::zeroed()};
            let mut address_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            #[allow(trivial_casts)]
            let len = unsafe {
                libc::recvfrom(
                    self.as_raw_fd(),
                    packed.as_mut_ptr() as *mut libc::c_void,
                    packed.len(),
                    0,
                    &mut address as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                    &mut address_len,
                )
            };
            if len < 0 {
                let error = io::Error::last_os_error();
                return match error.kind() {
                    io::ErrorKind::WouldBlock => Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(error),
                };
            }
            let len = len as usize;
            if len < ETH_HEADER_SIZE {continue}

            let header = EthernetHeader::unpack_from_slice(&packed[.. ETH_HEADER_SIZE])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad ethernet header"))?;
            if ! returned(address.sll_pkttype, &header)
                {continue}
            if header.src[0] & LOCAL_ADMINISTERED == 0
                {trace!("frame from {} not processed by any slave", MacAddress(header.src))}

            let content = &packed[ETH_HEADER_SIZE .. len];
            let size = content.len().min(data.len());
            data[.. size].copy_from_slice(&content[.. size]);
            return Ok(Some(size));
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut packed = heapless::Vec::<u8, {ETH_HEADER_SIZE + ETH_DATA_LEN}>::new();
        let header = EthernetHeader {
            dst: BROADCAST_MAC,
            src: MASTER_MAC,
            // vlan is said to be optional and this is not present in most ethercat frames, so will not be used here
            ty: ETHERCAT_ETHERTYPE,
            }.pack()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cannot pack ethernet header"))?;
        packed.extend_from_slice(&header)
            .and_then(|_| packed.extend_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too big for ethernet"))?;
        // the checksum is added by the network interface, only padding is left to us
        if packed.len() < ETH_MIN_FRAME {
            packed.resize(ETH_MIN_FRAME, 0)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cannot pad ethernet frame"))?;
        }

        let len = unsafe {
            libc::write(
                self.as_raw_fd(),
                packed.as_ptr() as *const libc::c_void,
                packed.len(),
            )
        };
        if len < 0 {
            Err(io::Error::last_os_error())
        }
        else if (len as usize) != packed.len() {
            Err(io::Error::new(io::ErrorKind::WriteZero, "frame partially sent"))
        }
        else {
            Ok(())
        }
    }
    fn max_frame(&self) -> usize {ETH_DATA_LEN}
}


/// bit set in the source MAC by every slave forwarding a frame
const LOCAL_ADMINISTERED: u8 = 0x02;

/// true for ethercat frames coming from the ring, frames sent by this host may be looped back by the kernel
fn returned(pkttype: libc::c_uchar, header: &EthernetHeader) -> bool {
    pkttype != libc::PACKET_OUTGOING as libc::c_uchar
        && header.ty == ETHERCAT_ETHERTYPE
}


// intermediate C-like structures and functions

#[repr(C)]
#[derive(Debug)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: libc::c_int, /* ifr_ifindex or ifr_mtu */
}

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    unsafe {
        #[allow(trivial_casts)]
        let res = libc::ioctl(lower, cmd, ifreq as *mut ifreq);

        if res == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(ifreq.ifr_data)
}

fn ifreq_for(name: &str) -> ifreq {
    let mut ifreq = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_data: 0,
    };
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char
    }
    ifreq
}



#[derive(PackedStruct, Clone, Debug)]
#[packed_struct(size_bytes="14", bit_numbering = "msb0", endian = "msb")]
struct EthernetHeader {
    #[packed_field(bytes="0:5")]  dst: [u8;6],
    #[packed_field(bytes="6:11")]  src: [u8;6],
    #[packed_field(bytes="12:13")]  ty: u16,
}
