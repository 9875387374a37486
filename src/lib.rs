/*!
    Cycle-driven EtherCAT master.

    The master drives a ring of slaves over raw ethernet frames. Every operation on the slaves (state changes, mailbox exchanges, tunneled ethernet frames) is an asynchronous request, queued by the user and progressing as the master cycles are run:

    - [frame] packs datagrams into frames
    - [transport] sends them, matches the answers, times out and retries
    - [slave] drives the application layer state of the slaves
    - [mailbox] serializes the mailbox exchanges with each slave
    - [tunnel] runs ethernet tunneling at a fixed rate
    - [master] gathers all of them in one cycle

    Nothing blocks: a cycle never waits for an answer, timeouts are detected by comparing the cycle instant with deadlines.
*/

pub mod config;
pub mod data;
pub mod error;
pub mod registers;
pub mod datagram;
pub mod frame;
pub mod socket;
pub mod transport;
pub mod request;
pub mod slave;
pub mod coe;
pub mod mailbox;
pub mod tunnel;
pub mod master;
pub mod driver;

pub use crate::config::MasterConfig;
pub use crate::data::{PduData, Field, HexDump, HexDiff, MacAddress};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::registers::{AlState, AlError};
pub use crate::datagram::{Datagram, SlaveAddress, PduCommand, Response};
pub use crate::socket::*;
pub use crate::request::{RequestState, RequestHandle};
pub use crate::slave::{SlaveState, SlaveFault};
pub use crate::mailbox::{MailboxConfig, MailboxType, MailboxReply, MailboxReject, Operation};
pub use crate::master::{Master, SlaveStatus};
