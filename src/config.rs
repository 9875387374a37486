/*!
    Global parameterization of the master.

    The protocol constants are fixed by the wire format. The timing parameters have protocol-given defaults but are gathered in [MasterConfig] and handed to the master at construction, so that a test bench can run with compressed delays.
*/

use core::time::Duration;

/// version of this master, as reported to the user
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// maximum payload of an ethernet frame
pub const ETH_DATA_LEN: usize = 1500;
/// size of an EtherCAT frame header
pub const FRAME_HEADER_SIZE: usize = 2;
/// size of an EtherCAT datagram header
pub const DATAGRAM_HEADER_SIZE: usize = 10;
/// size of an EtherCAT datagram footer (the working counter)
pub const DATAGRAM_FOOTER_SIZE: usize = 2;
/// largest frame the 11 bits length of the frame header can describe, header included
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + 0x7ff;
/// resulting maximum data size of a single datagram in a frame
pub const MAX_DATA_SIZE: usize = ETH_DATA_LEN - FRAME_HEADER_SIZE - DATAGRAM_HEADER_SIZE - DATAGRAM_FOOTER_SIZE;

/// datagram round trip timeout
pub const IO_TIMEOUT: Duration = Duration::from_micros(500);
/// number of transmissions of a datagram before declaring it failed on timeout
pub const FSM_RETRIES: u32 = 3;
/// delay to wait before fetching the object dictionary after a slave entered PREOP
pub const WAIT_SDO_DICT: Duration = Duration::from_secs(3);
/// clock frequency of the ethernet tunneling state machines
pub const EOE_FREQUENCY: u32 = 1000;

/// parameters of a [Master](crate::Master) and all its state machines
#[derive(Clone, Debug, PartialEq)]
pub struct MasterConfig {
    /// byte size of the frames sent, EtherCAT frame header included
    pub frame_size: usize,
    /// delay after which a sent datagram with no answer is considered lost
    pub io_timeout: Duration,
    /// number of transmissions of a datagram before it is declared timed out
    pub retries: u32,
    /// delay a slave must spend in PREOP before its object dictionary can be fetched
    pub sdo_dictionary_delay: Duration,
    /// frequency of the ethernet tunneling ticks
    pub eoe_frequency: u32,
    /// maximum delay for a slave to reach a requested state
    pub state_change_timeout: Duration,
    /// maximum delay for a slave to answer a mailbox request
    pub mailbox_timeout: Duration,
    /// period of the cycles when the master is run by [crate::driver]
    pub cycle_period: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            frame_size: ETH_DATA_LEN,
            io_timeout: IO_TIMEOUT,
            retries: FSM_RETRIES,
            sdo_dictionary_delay: WAIT_SDO_DICT,
            eoe_frequency: EOE_FREQUENCY,
            state_change_timeout: Duration::from_secs(5),
            mailbox_timeout: Duration::from_secs(1),
            cycle_period: Duration::from_millis(1),
        }
    }
}

impl MasterConfig {
    /// maximum payload of a single datagram with the configured frame size
    pub fn max_data_size(&self) -> usize {
        self.frame_size.min(MAX_FRAME_SIZE).saturating_sub(FRAME_HEADER_SIZE + DATAGRAM_HEADER_SIZE + DATAGRAM_FOOTER_SIZE)
    }
    /// period between two tunneling ticks
    pub fn eoe_period(&self) -> Duration {
        Duration::from_secs(1) / self.eoe_frequency.max(1)
    }
}
