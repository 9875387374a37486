/*!
    structs and consts for the registers of a standard slave's RAM used by this master. This should be used instead of any hardcoded register value.

    Only the registers driving the application layer state machine, the station address and the mailbox sync managers are gathered here, since process data mapping and clocks are not handled by this crate.
*/

use core::fmt;
use bilge::prelude::*;
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    /// ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    /// ETG.1000.4 table 32
    pub const alias: Field<u16> = Field::simple(0x0012);
}

/// AL (Application Layer) registers are controling the communication state of a slave
pub mod al {
    use super::*;

    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    pub const error: Field<AlError> = Field::simple(0x0134);
}

/**
    SM (Sync Managers) are used for configuring and controling two distinct things:
    - mailbox exchanges (CoE, EoE, ...)
    - pdo exchanges (copying PDO data to slave's physical memory)

    By convention the first sync manager is the mailbox written by the master, and the second one the mailbox read by the master.
*/
pub mod sync_manager {
    use super::*;

    /// address of the first sync manager channel
    pub const base: u16 = 0x0800;
    /// byte size of each sync manager channel
    pub const channel_size: u16 = 8;
    /// sync manager used for master to slave mailbox
    pub const mailbox_write: u8 = 0;
    /// sync manager used for slave to master mailbox
    pub const mailbox_read: u8 = 1;

    /// status register of the given sync manager channel
    pub const fn status(channel: u8) -> Field<SyncManagerStatus> {
        Field::simple((base + channel_size * channel as u16 + 5) as usize)
    }
}


/// ETG.1000.6 table 9
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlControlRequest {
    /// requested state of communication
    pub state: u4,
    /// if true, the error indication in [AlStatus::error] will be acknowledged
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlControlRequest, u8, u8);

impl AlControlRequest {
    /// request for the given state, acknowledging any former error
    pub fn switch(state: AlState) -> Self {
        let mut request = Self::default();
        request.set_state(u4::from(state));
        request.set_ack(true);
        request
    }
}

/// ETG.1000.6 table 12
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlStatus {
    /// current state of communication, possibly not a valid [AlState]
    pub state: u4,
    /// true if the last state change failed, the reason is in [al::error]
    pub error: bool,
    /// true if an id has been loaded in [al::error] instead of an error code
    pub id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlStatus, u8, u8);

impl AlStatus {
    /// current state, if the slave reports a valid one
    pub fn al_state(&self) -> Option<AlState> {
        AlState::try_from(self.state()).ok()
    }
}

/**
    the current operation state on one device.

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AlState {
    /**
        Transitional state meaning the slave is booting up and ready for nothing yet.

        It can only be requested from [Self::Init], usually for firmware updates.
    */
    Bootstrap = 3,
    /**
        The init mode allows to set many communication registers, like the salve address, the mailbox setup, etc.

        Only registers can be used.
    */
    Init = 1,
    /**
        the pre operational mode allows mailbox communication, which is mendatory to configure some slaves before realtime operations. Most functions are enabled but not realtime.

        This is the configuration state: object dictionary and tunneled traffic become available here.
    */
    PreOperational = 2,
    /**
        Mode allowing realtime operations, except that commands sent to the slaves via its mapping will not be executed.
    */
    SafeOperational = 4,
    /**
        Realtime operations running
    */
    Operational = 8,
}

impl AlState {
    /// position of the state in the startup progression, [Self::Bootstrap] is aside of the progression and ranks as [Self::Init]
    pub fn rank(self) -> u8 {
        match self {
            Self::Init | Self::Bootstrap => 0,
            Self::PreOperational => 1,
            Self::SafeOperational => 2,
            Self::Operational => 3,
        }
    }
    /**
        next state to request in order to travel from `self` to `target`

        going up the progression must be done one step at a time, going down can be done directly. [Self::Bootstrap] is only reachable from and left to [Self::Init]
    */
    pub fn step_toward(self, target: Self) -> Self {
        match (self, target) {
            (Self::Init, _) | (_, Self::Init) => {},
            (Self::Bootstrap, _) | (_, Self::Bootstrap) if self != target => return Self::Init,
            _ => {},
        }
        if target.rank() <= self.rank()
            {return target}
        match self.rank() {
            0 => Self::PreOperational,
            1 => Self::SafeOperational,
            _ => Self::Operational,
        }
    }
}

impl fmt::Display for AlState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::PreOperational => "PREOP",
            Self::Bootstrap => "BOOT",
            Self::SafeOperational => "SAFEOP",
            Self::Operational => "OP",
        })
	}
}

/// maximum length of a text produced by [AlMixedState]'s display, error acknowledgement included
pub const STATE_STRING_SIZE: usize = 32;

/**
	gather the current operation states on several devices, or the raw state nibble reported by one slave which can be any combination

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlMixedState {
    /// one slave at least is in [AlState::Init]
	pub init: bool,
	/// one slave at least is in [AlState::PreOperational]
	pub pre_operational: bool,
	/// one slave at least is in [AlState::SafeOperational]
	pub safe_operational: bool,
	/// one slave at least is in [AlState::Operational]
	pub operational: bool,
}

/// formats a raw status byte as `INIT`, `PREOP + SAFEOP`, `OP + ERROR` and so on
impl fmt::Display for AlMixedState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if u4::from(*self) == u4::new(3) {
            return f.write_str("BOOT")
        }
        let mut first = true;
		for (active, mark) in [ (self.init(), "INIT"),
								(self.pre_operational(), "PREOP"),
								(self.safe_operational(), "SAFEOP"),
								(self.operational(), "OP"),
								] {
			if active {
                if ! first {f.write_str(" + ")?}
                f.write_str(mark)?;
                first = false;
			}
		}
        if first {
            f.write_str("(unknown)")?;
        }
		Ok(())
	}
}

impl From<AlState> for AlMixedState {
    fn from(state: AlState) -> Self {
        Self::from(u4::from(state))
    }
}

impl fmt::Display for AlStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", AlMixedState::from(self.state()))?;
        if self.error() {
            f.write_str(" + ERROR")?;
        }
        Ok(())
	}
}

/// ETG.1000.6 table 11
#[bitsize(16)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlError {
    NoError = 0x0000,
    Unspecified = 0x0001,
    NoMemory = 0x0002,
    InvalidDeviceSetup = 0x0003,
    InvalidStateRequest = 0x0011,
    UnknownStateRequest = 0x0012,
    BootstrapNotSupported = 0x0013,
    NoValidFirmware = 0x0014,
    InvalidMailboxConfigBoot = 0x0015,
    InvalidMailboxConfigPreop = 0x0016,
    InvalidSyncConfig = 0x0017,
    NoInputsAvailable = 0x0018,
    NoValidInputs = 0x0019,
    Synchronization = 0x001A,
    SyncWatchdog = 0x001B,
    InvalidSyncTypes = 0x001C,
    InvalidOutputConfig = 0x001D,
    InvalidInputConfig = 0x001E,
    InvalidWatchdogConfig = 0x001F,
    NeedColdStart = 0x0020,
    NeedInit = 0x0021,
    NeedPreop = 0x0022,
    NeedSafeOp = 0x0023,
    InvalidInputMapping = 0x0024,
    InvalidOutputMapping = 0x0025,
    InconsistentSettings = 0x0026,
    FreeRunNotSupported = 0x0027,
    SyncModeNotSupported = 0x0028,
    FreeRunNeedsBuffer = 0x0029,
    BackgroundWatchdog = 0x002A,
    NoValidIO = 0x002B,
    FatalSync = 0x002C,
    NoSync = 0x002D,
    InvalidDcConfig = 0x0030,
    InvalidLatchConfig = 0x0031,
    PLL = 0x0032,
    DCSyncIO = 0x0033,
    DCSyncTimeout = 0x0034,
    DCInvalidPeriod = 0x0035,
    MailboxAOE = 0x0041,
    MailboxEOE = 0x0042,
    MailboxCOE = 0x0043,
    MailboxFOE = 0x0044,
    MailboxSOE = 0x0045,
    MailboxVOE = 0x004F,
    EepromNoAccess = 0x0050,
    Eeeprom = 0x0051,
    SlaveRestarted = 0x0060,
    DeviceIdentificationUpdated = 0x0061,
    ApplicationAvailable = 0x00F0,
    /// any code not listed above, reserved or vendor specific
    #[fallback]
    Specific = 0xffff,
}
data::bilge_pdudata!(AlError, u16, u16);

impl AlError {
    /// human readable message associated to the code
    pub fn message(self) -> &'static str {
        match self {
            Self::NoError => "No error",
            Self::Unspecified => "Unspecified error",
            Self::NoMemory => "No Memory",
            Self::InvalidDeviceSetup => "Invalid Device Setup",
            Self::InvalidStateRequest => "Invalid requested state change",
            Self::UnknownStateRequest => "Unknown requested state",
            Self::BootstrapNotSupported => "Bootstrap not supported",
            Self::NoValidFirmware => "No valid firmware",
            Self::InvalidMailboxConfigBoot => "Invalid mailbox configuration for BOOT",
            Self::InvalidMailboxConfigPreop => "Invalid mailbox configuration for PREOP",
            Self::InvalidSyncConfig => "Invalid sync manager configuration",
            Self::NoInputsAvailable => "No valid inputs available",
            Self::NoValidInputs => "No valid outputs",
            Self::Synchronization => "Synchronization error",
            Self::SyncWatchdog => "Sync manager watchdog",
            Self::InvalidSyncTypes => "Invalid Sync Manager Types",
            Self::InvalidOutputConfig => "Invalid Output Configuration",
            Self::InvalidInputConfig => "Invalid Input Configuration",
            Self::InvalidWatchdogConfig => "Invalid Watchdog Configuration",
            Self::NeedColdStart => "Slave needs cold start",
            Self::NeedInit => "Slave needs INIT",
            Self::NeedPreop => "Slave needs PREOP",
            Self::NeedSafeOp => "Slave needs SAFEOP",
            Self::InvalidInputMapping => "Invalid Input Mapping",
            Self::InvalidOutputMapping => "Invalid Output Mapping",
            Self::InconsistentSettings => "Inconsistent Settings",
            Self::FreeRunNotSupported => "FreeRun not supported",
            Self::SyncModeNotSupported => "SyncMode not supported",
            Self::FreeRunNeedsBuffer => "FreeRun needs 3 Buffer Mode",
            Self::BackgroundWatchdog => "Background Watchdog",
            Self::NoValidIO => "No Valid Inputs and Outputs",
            Self::FatalSync => "Fatal Sync Error",
            Self::NoSync => "No Sync Error",
            Self::InvalidDcConfig => "Invalid DC SYNC Configuration",
            Self::InvalidLatchConfig => "Invalid DC Latch Configuration",
            Self::PLL => "PLL Error",
            Self::DCSyncIO => "DC Sync IO Error",
            Self::DCSyncTimeout => "DC Sync Timeout Error",
            Self::DCInvalidPeriod => "DC Invalid Sync Cycle Time",
            Self::MailboxAOE => "MBX_AOE",
            Self::MailboxEOE => "MBX_EOE",
            Self::MailboxCOE => "MBX_COE",
            Self::MailboxFOE => "MBX_FOE",
            Self::MailboxSOE => "MBX_SOE",
            Self::MailboxVOE => "MBX_VOE",
            Self::EepromNoAccess => "EEPROM No Access",
            Self::Eeeprom => "EEPROM Error",
            Self::SlaveRestarted => "Slave restarted locally",
            Self::DeviceIdentificationUpdated => "Device Identification value updated",
            Self::ApplicationAvailable => "Application controller available",
            Self::Specific => "Unknown or vendor specific",
        }
    }
}

impl fmt::Display for AlError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04X} \"{}\"", u16::from(*self), self.message())
	}
}


/// ETG.1000.4 table 58
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct SyncManagerStatus {
    /// interrupt raised by a write in the buffer
    pub interrupt_write: bool,
    /// interrupt raised by a read of the buffer
    pub interrupt_read: bool,
    reserved: u1,
    /// in mailbox mode, true when the mailbox contains a frame not yet read by its reader
    pub mailbox_full: bool,
    /// in buffered mode, index of the last written buffer
    pub buffered_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,
}
data::bilge_pdudata!(SyncManagerStatus, u8, u8);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn state_progression() {
        use AlState::*;
        assert_eq!(Init.step_toward(Operational), PreOperational);
        assert_eq!(PreOperational.step_toward(Operational), SafeOperational);
        assert_eq!(SafeOperational.step_toward(Operational), Operational);
        assert_eq!(Operational.step_toward(Init), Init);
        assert_eq!(Operational.step_toward(PreOperational), PreOperational);
        assert_eq!(Init.step_toward(Bootstrap), Bootstrap);
        assert_eq!(Bootstrap.step_toward(Operational), Init);
        assert_eq!(Bootstrap.step_toward(Init), Init);
        assert_eq!(Bootstrap.step_toward(Bootstrap), Bootstrap);
        // bootstrap is entered from INIT only
        assert_eq!(PreOperational.step_toward(Bootstrap), Init);
        assert_eq!(SafeOperational.step_toward(Bootstrap), Init);
        assert_eq!(Operational.step_toward(Bootstrap), Init);
    }

    #[test]
    fn status_string() {
        let status = AlStatus::unpack(&[0x12]).unwrap();
        assert_eq!(status.al_state(), Some(AlState::PreOperational));
        assert!(status.error());
        assert_eq!(status.to_string(), "PREOP + ERROR");
        assert_eq!(AlMixedState::from(u4::new(0b0110)).to_string(), "PREOP + SAFEOP");
        assert_eq!(AlMixedState::from(AlState::Bootstrap).to_string(), "BOOT");
        assert!("INIT + PREOP + SAFEOP + OP + ERROR".len() < STATE_STRING_SIZE);
    }

    #[test]
    fn register_packing() {
        let mut byte = [0];
        AlControlRequest::switch(AlState::SafeOperational).pack(&mut byte).unwrap();
        assert_eq!(byte, [0x14]);
        assert_eq!(AlError::unpack(&[0x1b, 0x00]).unwrap(), AlError::SyncWatchdog);
        assert_eq!(AlError::unpack(&[0x01, 0x80]).unwrap(), AlError::Specific);
        assert!(SyncManagerStatus::unpack(&[0x08]).unwrap().mailbox_full());
    }
}
