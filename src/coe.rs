/*!
    Minimal CoE (Canopen over Ethercat) support: only the SDO information service listing the object dictionary is implemented, SDO transfers themselves can be done with raw mailbox exchanges.

    ETG.1000.6 5.6.3
*/

use core::fmt;
use bilge::prelude::*;
use crate::data::{self, PduData, Cursor, PackingError, PackingResult};


/// header of every CoE mailbox payload
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct CoeHeader {
    /// present in the Can protocol, but not used in CoE
    pub number: u9,
    reserved: u3,
    /// Can command
    pub service: CanService,
}
data::bilge_pdudata!(CoeHeader, u16, u16);

/**
    Type of can service

    receiving and transmiting is from the point of view of the slave:
        - transmitting is slave -> master
        - receiving is master -> slave
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanService {
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}

/// header of SDO information services, following [CoeHeader]
///
/// ETG.1000.6 5.6.3.2
#[bitsize(32)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct SdoInfoHeader {
    pub opcode: SdoInfoOpcode,
    /// true if more fragments of the same answer follow
    pub incomplete: bool,
    reserved: u8,
    pub fragments_left: u16,
}
data::bilge_pdudata!(SdoInfoHeader, u32, u32);

#[bitsize(7)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoInfoOpcode {
    DictionaryRequest = 0x01,
    DictionaryResponse = 0x02,
    DescriptionRequest = 0x03,
    DescriptionResponse = 0x04,
    EntryRequest = 0x05,
    EntryResponse = 0x06,
    Error = 0x07,
}

/// selection of objects returned by a dictionary request
///
/// ETG.1000.6 table 44
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum DictionaryList {
    Length = 0,
    All = 1,
    RxPdoMappable = 2,
    TxPdoMappable = 3,
    Backup = 4,
    Settings = 5,
}

/// mailbox payload requesting the given list of objects
pub fn dictionary_request(list: DictionaryList) -> PackingResult<Vec<u8>> {
    let mut buffer = vec![0; CoeHeader::packed_size() + SdoInfoHeader::packed_size() + u16::packed_size()];
    let mut cursor = Cursor::new(buffer.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CanService::SdoInformation))?;
    cursor.pack(&SdoInfoHeader::new(SdoInfoOpcode::DictionaryRequest, false, 0))?;
    cursor.pack(&(list as u16))?;
    Ok(buffer)
}

/// content of one answer fragment to a dictionary request
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DictionaryFragment {
    /// indices of objects, more fragments follow if `incomplete`
    Indices {indices: Vec<u16>, incomplete: bool},
    /// the slave refused the request with the given SDO abort code
    Abort(u32),
}

/// parse a mailbox payload answering a dictionary request, only the first fragment starts with the list type
pub fn dictionary_response(data: &[u8], first: bool) -> PackingResult<DictionaryFragment> {
    let mut cursor = Cursor::new(data);
    let coe = cursor.unpack::<CoeHeader>()?;
    if coe.service() != CanService::SdoInformation
        {return Err(PackingError::InvalidValue("not an SDO information answer"))}
    let header = cursor.unpack::<SdoInfoHeader>()?;
    match header.opcode() {
        SdoInfoOpcode::Error => Ok(DictionaryFragment::Abort(cursor.unpack::<u32>()?)),
        SdoInfoOpcode::DictionaryResponse => {
            if first {
                cursor.unpack::<u16>()?;
            }
            let indices = cursor.remain()
                .chunks_exact(2)
                .map(|index| u16::from_le_bytes([index[0], index[1]]))
                .collect();
            Ok(DictionaryFragment::Indices {indices, incomplete: header.incomplete()})
        },
        _ => Err(PackingError::InvalidValue("unexpected SDO information answer")),
    }
}

/// SDO abort code, displayed with its meaning when it is a standard one
///
/// ETG.1000.6 table 41
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SdoAbortCode(pub u32);

impl SdoAbortCode {
    pub fn message(self) -> &'static str {
        match self.0 {
            0x05_03_00_00 => "Toggle bit not changed",
            0x05_04_00_00 => "SDO protocol timeout",
            0x05_04_00_01 => "Client/Server command specifier not valid or unknown",
            0x05_04_00_05 => "Out of memory",
            0x06_01_00_00 => "Unsupported access to an object",
            0x06_02_00_00 => "The object does not exist in the object directory",
            0x06_06_00_00 => "Access failed due to a hardware error",
            0x08_00_00_00 => "General error",
            0x08_00_00_22 => "Data cannot be transferred or stored to the application because of the present device state",
            0x08_00_00_23 => "Object dictionary dynamic generation fails or no object dictionary is present",
            _ => "Unknown or vendor specific",
        }
    }
}

impl fmt::Display for SdoAbortCode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:08X} \"{}\"", self.0, self.message())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_exchange() {
        assert_eq!(dictionary_request(DictionaryList::All).unwrap(), vec![0x00, 0x80, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00]);

        let first = [0x00, 0x80, 0x82, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x10, 0x18, 0x10];
        assert_eq!(dictionary_response(&first, true).unwrap(), DictionaryFragment::Indices {
            indices: vec![0x1000, 0x1018],
            incomplete: true,
            });
        let last = [0x00, 0x80, 0x02, 0x00, 0x00, 0x00, 0x00, 0x60];
        assert_eq!(dictionary_response(&last, false).unwrap(), DictionaryFragment::Indices {
            indices: vec![0x6000],
            incomplete: false,
            });
        let abort = [0x00, 0x80, 0x07, 0x00, 0x00, 0x00, 0x23, 0x00, 0x00, 0x08];
        assert_eq!(dictionary_response(&abort, true).unwrap(), DictionaryFragment::Abort(0x0800_0023));
        assert!(dictionary_response(&[0x00, 0x30, 0x02, 0x00, 0x00, 0x00], true).is_err());
        assert_eq!(SdoAbortCode(0x0800_0023).to_string(),
            "0x08000023 \"Object dictionary dynamic generation fails or no object dictionary is present\"");
    }
}
