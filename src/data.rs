//! Traits and impls used to read/write data to/from the wire.

use core::{
	marker::PhantomData,
	fmt,
	};

/**
	trait for data types than can be packed/unpacked to/from a datagram payload
*/
pub trait PduData: Sized {
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
    fn packed_bitsize() -> usize {Self::Packed::LEN*8}
}

/** Enum to identify and raise adapted error raised by this package
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackingError {
    BadSize(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// fixed size byte buffer holding the packed version of a [PduData]
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

impl<const N: usize> PduData for [u8; N] {
	type Packed = Self;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for desired slice"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < N
            {return Err(PackingError::BadSize(src.len(), "not enough bytes for desired slice"))}
        let mut dst = [0; N];
        dst.copy_from_slice(&src[.. N]);
		Ok(dst)
	}
}

impl PduData for () {
	type Packed = [u8; 0];

	fn pack(&self, _dst: &mut [u8]) -> PackingResult<()>  {Ok(())}
	fn unpack(_src: &[u8]) -> PackingResult<Self>  {Ok(())}
}

impl PduData for bool {
	type Packed = [u8; 1];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(dst.len(), "no byte for bool"))}
        dst[0] = if *self {0b1} else {0b0};
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(src.len(), "no byte for bool"))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

/**
    macro implementing [PduData] for a given struct generated with `bilge`

    `$id` is the arbitrary integer the struct is made of and `$raw` the native integer backing it. The struct is written little endian and truncated to its bit size rounded up to bytes.
*/
macro_rules! bilge_pdudata {
    ($t: ty, $id: ty, $raw: ty) => { impl crate::data::PduData for $t {
        type Packed = [u8; (<$id>::BITS as usize + 7)/8];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            use crate::data::Storage;
            use bilge::prelude::Number;
            if dst.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(dst.len(), "bilge struct needs exact size"))}
            let raw: $raw = <$id>::from(self.clone()).value();
            dst[.. Self::Packed::LEN].copy_from_slice(&raw.to_le_bytes()[.. Self::Packed::LEN]);
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            use crate::data::Storage;
            use bilge::prelude::Number;
            if src.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(src.len(), "bilge struct needs exact size"))}
            let mut bytes = [0; core::mem::size_of::<$raw>()];
            bytes[.. Self::Packed::LEN].copy_from_slice(&src[.. Self::Packed::LEN]);
            let raw = <$id as Number>::new(<$raw>::from_le_bytes(bytes));
            Self::try_from(raw)
                .map_err(|_| crate::data::PackingError::InvalidValue("bilge struct has no valid value for these bits"))
        }
    }};
}
pub(crate) use bilge_pdudata;

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty) => { impl crate::data::PduData for $t {
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                if dst.len() < core::mem::size_of::<$t>()
                    {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for integer"))}
				dst[.. core::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
				Ok(Self::from_le_bytes(src.get(.. core::mem::size_of::<$t>())
					.and_then(|s| s.try_into().ok())
					.ok_or(crate::data::PackingError::BadSize(src.len(), "not enough bytes for integer"))?
					))
			}
		}};
}

num_pdudata!(u8);
num_pdudata!(u16);
num_pdudata!(u32);
num_pdudata!(u64);
num_pdudata!(i8);
num_pdudata!(i16);
num_pdudata!(i32);
num_pdudata!(i64);



/**
	locate some data in a slave's physical memory by its byte position and length, which must be extracted to type `T` to be processed in rust

	It acts like a getter/setter of a value in a byte sequence. One can think of it as an offset to a data location because it does not actually point the data but only its offset in the byte sequence, it also contains its length to dynamically check memory bounds.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    /// this is only here to mark that T is actually used
	extracted: PhantomData<T>,
	/// start byte index of the object
	pub byte: usize,
	/// byte length of the object
	pub len: usize,
}
impl<T: PduData> Field<T>
{
	/// build a Field from its byte offset and byte length
	pub const fn new(byte: usize, len: usize) -> Self {
		Self{extracted: PhantomData, byte, len}
	}
	/// build a Field from its byte offset, infering its length from the data nominal size
	pub const fn simple(byte: usize) -> Self {
        Self{extracted: PhantomData, byte, len: T::Packed::LEN}
	}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T> {
        let src = data.get(self.byte ..)
            .and_then(|data| data.get(.. self.len))
            .ok_or(PackingError::BadSize(data.len(), "field out of data bounds"))?;
		T::unpack(src)
	}
	/// dump the given value to the place pointed by the field in the byte array
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        let size = data.len();
        let dst = data.get_mut(self.byte ..)
            .and_then(|data| data.get_mut(.. self.len))
            .ok_or(PackingError::BadSize(size, "field out of data bounds"))?;
        value.pack(dst)
	}
}
impl<T: PduData> fmt::Debug for Field<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Field{{0x{:x}, {}}}", self.byte, self.len)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a field pointing to a type which does not implement this operation
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self   {Self::new(self.byte, self.len)}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}



/** helper to read/write sequencial data from/to a byte slice

    It is close to what [std::io::Cursor] is doing, but this struct allows reading forward without consuming the stream, and returns slices without copying the data. It is also meant to work with [PduData]

    Depending on the mutability of the slice this struct is built on, different capabilities are provided. Every access is bound checked and reports a [PackingError] instead of panicking, since it is used on frames coming from the wire.
*/
pub struct Cursor<T> {
    position: usize,
    data: T,
}
impl<T> Cursor<T> {
    /// create a new cursor starting at position zero in the given slice
    pub fn new(data: T) -> Self   {Self{position: 0, data}}
    /** current position in the read/write slice

        bytes before this position are considered read or written, and bytes after are coming for use in next read/write calls
    */
    pub fn position(&self) -> usize   {self.position}
}
impl<'a> Cursor<&'a [u8]> {
    /// read the next coming bytes with a [PduData] value, and increment the position
    pub fn unpack<T: PduData>(&mut self) -> PackingResult<T> {
        let value = T::unpack(self.read(T::Packed::LEN)?)?;
        Ok(value)
    }
    /// read the next coming `size` bytes and increment the position
    pub fn read(&mut self, size: usize) -> PackingResult<&'a [u8]> {
        let data: &'a [u8] = self.data;
        let content = data.get(self.position ..)
            .and_then(|data| data.get(.. size))
            .ok_or(PackingError::BadSize(self.remain().len(), "not enough bytes left in cursor"))?;
        self.position += size;
        Ok(content)
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[self.position ..]
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a [u8] {
        &self.data[.. self.position]
    }
}
impl<'a> Cursor<&'a mut [u8]> {
    /// write the next coming bytes with a [PduData] value, and increment the position
    pub fn pack<T: PduData>(&mut self, value: &T) -> PackingResult<()> {
        let dst = self.reserve(T::Packed::LEN)?;
        value.pack(dst)
    }
    /// write the next coming bytes with the given slice, and increment the position
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        self.reserve(value.len())?.copy_from_slice(value);
        Ok(())
    }
    /// advance the position of `size` bytes and return the skipped area for writing
    fn reserve(&mut self, size: usize) -> PackingResult<&mut [u8]> {
        let remain = self.data.len().saturating_sub(self.position);
        if remain < size
            {return Err(PackingError::BadSize(remain, "not enough bytes left in cursor"))}
        let start = self.position;
        self.position += size;
        Ok(&mut self.data[start .. self.position])
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&mut self) -> &'_ mut [u8] {
        &mut self.data[self.position ..]
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a mut [u8] {
        &mut self.data[.. self.position]
    }
}


/**
    hexadecimal display of raw bytes, 16 bytes per line

    meant for diagnostics of frames and payloads, as in `trace!("{}", HexDump(&frame))`
*/
#[derive(Copy, Clone, Debug)]
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.0.chunks(16).enumerate() {
            if i != 0 {f.write_str("\n")?}
            for (j, byte) in line.iter().enumerate() {
                if j != 0 {f.write_str(" ")?}
                write!(f, "{:02x}", byte)?;
            }
        }
        Ok(())
    }
}

/**
    hexadecimal display of the differences between two byte buffers, 16 bytes per line

    bytes of `new` differing from `old` are displayed, equal bytes are shown as `--` and bytes missing in `new` as `..`
*/
#[derive(Copy, Clone, Debug)]
pub struct HexDiff<'a> {
    pub old: &'a [u8],
    pub new: &'a [u8],
}

impl fmt::Display for HexDiff<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.old.len().max(self.new.len());
        for i in 0 .. len {
            if i != 0 {
                f.write_str(if i % 16 == 0 {"\n"} else {" "})?;
            }
            match (self.old.get(i), self.new.get(i)) {
                (Some(old), Some(new)) if old == new => f.write_str("--")?,
                (_, Some(new)) => write!(f, "{:02x}", new)?,
                (_, None) => f.write_str("..")?,
            }
        }
        Ok(())
    }
}

/// ethernet MAC address, displayed in the usual colon separated form
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// destination address of an ethernet frame, if the frame is long enough
    pub fn destination(frame: &[u8]) -> Option<Self> {
        frame.get(0 .. 6)?.try_into().ok().map(Self)
    }
    /// source address of an ethernet frame, if the frame is long enough
    pub fn source(frame: &[u8]) -> Option<Self> {
        frame.get(6 .. 12)?.try_into().ok().map(Self)
    }
    /// the null address, meaning no address has been set
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}
