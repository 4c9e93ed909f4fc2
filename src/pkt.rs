//! Binary data packet utilities.
//!
//! A packet is a fixed-size record with a declared binary layout. Packet types
//! are declared with the [`packetclass!`](crate::packetclass) macro, which takes
//! an ordered field list and a [`Layout`] and emits a struct with `pack`,
//! `unpack`, a compile-time size and the header-check logic for fields that
//! carry an expected constant (typically a packet header magic). The
//! `pack`/`unpack` pair is designed to round-trip, so that the binary stream
//! written during a run can be read back packet by packet with [`PacketFile`].

use std::error;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::info;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Format characters describing the primitive field types, mirroring the
/// classic `struct` alphabet (`x c b B ? h H i I l L q Q f d s p P`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// `x`: pad byte.
    Pad,
    /// `c`: single character.
    Char,
    /// `b`: signed 8-bit integer.
    SignedChar,
    /// `B`: unsigned 8-bit integer.
    UnsignedChar,
    /// `?`: boolean.
    Bool,
    /// `h`: signed 16-bit integer.
    Short,
    /// `H`: unsigned 16-bit integer.
    UnsignedShort,
    /// `i`: signed 32-bit integer.
    Int,
    /// `I`: unsigned 32-bit integer.
    UnsignedInt,
    /// `l`: signed 32-bit integer (C long in standard size).
    Long,
    /// `L`: unsigned 32-bit integer (C unsigned long in standard size).
    UnsignedLong,
    /// `q`: signed 64-bit integer.
    LongLong,
    /// `Q`: unsigned 64-bit integer.
    UnsignedLongLong,
    /// `f`: 32-bit float.
    Float,
    /// `d`: 64-bit float.
    Double,
    /// `s`: byte string.
    CharArray,
    /// `p`: length-prefixed byte string.
    PascalString,
    /// `P`: pointer-sized integer.
    Pointer,
}

/// The full format alphabet, in the conventional order.
pub const FORMAT_CODES: &[char] = &[
    'x', 'c', 'b', 'B', '?', 'h', 'H', 'i', 'I', 'l', 'L', 'q', 'Q', 'f', 'd', 's', 'p', 'P',
];

impl Format {
    /// Return the format character for this format.
    pub const fn code(self) -> char {
        match self {
            Format::Pad => 'x',
            Format::Char => 'c',
            Format::SignedChar => 'b',
            Format::UnsignedChar => 'B',
            Format::Bool => '?',
            Format::Short => 'h',
            Format::UnsignedShort => 'H',
            Format::Int => 'i',
            Format::UnsignedInt => 'I',
            Format::Long => 'l',
            Format::UnsignedLong => 'L',
            Format::LongLong => 'q',
            Format::UnsignedLongLong => 'Q',
            Format::Float => 'f',
            Format::Double => 'd',
            Format::CharArray => 's',
            Format::PascalString => 'p',
            Format::Pointer => 'P',
        }
    }

    /// Parse a format character, failing on anything outside the alphabet.
    pub fn from_code(code: char) -> Result<Self, PacketError> {
        match code {
            'x' => Ok(Format::Pad),
            'c' => Ok(Format::Char),
            'b' => Ok(Format::SignedChar),
            'B' => Ok(Format::UnsignedChar),
            '?' => Ok(Format::Bool),
            'h' => Ok(Format::Short),
            'H' => Ok(Format::UnsignedShort),
            'i' => Ok(Format::Int),
            'I' => Ok(Format::UnsignedInt),
            'l' => Ok(Format::Long),
            'L' => Ok(Format::UnsignedLong),
            'q' => Ok(Format::LongLong),
            'Q' => Ok(Format::UnsignedLongLong),
            'f' => Ok(Format::Float),
            'd' => Ok(Format::Double),
            's' => Ok(Format::CharArray),
            'p' => Ok(Format::PascalString),
            'P' => Ok(Format::Pointer),
            _ => Err(PacketError::Format(code)),
        }
    }

    /// Size of a single value of this format, in bytes.
    pub const fn size(self) -> usize {
        match self {
            Format::Pad
            | Format::Char
            | Format::SignedChar
            | Format::UnsignedChar
            | Format::Bool
            | Format::CharArray
            | Format::PascalString => 1,
            Format::Short | Format::UnsignedShort => 2,
            Format::Int | Format::UnsignedInt | Format::Long | Format::UnsignedLong => 4,
            Format::LongLong | Format::UnsignedLongLong => 8,
            Format::Float => 4,
            Format::Double => 8,
            Format::Pointer => size_of::<usize>(),
        }
    }

    /// Natural alignment of this format, used by the native-aligned layout.
    pub const fn alignment(self) -> usize {
        self.size()
    }
}

/// Byte-order/alignment modes, mirroring the `struct` layout characters
/// (`@ = < > !`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// `@`: host byte order, fields aligned to their natural alignment.
    NativeAligned,
    /// `=`: host byte order, no padding.
    NativePacked,
    /// `<`: little-endian, no padding.
    LittleEndian,
    /// `>`: big-endian, no padding.
    BigEndian,
    /// `!`: network byte order (big-endian), no padding.
    Network,
}

/// The full layout alphabet.
pub const LAYOUT_CODES: &[char] = &['@', '=', '<', '>', '!'];

impl Layout {
    /// Return the layout character for this layout.
    pub const fn code(self) -> char {
        match self {
            Layout::NativeAligned => '@',
            Layout::NativePacked => '=',
            Layout::LittleEndian => '<',
            Layout::BigEndian => '>',
            Layout::Network => '!',
        }
    }

    /// Parse a layout character, failing on anything outside the alphabet.
    pub fn from_code(code: char) -> Result<Self, PacketError> {
        match code {
            '@' => Ok(Layout::NativeAligned),
            '=' => Ok(Layout::NativePacked),
            '<' => Ok(Layout::LittleEndian),
            '>' => Ok(Layout::BigEndian),
            '!' => Ok(Layout::Network),
            _ => Err(PacketError::Layout(code)),
        }
    }

    /// True if fields are aligned to their natural alignment.
    pub const fn aligned(self) -> bool {
        matches!(self, Layout::NativeAligned)
    }

    /// True if multi-byte values are encoded most-significant byte first.
    pub const fn big_endian(self) -> bool {
        match self {
            Layout::BigEndian | Layout::Network => true,
            Layout::LittleEndian => false,
            Layout::NativeAligned | Layout::NativePacked => cfg!(target_endian = "big"),
        }
    }
}

/// A single field value, tagged with its primitive type. This is what packet
/// iteration yields, since the fields of a packet are heterogeneous.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Boolean field.
    Bool(bool),
    /// Signed 8-bit field.
    I8(i8),
    /// Unsigned 8-bit field.
    U8(u8),
    /// Signed 16-bit field.
    I16(i16),
    /// Unsigned 16-bit field.
    U16(u16),
    /// Signed 32-bit field.
    I32(i32),
    /// Unsigned 32-bit field.
    U32(u32),
    /// Signed 64-bit field.
    I64(i64),
    /// Unsigned 64-bit field.
    U64(u64),
    /// 32-bit float field.
    F32(f32),
    /// 64-bit float field.
    F64(f64),
}

impl FieldValue {
    // Integer values are rendered in hex in mismatch messages, since expected
    // constants are almost always header magics.
    fn hex_string(&self) -> String {
        match self {
            FieldValue::Bool(value) => value.to_string(),
            FieldValue::I8(value) => format!("{value:#x}"),
            FieldValue::U8(value) => format!("{value:#x}"),
            FieldValue::I16(value) => format!("{value:#x}"),
            FieldValue::U16(value) => format!("{value:#x}"),
            FieldValue::I32(value) => format!("{value:#x}"),
            FieldValue::U32(value) => format!("{value:#x}"),
            FieldValue::I64(value) => format!("{value:#x}"),
            FieldValue::U64(value) => format!("{value:#x}"),
            FieldValue::F32(value) => value.to_string(),
            FieldValue::F64(value) => value.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(value) => write!(f, "{value}"),
            FieldValue::I8(value) => write!(f, "{value}"),
            FieldValue::U8(value) => write!(f, "{value}"),
            FieldValue::I16(value) => write!(f, "{value}"),
            FieldValue::U16(value) => write!(f, "{value}"),
            FieldValue::I32(value) => write!(f, "{value}"),
            FieldValue::U32(value) => write!(f, "{value}"),
            FieldValue::I64(value) => write!(f, "{value}"),
            FieldValue::U64(value) => write!(f, "{value}"),
            FieldValue::F32(value) => write!(f, "{value}"),
            FieldValue::F64(value) => write!(f, "{value}"),
        }
    }
}

/// Error that may occur while declaring, packing or unpacking a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketError {
    /// Unrecognized layout character.
    Layout(char),
    /// Unrecognized format character.
    Format(char),
    /// A field carrying an expected constant did not match the decoded value.
    FieldMismatch {
        /// Name of the packet type.
        packet: &'static str,
        /// Name of the offending field.
        field: &'static str,
        /// The declared constant.
        expected: FieldValue,
        /// The value actually found.
        actual: FieldValue,
    },
    /// The input byte string does not match the packet fixed size.
    SizeMismatch {
        /// Name of the packet type.
        packet: &'static str,
        /// The packet fixed size.
        expected: usize,
        /// The input length.
        actual: usize,
    },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Layout(code) => write!(
                f,
                "unsupported layout character {code:?}; valid layout characters are {LAYOUT_CODES:?}"
            ),
            PacketError::Format(code) => write!(
                f,
                "unsupported format character {code:?}; valid format characters are {FORMAT_CODES:?}"
            ),
            PacketError::FieldMismatch {
                packet,
                field,
                expected,
                actual,
            } => write!(
                f,
                "{} mismatch for field \"{}\" (expected {}, found {})",
                packet,
                field,
                expected.hex_string(),
                actual.hex_string()
            ),
            PacketError::SizeMismatch {
                packet,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch for {packet} ({actual} byte(s), expected {expected})"
            ),
        }
    }
}

impl error::Error for PacketError {}

/// Encoding and decoding of a single primitive field under a given [`Layout`].
///
/// This is the bridge between the Rust field types accepted by
/// [`packetclass!`](crate::packetclass) and the format alphabet.
pub trait FieldCodec: Copy + PartialEq {
    /// The format describing this type in a packet layout.
    const FORMAT: Format;

    /// Append the encoded value to `out`.
    fn encode(self, layout: Layout, out: &mut Vec<u8>);

    /// Decode a value from exactly `FORMAT.size()` bytes.
    fn decode(layout: Layout, bytes: &[u8]) -> Self;

    /// Wrap the value into a [`FieldValue`].
    fn field_value(self) -> FieldValue;
}

macro_rules! numeric_field_codec {
    ($ty:ty, $format:expr, $variant:ident) => {
        impl FieldCodec for $ty {
            const FORMAT: Format = $format;

            fn encode(self, layout: Layout, out: &mut Vec<u8>) {
                if layout.big_endian() {
                    out.extend_from_slice(&self.to_be_bytes());
                } else {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }

            fn decode(layout: Layout, bytes: &[u8]) -> Self {
                let mut raw = [0u8; size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                if layout.big_endian() {
                    <$ty>::from_be_bytes(raw)
                } else {
                    <$ty>::from_le_bytes(raw)
                }
            }

            fn field_value(self) -> FieldValue {
                FieldValue::$variant(self)
            }
        }
    };
}

numeric_field_codec!(i8, Format::SignedChar, I8);
numeric_field_codec!(u8, Format::UnsignedChar, U8);
numeric_field_codec!(i16, Format::Short, I16);
numeric_field_codec!(u16, Format::UnsignedShort, U16);
numeric_field_codec!(i32, Format::Long, I32);
numeric_field_codec!(u32, Format::UnsignedLong, U32);
numeric_field_codec!(i64, Format::LongLong, I64);
numeric_field_codec!(u64, Format::UnsignedLongLong, U64);
numeric_field_codec!(f32, Format::Float, F32);
numeric_field_codec!(f64, Format::Double, F64);

impl FieldCodec for bool {
    const FORMAT: Format = Format::Bool;

    fn encode(self, _layout: Layout, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn decode(_layout: Layout, bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn field_value(self) -> FieldValue {
        FieldValue::Bool(self)
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Compute the fixed size of a packet with the given layout and field formats.
///
/// Under [`Layout::NativeAligned`] padding is inserted between successive
/// fields so that every field sits at its natural alignment; no padding is
/// added at the beginning or the end. All other layouts are packed.
pub const fn packet_size(layout: Layout, formats: &[Format]) -> usize {
    let mut size = 0;
    let mut index = 0;
    while index < formats.len() {
        let format = formats[index];
        if layout.aligned() {
            size = align_up(size, format.alignment());
        }
        size += format.size();
        index += 1;
    }
    size
}

/// Decode the next field from `data`, honoring the layout alignment rules and
/// advancing `offset` past the field. Used by the generated `unpack` code.
pub fn read_field<T: FieldCodec>(layout: Layout, data: &[u8], offset: &mut usize) -> T {
    if layout.aligned() {
        *offset = align_up(*offset, T::FORMAT.alignment());
    }
    let size = T::FORMAT.size();
    let value = T::decode(layout, &data[*offset..*offset + size]);
    *offset += size;
    value
}

/// Encode a field at the tail of `out`, honoring the layout alignment rules.
/// Used by the generated `pack` code.
pub fn write_field<T: FieldCodec>(layout: Layout, value: T, out: &mut Vec<u8>) {
    if layout.aligned() {
        let aligned = align_up(out.len(), T::FORMAT.alignment());
        out.resize(aligned, 0);
    }
    value.encode(layout, out);
}

/// A fixed-size binary packet.
///
/// Implementations come from the [`packetclass!`](crate::packetclass) macro;
/// the trait only captures what the rest of the framework needs: the fixed
/// size, the pack/unpack pair and access to the raw payload cached at
/// construction.
pub trait Packet: Clone + Sized {
    /// The packet layout.
    const LAYOUT: Layout;
    /// The packet fixed size, in bytes.
    const SIZE: usize;

    /// Serialize every field in declaration order. The output length is
    /// exactly [`Self::SIZE`].
    fn pack(&self) -> Vec<u8>;

    /// Inverse of [`pack`](Self::pack), verifying any expected constants.
    fn unpack(data: &[u8]) -> Result<Self, PacketError>;

    /// The raw byte representation cached at construction.
    fn payload(&self) -> &[u8];

    /// Field names and values in declaration order.
    fn field_values(&self) -> Vec<(&'static str, FieldValue)>;
}

/// Declare a fixed-size packet type.
///
/// The macro takes a layout and an ordered field list, where every field type
/// must implement [`FieldCodec`](crate::pkt::FieldCodec), and emits the struct
/// (the declared fields plus the cached payload) along with an implementation
/// of [`Packet`](crate::pkt::Packet). A field may carry an expected constant
/// after `=`, verified at construction and at unpack time. Derived quantities
/// (e.g. a timestamp in seconds computed from a raw counter) belong in
/// inherent methods next to the declaration, so that round-trips reproduce
/// them exactly.
///
/// ```
/// use baldaquin::pkt::{Layout, Packet};
///
/// baldaquin::packetclass! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Readout {
///         layout: Layout::BigEndian;
///         header: u8 = 0xAA,
///         milliseconds: u32,
///         adc_value: u16,
///     }
/// }
///
/// let readout = Readout::new(0xAA, 1000, 127).unwrap();
/// assert_eq!(Readout::SIZE, 7);
/// assert_eq!(readout.pack(), vec![0xAA, 0x00, 0x00, 0x03, 0xE8, 0x00, 0x7F]);
/// assert_eq!(Readout::unpack(&readout.pack()).unwrap(), readout);
/// ```
#[macro_export]
macro_rules! packetclass {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            layout: $layout:expr;
            $($fname:ident : $fty:ty $(= $expected:expr)?),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                #[allow(missing_docs)]
                pub $fname: $fty,
            )+
            payload: ::std::vec::Vec<u8>,
        }

        impl $name {
            /// Create a packet from its field values, verifying any expected
            /// constants and caching the payload.
            $vis fn new($($fname: $fty),+) -> ::std::result::Result<Self, $crate::pkt::PacketError> {
                $($(
                    if $fname != $expected {
                        return ::std::result::Result::Err($crate::pkt::PacketError::FieldMismatch {
                            packet: stringify!($name),
                            field: stringify!($fname),
                            expected: <$fty as $crate::pkt::FieldCodec>::field_value($expected),
                            actual: <$fty as $crate::pkt::FieldCodec>::field_value($fname),
                        });
                    }
                )?)+
                let mut packet = Self {
                    $($fname,)+
                    payload: ::std::vec::Vec::new(),
                };
                packet.payload = packet.encode_fields();
                ::std::result::Result::Ok(packet)
            }

            fn encode_fields(&self) -> ::std::vec::Vec<u8> {
                let mut out = ::std::vec::Vec::with_capacity(<Self as $crate::pkt::Packet>::SIZE);
                $($crate::pkt::write_field(<Self as $crate::pkt::Packet>::LAYOUT, self.$fname, &mut out);)+
                out
            }

            /// The struct-style format string of this packet type (layout
            /// character followed by one format character per field).
            $vis fn format_string() -> ::std::string::String {
                let mut out = ::std::string::String::new();
                out.push(<Self as $crate::pkt::Packet>::LAYOUT.code());
                $(out.push(<$fty as $crate::pkt::FieldCodec>::FORMAT.code());)+
                out
            }
        }

        impl $crate::pkt::Packet for $name {
            const LAYOUT: $crate::pkt::Layout = $layout;
            const SIZE: usize = $crate::pkt::packet_size(
                $layout,
                &[$(<$fty as $crate::pkt::FieldCodec>::FORMAT),+],
            );

            fn pack(&self) -> ::std::vec::Vec<u8> {
                self.encode_fields()
            }

            fn unpack(data: &[u8]) -> ::std::result::Result<Self, $crate::pkt::PacketError> {
                if data.len() != Self::SIZE {
                    return ::std::result::Result::Err($crate::pkt::PacketError::SizeMismatch {
                        packet: stringify!($name),
                        expected: Self::SIZE,
                        actual: data.len(),
                    });
                }
                let mut offset = 0usize;
                $(let $fname: $fty = $crate::pkt::read_field(Self::LAYOUT, data, &mut offset);)+
                $($(
                    if $fname != $expected {
                        return ::std::result::Result::Err($crate::pkt::PacketError::FieldMismatch {
                            packet: stringify!($name),
                            field: stringify!($fname),
                            expected: <$fty as $crate::pkt::FieldCodec>::field_value($expected),
                            actual: <$fty as $crate::pkt::FieldCodec>::field_value($fname),
                        });
                    }
                )?)+
                ::std::result::Result::Ok(Self {
                    $($fname,)+
                    payload: data.to_vec(),
                })
            }

            fn payload(&self) -> &[u8] {
                &self.payload
            }

            fn field_values(&self) -> ::std::vec::Vec<(&'static str, $crate::pkt::FieldValue)> {
                ::std::vec![
                    $((stringify!($fname), $crate::pkt::FieldCodec::field_value(self.$fname))),+
                ]
            }
        }
    };
}

/// Error that may occur while reading packets back from a file.
#[derive(Debug)]
pub enum PacketFileError {
    /// Underlying I/O failure.
    Io(io::Error),
    /// A record failed to unpack.
    Decode(PacketError),
    /// The file ends in the middle of a record.
    TruncatedFile {
        /// The packet fixed size.
        expected: usize,
        /// The number of bytes actually left.
        actual: usize,
    },
}

impl fmt::Display for PacketFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketFileError::Io(err) => write!(f, "I/O error while reading packets: {err}"),
            PacketFileError::Decode(err) => write!(f, "{err}"),
            PacketFileError::TruncatedFile { expected, actual } => write!(
                f,
                "truncated packet at end of file ({actual} byte(s), expected {expected})"
            ),
        }
    }
}

impl error::Error for PacketFileError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            PacketFileError::Io(err) => Some(err),
            PacketFileError::Decode(err) => Some(err),
            PacketFileError::TruncatedFile { .. } => None,
        }
    }
}

impl From<io::Error> for PacketFileError {
    fn from(err: io::Error) -> Self {
        PacketFileError::Io(err)
    }
}

impl From<PacketError> for PacketFileError {
    fn from(err: PacketError) -> Self {
        PacketFileError::Decode(err)
    }
}

/// An iterable, append-only container of packets of a single type, as written
/// by the canonical binary sink: a contiguous sequence of records with no
/// file-level framing.
#[derive(Debug)]
pub struct PacketFile<P: Packet> {
    path: PathBuf,
    reader: BufReader<File>,
    _packet: PhantomData<P>,
}

impl<P: Packet> PacketFile<P> {
    /// Open a packet file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            _packet: PhantomData,
        })
    }

    /// The path to the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain the iterator into an in-memory sequence.
    pub fn read_all(self) -> Result<Vec<P>, PacketFileError> {
        self.collect()
    }
}

impl<P: Packet> Iterator for PacketFile<P> {
    type Item = Result<P, PacketFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut data = vec![0u8; P::SIZE];
        let mut offset = 0;
        while offset < data.len() {
            match self.reader.read(&mut data[offset..]) {
                Ok(0) => break,
                Ok(count) => offset += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
        match offset {
            0 => None,
            count if count < P::SIZE => Some(Err(PacketFileError::TruncatedFile {
                expected: P::SIZE,
                actual: count,
            })),
            _ => Some(P::unpack(&data).map_err(PacketFileError::from)),
        }
    }
}

/// Bookkeeping counters shared between the acquisition thread (packets
/// processed) and the flush path (packets and bytes written).
#[derive(Debug, Default)]
pub struct PacketStatistics {
    packets_processed: AtomicUsize,
    packets_written: AtomicUsize,
    bytes_written: AtomicU64,
}

impl PacketStatistics {
    /// Create a zeroed statistics record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all the counters.
    pub fn reset(&self) {
        self.packets_processed.store(0, Ordering::Release);
        self.packets_written.store(0, Ordering::Release);
        self.bytes_written.store(0, Ordering::Release);
    }

    /// Update the counters.
    pub fn update(&self, packets_processed: usize, packets_written: usize, bytes_written: u64) {
        self.packets_processed
            .fetch_add(packets_processed, Ordering::AcqRel);
        self.packets_written
            .fetch_add(packets_written, Ordering::AcqRel);
        self.bytes_written.fetch_add(bytes_written, Ordering::AcqRel);
    }

    /// Take a plain-value snapshot of the counters.
    pub fn snapshot(&self) -> PacketStatisticsSnapshot {
        PacketStatisticsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Acquire),
            packets_written: self.packets_written.load(Ordering::Acquire),
            bytes_written: self.bytes_written.load(Ordering::Acquire),
        }
    }
}

/// A plain-value copy of [`PacketStatistics`], suitable for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PacketStatisticsSnapshot {
    /// Packets handled by the acquisition loop.
    pub packets_processed: usize,
    /// Packets drained to the attached sinks.
    pub packets_written: usize,
    /// Bytes written across all the attached sinks.
    pub bytes_written: u64,
}

impl fmt::Display for PacketStatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packet(s) processed, {} packet(s) written, {} byte(s) written",
            self.packets_processed, self.packets_written, self.bytes_written
        )
    }
}

/// Log a one-line summary of a packet for debugging purposes.
pub fn log_packet<P: Packet>(packet: &P) {
    let fields: Vec<String> = packet
        .field_values()
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    info!("{}", fields.join(", "));
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    packetclass! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Readout {
            layout: Layout::BigEndian;
            header: u8 = 0xAA,
            milliseconds: u32,
            adc_value: u16,
        }
    }

    impl Readout {
        fn seconds(&self) -> f64 {
            1.0e-3 * f64::from(self.milliseconds)
        }
    }

    packetclass! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct AlignedPair {
            layout: Layout::NativeAligned;
            flag: u8,
            count: u32,
        }
    }

    packetclass! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct PackedPair {
            layout: Layout::NativePacked;
            count: u32,
            flag: u8,
        }
    }

    #[test]
    fn format_codes_round_trip() {
        for &code in FORMAT_CODES {
            assert_eq!(Format::from_code(code).unwrap().code(), code);
        }
        assert_eq!(Format::from_code('z'), Err(PacketError::Format('z')));
    }

    #[test]
    fn layout_codes_round_trip() {
        for &code in LAYOUT_CODES {
            assert_eq!(Layout::from_code(code).unwrap().code(), code);
        }
        assert_eq!(Layout::from_code('#'), Err(PacketError::Layout('#')));
    }

    #[test]
    fn packet_sizes() {
        // Big-endian layouts are packed: 1 + 4 + 2 bytes.
        assert_eq!(Readout::SIZE, 7);
        // Native alignment pads the u32 to a 4-byte boundary.
        assert_eq!(AlignedPair::SIZE, 8);
        // Trailing bytes are never padded.
        assert_eq!(PackedPair::SIZE, 5);
    }

    #[test]
    fn size_law() {
        let readout = Readout::new(0xAA, 1000, 127).unwrap();
        assert_eq!(readout.pack().len(), Readout::SIZE);
        let pair = AlignedPair::new(1, 2).unwrap();
        assert_eq!(pair.pack().len(), AlignedPair::SIZE);
    }

    #[test]
    fn pack_seven_byte_big_endian() {
        let readout = Readout::new(0xAA, 1000, 127).unwrap();
        assert_eq!(readout.pack(), vec![0xAA, 0x00, 0x00, 0x03, 0xE8, 0x00, 0x7F]);
        assert_eq!(readout.payload(), readout.pack().as_slice());
    }

    #[test]
    fn round_trip() {
        let readout = Readout::new(0xAA, 1000, 127).unwrap();
        let twin = Readout::unpack(&readout.pack()).unwrap();
        assert_eq!(twin, readout);
        assert_eq!(twin.seconds(), 1.0);
    }

    #[test]
    fn header_mismatch() {
        let mut data = Readout::new(0xAA, 1000, 127).unwrap().pack();
        data[0] = 0xAB;
        let err = Readout::unpack(&data).unwrap_err();
        assert_eq!(
            err,
            PacketError::FieldMismatch {
                packet: "Readout",
                field: "header",
                expected: FieldValue::U8(0xAA),
                actual: FieldValue::U8(0xAB),
            }
        );
        // The input bytes are left alone.
        assert_eq!(data[0], 0xAB);
    }

    #[test]
    fn constructor_checks_expected_constants() {
        let err = Readout::new(0xAB, 0, 0).unwrap_err();
        assert!(matches!(err, PacketError::FieldMismatch { field: "header", .. }));
    }

    #[test]
    fn size_mismatch() {
        let err = Readout::unpack(&[0xAA, 0x00]).unwrap_err();
        assert_eq!(
            err,
            PacketError::SizeMismatch {
                packet: "Readout",
                expected: 7,
                actual: 2,
            }
        );
    }

    #[test]
    fn field_values_in_declaration_order() {
        let readout = Readout::new(0xAA, 1000, 127).unwrap();
        assert_eq!(
            readout.field_values(),
            vec![
                ("header", FieldValue::U8(0xAA)),
                ("milliseconds", FieldValue::U32(1000)),
                ("adc_value", FieldValue::U16(127)),
            ]
        );
    }

    #[test]
    fn format_string() {
        assert_eq!(Readout::format_string(), ">BLH");
        assert_eq!(AlignedPair::format_string(), "@BL");
    }

    #[test]
    fn file_round_trip() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("readout.dat");
        let packets: Vec<Readout> = (0..5)
            .map(|index| Readout::new(0xAA, 100 * index, index as u16).unwrap())
            .collect();
        let mut file = File::create(&path).unwrap();
        for packet in &packets {
            file.write_all(packet.payload()).unwrap();
        }
        drop(file);
        let twins = PacketFile::<Readout>::open(&path).unwrap().read_all().unwrap();
        assert_eq!(twins, packets);
    }

    #[test]
    fn truncated_file() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("readout.dat");
        let packet = Readout::new(0xAA, 1000, 127).unwrap();
        let mut file = File::create(&path).unwrap();
        file.write_all(packet.payload()).unwrap();
        file.write_all(&packet.payload()[..3]).unwrap();
        drop(file);
        let mut packets = PacketFile::<Readout>::open(&path).unwrap();
        assert!(packets.next().unwrap().is_ok());
        assert!(matches!(
            packets.next().unwrap().unwrap_err(),
            PacketFileError::TruncatedFile {
                expected: 7,
                actual: 3,
            }
        ));
    }

    #[test]
    fn empty_file() {
        let folder = tempfile::tempdir().unwrap();
        let path = folder.path().join("empty.dat");
        File::create(&path).unwrap();
        let packets = PacketFile::<Readout>::open(&path).unwrap().read_all().unwrap();
        assert!(packets.is_empty());
    }

    #[test]
    fn statistics() {
        let statistics = PacketStatistics::new();
        statistics.update(1, 0, 0);
        statistics.update(0, 3, 21);
        let snapshot = statistics.snapshot();
        assert_eq!(snapshot.packets_processed, 1);
        assert_eq!(snapshot.packets_written, 3);
        assert_eq!(snapshot.bytes_written, 21);
        statistics.reset();
        assert_eq!(statistics.snapshot(), PacketStatisticsSnapshot::default());
    }
}
