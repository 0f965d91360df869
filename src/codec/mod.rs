//! C-Bus wire codec: pure encode/decode of packets, SALs and CALs, plus the
//! ASCII framing rules (hex payloads, checksum, confirmation codes, CR/CRLF
//! terminators). Nothing in this module touches I/O or global state.

pub mod application;
pub mod cal;
pub mod framing;
pub mod packet;
pub mod sal;

pub use application::Application;
pub use cal::{Cal, ExtendedReportData};
pub use framing::find_crlf;
pub use packet::{
    decode_packet, encode_packet, DecodeError, DeviceManagementPacket, InvalidPacket, Packet,
    PointToMultipointPacket, PointToPointPacket, SendOptions,
};
pub use sal::{ramp_byte_to_duration, Sal, RAMP_RATES};
