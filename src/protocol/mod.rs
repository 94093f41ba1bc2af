//! Wire protocol shared by client and server.

mod frame;
mod packet;

pub use frame::{read_frame, write_frame};
pub use packet::{
    AuthToken, CorrelationId, Credentials, FrameOrigin, Packet, PacketType, AUTH_TOKEN_LEN,
    BASE_HEADER_LEN, CORRELATION_ID_LEN, LENGTH_PREFIX_LEN, MAX_HEADER_LEN,
};
