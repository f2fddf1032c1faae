//! Wire format shared by the ground station and the autopilot.
//!
//! A frame is `[sync][len][msg_id][payload][crc16]`; [`frame`] handles delimiting and
//! checksums, [`message`] maps payloads to typed messages.

pub mod frame;
pub mod message;

pub use frame::{crc16, DecoderStats, Frame, FrameDecoder, FrameError, MAX_PAYLOAD, SYNC};
pub use message::{
    CalibrationReport, CommandAck, CommandLong, Heartbeat, Message, MessageId, ParamValue,
    StatusText, Target, PARAM_NAME_LEN,
};
