use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameError};

/// Parameter names are fixed 16-byte, NUL padded fields on the wire.
pub const PARAM_NAME_LEN: usize = 16;

const STATUS_TEXT_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageId {
    Heartbeat = 0,
    ParamRequestRead = 20,
    ParamRequestList = 21,
    ParamValue = 22,
    ParamSet = 23,
    CommandLong = 76,
    CommandAck = 77,
    CalibrationProgress = 191,
    StatusText = 253,
}

impl MessageId {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Heartbeat,
            20 => Self::ParamRequestRead,
            21 => Self::ParamRequestList,
            22 => Self::ParamValue,
            23 => Self::ParamSet,
            76 => Self::CommandLong,
            77 => Self::CommandAck,
            191 => Self::CalibrationProgress,
            253 => Self::StatusText,
            _ => return None,
        })
    }

    /// Exact payload size for this message.
    pub fn payload_len(self) -> usize {
        match self {
            Self::Heartbeat => 8,
            Self::ParamRequestRead => 2 + 2 + PARAM_NAME_LEN,
            Self::ParamRequestList => 2,
            Self::ParamValue => 4 + 2 + 2 + PARAM_NAME_LEN,
            Self::ParamSet => 2 + 4 + PARAM_NAME_LEN,
            Self::CommandLong => 2 + 2 + 1 + 7 * 4,
            Self::CommandAck => 3,
            Self::CalibrationProgress => 4,
            Self::StatusText => 1 + STATUS_TEXT_LEN,
        }
    }
}

/// Addressed system/component on the autopilot side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}

impl Default for Target {
    fn default() -> Self {
        Self { system: 1, component: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub vehicle_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
}

impl Heartbeat {
    pub const MODE_FLAG_SAFETY_ARMED: u8 = 0x80;

    pub fn is_armed(&self) -> bool {
        self.base_mode & Self::MODE_FLAG_SAFETY_ARMED != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamValue {
    pub name: String,
    pub value: f32,
    pub index: u16,
    pub count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLong {
    pub target: Target,
    pub command: u16,
    pub confirmation: u8,
    pub params: [f32; 7],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub command: u16,
    pub result: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationReport {
    pub kind: u8,
    pub percent: u8,
    pub step: u8,
    pub flags: u8,
}

impl CalibrationReport {
    pub const FLAG_COMPLETE: u8 = 0x01;
    pub const FLAG_FAILED: u8 = 0x02;
    pub const FLAG_RESTART: u8 = 0x04;

    pub fn is_complete(&self) -> bool {
        self.flags & Self::FLAG_COMPLETE != 0
    }

    pub fn is_failed(&self) -> bool {
        self.flags & Self::FLAG_FAILED != 0
    }

    pub fn is_restart(&self) -> bool {
        self.flags & Self::FLAG_RESTART != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText {
    pub severity: u8,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat(Heartbeat),
    ParamRequestList { target: Target },
    /// `index = -1` requests by name.
    ParamRequestRead { target: Target, index: i16, name: String },
    ParamValue(ParamValue),
    ParamSet { target: Target, name: String, value: f32 },
    CommandLong(CommandLong),
    CommandAck(CommandAck),
    CalibrationProgress(CalibrationReport),
    StatusText(StatusText),
    /// Valid frame with an id this crate does not model.
    Unknown(Frame),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::Heartbeat(_) => MessageId::Heartbeat,
            Message::ParamRequestList { .. } => MessageId::ParamRequestList,
            Message::ParamRequestRead { .. } => MessageId::ParamRequestRead,
            Message::ParamValue(_) => MessageId::ParamValue,
            Message::ParamSet { .. } => MessageId::ParamSet,
            Message::CommandLong(_) => MessageId::CommandLong,
            Message::CommandAck(_) => MessageId::CommandAck,
            Message::CalibrationProgress(_) => MessageId::CalibrationProgress,
            Message::StatusText(_) => MessageId::StatusText,
            Message::Unknown(_) => return None,
        })
    }

    /// Fails when a string field does not fit its fixed width.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        let mut b = BytesMut::with_capacity(64);
        let id = match self {
            Message::Unknown(frame) => return Ok(frame.clone()),
            Message::Heartbeat(hb) => {
                b.put_u32_le(hb.custom_mode);
                b.put_u8(hb.vehicle_type);
                b.put_u8(hb.autopilot);
                b.put_u8(hb.base_mode);
                b.put_u8(hb.system_status);
                MessageId::Heartbeat
            }
            Message::ParamRequestList { target } => {
                put_target(&mut b, target);
                MessageId::ParamRequestList
            }
            Message::ParamRequestRead { target, index, name } => {
                put_target(&mut b, target);
                b.put_i16_le(*index);
                put_str(&mut b, name, PARAM_NAME_LEN, MessageId::ParamRequestRead, "param_id")?;
                MessageId::ParamRequestRead
            }
            Message::ParamValue(p) => {
                b.put_f32_le(p.value);
                b.put_u16_le(p.count);
                b.put_u16_le(p.index);
                put_str(&mut b, &p.name, PARAM_NAME_LEN, MessageId::ParamValue, "param_id")?;
                MessageId::ParamValue
            }
            Message::ParamSet { target, name, value } => {
                put_target(&mut b, target);
                b.put_f32_le(*value);
                put_str(&mut b, name, PARAM_NAME_LEN, MessageId::ParamSet, "param_id")?;
                MessageId::ParamSet
            }
            Message::CommandLong(c) => {
                put_target(&mut b, &c.target);
                b.put_u16_le(c.command);
                b.put_u8(c.confirmation);
                for p in c.params {
                    b.put_f32_le(p);
                }
                MessageId::CommandLong
            }
            Message::CommandAck(a) => {
                b.put_u16_le(a.command);
                b.put_u8(a.result);
                MessageId::CommandAck
            }
            Message::CalibrationProgress(r) => {
                b.put_u8(r.kind);
                b.put_u8(r.percent);
                b.put_u8(r.step);
                b.put_u8(r.flags);
                MessageId::CalibrationProgress
            }
            Message::StatusText(s) => {
                b.put_u8(s.severity);
                put_str(&mut b, &s.text, STATUS_TEXT_LEN, MessageId::StatusText, "text")?;
                MessageId::StatusText
            }
        };
        Ok(Frame::new(id as u8, b.freeze()))
    }

    /// Wire bytes for this message.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        self.to_frame()?.encode()
    }

    /// Decode a checksum-verified frame. A known id with the wrong payload size is a
    /// [`FrameError::Length`].
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let Some(id) = MessageId::from_u8(frame.msg_id) else {
            return Ok(Message::Unknown(frame.clone()));
        };
        if frame.payload.len() != id.payload_len() {
            return Err(FrameError::Length { msg_id: frame.msg_id, len: frame.payload.len() });
        }

        let mut b = frame.payload.clone();
        let msg_id = frame.msg_id;
        Ok(match id {
            MessageId::Heartbeat => Message::Heartbeat(Heartbeat {
                custom_mode: b.get_u32_le(),
                vehicle_type: b.get_u8(),
                autopilot: b.get_u8(),
                base_mode: b.get_u8(),
                system_status: b.get_u8(),
            }),
            MessageId::ParamRequestList => Message::ParamRequestList { target: get_target(&mut b) },
            MessageId::ParamRequestRead => {
                let target = get_target(&mut b);
                let index = b.get_i16_le();
                let name = get_str(&mut b, PARAM_NAME_LEN, msg_id, "param_id")?;
                Message::ParamRequestRead { target, index, name }
            }
            MessageId::ParamValue => {
                let value = b.get_f32_le();
                let count = b.get_u16_le();
                let index = b.get_u16_le();
                let name = get_str(&mut b, PARAM_NAME_LEN, msg_id, "param_id")?;
                if name.is_empty() {
                    return Err(FrameError::Malformed { msg_id, field: "param_id" });
                }
                Message::ParamValue(ParamValue { name, value, index, count })
            }
            MessageId::ParamSet => {
                let target = get_target(&mut b);
                let value = b.get_f32_le();
                let name = get_str(&mut b, PARAM_NAME_LEN, msg_id, "param_id")?;
                Message::ParamSet { target, name, value }
            }
            MessageId::CommandLong => {
                let target = get_target(&mut b);
                let command = b.get_u16_le();
                let confirmation = b.get_u8();
                let mut params = [0.0f32; 7];
                for p in params.iter_mut() {
                    *p = b.get_f32_le();
                }
                Message::CommandLong(CommandLong { target, command, confirmation, params })
            }
            MessageId::CommandAck => Message::CommandAck(CommandAck {
                command: b.get_u16_le(),
                result: b.get_u8(),
            }),
            MessageId::CalibrationProgress => Message::CalibrationProgress(CalibrationReport {
                kind: b.get_u8(),
                percent: b.get_u8(),
                step: b.get_u8(),
                flags: b.get_u8(),
            }),
            MessageId::StatusText => {
                let severity = b.get_u8();
                let text = get_str(&mut b, STATUS_TEXT_LEN, msg_id, "text")?;
                Message::StatusText(StatusText { severity, text })
            }
        })
    }
}

fn put_target(b: &mut BytesMut, t: &Target) {
    b.put_u8(t.system);
    b.put_u8(t.component);
}

fn get_target(b: &mut impl Buf) -> Target {
    Target { system: b.get_u8(), component: b.get_u8() }
}

// Pads with NUL up to `width`. A value filling the whole field carries no terminator.
fn put_str(b: &mut BytesMut, s: &str, width: usize, id: MessageId, field: &'static str) -> Result<(), FrameError> {
    let raw = s.as_bytes();
    if raw.len() > width {
        return Err(FrameError::FieldTooLong { msg_id: id as u8, field, len: raw.len(), max: width });
    }
    b.put_slice(raw);
    b.put_bytes(0, width - raw.len());
    Ok(())
}

fn get_str(b: &mut impl Buf, width: usize, msg_id: u8, field: &'static str) -> Result<String, FrameError> {
    let mut raw = vec![0u8; width];
    b.copy_to_slice(&mut raw);
    let end = raw.iter().position(|c| *c == 0).unwrap_or(width);
    raw.truncate(end);
    String::from_utf8(raw).map_err(|_| FrameError::Malformed { msg_id, field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_layout() {
        let msg = Message::ParamValue(ParamValue {
            name: "BATT_LOW_VOLT".into(),
            value: 10.5,
            index: 3,
            count: 400,
        });
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.msg_id, 22);
        assert_eq!(frame.payload.len(), 24);
        assert_eq!(&frame.payload[0..4], &10.5f32.to_le_bytes());
        assert_eq!(&frame.payload[4..6], &400u16.to_le_bytes());
        assert_eq!(&frame.payload[8..21], b"BATT_LOW_VOLT");
        assert!(frame.payload[21..].iter().all(|b| *b == 0));
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_long_name_rejected_on_encode() {
        let msg = Message::ParamSet {
            target: Target::default(),
            name: "A_VERY_LONG_PARAMETER_NAME".into(),
            value: 1.0,
        };
        assert_eq!(
            msg.encode(),
            Err(FrameError::FieldTooLong { msg_id: 23, field: "param_id", len: 26, max: PARAM_NAME_LEN })
        );

        // Exactly 16 bytes fills the field without a terminator.
        let msg = Message::ParamSet { target: Target::default(), name: "SIXTEEN_CHARS_AB".into(), value: 1.0 };
        assert_eq!(Message::from_frame(&msg.to_frame().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_wrong_payload_length_is_frame_error() {
        let frame = Frame::new(MessageId::CommandAck as u8, vec![0u8; 5]);
        assert_eq!(
            Message::from_frame(&frame),
            Err(FrameError::Length { msg_id: 77, len: 5 })
        );
    }

    #[test]
    fn test_empty_param_name_rejected() {
        let mut payload = vec![0u8; MessageId::ParamValue.payload_len()];
        payload[0..4].copy_from_slice(&1.0f32.to_le_bytes());
        let frame = Frame::new(MessageId::ParamValue as u8, payload);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(FrameError::Malformed { field: "param_id", .. })
        ));
    }

    #[test]
    fn test_unknown_id_passes_through() {
        let frame = Frame::new(150, vec![1u8, 2, 3]);
        let msg = Message::from_frame(&frame).unwrap();
        assert_eq!(msg.id(), None);
        assert_eq!(msg.to_frame().unwrap(), frame);
    }

    #[test]
    fn test_command_long_params_order() {
        let mut params = [0.0f32; 7];
        params[0] = 1.0;
        params[1] = 21196.0;
        let msg = Message::CommandLong(CommandLong {
            target: Target { system: 1, component: 1 },
            command: 400,
            confirmation: 0,
            params,
        });
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.payload.len(), 33);
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_heartbeat_armed_flag() {
        let hb = Heartbeat { base_mode: 0x80 | 0x01, ..Default::default() };
        assert!(hb.is_armed());
        assert!(!Heartbeat::default().is_armed());
    }
}
