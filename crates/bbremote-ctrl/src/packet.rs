use bytes::{Buf, BufMut, Bytes, BytesMut};
use ratp_conn::Route;

use crate::error::{CtrlError, Result};
use crate::fs::{FsReply, FsRequest};

/// Packet header: type (2) + flags (2).
pub const HEADER_SIZE: usize = 4;

/// Set on a request that expects a reply, and echoed on that reply.
pub const FLAG_EXCHANGE: u16 = 0x0001;

/// Packet type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Command = 1,
    CommandReturn = 2,
    ConsoleMsg = 3,
    Ping = 4,
    Pong = 5,
    Getenv = 6,
    GetenvReturn = 7,
    Fs = 8,
    FsReturn = 9,
    Md = 10,
    MdReturn = 11,
    Mw = 12,
    MwReturn = 13,
    Reset = 14,
    I2cRead = 15,
    I2cReadReturn = 16,
    I2cWrite = 17,
    I2cWriteReturn = 18,
    GpioGetValue = 19,
    GpioGetValueReturn = 20,
    GpioSetValue = 21,
    GpioSetValueReturn = 22,
    GpioSetDirection = 23,
    GpioSetDirectionReturn = 24,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Option<Self> {
        use PacketType::*;
        let ty = match value {
            1 => Command,
            2 => CommandReturn,
            3 => ConsoleMsg,
            4 => Ping,
            5 => Pong,
            6 => Getenv,
            7 => GetenvReturn,
            8 => Fs,
            9 => FsReturn,
            10 => Md,
            11 => MdReturn,
            12 => Mw,
            13 => MwReturn,
            14 => Reset,
            15 => I2cRead,
            16 => I2cReadReturn,
            17 => I2cWrite,
            18 => I2cWriteReturn,
            19 => GpioGetValue,
            20 => GpioGetValueReturn,
            21 => GpioSetValue,
            22 => GpioSetValueReturn,
            23 => GpioSetDirection,
            24 => GpioSetDirectionReturn,
            _ => return None,
        };
        Some(ty)
    }

    /// The type that answers a request of this type.
    pub fn reply_type(self) -> Option<Self> {
        use PacketType::*;
        let reply = match self {
            Command => CommandReturn,
            Ping => Pong,
            Getenv => GetenvReturn,
            Fs => FsReturn,
            Md => MdReturn,
            Mw => MwReturn,
            I2cRead => I2cReadReturn,
            I2cWrite => I2cWriteReturn,
            GpioGetValue => GpioGetValueReturn,
            GpioSetValue => GpioSetValueReturn,
            GpioSetDirection => GpioSetDirectionReturn,
            _ => return None,
        };
        Some(reply)
    }

    /// Whether this type answers a request.
    pub fn is_reply(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            CommandReturn
                | Pong
                | GetenvReturn
                | FsReturn
                | MdReturn
                | MwReturn
                | I2cReadReturn
                | I2cWriteReturn
                | GpioGetValueReturn
                | GpioSetValueReturn
                | GpioSetDirectionReturn
        )
    }
}

/// GPIO line direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioDirection {
    Input,
    Output,
}

/// Packet bodies. Integers are big-endian; strings carry a `u16` length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command { command: String },
    CommandReturn { status: i32 },
    ConsoleMsg { data: Bytes },
    Ping,
    Pong,
    Getenv { name: String },
    GetenvReturn { value: Option<Bytes> },
    Fs(FsRequest),
    FsReturn(FsReply),
    Md { path: String, address: u32, size: u32 },
    MdReturn { status: i32, data: Bytes },
    Mw { path: String, address: u32, data: Bytes },
    MwReturn { status: i32, written: u32 },
    Reset { force: bool },
    I2cRead { bus: u8, address: u8, reg: u16, flags: u8, size: u16 },
    I2cReadReturn { status: i32, data: Bytes },
    I2cWrite { bus: u8, address: u8, reg: u16, flags: u8, data: Bytes },
    I2cWriteReturn { status: i32, written: u16 },
    GpioGetValue { gpio: u32 },
    GpioGetValueReturn { value: u8 },
    GpioSetValue { gpio: u32, value: u8 },
    GpioSetValueReturn,
    GpioSetDirection { gpio: u32, direction: GpioDirection, value: u8 },
    GpioSetDirectionReturn { status: i32 },
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Command { .. } => PacketType::Command,
            Self::CommandReturn { .. } => PacketType::CommandReturn,
            Self::ConsoleMsg { .. } => PacketType::ConsoleMsg,
            Self::Ping => PacketType::Ping,
            Self::Pong => PacketType::Pong,
            Self::Getenv { .. } => PacketType::Getenv,
            Self::GetenvReturn { .. } => PacketType::GetenvReturn,
            Self::Fs(_) => PacketType::Fs,
            Self::FsReturn(_) => PacketType::FsReturn,
            Self::Md { .. } => PacketType::Md,
            Self::MdReturn { .. } => PacketType::MdReturn,
            Self::Mw { .. } => PacketType::Mw,
            Self::MwReturn { .. } => PacketType::MwReturn,
            Self::Reset { .. } => PacketType::Reset,
            Self::I2cRead { .. } => PacketType::I2cRead,
            Self::I2cReadReturn { .. } => PacketType::I2cReadReturn,
            Self::I2cWrite { .. } => PacketType::I2cWrite,
            Self::I2cWriteReturn { .. } => PacketType::I2cWriteReturn,
            Self::GpioGetValue { .. } => PacketType::GpioGetValue,
            Self::GpioGetValueReturn { .. } => PacketType::GpioGetValueReturn,
            Self::GpioSetValue { .. } => PacketType::GpioSetValue,
            Self::GpioSetValueReturn => PacketType::GpioSetValueReturn,
            Self::GpioSetDirection { .. } => PacketType::GpioSetDirection,
            Self::GpioSetDirectionReturn { .. } => PacketType::GpioSetDirectionReturn,
        }
    }
}

/// A controller packet: header flags plus a typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u16,
    pub message: Message,
}

impl Packet {
    /// A request expecting a reply.
    pub fn request(message: Message) -> Self {
        Self {
            flags: FLAG_EXCHANGE,
            message,
        }
    }

    /// A one-way packet.
    pub fn notify(message: Message) -> Self {
        Self { flags: 0, message }
    }

    /// A reply to a packet carrying `request_flags`.
    pub fn reply(request_flags: u16, message: Message) -> Self {
        Self {
            flags: request_flags & FLAG_EXCHANGE,
            message,
        }
    }

    pub fn is_exchange(&self) -> bool {
        self.flags & FLAG_EXCHANGE != 0
    }

    pub fn packet_type(&self) -> PacketType {
        self.message.packet_type()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.packet_type() as u16);
        buf.put_u16(self.flags);

        match &self.message {
            Message::Command { command } => put_str(&mut buf, command)?,
            Message::CommandReturn { status } => buf.put_i32(*status),
            Message::ConsoleMsg { data } => buf.put_slice(data),
            Message::Ping | Message::Pong | Message::GpioSetValueReturn => {}
            Message::Getenv { name } => put_str(&mut buf, name)?,
            Message::GetenvReturn { value } => match value {
                Some(value) => {
                    buf.put_u8(1);
                    buf.put_slice(value);
                }
                None => buf.put_u8(0),
            },
            Message::Fs(request) => request.encode(&mut buf)?,
            Message::FsReturn(reply) => reply.encode(&mut buf)?,
            Message::Md {
                path,
                address,
                size,
            } => {
                put_str(&mut buf, path)?;
                buf.put_u32(*address);
                buf.put_u32(*size);
            }
            Message::MdReturn { status, data } | Message::I2cReadReturn { status, data } => {
                buf.put_i32(*status);
                buf.put_slice(data);
            }
            Message::Mw {
                path,
                address,
                data,
            } => {
                put_str(&mut buf, path)?;
                buf.put_u32(*address);
                buf.put_slice(data);
            }
            Message::MwReturn { status, written } => {
                buf.put_i32(*status);
                buf.put_u32(*written);
            }
            Message::Reset { force } => buf.put_u8(u8::from(*force)),
            Message::I2cRead {
                bus,
                address,
                reg,
                flags,
                size,
            } => {
                buf.put_u8(*bus);
                buf.put_u8(*address);
                buf.put_u16(*reg);
                buf.put_u8(*flags);
                buf.put_u16(*size);
            }
            Message::I2cWrite {
                bus,
                address,
                reg,
                flags,
                data,
            } => {
                buf.put_u8(*bus);
                buf.put_u8(*address);
                buf.put_u16(*reg);
                buf.put_u8(*flags);
                buf.put_slice(data);
            }
            Message::I2cWriteReturn { status, written } => {
                buf.put_i32(*status);
                buf.put_u16(*written);
            }
            Message::GpioGetValue { gpio } => buf.put_u32(*gpio),
            Message::GpioGetValueReturn { value } => buf.put_u8(*value),
            Message::GpioSetValue { gpio, value } => {
                buf.put_u32(*gpio);
                buf.put_u8(*value);
            }
            Message::GpioSetDirection {
                gpio,
                direction,
                value,
            } => {
                buf.put_u32(*gpio);
                buf.put_u8(match direction {
                    GpioDirection::Input => 0,
                    GpioDirection::Output => 1,
                });
                buf.put_u8(*value);
            }
            Message::GpioSetDirectionReturn { status } => buf.put_i32(*status),
        }

        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut body = BodyReader::new(Bytes::copy_from_slice(bytes));
        let raw_type = body.u16()?;
        let flags = body.u16()?;
        let ty = PacketType::from_u16(raw_type)
            .ok_or_else(|| CtrlError::Decode(format!("unknown packet type {raw_type}")))?;

        let message = match ty {
            PacketType::Command => Message::Command {
                command: body.string()?,
            },
            PacketType::CommandReturn => Message::CommandReturn {
                status: body.i32()?,
            },
            PacketType::ConsoleMsg => Message::ConsoleMsg { data: body.rest() },
            PacketType::Ping => Message::Ping,
            PacketType::Pong => Message::Pong,
            PacketType::Getenv => Message::Getenv {
                name: body.string()?,
            },
            PacketType::GetenvReturn => {
                let present = body.u8()? != 0;
                let value = body.rest();
                Message::GetenvReturn {
                    value: present.then_some(value),
                }
            }
            PacketType::Fs => Message::Fs(FsRequest::decode(&mut body)?),
            PacketType::FsReturn => Message::FsReturn(FsReply::decode(&mut body)?),
            PacketType::Md => Message::Md {
                path: body.string()?,
                address: body.u32()?,
                size: body.u32()?,
            },
            PacketType::MdReturn => Message::MdReturn {
                status: body.i32()?,
                data: body.rest(),
            },
            PacketType::Mw => Message::Mw {
                path: body.string()?,
                address: body.u32()?,
                data: body.rest(),
            },
            PacketType::MwReturn => Message::MwReturn {
                status: body.i32()?,
                written: body.u32()?,
            },
            PacketType::Reset => Message::Reset {
                force: body.u8()? != 0,
            },
            PacketType::I2cRead => Message::I2cRead {
                bus: body.u8()?,
                address: body.u8()?,
                reg: body.u16()?,
                flags: body.u8()?,
                size: body.u16()?,
            },
            PacketType::I2cReadReturn => Message::I2cReadReturn {
                status: body.i32()?,
                data: body.rest(),
            },
            PacketType::I2cWrite => Message::I2cWrite {
                bus: body.u8()?,
                address: body.u8()?,
                reg: body.u16()?,
                flags: body.u8()?,
                data: body.rest(),
            },
            PacketType::I2cWriteReturn => Message::I2cWriteReturn {
                status: body.i32()?,
                written: body.u16()?,
            },
            PacketType::GpioGetValue => Message::GpioGetValue { gpio: body.u32()? },
            PacketType::GpioGetValueReturn => Message::GpioGetValueReturn { value: body.u8()? },
            PacketType::GpioSetValue => Message::GpioSetValue {
                gpio: body.u32()?,
                value: body.u8()?,
            },
            PacketType::GpioSetValueReturn => Message::GpioSetValueReturn,
            PacketType::GpioSetDirection => Message::GpioSetDirection {
                gpio: body.u32()?,
                direction: match body.u8()? {
                    0 => GpioDirection::Input,
                    1 => GpioDirection::Output,
                    other => {
                        return Err(CtrlError::Decode(format!("invalid gpio direction {other}")))
                    }
                },
                value: body.u8()?,
            },
            PacketType::GpioSetDirectionReturn => Message::GpioSetDirectionReturn {
                status: body.i32()?,
            },
        };

        Ok(Self { flags, message })
    }
}

/// Type and flags of an encoded packet, without decoding the body.
pub fn peek(message: &[u8]) -> Option<(PacketType, u16)> {
    if message.len() < HEADER_SIZE {
        return None;
    }
    let ty = PacketType::from_u16(u16::from_be_bytes([message[0], message[1]]))?;
    Some((ty, u16::from_be_bytes([message[2], message[3]])))
}

/// Connection demux: replies that carry the exchange flag answer the
/// pending request; everything else is asynchronous traffic.
pub fn route(message: &[u8]) -> Route {
    match peek(message) {
        Some((ty, flags)) if ty.is_reply() && flags & FLAG_EXCHANGE != 0 => Route::Response,
        _ => Route::Stream,
    }
}

/// Exchange matcher: accepts only a reply of type `expected`.
pub fn answers(expected: PacketType) -> impl Fn(&[u8]) -> bool + Send + 'static {
    move |message: &[u8]| matches!(peek(message), Some((ty, _)) if ty == expected)
}

pub(crate) fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| CtrlError::Encode(format!("string of {} bytes", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Bounds-checked reader over a packet body.
pub(crate) struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(CtrlError::Decode(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<Bytes> {
        self.need(len, "bytes")?;
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| CtrlError::Decode(e.to_string()))
    }

    pub(crate) fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn matcher_accepts_only_the_expected_reply() {
        let accept = answers(PacketType::Command.reply_type().unwrap());
        let status = Packet::reply(FLAG_EXCHANGE, Message::CommandReturn { status: 0 })
            .encode()
            .unwrap();
        let pong = Packet::reply(FLAG_EXCHANGE, Message::Pong).encode().unwrap();
        assert!(accept(&status[..]));
        assert!(!accept(&pong[..]));
        assert!(!accept(&status[..2]));
        assert_eq!(PacketType::Reset.reply_type(), None);
    }

    #[test]
    fn command_layout() {
        let bytes = Packet::request(Message::Command {
            command: "version".to_string(),
        })
        .encode()
        .unwrap();
        assert_eq!(&bytes[..6], &[0x00, 0x01, 0x00, 0x01, 0x00, 0x07]);
        assert_eq!(&bytes[6..], b"version");
    }

    #[test]
    fn request_reply_pairs_roundtrip() {
        roundtrip(Packet::request(Message::Md {
            path: "/dev/mem".to_string(),
            address: 0x8000_0000,
            size: 64,
        }));
        roundtrip(Packet::reply(
            FLAG_EXCHANGE,
            Message::MdReturn {
                status: 0,
                data: Bytes::from_static(&[1, 2, 3]),
            },
        ));
        roundtrip(Packet::request(Message::GpioSetDirection {
            gpio: 17,
            direction: GpioDirection::Output,
            value: 1,
        }));
        roundtrip(Packet::reply(
            FLAG_EXCHANGE,
            Message::GetenvReturn { value: None },
        ));
    }

    #[test]
    fn empty_getenv_value_is_not_absent() {
        let packet = Packet::reply(
            FLAG_EXCHANGE,
            Message::GetenvReturn {
                value: Some(Bytes::new()),
            },
        );
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.message,
            Message::GetenvReturn {
                value: Some(Bytes::new())
            }
        );
    }

    #[test]
    fn reply_echoes_only_exchange_flag() {
        assert_eq!(Packet::reply(0xffff, Message::Pong).flags, FLAG_EXCHANGE);
        assert_eq!(Packet::reply(0, Message::Pong).flags, 0);
    }

    #[test]
    fn route_replies_with_exchange_to_response() {
        let reply = Packet::reply(FLAG_EXCHANGE, Message::CommandReturn { status: 0 })
            .encode()
            .unwrap();
        assert_eq!(route(&reply), Route::Response);

        let async_pong = Packet::notify(Message::Pong).encode().unwrap();
        assert_eq!(route(&async_pong), Route::Stream);

        let remote_request = Packet::request(Message::Ping).encode().unwrap();
        assert_eq!(route(&remote_request), Route::Stream);

        let console = Packet::notify(Message::ConsoleMsg {
            data: Bytes::from_static(b"barebox\n"),
        })
        .encode()
        .unwrap();
        assert_eq!(route(&console), Route::Stream);
        assert_eq!(route(b"\x00"), Route::Stream);
    }

    #[test]
    fn decode_rejects_truncated_and_unknown() {
        assert!(matches!(
            Packet::decode(&[0x00, 0x0a, 0x00, 0x01, 0x00]),
            Err(CtrlError::Decode(_))
        ));
        assert!(matches!(
            Packet::decode(&[0x00, 0x63, 0x00, 0x00]),
            Err(CtrlError::Decode(_))
        ));
        assert!(matches!(Packet::decode(&[0x00]), Err(CtrlError::Decode(_))));
    }

    #[test]
    fn encode_rejects_oversized_string() {
        let packet = Packet::request(Message::Command {
            command: "x".repeat(70_000),
        });
        assert!(matches!(packet.encode(), Err(CtrlError::Encode(_))));
    }

    #[test]
    fn every_type_number_maps_back() {
        for value in 1..=24u16 {
            let ty = PacketType::from_u16(value).unwrap();
            assert_eq!(ty as u16, value);
        }
        assert!(PacketType::from_u16(0).is_none());
        assert!(PacketType::from_u16(25).is_none());
    }
}
