//! Event kinds and header flags.

use crate::error::FrameError;

/// Marks the final chunk of a framed packet.
pub const FLAG_LAST: u8 = 0x01;

/// Marks a negative response (request rejected by the peer).
pub const FLAG_NACK: u8 = 0x02;

/// Stream id carried by a device-side open before the host assigns one.
pub const UNASSIGNED_STREAM: u32 = u32::MAX;

/// Bit set on every response kind.
const RESPONSE_BIT: u8 = 0x80;

/// Kind of a framed link event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// One chunk of packet data.
    Write = 0x01,
    /// The sender freed bytes it had received on a stream.
    Release = 0x02,
    OpenStream = 0x03,
    CloseStream = 0x04,
    /// Liveness check.
    Ping = 0x05,
    /// The sender is tearing the link down.
    Reset = 0x06,
    /// Announces the chunk size the receiver must use when sending.
    SetPacketLength = 0x07,
    WriteResponse = 0x01 | RESPONSE_BIT,
    OpenStreamResponse = 0x03 | RESPONSE_BIT,
    PingResponse = 0x05 | RESPONSE_BIT,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Write => "WRITE",
            EventKind::Release => "RELEASE",
            EventKind::OpenStream => "OPEN_STREAM",
            EventKind::CloseStream => "CLOSE_STREAM",
            EventKind::Ping => "PING",
            EventKind::Reset => "RESET",
            EventKind::SetPacketLength => "SET_PACKET_LENGTH",
            EventKind::WriteResponse => "WRITE_RESPONSE",
            EventKind::OpenStreamResponse => "OPEN_STREAM_RESPONSE",
            EventKind::PingResponse => "PING_RESPONSE",
        }
    }

    pub fn is_response(self) -> bool {
        (self as u8) & RESPONSE_BIT != 0
    }
}

impl TryFrom<u8> for EventKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => EventKind::Write,
            0x02 => EventKind::Release,
            0x03 => EventKind::OpenStream,
            0x04 => EventKind::CloseStream,
            0x05 => EventKind::Ping,
            0x06 => EventKind::Reset,
            0x07 => EventKind::SetPacketLength,
            0x81 => EventKind::WriteResponse,
            0x83 => EventKind::OpenStreamResponse,
            0x85 => EventKind::PingResponse,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [EventKind; 10] = [
        EventKind::Write,
        EventKind::Release,
        EventKind::OpenStream,
        EventKind::CloseStream,
        EventKind::Ping,
        EventKind::Reset,
        EventKind::SetPacketLength,
        EventKind::WriteResponse,
        EventKind::OpenStreamResponse,
        EventKind::PingResponse,
    ];

    #[test]
    fn kinds_survive_the_byte_representation() {
        for kind in ALL {
            assert_eq!(EventKind::try_from(kind as u8).unwrap(), kind);
        }
    }

    #[test]
    fn responses_are_flagged() {
        let responses: Vec<_> = ALL.iter().filter(|k| k.is_response()).collect();
        assert_eq!(responses.len(), 3);
        assert!(!EventKind::Release.is_response());
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(matches!(
            EventKind::try_from(0x42),
            Err(FrameError::UnknownKind(0x42))
        ));
    }
}
