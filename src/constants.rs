//! Wire-level constants: command and response codes, data packet flags, and
//! the operational-modes bitfield negotiated per connection.

/// Commands a subscriber may send over the command channel.
///
/// Codes `0xD0..=0xDF` are reserved for user-defined commands and are carried
/// in the `UserCommand` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    MetadataRefresh,
    Subscribe,
    Unsubscribe,
    RotateCipherKeys,
    UpdateProcessingInterval,
    DefineOperationalModes,
    ConfirmNotification,
    ConfirmBufferBlock,
    PublishCommandMeasurements,
    UserCommand(u8),
}

impl ServerCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ServerCommand::MetadataRefresh),
            0x02 => Some(ServerCommand::Subscribe),
            0x03 => Some(ServerCommand::Unsubscribe),
            0x04 => Some(ServerCommand::RotateCipherKeys),
            0x05 => Some(ServerCommand::UpdateProcessingInterval),
            0x06 => Some(ServerCommand::DefineOperationalModes),
            0x07 => Some(ServerCommand::ConfirmNotification),
            0x08 => Some(ServerCommand::ConfirmBufferBlock),
            0x09 => Some(ServerCommand::PublishCommandMeasurements),
            0xD0..=0xDF => Some(ServerCommand::UserCommand(value)),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ServerCommand::MetadataRefresh => 0x01,
            ServerCommand::Subscribe => 0x02,
            ServerCommand::Unsubscribe => 0x03,
            ServerCommand::RotateCipherKeys => 0x04,
            ServerCommand::UpdateProcessingInterval => 0x05,
            ServerCommand::DefineOperationalModes => 0x06,
            ServerCommand::ConfirmNotification => 0x07,
            ServerCommand::ConfirmBufferBlock => 0x08,
            ServerCommand::PublishCommandMeasurements => 0x09,
            ServerCommand::UserCommand(code) => *code,
        }
    }
}

/// Responses the publisher sends back over the command or data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerResponse {
    Succeeded = 0x80,
    Failed = 0x81,
    DataPacket = 0x82,
    UpdateSignalIndexCache = 0x83,
    UpdateBaseTimes = 0x84,
    UpdateCipherKeys = 0x85,
    DataStartTime = 0x86,
    ProcessingComplete = 0x87,
    BufferBlock = 0x88,
    Notify = 0x89,
    ConfigurationChanged = 0x8A,
    NoOp = 0xFF,
}

impl ServerResponse {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(ServerResponse::Succeeded),
            0x81 => Some(ServerResponse::Failed),
            0x82 => Some(ServerResponse::DataPacket),
            0x83 => Some(ServerResponse::UpdateSignalIndexCache),
            0x84 => Some(ServerResponse::UpdateBaseTimes),
            0x85 => Some(ServerResponse::UpdateCipherKeys),
            0x86 => Some(ServerResponse::DataStartTime),
            0x87 => Some(ServerResponse::ProcessingComplete),
            0x88 => Some(ServerResponse::BufferBlock),
            0x89 => Some(ServerResponse::Notify),
            0x8A => Some(ServerResponse::ConfigurationChanged),
            0xFF => Some(ServerResponse::NoOp),
            _ => None,
        }
    }
}

/// Flags carried in the first byte of a `DataPacket` payload.
pub mod data_packet_flags {
    /// Measurement records use the compact format.
    pub const COMPACT: u8 = 0x02;
    /// Packet was encrypted with cipher slot 1 (slot 0 when clear).
    pub const CIPHER_INDEX: u8 = 0x04;
    /// Packet body is gzip-compressed.
    pub const COMPRESSED: u8 = 0x08;
}

/// Operational-modes bitfield.
///
/// Encoding selection is one-hot within bits 0-7; UTF-8 applies when no
/// encoding bit is set.
pub mod operational_modes {
    pub const ENCODING_MASK: u32 = 0x0000_00FF;
    pub const UTF16_LE: u32 = 0x0000_0001;
    pub const UTF16_BE: u32 = 0x0000_0002;
    pub const ANSI: u32 = 0x0000_0004;
    pub const UTF8: u32 = 0x0000_0008;
    pub const COMMON_SERIALIZATION_FORMAT: u32 = 0x0000_0100;
    pub const COMPRESS_PAYLOAD: u32 = 0x0100_0000;
    pub const COMPRESS_METADATA: u32 = 0x0200_0000;
    pub const VERSION_FLAG: u32 = 0x8000_0000;
}

/// Measurement records larger than this never share a data packet; batches
/// split into multiple packets at this boundary.
pub const MAX_PACKET_SIZE: usize = 32_768;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_code_roundtrip() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09] {
            let cmd = ServerCommand::from_u8(code).expect("known command");
            assert_eq!(cmd.as_u8(), code);
        }
    }

    #[test]
    fn test_user_command_range() {
        assert_eq!(
            ServerCommand::from_u8(0xD7),
            Some(ServerCommand::UserCommand(0xD7))
        );
        assert_eq!(ServerCommand::from_u8(0x00), None);
        assert_eq!(ServerCommand::from_u8(0xE0), None);
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(ServerResponse::from_u8(0x82), Some(ServerResponse::DataPacket));
        assert_eq!(ServerResponse::from_u8(0xFF), Some(ServerResponse::NoOp));
        assert_eq!(ServerResponse::from_u8(0x10), None);
    }
}
