//! Single-byte uplink commands.
//!
//! | Byte   | Command            |
//! |--------|--------------------|
//! | `0x32` | `START_TRANSFER`   |
//! | `0x4C` | `SEND_LATEST`      |
//! | `0x03` | `END_TRANSFER_ACK` |
//! | `0x50` | `PAUSE`            |
//! | `0x52` | `RESUME`           |

/// Begin a session over the stored samples, oldest first
pub const START_TRANSFER: u8 = 0x32;
/// Begin a session over the newest few samples, newest first
pub const SEND_LATEST: u8 = 0x4C;
/// Ground acknowledges the end of a transfer
pub const END_TRANSFER_ACK: u8 = 0x03;
/// Suspend sample production
pub const PAUSE: u8 = 0x50;
/// Resume sample production
pub const RESUME: u8 = 0x52;

const ALL_BYTES: [u8; 5] = [START_TRANSFER, SEND_LATEST, END_TRANSFER_ACK, PAUSE, RESUME];

const fn all_distinct(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let mut j = i + 1;
        while j < bytes.len() {
            if bytes[i] == bytes[j] {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(all_distinct(&ALL_BYTES), "command bytes must be distinct");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartTransfer,
    SendLatest,
    EndTransferAck,
    Pause,
    Resume,
}

impl Command {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            START_TRANSFER => Some(Self::StartTransfer),
            SEND_LATEST => Some(Self::SendLatest),
            END_TRANSFER_ACK => Some(Self::EndTransferAck),
            PAUSE => Some(Self::Pause),
            RESUME => Some(Self::Resume),
            _ => None,
        }
    }

    pub const fn byte(self) -> u8 {
        match self {
            Self::StartTransfer => START_TRANSFER,
            Self::SendLatest => SEND_LATEST,
            Self::EndTransferAck => END_TRANSFER_ACK,
            Self::Pause => PAUSE,
            Self::Resume => RESUME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_command_byte_maps_back() {
        for byte in ALL_BYTES {
            let command = Command::from_byte(byte).unwrap();
            assert_eq!(command.byte(), byte);
        }
    }

    #[test]
    fn test_other_bytes_are_not_commands() {
        let unknown = (0..=u8::MAX).filter(|b| Command::from_byte(*b).is_none()).count();
        assert_eq!(unknown, 256 - ALL_BYTES.len());
    }
}
