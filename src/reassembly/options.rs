//! TCP option consistency check
//!
//! Rejects segments whose options are inconsistent with the connection so
//! far: an MSS option outside a SYN segment, or a timestamp value that
//! moves backwards within one direction.

use crate::core::layers::TcpInfo;

use super::Direction;

/// Per-direction option state
#[derive(Debug, Default)]
struct OptionState {
    last_tsval: Option<u32>,
    mss: Option<u16>,
}

/// Option validator for one bidirectional connection
#[derive(Debug, Default)]
pub struct TcpOptionCheck {
    client: OptionState,
    server: OptionState,
}

impl TcpOptionCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options on a segment.
    /// Returns a description of the violation, if any.
    pub fn accept(&mut self, tcp: &TcpInfo, dir: Direction) -> Result<(), String> {
        let state = match dir {
            Direction::ClientToServer => &mut self.client,
            Direction::ServerToClient => &mut self.server,
        };

        if let Some(mss) = tcp.mss {
            if !tcp.flags.syn {
                return Err(format!("MSS option ({}) outside SYN segment", mss));
            }
            state.mss = Some(mss);
        }

        if let Some(tsval) = tcp.tsval {
            if let Some(last) = state.last_tsval {
                // timestamp must not move backwards, modulo wraparound
                let delta = tsval.wrapping_sub(last);
                if delta > (1 << 31) {
                    return Err(format!("timestamp moved backwards: {} -> {}", last, tsval));
                }
            }
            state.last_tsval = Some(tsval);
        }

        Ok(())
    }
}
