//! Simple TCP state machine
//!
//! Validates that segments are consistent with SYN / SYN-ACK / ACK / FIN
//! progression before they enter reassembly. The machine is deliberately
//! permissive once a connection is established; its job is to reject data
//! that arrives before a plausible handshake, unless mid-stream pickup is
//! allowed.

use crate::core::layers::TcpInfo;

use super::Direction;

/// Connection state as tracked by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsmState {
    #[default]
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinSeen,
    Reset,
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsmState::Closed => write!(f, "CLOSED"),
            FsmState::SynSent => write!(f, "SYN_SENT"),
            FsmState::SynReceived => write!(f, "SYN_RCVD"),
            FsmState::Established => write!(f, "ESTABLISHED"),
            FsmState::FinSeen => write!(f, "FIN_SEEN"),
            FsmState::Reset => write!(f, "RESET"),
        }
    }
}

/// SYN/ACK/FIN progression validator
#[derive(Debug)]
pub struct TcpFsm {
    state: FsmState,
    allow_missing_init: bool,
}

impl TcpFsm {
    pub fn new(allow_missing_init: bool) -> Self {
        Self {
            state: FsmState::Closed,
            allow_missing_init,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Check a segment against the expected progression.
    /// Returns false when the segment is invalid for its direction; the
    /// caller decides whether rejection is fatal.
    pub fn check(&mut self, tcp: &TcpInfo, dir: Direction) -> bool {
        let flags = &tcp.flags;

        if flags.rst {
            self.state = FsmState::Reset;
            return true;
        }

        match self.state {
            FsmState::Closed => {
                if flags.is_syn() && dir == Direction::ClientToServer {
                    self.state = FsmState::SynSent;
                    return true;
                }

                // no handshake observed: tolerate mid-stream pickup only
                // when configured
                if self.allow_missing_init {
                    self.state = FsmState::Established;
                    return true;
                }

                false
            }
            FsmState::SynSent => match dir {
                Direction::ServerToClient => {
                    if flags.is_syn_ack() {
                        self.state = FsmState::SynReceived;
                        true
                    } else {
                        false
                    }
                }
                // SYN retransmission
                Direction::ClientToServer => flags.is_syn(),
            },
            FsmState::SynReceived => match dir {
                Direction::ClientToServer => {
                    if flags.ack {
                        self.state = FsmState::Established;
                        true
                    } else {
                        false
                    }
                }
                // SYN-ACK retransmission
                Direction::ServerToClient => flags.is_syn_ack(),
            },
            FsmState::Established => {
                if flags.fin {
                    self.state = FsmState::FinSeen;
                }
                true
            }
            // teardown: anything goes, we only watch for the close
            FsmState::FinSeen | FsmState::Reset => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layers::TcpFlags;

    fn seg(flags: TcpFlags) -> TcpInfo {
        TcpInfo {
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn test_handshake_progression() {
        let mut fsm = TcpFsm::new(false);

        let syn = seg(TcpFlags { syn: true, ..Default::default() });
        assert!(fsm.check(&syn, Direction::ClientToServer));
        assert_eq!(fsm.state(), FsmState::SynSent);

        let syn_ack = seg(TcpFlags { syn: true, ack: true, ..Default::default() });
        assert!(fsm.check(&syn_ack, Direction::ServerToClient));
        assert_eq!(fsm.state(), FsmState::SynReceived);

        let ack = seg(TcpFlags { ack: true, ..Default::default() });
        assert!(fsm.check(&ack, Direction::ClientToServer));
        assert_eq!(fsm.state(), FsmState::Established);
    }

    #[test]
    fn test_data_before_handshake_rejected() {
        let mut fsm = TcpFsm::new(false);
        let data = seg(TcpFlags { ack: true, psh: true, ..Default::default() });
        assert!(!fsm.check(&data, Direction::ClientToServer));
        assert_eq!(fsm.state(), FsmState::Closed);
    }

    #[test]
    fn test_missing_init_tolerated() {
        let mut fsm = TcpFsm::new(true);
        let data = seg(TcpFlags { ack: true, psh: true, ..Default::default() });
        assert!(fsm.check(&data, Direction::ServerToClient));
        assert_eq!(fsm.state(), FsmState::Established);
    }

    #[test]
    fn test_rst_always_accepted() {
        let mut fsm = TcpFsm::new(false);
        let rst = seg(TcpFlags { rst: true, ..Default::default() });
        assert!(fsm.check(&rst, Direction::ServerToClient));
        assert_eq!(fsm.state(), FsmState::Reset);
    }

    #[test]
    fn test_syn_retransmission_accepted() {
        let mut fsm = TcpFsm::new(false);
        let syn = seg(TcpFlags { syn: true, ..Default::default() });
        assert!(fsm.check(&syn, Direction::ClientToServer));
        assert!(fsm.check(&syn, Direction::ClientToServer));
        assert_eq!(fsm.state(), FsmState::SynSent);
    }
}
