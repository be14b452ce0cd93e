//! The local-side SOCKS5 front-end state machine (spec §4.3).
//!
//! Modeled as an explicit tagged variant with a pure transition function
//! rather than dynamic state-name dispatch (spec §9, "Dynamic dispatch FSM
//! -> tagged variant"): `SocksFsm::feed` consumes as much of the buffered
//! input as the current state allows and returns the actions the caller
//! must perform, leaving any leftover bytes in the buffer for the next
//! read.

use bytes::{Buf, Bytes, BytesMut};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksState {
    WaitHello,
    WaitConnect,
    Streaming,
    Closed,
}

/// One thing the caller must do in response to bytes fed into the FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAction {
    /// Write these bytes back to the SOCKS client verbatim.
    Write(Bytes),
    /// Emit a CONNECT for `host:port` over the tunnel; a success reply has
    /// already been queued via an accompanying `Write` (optimistic success,
    /// spec §4.2/§4.3).
    Connect { host: Bytes, port: u16 },
    /// Bytes to forward as `DATA_OUT` (only produced once `Streaming`).
    Data(Bytes),
    /// Close the client TCP; no further actions follow in this batch.
    Close,
}

#[derive(Debug, Default)]
pub struct SocksFsm {
    state: SocksState2,
}

// Avoids exposing an uninhabited default; wraps SocksState with a Default
// impl of WaitHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocksState2(SocksState);

impl Default for SocksState2 {
    fn default() -> Self {
        SocksState2(SocksState::WaitHello)
    }
}

impl SocksFsm {
    pub fn new() -> Self {
        SocksFsm::default()
    }

    pub fn state(&self) -> SocksState {
        self.state.0
    }

    /// Feed newly-arrived bytes. `buf` is the accumulated-but-unconsumed
    /// input; on return, any prefix the FSM was able to act on has been
    /// removed.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Vec<SocksAction> {
        let mut actions = Vec::new();
        loop {
            match self.state.0 {
                SocksState::WaitHello => {
                    if !self.try_wait_hello(buf, &mut actions) {
                        break;
                    }
                }
                SocksState::WaitConnect => {
                    if !self.try_wait_connect(buf, &mut actions) {
                        break;
                    }
                }
                SocksState::Streaming => {
                    if buf.is_empty() {
                        break;
                    }
                    actions.push(SocksAction::Data(buf.split().freeze()));
                }
                SocksState::Closed => break,
            }
            if matches!(self.state.0, SocksState::Closed) {
                break;
            }
        }
        actions
    }

    fn try_wait_hello(&mut self, buf: &mut BytesMut, actions: &mut Vec<SocksAction>) -> bool {
        if buf.len() < 2 {
            return false;
        }
        let nmethods = buf[1] as usize;
        if buf.len() < 2 + nmethods {
            return false;
        }
        let version = buf[0];
        let methods = &buf[2..2 + nmethods];
        let accepted = version == SOCKS_VERSION && methods.contains(&METHOD_NO_AUTH);
        buf.advance(2 + nmethods);
        if accepted {
            actions.push(SocksAction::Write(Bytes::from_static(&[
                SOCKS_VERSION,
                METHOD_NO_AUTH,
            ])));
            self.state.0 = SocksState::WaitConnect;
        } else {
            actions.push(SocksAction::Write(Bytes::from_static(&[
                SOCKS_VERSION,
                METHOD_NO_ACCEPTABLE,
            ])));
            actions.push(SocksAction::Close);
            self.state.0 = SocksState::Closed;
        }
        true
    }

    fn try_wait_connect(&mut self, buf: &mut BytesMut, actions: &mut Vec<SocksAction>) -> bool {
        if buf.len() < 4 {
            return false;
        }
        let version = buf[0];
        let cmd = buf[1];
        let rsv = buf[2];
        let atyp = buf[3];

        if version != SOCKS_VERSION || rsv != 0 {
            buf.clear();
            actions.push(SocksAction::Close);
            self.state.0 = SocksState::Closed;
            return true;
        }
        if cmd != CMD_CONNECT {
            buf.clear();
            actions.push(SocksAction::Write(connect_reply(REPLY_COMMAND_NOT_SUPPORTED)));
            actions.push(SocksAction::Close);
            self.state.0 = SocksState::Closed;
            return true;
        }
        if atyp != ATYP_IPV4 && atyp != ATYP_DOMAIN {
            buf.clear();
            actions.push(SocksAction::Write(connect_reply(REPLY_ATYP_NOT_SUPPORTED)));
            actions.push(SocksAction::Close);
            self.state.0 = SocksState::Closed;
            return true;
        }

        let (host, port, consumed) = match atyp {
            ATYP_IPV4 => {
                if buf.len() < 10 {
                    return false;
                }
                let octets = &buf[4..8];
                let host = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
                let port = u16::from_be_bytes([buf[8], buf[9]]);
                (Bytes::from(host.into_bytes()), port, 10)
            }
            ATYP_DOMAIN => {
                if buf.len() < 5 {
                    return false;
                }
                let len = buf[4] as usize;
                let total = 5 + len + 2;
                if buf.len() < total {
                    return false;
                }
                let host = Bytes::copy_from_slice(&buf[5..5 + len]);
                let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
                (host, port, total)
            }
            _ => unreachable!(),
        };

        buf.advance(consumed);
        actions.push(SocksAction::Write(connect_reply(0)));
        actions.push(SocksAction::Connect { host, port });
        self.state.0 = SocksState::Streaming;
        true
    }
}

fn connect_reply(code: u8) -> Bytes {
    Bytes::from_static(match code {
        0 => &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0],
        0x07 => &[5, 7, 0, 1, 0, 0, 0, 0, 0, 0],
        0x08 => &[5, 8, 0, 1, 0, 0, 0, 0, 0, 0],
        _ => &[5, 1, 0, 1, 0, 0, 0, 0, 0, 0],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_no_auth_and_advances() {
        let mut fsm = SocksFsm::new();
        let mut buf = BytesMut::from(&[5u8, 1, 0][..]);
        let actions = fsm.feed(&mut buf);
        assert_eq!(
            actions,
            vec![SocksAction::Write(Bytes::from_static(&[5, 0]))]
        );
        assert_eq!(fsm.state(), SocksState::WaitConnect);
    }

    #[test]
    fn rejects_when_no_auth_method_offered() {
        let mut fsm = SocksFsm::new();
        let mut buf = BytesMut::from(&[5u8, 1, 0x02][..]);
        let actions = fsm.feed(&mut buf);
        assert_eq!(
            actions,
            vec![
                SocksAction::Write(Bytes::from_static(&[5, 0xFF])),
                SocksAction::Close
            ]
        );
        assert_eq!(fsm.state(), SocksState::Closed);
    }

    #[test]
    fn waits_for_full_method_list() {
        let mut fsm = SocksFsm::new();
        let mut buf = BytesMut::from(&[5u8, 2, 0][..]); // nmethods=2 but only 1 given
        let actions = fsm.feed(&mut buf);
        assert!(actions.is_empty());
        assert_eq!(fsm.state(), SocksState::WaitHello);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn ipv4_connect_emits_reply_then_connect() {
        let mut fsm = SocksFsm::new();
        let mut hello = BytesMut::from(&[5u8, 1, 0][..]);
        fsm.feed(&mut hello);

        let mut req = BytesMut::from(
            &[5u8, 1, 0, 1, 127, 0, 0, 1, 0x1F, 0x90][..], // 127.0.0.1:8080
        );
        let actions = fsm.feed(&mut req);
        assert_eq!(
            actions,
            vec![
                SocksAction::Write(Bytes::from_static(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])),
                SocksAction::Connect {
                    host: Bytes::from_static(b"127.0.0.1"),
                    port: 8080,
                },
            ]
        );
        assert_eq!(fsm.state(), SocksState::Streaming);
        assert!(req.is_empty());
    }

    #[test]
    fn domain_connect_reads_length_prefixed_host() {
        let mut fsm = SocksFsm::new();
        let mut hello = BytesMut::from(&[5u8, 1, 0][..]);
        fsm.feed(&mut hello);

        let mut req = BytesMut::new();
        req.extend_from_slice(&[5, 1, 0, 3, 9]);
        req.extend_from_slice(b"localhost");
        req.extend_from_slice(&0x0050u16.to_be_bytes());
        let actions = fsm.feed(&mut req);
        assert_eq!(
            actions,
            vec![
                SocksAction::Write(Bytes::from_static(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])),
                SocksAction::Connect {
                    host: Bytes::from_static(b"localhost"),
                    port: 80,
                },
            ]
        );
    }

    #[test]
    fn unsupported_command_gets_code_07_and_closes() {
        let mut fsm = SocksFsm::new();
        let mut hello = BytesMut::from(&[5u8, 1, 0][..]);
        fsm.feed(&mut hello);

        let mut req = BytesMut::from(&[5u8, 2, 0, 1, 0, 0, 0, 0, 0, 0][..]); // BIND
        let actions = fsm.feed(&mut req);
        assert_eq!(
            actions,
            vec![
                SocksAction::Write(Bytes::from_static(&[5, 7, 0, 1, 0, 0, 0, 0, 0, 0])),
                SocksAction::Close
            ]
        );
        assert_eq!(fsm.state(), SocksState::Closed);
    }

    #[test]
    fn unsupported_atyp_gets_code_08_and_closes() {
        let mut fsm = SocksFsm::new();
        let mut hello = BytesMut::from(&[5u8, 1, 0][..]);
        fsm.feed(&mut hello);

        let mut req = BytesMut::from(&[5u8, 1, 0, 4, 0, 0, 0, 0, 0, 0][..]); // ATYP=4 (ipv6)
        let actions = fsm.feed(&mut req);
        assert_eq!(
            actions,
            vec![
                SocksAction::Write(Bytes::from_static(&[5, 8, 0, 1, 0, 0, 0, 0, 0, 0])),
                SocksAction::Close
            ]
        );
    }

    #[test]
    fn streaming_forwards_raw_bytes_as_data_actions() {
        let mut fsm = SocksFsm::new();
        let mut hello = BytesMut::from(&[5u8, 1, 0][..]);
        fsm.feed(&mut hello);
        let mut req = BytesMut::from(&[5u8, 1, 0, 1, 127, 0, 0, 1, 0, 80][..]);
        fsm.feed(&mut req);

        let mut payload = BytesMut::from(&b"hello"[..]);
        let actions = fsm.feed(&mut payload);
        assert_eq!(actions, vec![SocksAction::Data(Bytes::from_static(b"hello"))]);
    }
}
