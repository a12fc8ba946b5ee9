//! MeshCore companion command encoding and response/push decoding.
//!
//! Only the commands the synchronization layer issues are modelled. Unknown
//! response codes decode to [`Response::Unknown`] so firmware additions never
//! break the link.

use crate::error::TransportError;

use super::{ChannelInfo, ContactInfo, IncomingText, TextOrigin};

pub mod cmd {
    pub const APP_START: u8 = 1;
    pub const SEND_TXT_MSG: u8 = 2;
    pub const SEND_CHANNEL_TXT_MSG: u8 = 3;
    pub const GET_CONTACTS: u8 = 4;
    pub const GET_DEVICE_TIME: u8 = 5;
    pub const SYNC_NEXT_MESSAGE: u8 = 10;
    pub const DEVICE_QUERY: u8 = 22;
    pub const GET_CHANNEL: u8 = 31;
}

pub mod resp {
    pub const OK: u8 = 0;
    pub const ERR: u8 = 1;
    pub const CONTACTS_START: u8 = 2;
    pub const CONTACT: u8 = 3;
    pub const END_OF_CONTACTS: u8 = 4;
    pub const SELF_INFO: u8 = 5;
    pub const SENT: u8 = 6;
    pub const CONTACT_MSG_RECV: u8 = 7;
    pub const CHANNEL_MSG_RECV: u8 = 8;
    pub const CURR_TIME: u8 = 9;
    pub const NO_MORE_MESSAGES: u8 = 10;
    pub const DEVICE_INFO: u8 = 13;
    pub const CONTACT_MSG_RECV_V3: u8 = 16;
    pub const CHANNEL_MSG_RECV_V3: u8 = 17;
    pub const CHANNEL_INFO: u8 = 18;

    pub const PUSH_ADVERT: u8 = 0x80;
    pub const PUSH_PATH_UPDATED: u8 = 0x81;
    pub const PUSH_SEND_CONFIRMED: u8 = 0x82;
    pub const PUSH_MSG_WAITING: u8 = 0x83;
    pub const PUSH_NEW_ADVERT: u8 = 0x8A;
}

const APP_NAME: &str = "meshchat";
const APP_PROTOCOL_VERSION: u8 = 3;
const TXT_TYPE_PLAIN: u8 = 0;
const TXT_TYPE_SIGNED: u8 = 2;
const PUBKEY_LEN: usize = 32;
pub const PREFIX_LEN: usize = 6;

/// Request frames sent to the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AppStart,
    DeviceQuery,
    GetDeviceTime,
    GetChannel(u8),
    GetContacts,
    SyncNextMessage,
    SendText {
        prefix: [u8; PREFIX_LEN],
        attempt: u8,
        timestamp: u32,
        text: String,
    },
    SendChannelText {
        index: u8,
        timestamp: u32,
        text: String,
    },
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::AppStart => {
                let mut out = vec![cmd::APP_START, 1];
                out.extend_from_slice(&[0u8; 6]);
                out.extend_from_slice(APP_NAME.as_bytes());
                out
            }
            Command::DeviceQuery => vec![cmd::DEVICE_QUERY, APP_PROTOCOL_VERSION],
            Command::GetDeviceTime => vec![cmd::GET_DEVICE_TIME],
            Command::GetChannel(idx) => vec![cmd::GET_CHANNEL, *idx],
            Command::GetContacts => vec![cmd::GET_CONTACTS],
            Command::SyncNextMessage => vec![cmd::SYNC_NEXT_MESSAGE],
            Command::SendText {
                prefix,
                attempt,
                timestamp,
                text,
            } => {
                let mut out = vec![cmd::SEND_TXT_MSG, TXT_TYPE_PLAIN, *attempt];
                out.extend_from_slice(&timestamp.to_le_bytes());
                out.extend_from_slice(prefix);
                out.extend_from_slice(text.as_bytes());
                out
            }
            Command::SendChannelText {
                index,
                timestamp,
                text,
            } => {
                let mut out = vec![cmd::SEND_CHANNEL_TXT_MSG, TXT_TYPE_PLAIN, *index];
                out.extend_from_slice(&timestamp.to_le_bytes());
                out.extend_from_slice(text.as_bytes());
                out
            }
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AppStart => "APP_START",
            Command::DeviceQuery => "DEVICE_QUERY",
            Command::GetDeviceTime => "GET_DEVICE_TIME",
            Command::GetChannel(_) => "GET_CHANNEL",
            Command::GetContacts => "GET_CONTACTS",
            Command::SyncNextMessage => "SYNC_NEXT_MESSAGE",
            Command::SendText { .. } => "SEND_TXT_MSG",
            Command::SendChannelText { .. } => "SEND_CHANNEL_TXT_MSG",
        }
    }
}

/// Decoded radio → app frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Err(Option<u8>),
    ContactsStart(u32),
    Contact(ContactInfo),
    EndOfContacts,
    SelfInfo { public_key: String, name: String },
    Sent { flood: bool, expected_ack: u32, suggested_timeout_ms: u32 },
    Message(IncomingText),
    CurrentTime(u32),
    NoMoreMessages,
    DeviceInfo { firmware: u8, max_channels: u8 },
    ChannelInfo(ChannelInfo),

    PushAdvert { public_key: String },
    PushPathUpdated { public_key: String },
    PushSendConfirmed { ack: u32, round_trip_ms: u32 },
    PushMessagesWaiting,
    PushNewAdvert(ContactInfo),

    Unknown(u8),
}

impl Response {
    /// Pushes arrive unsolicited and are never the answer to a command.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            Response::PushAdvert { .. }
                | Response::PushPathUpdated { .. }
                | Response::PushSendConfirmed { .. }
                | Response::PushMessagesWaiting
                | Response::PushNewAdvert(_)
        ) || matches!(self, Response::Unknown(code) if *code >= 0x80)
    }

    pub fn decode(frame: &[u8]) -> Result<Response, TransportError> {
        let (&code, body) = frame
            .split_first()
            .ok_or_else(|| TransportError::ProtocolError("empty frame".into()))?;
        let mut r = Reader::new(body, code);
        let decoded = match code {
            resp::OK => Response::Ok,
            resp::ERR => Response::Err(body.first().copied()),
            resp::CONTACTS_START => Response::ContactsStart(r.u32().unwrap_or(0)),
            resp::CONTACT => Response::Contact(decode_contact(&mut r)?),
            resp::END_OF_CONTACTS => Response::EndOfContacts,
            resp::SELF_INFO => decode_self_info(body),
            resp::SENT => Response::Sent {
                flood: r.u8()? != 0,
                expected_ack: r.u32()?,
                suggested_timeout_ms: r.u32()?,
            },
            resp::CONTACT_MSG_RECV => Response::Message(decode_contact_msg(&mut r, None)?),
            resp::CONTACT_MSG_RECV_V3 => {
                let snr = r.snr()?;
                Response::Message(decode_contact_msg(&mut r, Some(snr))?)
            }
            resp::CHANNEL_MSG_RECV => Response::Message(decode_channel_msg(&mut r, None)?),
            resp::CHANNEL_MSG_RECV_V3 => {
                let snr = r.snr()?;
                Response::Message(decode_channel_msg(&mut r, Some(snr))?)
            }
            resp::CURR_TIME => Response::CurrentTime(r.u32()?),
            resp::NO_MORE_MESSAGES => Response::NoMoreMessages,
            resp::DEVICE_INFO => {
                let firmware = r.u8()?;
                // Older firmware answers with the version byte only.
                let max_channels = if firmware >= 3 {
                    r.skip(1)?;
                    r.u8()?
                } else {
                    8
                };
                Response::DeviceInfo {
                    firmware,
                    max_channels,
                }
            }
            resp::CHANNEL_INFO => {
                let index = r.u8()?;
                let name = r.cstr(32)?;
                let secret = r.bytes(16).ok().and_then(|s| <[u8; 16]>::try_from(s).ok());
                Response::ChannelInfo(ChannelInfo {
                    index,
                    name,
                    secret,
                })
            }
            resp::PUSH_ADVERT => Response::PushAdvert {
                public_key: r.hex(PUBKEY_LEN)?,
            },
            resp::PUSH_PATH_UPDATED => Response::PushPathUpdated {
                public_key: r.hex(PUBKEY_LEN)?,
            },
            resp::PUSH_SEND_CONFIRMED => Response::PushSendConfirmed {
                ack: r.u32()?,
                round_trip_ms: r.u32().unwrap_or(0),
            },
            resp::PUSH_MSG_WAITING => Response::PushMessagesWaiting,
            resp::PUSH_NEW_ADVERT => Response::PushNewAdvert(decode_contact(&mut r)?),
            other => Response::Unknown(other),
        };
        Ok(decoded)
    }
}

fn decode_contact(r: &mut Reader<'_>) -> Result<ContactInfo, TransportError> {
    let public_key = r.hex(PUBKEY_LEN)?;
    let kind = r.u8()?;
    let _flags = r.u8()?;
    let out_path_len = r.u8()? as i8;
    r.skip(64)?;
    let name = r.cstr(32)?;
    let last_advert = r.u32()?;
    Ok(ContactInfo {
        public_key,
        name,
        kind,
        hops: u8::try_from(out_path_len).ok(),
        last_advert,
    })
}

fn decode_self_info(body: &[u8]) -> Response {
    // adv_type, tx_power, max_tx_power, then the 32-byte key; name starts at 57.
    let public_key = body
        .get(3..3 + PUBKEY_LEN)
        .map(to_hex)
        .unwrap_or_default();
    let name = body.get(57..).map(trim_cstr).unwrap_or_default();
    Response::SelfInfo { public_key, name }
}

fn decode_contact_msg(r: &mut Reader<'_>, snr: Option<f32>) -> Result<IncomingText, TransportError> {
    let prefix = r.hex(PREFIX_LEN)?;
    let path_len = r.u8()?;
    let txt_type = r.u8()?;
    let sender_timestamp = r.u32()?;
    if txt_type == TXT_TYPE_SIGNED {
        r.skip(4)?;
    }
    Ok(IncomingText {
        origin: TextOrigin::Contact { prefix },
        sender_timestamp,
        text: r.rest_string(),
        hops: hops_from_path_len(path_len),
        snr,
    })
}

fn decode_channel_msg(r: &mut Reader<'_>, snr: Option<f32>) -> Result<IncomingText, TransportError> {
    let index = r.u8()?;
    let path_len = r.u8()?;
    let _txt_type = r.u8()?;
    let sender_timestamp = r.u32()?;
    Ok(IncomingText {
        origin: TextOrigin::Channel { index },
        sender_timestamp,
        text: r.rest_string(),
        hops: hops_from_path_len(path_len),
        snr,
    })
}

/// `0xFF` marks a direct (zero-hop) reception.
fn hops_from_path_len(path_len: u8) -> Option<u8> {
    Some(if path_len == 0xFF { 0 } else { path_len })
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn trim_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    code: u8,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], code: u8) -> Self {
        Self { buf, pos: 0, code }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        let end = self.pos + n;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| {
            TransportError::ProtocolError(format!(
                "response 0x{:02x} truncated at byte {}",
                self.code, self.pos
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), TransportError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// V3 message prefix: SNR in quarter dB followed by two reserved bytes.
    fn snr(&mut self) -> Result<f32, TransportError> {
        let raw = self.u8()? as i8;
        self.skip(2)?;
        Ok(raw as f32 / 4.0)
    }

    fn hex(&mut self, n: usize) -> Result<String, TransportError> {
        Ok(to_hex(self.bytes(n)?))
    }

    fn cstr(&mut self, n: usize) -> Result<String, TransportError> {
        Ok(trim_cstr(self.bytes(n)?))
    }

    fn rest_string(&mut self) -> String {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        trim_cstr(rest)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Radio-side frame builders shared by unit and link tests.
    use super::*;

    pub fn contact_frame(code: u8, public_key: [u8; 32], name: &str, out_path_len: i8) -> Vec<u8> {
        let mut f = vec![code];
        f.extend_from_slice(&public_key);
        f.push(1); // chat node
        f.push(0);
        f.push(out_path_len as u8);
        f.extend_from_slice(&[0u8; 64]);
        let mut n = [0u8; 32];
        n[..name.len()].copy_from_slice(name.as_bytes());
        f.extend_from_slice(&n);
        f.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        f.extend_from_slice(&[0u8; 12]);
        f
    }

    pub fn channel_info_frame(index: u8, name: &str) -> Vec<u8> {
        let mut f = vec![resp::CHANNEL_INFO, index];
        let mut n = [0u8; 32];
        n[..name.len()].copy_from_slice(name.as_bytes());
        f.extend_from_slice(&n);
        f.extend_from_slice(&[0xAB; 16]);
        f
    }

    pub fn contact_msg_frame(prefix: [u8; 6], ts: u32, text: &str) -> Vec<u8> {
        let mut f = vec![resp::CONTACT_MSG_RECV];
        f.extend_from_slice(&prefix);
        f.push(2);
        f.push(TXT_TYPE_PLAIN);
        f.extend_from_slice(&ts.to_le_bytes());
        f.extend_from_slice(text.as_bytes());
        f
    }

    pub fn channel_msg_frame(index: u8, ts: u32, text: &str) -> Vec<u8> {
        let mut f = vec![resp::CHANNEL_MSG_RECV, index, 0xFF, TXT_TYPE_PLAIN];
        f.extend_from_slice(&ts.to_le_bytes());
        f.extend_from_slice(text.as_bytes());
        f
    }

    pub fn sent_frame(ack: u32, timeout_ms: u32) -> Vec<u8> {
        let mut f = vec![resp::SENT, 0];
        f.extend_from_slice(&ack.to_le_bytes());
        f.extend_from_slice(&timeout_ms.to_le_bytes());
        f
    }

    pub fn send_confirmed_frame(ack: u32) -> Vec<u8> {
        let mut f = vec![resp::PUSH_SEND_CONFIRMED];
        f.extend_from_slice(&ack.to_le_bytes());
        f.extend_from_slice(&250u32.to_le_bytes());
        f
    }

    pub fn self_info_frame(name: &str) -> Vec<u8> {
        let mut f = vec![resp::SELF_INFO, 1, 22, 22];
        f.extend_from_slice(&[0x11; 32]);
        f.extend_from_slice(&[0u8; 22]);
        f.extend_from_slice(name.as_bytes());
        f
    }
}
