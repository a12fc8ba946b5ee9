//! Request/response correlation for the companion protocol.
//!
//! A [`CompanionLink`] owns two byte channels fed by a transport pump (TCP,
//! serial or an in-memory pipe). A reader task frames and decodes everything
//! the radio sends. Pushes go to the event channel and everything else goes to
//! the response channel. Commands are serialized by a mutex so exactly one is
//! outstanding at a time, which is what the companion firmware expects.

use async_trait::async_trait;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::framer::{encode_frame, CompanionFramer, APP_TO_RADIO};
use super::packets::{Command, Response, PREFIX_LEN};
use super::{IncomingText, Metadata, RadioEvent, RadioLink, SendOutcome, TextTarget};
use crate::error::TransportError;
use crate::logutil::{escape_log, hex_snippet};
use crate::model::SelfInfo;
use crate::validation::hex_prefix_bytes;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub command_timeout: Duration,
    pub log_packets: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            log_packets: false,
        }
    }
}

struct CommandChannel {
    outbound: mpsc::Sender<Vec<u8>>,
    responses: mpsc::UnboundedReceiver<Response>,
}

pub struct CompanionLink {
    channel: Mutex<CommandChannel>,
    options: LinkOptions,
    cancel: CancellationToken,
}

impl CompanionLink {
    /// Wire a link over raw byte channels and start its reader task.
    ///
    /// `cancel` is shared with the byte pump; [`RadioLink::disconnect`]
    /// cancels it, which tears down the pump and closes the event stream.
    pub fn spawn(
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
        options: LinkOptions,
        cancel: CancellationToken,
    ) -> (Arc<CompanionLink>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(
            inbound,
            responses_tx,
            events_tx,
            cancel.clone(),
            options.log_packets,
        ));
        let link = Arc::new(CompanionLink {
            channel: Mutex::new(CommandChannel {
                outbound,
                responses: responses_rx,
            }),
            options,
            cancel,
        });
        (link, events_rx)
    }

    /// APP_START handshake; returns the companion's advertised identity.
    pub async fn handshake(&self) -> Result<SelfInfo, TransportError> {
        match self.request(Command::AppStart).await? {
            Response::SelfInfo { public_key, name } => Ok(SelfInfo {
                name: if name.is_empty() {
                    SelfInfo::default().name
                } else {
                    name
                },
                public_key: (!public_key.is_empty()).then_some(public_key),
            }),
            other => Err(unexpected("APP_START", &other)),
        }
    }

    async fn request(&self, command: Command) -> Result<Response, TransportError> {
        let mut channel = self.channel.lock().await;
        self.write(&mut channel, &command).await?;
        self.read(&mut channel, command.name()).await
    }

    async fn write(
        &self,
        channel: &mut CommandChannel,
        command: &Command,
    ) -> Result<(), TransportError> {
        // Replies that arrived after an earlier command timed out would
        // otherwise be taken as the answer to this one.
        while let Ok(stale) = channel.responses.try_recv() {
            debug!("Discarding late response {:?}", stale);
        }
        let payload = command.encode();
        if self.options.log_packets {
            trace!(
                "TX {} ({} bytes): {}",
                command.name(),
                payload.len(),
                hex_snippet(&payload, 64)
            );
        }
        channel
            .outbound
            .send(encode_frame(APP_TO_RADIO, &payload))
            .await
            .map_err(|_| TransportError::Unreachable("companion link closed".into()))
    }

    async fn read(
        &self,
        channel: &mut CommandChannel,
        what: &str,
    ) -> Result<Response, TransportError> {
        match timeout(self.options.command_timeout, channel.responses.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(TransportError::Unreachable("companion link closed".into())),
            Err(_) => Err(TransportError::Timeout(what.to_string())),
        }
    }

    async fn fetch_contacts(&self) -> Result<Vec<super::ContactInfo>, TransportError> {
        let mut channel = self.channel.lock().await;
        self.write(&mut channel, &Command::GetContacts).await?;
        let mut contacts = Vec::new();
        loop {
            match self.read(&mut channel, "GET_CONTACTS").await? {
                Response::ContactsStart(count) => debug!("Companion reports {} contacts", count),
                Response::Contact(c) => contacts.push(c),
                Response::EndOfContacts => return Ok(contacts),
                Response::Err(code) => {
                    return Err(TransportError::Rejected(format!(
                        "GET_CONTACTS failed (code {:?})",
                        code
                    )))
                }
                other => return Err(unexpected("GET_CONTACTS", &other)),
            }
        }
    }
}

#[async_trait]
impl RadioLink for CompanionLink {
    async fn send_text(
        &self,
        target: &TextTarget,
        text: &str,
        attempt: u8,
    ) -> Result<SendOutcome, TransportError> {
        let timestamp = chrono::Utc::now().timestamp() as u32;
        match target {
            TextTarget::Channel { index } => {
                let command = Command::SendChannelText {
                    index: *index,
                    timestamp,
                    text: text.to_string(),
                };
                match self.request(command).await? {
                    Response::Ok => Ok(SendOutcome::Accepted),
                    Response::Err(code) => Err(TransportError::Rejected(format!(
                        "channel {} send refused (code {:?})",
                        index, code
                    ))),
                    other => Err(unexpected("SEND_CHANNEL_TXT_MSG", &other)),
                }
            }
            TextTarget::Contact { public_key } => {
                let prefix = hex_prefix_bytes::<PREFIX_LEN>(public_key).ok_or_else(|| {
                    TransportError::Rejected(format!(
                        "contact key '{}' is shorter than {} bytes",
                        escape_log(public_key),
                        PREFIX_LEN
                    ))
                })?;
                let command = Command::SendText {
                    prefix,
                    attempt,
                    timestamp,
                    text: text.to_string(),
                };
                match self.request(command).await? {
                    Response::Sent {
                        expected_ack,
                        suggested_timeout_ms,
                        ..
                    } => Ok(SendOutcome::AwaitAck {
                        ack: expected_ack,
                        timeout: Duration::from_millis(suggested_timeout_ms as u64),
                    }),
                    Response::Err(code) => Err(TransportError::Rejected(format!(
                        "direct send refused (code {:?})",
                        code
                    ))),
                    other => Err(unexpected("SEND_TXT_MSG", &other)),
                }
            }
        }
    }

    async fn fetch_metadata(&self) -> Result<Metadata, TransportError> {
        let max_channels = match self.request(Command::DeviceQuery).await? {
            Response::DeviceInfo { max_channels, .. } => max_channels,
            other => return Err(unexpected("DEVICE_QUERY", &other)),
        };
        let mut channels = Vec::new();
        for idx in 0..max_channels {
            match self.request(Command::GetChannel(idx)).await {
                Ok(Response::ChannelInfo(info)) if !info.name.is_empty() => channels.push(info),
                Ok(Response::ChannelInfo(_)) | Ok(Response::Err(_)) => {}
                Ok(other) => return Err(unexpected("GET_CHANNEL", &other)),
                Err(TransportError::Timeout(what)) => {
                    warn!("Channel fetch stopped at slot {}: timed out on {}", idx, what);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        let contacts = self.fetch_contacts().await?;
        debug!(
            "Metadata fetch: {} channels, {} contacts",
            channels.len(),
            contacts.len()
        );
        Ok(Metadata { channels, contacts })
    }

    async fn drain_pending(&self, limit: usize) -> Result<Vec<IncomingText>, TransportError> {
        let mut drained = Vec::new();
        while drained.len() < limit {
            match self.request(Command::SyncNextMessage).await? {
                Response::Message(m) => drained.push(m),
                Response::NoMoreMessages | Response::Err(_) => break,
                other => {
                    warn!("Unexpected reply while draining messages: {:?}", other);
                    break;
                }
            }
        }
        if drained.len() == limit {
            warn!("Drained {} pending messages; stopping to avoid loops", limit);
        }
        Ok(drained)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        match self.request(Command::GetDeviceTime).await? {
            Response::Err(code) => Err(TransportError::Rejected(format!(
                "GET_DEVICE_TIME failed (code {:?})",
                code
            ))),
            _ => Ok(()),
        }
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
    }
}

fn unexpected(command: &str, response: &Response) -> TransportError {
    TransportError::ProtocolError(format!("unexpected reply to {}: {:?}", command, response))
}

async fn read_loop(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    responses: mpsc::UnboundedSender<Response>,
    events: mpsc::UnboundedSender<RadioEvent>,
    cancel: CancellationToken,
    log_packets: bool,
) {
    let mut framer = CompanionFramer::inbound();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = inbound.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            debug!("Companion byte stream closed");
            break;
        };
        framer.push(&chunk);
        while let Some(frame) = framer.next_frame() {
            if log_packets {
                trace!("RX {} bytes: {}", frame.len(), hex_snippet(&frame, 64));
            }
            match Response::decode(&frame) {
                Ok(response) if response.is_push() => {
                    if let Some(event) = push_event(response) {
                        let _ = events.send(event);
                    }
                }
                Ok(response) => {
                    let _ = responses.send(response);
                }
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        }
    }
    debug!("Companion reader stopped ({} bytes skipped)", framer.dropped());
}

fn push_event(push: Response) -> Option<RadioEvent> {
    match push {
        Response::PushMessagesWaiting => Some(RadioEvent::MessagesWaiting),
        Response::PushSendConfirmed { ack, round_trip_ms } => {
            Some(RadioEvent::SendConfirmed { ack, round_trip_ms })
        }
        Response::PushNewAdvert(contact) => Some(RadioEvent::ContactAdvert(contact)),
        Response::PushAdvert { public_key } | Response::PushPathUpdated { public_key } => {
            Some(RadioEvent::Seen { public_key })
        }
        other => {
            debug!("Ignoring push {:?}", other);
            None
        }
    }
}
