use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::client::Client;
use crate::error::{Result, RtspError};
use crate::protocol::{RtspMessage, SERVER_AGENT};
use crate::session::Session;

/// Sends a single message. The flag asks for the connection to be closed
/// afterwards. Returns `false` when the message could not be sent.
pub type SendFunc = Box<dyn Fn(&RtspMessage, bool) -> bool + Send + Sync>;

/// Sends a batch of messages. Returns 0 when they were written at once,
/// otherwise an id reported back through [`Client::message_sent`] once the
/// batch left the queue.
pub type SendMessagesFunc = Box<dyn Fn(&[RtspMessage], bool) -> Result<u32> + Send + Sync>;

#[derive(Default)]
pub(super) enum Sender {
    #[default]
    None,
    Single(SendFunc),
    Batched(SendMessagesFunc),
}

#[derive(Default)]
pub(super) struct SendState {
    sender: Sender,
    /// Id of the message in flight per interleaved channel, 0 when idle.
    data_seqs: HashMap<u8, u32>,
}

impl Client {
    /// Send messages one at a time through `func`. Fails while a batched
    /// send function is installed.
    pub fn set_send_func(&self, func: SendFunc) -> Result<()> {
        let mut send = self.send.lock();
        if matches!(send.sender, Sender::Batched(_)) {
            return Err(RtspError::SendConflict("batched"));
        }
        send.sender = Sender::Single(func);
        Ok(())
    }

    /// Send messages in batches through `func`. Fails while a single
    /// message send function is installed.
    pub fn set_send_messages_func(&self, func: SendMessagesFunc) -> Result<()> {
        let mut send = self.send.lock();
        if matches!(send.sender, Sender::Single(_)) {
            return Err(RtspError::SendConflict("single"));
        }
        send.sender = Sender::Batched(func);
        Ok(())
    }

    pub(super) fn replace_sender(&self, sender: Sender) {
        self.send.lock().sender = sender;
    }

    /// Send a server-initiated message, adding the `Session` header of
    /// `session` when given.
    pub fn send_message(&self, session: Option<&Arc<Session>>, message: RtspMessage) -> bool {
        self.send_message_inner(session, message, false)
    }

    pub(super) fn send_message_inner(
        &self,
        session: Option<&Arc<Session>>,
        mut message: RtspMessage,
        close: bool,
    ) -> bool {
        match &mut message {
            RtspMessage::Request(req) => {
                req.headers.remove("Session");
                if let Some(session) = session {
                    req.headers.add("Session", &session.header());
                }
            }
            RtspMessage::Response(resp) => {
                resp.headers.set("Server", SERVER_AGENT);
                resp.headers.remove("Session");
                if let Some(session) = session {
                    resp.headers.add("Session", &session.header());
                }
                if close {
                    resp.headers.add("Connection", "close");
                }
            }
            RtspMessage::Data { .. } => {}
        }

        for h in &self.hooks {
            h.send_message(&mut message);
        }

        let sent = {
            let send = self.send.lock();
            match &send.sender {
                Sender::None => true,
                Sender::Single(func) => func(&message, close),
                Sender::Batched(func) => match func(std::slice::from_ref(&message), close) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to queue message");
                        false
                    }
                },
            }
        };

        if !sent {
            tracing::warn!("error sending message, closing client");
            self.close_pending.store(true, Ordering::SeqCst);
        } else if close {
            self.close_pending.store(true, Ordering::SeqCst);
        }
        sent
    }

    /// Frame `payload` onto interleaved `channel`. Refused while the
    /// previous message on that channel is still queued.
    pub(super) fn do_send_data(&self, payload: &[u8], channel: u8) -> bool {
        let mut guard = self.send.lock();
        let st = &mut *guard;
        if st.data_seqs.get(&channel).is_some_and(|seq| *seq != 0) {
            tracing::warn!(channel, "previous data on channel not yet sent");
            return false;
        }

        let message = RtspMessage::Data {
            channel,
            payload: payload.to_vec(),
        };
        let sent = match &st.sender {
            Sender::None => false,
            Sender::Single(func) => func(&message, false),
            Sender::Batched(func) => match func(std::slice::from_ref(&message), false) {
                Ok(0) => true,
                Ok(id) => {
                    if let Some(seq) = st.data_seqs.get_mut(&channel) {
                        *seq = id;
                    }
                    true
                }
                Err(e) => {
                    tracing::debug!(channel, error = %e, "failed to queue data");
                    false
                }
            },
        };
        drop(guard);

        if !sent {
            self.close_pending.store(true, Ordering::SeqCst);
        }
        sent
    }

    /// Whether interleaved `channel` still has a message in flight.
    pub fn check_back_pressure(&self, channel: u8) -> bool {
        self.send
            .lock()
            .data_seqs
            .get(&channel)
            .is_some_and(|seq| *seq != 0)
    }

    /// The queued message `id` left the connection. Frees its channel and
    /// tells the transport it may send again.
    pub fn message_sent(&self, id: u32) {
        if id == 0 {
            return;
        }
        let channel = {
            let mut send = self.send.lock();
            let channel = send
                .data_seqs
                .iter()
                .find(|(_, seq)| **seq == id)
                .map(|(ch, _)| *ch);
            if let Some(ch) = channel {
                send.data_seqs.insert(ch, 0);
            }
            channel
        };
        if let Some(transport) = channel.and_then(|ch| self.transport_for_channel(ch)) {
            transport.message_sent();
        }
    }

    pub(super) fn add_data_seq(&self, channel: u8) {
        self.send.lock().data_seqs.insert(channel, 0);
    }

    pub(super) fn remove_data_seq(&self, channel: u8) {
        self.send.lock().data_seqs.remove(&channel);
    }
}
