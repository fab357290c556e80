use chrono::Utc;

use super::wire::{WireReader, WireWriter};
use crate::error::Result;

/// A published message. The same record travels client → broker, broker →
/// peer broker and broker → subscriber; only the framing code around it
/// changes.
#[derive(Clone, Debug)]
pub struct Message {
    pub subject: String,
    /// The message "type" in the subject/type matching pair. Named `kind`
    /// because `type` is reserved.
    pub kind: String,
    pub text: String,
    pub payload: Vec<u8>,
    pub sender: String,
    pub sender_host: String,
    pub namespace: String,
    /// Unreliable sends may travel over UDP.
    pub reliable: bool,
    /// Set on messages published through `sendAndGet`; responders answer
    /// with `respond`.
    pub is_get_request: bool,
    pub is_get_response: bool,
    /// Correlates a get response back to the requester: the requester's
    /// token and its request id.
    pub sender_token: u64,
    pub sender_id: u64,
    /// Microseconds since the epoch, stamped at creation.
    pub sent_at: i64,
}

impl Message {
    pub fn new(subject: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind: kind.into(),
            text: String::new(),
            payload: Vec::new(),
            sender: String::new(),
            sender_host: String::new(),
            namespace: String::new(),
            reliable: true,
            is_get_request: false,
            is_get_response: false,
            sender_token: 0,
            sender_id: 0,
            sent_at: Utc::now().timestamp_micros(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }

    /// Builds the response to a `sendAndGet` request message. The subject
    /// and type are free; routing happens on the carried token and id.
    pub fn respond(&self, subject: &str, kind: &str) -> Message {
        let mut msg = Message::new(subject, kind);
        msg.is_get_response = true;
        msg.sender_token = self.sender_token;
        msg.sender_id = self.sender_id;
        msg
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(
            64 + self.subject.len()
                + self.kind.len()
                + self.text.len()
                + self.payload.len(),
        );
        w.put_str(&self.subject)
            .put_str(&self.kind)
            .put_str(&self.text)
            .put_bytes(&self.payload)
            .put_str(&self.sender)
            .put_str(&self.sender_host)
            .put_str(&self.namespace)
            .put_u8(self.reliable as u8)
            .put_u8(self.is_get_request as u8)
            .put_u8(self.is_get_response as u8)
            .put_u64(self.sender_token)
            .put_u64(self.sender_id)
            .put_i64(self.sent_at);
        w.finish()
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            subject: r.str()?,
            kind: r.str()?,
            text: r.str()?,
            payload: r.bytes()?,
            sender: r.str()?,
            sender_host: r.str()?,
            namespace: r.str()?,
            reliable: r.u8()? != 0,
            is_get_request: r.u8()? != 0,
            is_get_response: r.u8()? != 0,
            sender_token: r.u64()?,
            sender_id: r.u64()?,
            sent_at: r.i64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_routing_fields() {
        let mut msg = Message::new("temp", "reading")
            .with_text("23.4")
            .with_payload(vec![0xde, 0xad]);
        msg.namespace = "/hall-b".into();
        msg.sender = "probe-1".into();
        msg.is_get_request = true;
        msg.sender_token = 42;
        msg.sender_id = 9;

        let bytes = msg.encode();
        let decoded = Message::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded.subject, "temp");
        assert_eq!(decoded.kind, "reading");
        assert_eq!(decoded.text, "23.4");
        assert_eq!(decoded.payload, vec![0xde, 0xad]);
        assert_eq!(decoded.namespace, "/hall-b");
        assert!(decoded.is_get_request);
        assert_eq!(decoded.sender_token, 42);
        assert_eq!(decoded.sender_id, 9);
    }

    #[test]
    fn respond_carries_correlation() {
        let mut req = Message::new("ping", "rpc");
        req.sender_token = 7;
        req.sender_id = 3;
        let resp = req.respond("pong", "rpc");
        assert!(resp.is_get_response);
        assert_eq!(resp.sender_token, 7);
        assert_eq!(resp.sender_id, 3);
    }
}
