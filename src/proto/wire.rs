use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Flat enumeration of every request code on the wire. The numeric gaps
/// separate client-issued codes, server-to-server codes, lock traffic and
/// broker-to-client frames.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestCode {
    // client -> broker
    ClientConnect = 1,
    ClientDisconnect = 2,
    KeepAlive = 3,
    Send = 4,
    SyncSend = 5,
    Subscribe = 6,
    Unsubscribe = 7,
    SubscribeAndGet = 8,
    UnsubscribeAndGet = 9,
    SendAndGet = 10,
    UnSendAndGet = 11,
    ShutdownClients = 12,
    ShutdownServers = 13,

    // broker -> broker (bridge traffic)
    ServerConnect = 20,
    ServerSend = 21,
    ServerSubscribe = 22,
    ServerUnsubscribe = 23,
    ServerSubscribeAndGet = 24,
    ServerUnsubscribeAndGet = 25,
    ServerSendAndGet = 26,
    ServerUnSendAndGet = 27,
    ServerShutdownClients = 28,
    ServerSendNames = 29,
    ServerCloudPeers = 30,

    // distributed locks and membership
    CloudLock = 40,
    CloudUnlock = 41,
    RegistrationLock = 42,
    RegistrationUnlock = 43,
    CloudSetStatus = 44,

    // broker -> client
    Reply = 60,
    MessageDelivery = 61,
    GetResponse = 62,
    ShutdownNotice = 63,
}

impl TryFrom<u32> for RequestCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        use RequestCode::*;
        Ok(match value {
            1 => ClientConnect,
            2 => ClientDisconnect,
            3 => KeepAlive,
            4 => Send,
            5 => SyncSend,
            6 => Subscribe,
            7 => Unsubscribe,
            8 => SubscribeAndGet,
            9 => UnsubscribeAndGet,
            10 => SendAndGet,
            11 => UnSendAndGet,
            12 => ShutdownClients,
            13 => ShutdownServers,
            20 => ServerConnect,
            21 => ServerSend,
            22 => ServerSubscribe,
            23 => ServerUnsubscribe,
            24 => ServerSubscribeAndGet,
            25 => ServerUnsubscribeAndGet,
            26 => ServerSendAndGet,
            27 => ServerUnSendAndGet,
            28 => ServerShutdownClients,
            29 => ServerSendNames,
            30 => ServerCloudPeers,
            40 => CloudLock,
            41 => CloudUnlock,
            42 => RegistrationLock,
            43 => RegistrationUnlock,
            44 => CloudSetStatus,
            60 => Reply,
            61 => MessageDelivery,
            62 => GetResponse,
            63 => ShutdownNotice,
            other => {
                return Err(Error::Protocol(format!(
                    "unknown request code {other}"
                )))
            }
        })
    }
}

/// One decoded frame: the request code plus its raw payload bytes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub code: RequestCode,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(code: RequestCode, body: Vec<u8>) -> Self {
        Self { code, body }
    }

    pub fn reader(&self) -> WireReader<'_> {
        WireReader::new(&self.body)
    }
}

/// Membership state of a broker relative to the cloud.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudStatus {
    NonCloud,
    BecomingCloud,
    InCloud,
    Unknown,
}

impl CloudStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            CloudStatus::NonCloud => 0,
            CloudStatus::BecomingCloud => 1,
            CloudStatus::InCloud => 2,
            CloudStatus::Unknown => 3,
        }
    }

    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0 => CloudStatus::NonCloud,
            1 => CloudStatus::BecomingCloud,
            2 => CloudStatus::InCloud,
            _ => CloudStatus::Unknown,
        }
    }
}

/// Append-only payload builder. Integers are network byte order, strings
/// are length-prefixed.
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a received payload. Every getter checks the remaining
/// length; truncated payloads surface as `ProtocolError`.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Protocol(format!(
                "payload truncated: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    pub fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Protocol("string is not UTF-8".into()))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Everything not yet consumed, for replies whose tail layout depends
    /// on the call that was made.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Payload of `ClientConnect` / `ServerConnect`.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub corr: u64,
    pub version: u32,
    pub password: String,
    pub name: String,
    pub namespace: String,
    pub host: String,
    /// Set on `ServerConnect`: the peer broker's own listen URL, used for
    /// reciprocal bridging and transitive discovery.
    pub server_url: String,
    pub keepalive_ms: u32,
}

impl ConnectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.corr)
            .put_u32(self.version)
            .put_str(&self.password)
            .put_str(&self.name)
            .put_str(&self.namespace)
            .put_str(&self.host)
            .put_str(&self.server_url)
            .put_u32(self.keepalive_ms);
        w.finish()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            corr: r.u64()?,
            version: r.u32()?,
            password: r.str()?,
            name: r.str()?,
            namespace: r.str()?,
            host: r.str()?,
            server_url: r.str()?,
            keepalive_ms: r.u32()?,
        })
    }
}

/// Success body of the reply to a connect request.
#[derive(Clone, Debug)]
pub struct ConnectReply {
    pub token: u64,
    pub cloud_status: CloudStatus,
    pub udp_port: u32,
}

impl ConnectReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.token)
            .put_u8(self.cloud_status.to_wire())
            .put_u32(self.udp_port);
        w.finish()
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            token: r.u64()?,
            cloud_status: CloudStatus::from_wire(r.u8()?),
            udp_port: r.u32()?,
        })
    }
}

/// Payload of `Subscribe`/`Unsubscribe`/`SubscribeAndGet` and their
/// server-to-server forms.
#[derive(Clone, Debug)]
pub struct GetRequest {
    pub corr: u64,
    pub id: u64,
    pub subject: String,
    pub kind: String,
    pub namespace: String,
}

impl GetRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.corr)
            .put_u64(self.id)
            .put_str(&self.subject)
            .put_str(&self.kind)
            .put_str(&self.namespace);
        w.finish()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            corr: r.u64()?,
            id: r.u64()?,
            subject: r.str()?,
            kind: r.str()?,
            namespace: r.str()?,
        })
    }
}

/// Payload of `CloudLock`/`RegistrationLock`.
#[derive(Clone, Debug)]
pub struct LockRequest {
    pub corr: u64,
    pub holder: String,
    pub timeout_ms: u32,
}

impl LockRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.corr)
            .put_str(&self.holder)
            .put_u32(self.timeout_ms);
        w.finish()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        Ok(Self {
            corr: r.u64()?,
            holder: r.str()?,
            timeout_ms: r.u32()?,
        })
    }
}

/// Builds a `Reply` body: correlation id, status code, then any
/// call-specific extra payload.
pub fn encode_reply(corr: u64, status: u32, extra: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(12 + extra.len());
    w.put_u64(corr).put_u32(status);
    let mut buf = w.finish();
    buf.extend_from_slice(extra);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_code_round_trip() {
        for code in [
            RequestCode::ClientConnect,
            RequestCode::SendAndGet,
            RequestCode::ServerSendNames,
            RequestCode::CloudSetStatus,
            RequestCode::ShutdownNotice,
        ] {
            assert_eq!(RequestCode::try_from(code as u32).unwrap(), code);
        }
        assert!(RequestCode::try_from(99).is_err());
    }

    #[test]
    fn truncated_payload_is_protocol_error() {
        let mut w = WireWriter::new();
        w.put_u32(12); // claims a 12-byte string follows
        let buf = w.finish();
        let mut r = WireReader::new(&buf);
        assert!(matches!(r.str(), Err(Error::Protocol(_))));
    }

    #[test]
    fn connect_request_round_trip() {
        let req = ConnectRequest {
            corr: 7,
            version: PROTOCOL_VERSION,
            password: "hunter2".into(),
            name: "daq-reader".into(),
            namespace: "/hall-b".into(),
            host: "cp01".into(),
            server_url: String::new(),
            keepalive_ms: 1500,
        };
        let decoded = ConnectRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.corr, 7);
        assert_eq!(decoded.name, "daq-reader");
        assert_eq!(decoded.namespace, "/hall-b");
        assert_eq!(decoded.keepalive_ms, 1500);
    }
}
