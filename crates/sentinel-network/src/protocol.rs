//! Request/response protocols and their wire codec.
//!
//! Protocol names follow `/eth2/beacon_chain/req/{method}/{version}/bincode`.
//! Each (method, version) pair has exactly one request and one response shape;
//! [`protocol_codec`] returns the encode/decode pair for a supported pair and
//! [`RpcError::UnsupportedVersion`] otherwise.
//!
//! Framing on the stream:
//! - request: `u32 BE length ++ body`
//! - response: `u8 code ++ u32 BE length ++ body`
//!
//! A non-zero response code carries a UTF-8 error message as its body.

use libp2p::StreamProtocol;
use sentinel_core::codec;
use sentinel_core::constants::MAX_CHUNK_SIZE;
use sentinel_core::error::CodecError;
use sentinel_core::types::{Epoch, ForkDigest, Root, Slot};
use std::fmt;
use std::io;

use crate::error::RpcError;

/// Longest error message sent or accepted in an error response.
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    Status,
    Goodbye,
    Ping,
    MetaData,
}

impl RpcMethod {
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::Status => "status",
            RpcMethod::Goodbye => "goodbye",
            RpcMethod::Ping => "ping",
            RpcMethod::MetaData => "metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolId {
    pub method: RpcMethod,
    pub version: u8,
}

impl ProtocolId {
    pub const STATUS_V1: Self = Self { method: RpcMethod::Status, version: 1 };
    pub const GOODBYE_V1: Self = Self { method: RpcMethod::Goodbye, version: 1 };
    pub const PING_V1: Self = Self { method: RpcMethod::Ping, version: 1 };
    pub const METADATA_V1: Self = Self { method: RpcMethod::MetaData, version: 1 };
    pub const METADATA_V2: Self = Self { method: RpcMethod::MetaData, version: 2 };

    pub const SUPPORTED: [Self; 5] = [
        Self::STATUS_V1,
        Self::GOODBYE_V1,
        Self::PING_V1,
        Self::METADATA_V1,
        Self::METADATA_V2,
    ];

    /// Protocol name as negotiated on the stream, if supported.
    pub fn protocol_name(&self) -> Option<&'static str> {
        protocol_codec(self.method, self.version).ok().map(|c| c.name)
    }

    pub fn stream_protocol(&self) -> Result<StreamProtocol, RpcError> {
        Ok(StreamProtocol::new(protocol_codec(self.method, self.version)?.name))
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/eth2/beacon_chain/req/{}/{}/bincode", self.method.name(), self.version)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Chain head summary exchanged on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct StatusMessage {
    pub fork_digest: ForkDigest,
    pub finalized_root: Root,
    pub finalized_epoch: Epoch,
    pub head_root: Root,
    pub head_slot: Slot,
}

/// Ping and pong share one shape: the sender's metadata sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct Ping {
    pub seq_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct MetadataV1 {
    pub seq_number: u64,
    pub attnets: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct MetadataV2 {
    pub seq_number: u64,
    pub attnets: [u8; 8],
    pub syncnets: u8,
}

/// Reason code carried by a goodbye request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GoodbyeReason {
    ClientShutdown,
    IrrelevantNetwork,
    Fault,
    TooManyPeers,
    ScoreTooLow,
    Unknown(u64),
}

impl GoodbyeReason {
    pub fn code(&self) -> u64 {
        match self {
            GoodbyeReason::ClientShutdown => 1,
            GoodbyeReason::IrrelevantNetwork => 2,
            GoodbyeReason::Fault => 3,
            GoodbyeReason::TooManyPeers => 129,
            GoodbyeReason::ScoreTooLow => 250,
            GoodbyeReason::Unknown(code) => *code,
        }
    }
}

impl From<u64> for GoodbyeReason {
    fn from(code: u64) -> Self {
        match code {
            1 => GoodbyeReason::ClientShutdown,
            2 => GoodbyeReason::IrrelevantNetwork,
            3 => GoodbyeReason::Fault,
            129 => GoodbyeReason::TooManyPeers,
            250 => GoodbyeReason::ScoreTooLow,
            other => GoodbyeReason::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0,
    InvalidRequest = 1,
    ServerError = 2,
    ResourceUnavailable = 3,
}

impl TryFrom<u8> for ResponseCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        match code {
            0 => Ok(ResponseCode::Success),
            1 => Ok(ResponseCode::InvalidRequest),
            2 => Ok(ResponseCode::ServerError),
            3 => Ok(ResponseCode::ResourceUnavailable),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    Status(StatusMessage),
    Goodbye(GoodbyeReason),
    Ping(Ping),
    MetaData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    Status(StatusMessage),
    GoodbyeAck,
    Pong(Ping),
    MetaDataV1(MetadataV1),
    MetaDataV2(MetadataV2),
    Error { code: ResponseCode, message: String },
}

impl RpcResponse {
    pub fn error(code: ResponseCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8(&mut message, MAX_ERROR_MESSAGE_LEN);
        RpcResponse::Error { code, message }
    }
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// ---------------------------------------------------------------------------
// Protocol registry
// ---------------------------------------------------------------------------

/// Body encoder/decoder pair for one protocol version.
#[derive(Clone, Copy)]
pub struct ProtocolCodec {
    pub id: ProtocolId,
    pub name: &'static str,
    pub encode_request: fn(&RpcRequest) -> Result<Vec<u8>, CodecError>,
    pub decode_request: fn(&[u8]) -> Result<RpcRequest, CodecError>,
    pub encode_response: fn(&RpcResponse) -> Result<Vec<u8>, CodecError>,
    pub decode_response: fn(&[u8]) -> Result<RpcResponse, CodecError>,
}

impl fmt::Debug for ProtocolCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCodec").field("name", &self.name).finish()
    }
}

fn mismatch(expected: &str) -> CodecError {
    CodecError::Encode(format!("message does not belong to {expected}"))
}

fn empty_body(data: &[u8]) -> Result<(), CodecError> {
    if data.is_empty() { Ok(()) } else { Err(CodecError::TrailingBytes(data.len())) }
}

fn status_encode_request(req: &RpcRequest) -> Result<Vec<u8>, CodecError> {
    match req {
        RpcRequest::Status(s) => codec::encode(s),
        _ => Err(mismatch("status")),
    }
}

fn status_decode_request(data: &[u8]) -> Result<RpcRequest, CodecError> {
    codec::decode(data).map(RpcRequest::Status)
}

fn status_encode_response(resp: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    match resp {
        RpcResponse::Status(s) => codec::encode(s),
        _ => Err(mismatch("status")),
    }
}

fn status_decode_response(data: &[u8]) -> Result<RpcResponse, CodecError> {
    codec::decode(data).map(RpcResponse::Status)
}

fn goodbye_encode_request(req: &RpcRequest) -> Result<Vec<u8>, CodecError> {
    match req {
        RpcRequest::Goodbye(reason) => codec::encode(&reason.code()),
        _ => Err(mismatch("goodbye")),
    }
}

fn goodbye_decode_request(data: &[u8]) -> Result<RpcRequest, CodecError> {
    codec::decode::<u64>(data).map(|code| RpcRequest::Goodbye(code.into()))
}

fn goodbye_encode_response(resp: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    match resp {
        RpcResponse::GoodbyeAck => Ok(Vec::new()),
        _ => Err(mismatch("goodbye")),
    }
}

fn goodbye_decode_response(data: &[u8]) -> Result<RpcResponse, CodecError> {
    empty_body(data).map(|()| RpcResponse::GoodbyeAck)
}

fn ping_encode_request(req: &RpcRequest) -> Result<Vec<u8>, CodecError> {
    match req {
        RpcRequest::Ping(p) => codec::encode(p),
        _ => Err(mismatch("ping")),
    }
}

fn ping_decode_request(data: &[u8]) -> Result<RpcRequest, CodecError> {
    codec::decode(data).map(RpcRequest::Ping)
}

fn ping_encode_response(resp: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    match resp {
        RpcResponse::Pong(p) => codec::encode(p),
        _ => Err(mismatch("ping")),
    }
}

fn ping_decode_response(data: &[u8]) -> Result<RpcResponse, CodecError> {
    codec::decode(data).map(RpcResponse::Pong)
}

fn metadata_encode_request(req: &RpcRequest) -> Result<Vec<u8>, CodecError> {
    match req {
        RpcRequest::MetaData => Ok(Vec::new()),
        _ => Err(mismatch("metadata")),
    }
}

fn metadata_decode_request(data: &[u8]) -> Result<RpcRequest, CodecError> {
    empty_body(data).map(|()| RpcRequest::MetaData)
}

fn metadata_v1_encode_response(resp: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    match resp {
        RpcResponse::MetaDataV1(m) => codec::encode(m),
        _ => Err(mismatch("metadata/1")),
    }
}

fn metadata_v1_decode_response(data: &[u8]) -> Result<RpcResponse, CodecError> {
    codec::decode(data).map(RpcResponse::MetaDataV1)
}

fn metadata_v2_encode_response(resp: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    match resp {
        RpcResponse::MetaDataV2(m) => codec::encode(m),
        _ => Err(mismatch("metadata/2")),
    }
}

fn metadata_v2_decode_response(data: &[u8]) -> Result<RpcResponse, CodecError> {
    codec::decode(data).map(RpcResponse::MetaDataV2)
}

const CODECS: [ProtocolCodec; 5] = [
    ProtocolCodec {
        id: ProtocolId::STATUS_V1,
        name: "/eth2/beacon_chain/req/status/1/bincode",
        encode_request: status_encode_request,
        decode_request: status_decode_request,
        encode_response: status_encode_response,
        decode_response: status_decode_response,
    },
    ProtocolCodec {
        id: ProtocolId::GOODBYE_V1,
        name: "/eth2/beacon_chain/req/goodbye/1/bincode",
        encode_request: goodbye_encode_request,
        decode_request: goodbye_decode_request,
        encode_response: goodbye_encode_response,
        decode_response: goodbye_decode_response,
    },
    ProtocolCodec {
        id: ProtocolId::PING_V1,
        name: "/eth2/beacon_chain/req/ping/1/bincode",
        encode_request: ping_encode_request,
        decode_request: ping_decode_request,
        encode_response: ping_encode_response,
        decode_response: ping_decode_response,
    },
    ProtocolCodec {
        id: ProtocolId::METADATA_V1,
        name: "/eth2/beacon_chain/req/metadata/1/bincode",
        encode_request: metadata_encode_request,
        decode_request: metadata_decode_request,
        encode_response: metadata_v1_encode_response,
        decode_response: metadata_v1_decode_response,
    },
    ProtocolCodec {
        id: ProtocolId::METADATA_V2,
        name: "/eth2/beacon_chain/req/metadata/2/bincode",
        encode_request: metadata_encode_request,
        decode_request: metadata_decode_request,
        encode_response: metadata_v2_encode_response,
        decode_response: metadata_v2_decode_response,
    },
];

/// Encode/decode pair for `method` at `version`.
pub fn protocol_codec(method: RpcMethod, version: u8) -> Result<ProtocolCodec, RpcError> {
    CODECS
        .iter()
        .find(|c| c.id.method == method && c.id.version == version)
        .copied()
        .ok_or_else(|| RpcError::UnsupportedVersion { method: method.name().to_string(), version })
}

fn codec_by_name(name: &str) -> io::Result<&'static ProtocolCodec> {
    CODECS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| invalid_data(format!("unsupported protocol {name}")))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

// ---------------------------------------------------------------------------
// Stream codec
// ---------------------------------------------------------------------------

/// Codec for every request/response protocol. The negotiated protocol
/// name selects the body shapes.
#[derive(Debug, Clone)]
pub struct SentinelCodec {
    max_chunk_size: usize,
}

impl SentinelCodec {
    pub fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }

    async fn read_body<T>(&self, io: &mut T) -> io::Result<Vec<u8>>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        use libp2p::futures::AsyncReadExt;
        let mut len_buf = [0u8; 4];
        io.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_chunk_size {
            return Err(invalid_data(format!("chunk too large: {len} > {}", self.max_chunk_size)));
        }
        let mut buf = vec![0u8; len];
        io.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write_body<T>(&self, io: &mut T, body: &[u8]) -> io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        use libp2p::futures::AsyncWriteExt;
        if body.len() > self.max_chunk_size {
            return Err(invalid_data(format!("chunk too large: {}", body.len())));
        }
        io.write_all(&(body.len() as u32).to_be_bytes()).await?;
        io.write_all(body).await
    }
}

impl Default for SentinelCodec {
    fn default() -> Self {
        Self::new(MAX_CHUNK_SIZE)
    }
}

#[async_trait::async_trait]
impl libp2p::request_response::Codec for SentinelCodec {
    type Protocol = StreamProtocol;
    type Request = RpcRequest;
    type Response = RpcResponse;

    async fn read_request<T>(&mut self, protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        let codec = codec_by_name(protocol.as_ref())?;
        let body = self.read_body(io).await?;
        (codec.decode_request)(&body).map_err(|e| invalid_data(e.to_string()))
    }

    async fn read_response<T>(&mut self, protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: libp2p::futures::AsyncRead + Unpin + Send,
    {
        use libp2p::futures::AsyncReadExt;
        let codec = codec_by_name(protocol.as_ref())?;
        let mut code = [0u8; 1];
        io.read_exact(&mut code).await?;
        let code = ResponseCode::try_from(code[0])
            .map_err(|c| invalid_data(format!("unknown response code {c}")))?;
        let body = self.read_body(io).await?;
        match code {
            ResponseCode::Success => {
                (codec.decode_response)(&body).map_err(|e| invalid_data(e.to_string()))
            }
            code => {
                if body.len() > MAX_ERROR_MESSAGE_LEN {
                    return Err(invalid_data("error message too long"));
                }
                let message = String::from_utf8(body)
                    .map_err(|_| invalid_data("error message is not utf-8"))?;
                Ok(RpcResponse::Error { code, message })
            }
        }
    }

    async fn write_request<T>(&mut self, protocol: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        let codec = codec_by_name(protocol.as_ref())?;
        let body = (codec.encode_request)(&req).map_err(|e| invalid_data(e.to_string()))?;
        self.write_body(io, &body).await
    }

    async fn write_response<T>(&mut self, protocol: &Self::Protocol, io: &mut T, resp: Self::Response) -> io::Result<()>
    where
        T: libp2p::futures::AsyncWrite + Unpin + Send,
    {
        use libp2p::futures::AsyncWriteExt;
        let codec = codec_by_name(protocol.as_ref())?;
        let (code, body) = match resp {
            RpcResponse::Error { code, mut message } => {
                truncate_utf8(&mut message, MAX_ERROR_MESSAGE_LEN);
                (code, message.into_bytes())
            }
            other => (
                ResponseCode::Success,
                (codec.encode_response)(&other).map_err(|e| invalid_data(e.to_string()))?,
            ),
        };
        io.write_all(&[code as u8]).await?;
        self.write_body(io, &body).await
    }
}
