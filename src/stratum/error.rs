use {super::*, snafu::Snafu};

/// RPC-level error carried inside a response frame. Pool messages matter:
/// the proxy inspects them for ban notices, so `Display` must surface the
/// message text verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("failed to dial {address}: {source}"))]
    Dial {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("dial to {address} timed out"))]
    DialTimedOut { address: String },

    #[snafu(display("failed to encode {method} request: {source}"))]
    Encode {
        method: String,
        source: serde_json::Error,
    },

    #[snafu(display("transport error: {source}"))]
    Transport {
        source: tokio_util::codec::LinesCodecError,
    },

    #[snafu(display("rpc call timeout"))]
    CallTimedOut,

    #[snafu(display("connection closed"))]
    ConnectionClosed,

    #[snafu(display("bad {method} reply: {source}"))]
    BadReply {
        method: String,
        source: serde_json::Error,
    },

    #[snafu(display("{source}"))]
    Rpc { source: RpcError },

    #[snafu(display("notification buffer is full; the consumer must drain it"))]
    NotificationsFull,
}
