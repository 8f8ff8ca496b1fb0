//! Connection preamble.
//!
//! The first bytes on every connection are one newline-terminated JSON
//! value naming the magic number and the codec for the rest of the
//! stream. JSON is fixed here regardless of the negotiated codec, so the
//! codec choice can itself ride in the preamble.
//!
//! ```text
//! {"MagicNumber":3927900,"CodecType":"job"}\n
//! <codec-framed traffic until close>
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Canonical magic number; a connection opening with anything else is
/// dropped without a response.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// The per-connection preamble record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectOptions {
    /// Must equal [`MAGIC_NUMBER`]; [`Client::dial`](crate::client::Client::dial)
    /// forces it there regardless of what the caller set.
    pub magic_number: u32,
    /// Registered codec name, e.g. `"job"` or `"json"`.
    pub codec_type: String,
}

impl ConnectOptions {
    /// Options selecting the given codec with the canonical magic.
    pub fn new(codec: CodecType) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec.name().to_string(),
        }
    }

    /// Normalize caller-supplied options: the magic number is always the
    /// canonical one, an empty codec name falls back to the default, and
    /// the name must resolve in the codec factory.
    pub(crate) fn resolve(opts: Option<Self>) -> Result<(Self, CodecType)> {
        let mut opt = opts.unwrap_or_default();
        opt.magic_number = MAGIC_NUMBER;
        if opt.codec_type.is_empty() {
            opt.codec_type = CodecType::default().name().to_string();
        }
        let kind = CodecType::from_name(&opt.codec_type)
            .ok_or_else(|| RpcError::UnknownCodec(opt.codec_type.clone()))?;
        Ok((opt, kind))
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new(CodecType::default())
    }
}

/// Write the preamble as a single JSON line and flush.
pub async fn write_options<W: AsyncWrite + Unpin>(writer: &mut W, opt: &ConnectOptions) -> Result<()> {
    let mut line = serde_json::to_vec(opt)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON preamble line from the head of a connection.
pub async fn read_options<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ConnectOptions> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before preamble",
        )));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
