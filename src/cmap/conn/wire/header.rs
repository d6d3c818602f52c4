use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Message),
            other => Err(Error::protocol(format!(
                "invalid wire protocol opcode: {}",
                other
            ))),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the header and writes the bytes to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<()> {
        writer.write_i32_le(self.length).await?;
        writer.write_i32_le(self.request_id).await?;
        writer.write_i32_le(self.response_to).await?;
        writer.write_i32_le(self.op_code as i32).await?;

        Ok(())
    }

    /// Reads bytes from `reader` and deserializes them into a header.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            length: reader.read_i32_le().await?,
            request_id: reader.read_i32_le().await?,
            response_to: reader.read_i32_le().await?,
            op_code: OpCode::from_i32(reader.read_i32_le().await?)?,
        })
    }
}
