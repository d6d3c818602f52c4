use bitflags::bitflags;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::header::{Header, OpCode};
use crate::{
    bson::Document,
    error::{Error, Result},
};

/// Represents a legacy OP_QUERY wire protocol operation, used to address servers (and server
/// states) that predate OP_MSG.
#[derive(Debug)]
pub(crate) struct Query {
    pub(crate) request_id: i32,
    pub(crate) flags: QueryFlags,
    pub(crate) full_collection_name: String,
    pub(crate) num_to_skip: i32,
    pub(crate) num_to_return: i32,
    pub(crate) query: Document,
}

impl Query {
    /// Serializes the query and writes the bytes to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<()> {
        let mut body = Vec::new();
        body.extend(self.flags.bits().to_le_bytes());
        body.extend(self.full_collection_name.as_bytes());
        body.push(0);
        body.extend(self.num_to_skip.to_le_bytes());
        body.extend(self.num_to_return.to_le_bytes());
        self.query.to_writer(&mut body)?;

        let header = Header {
            length: i32::try_from(Header::LENGTH + body.len())
                .map_err(|_| Error::protocol("attempted to send an oversize OP_QUERY frame"))?,
            request_id: self.request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };

        header.write_to(writer).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;

        Ok(())
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_QUERY as defined in the spec.
    pub(crate) struct QueryFlags: u32 {
        const TAILABLE_CURSOR   = 0b_0000_0010;
        const SLAVE_OK          = 0b_0000_0100;
        const OPLOG_RELAY       = 0b_0000_1000;
        const NO_CURSOR_TIMEOUT = 0b_0001_0000;
        const AWAIT_DATA        = 0b_0010_0000;
        const EXHAUST           = 0b_0100_0000;
        const PARTIAL           = 0b_1000_0000;
    }
}
