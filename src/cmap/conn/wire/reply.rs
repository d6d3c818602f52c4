use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};

use super::{header::Header, util::CountReader};
use crate::{
    bson::Document,
    error::{Error, Result},
};

/// Represents a legacy OP_REPLY wire protocol operation, the server's answer to an OP_QUERY.
///
/// The driver only sends OP_QUERY for commands (single-document replies against a `$cmd`
/// collection), so the cursor bookkeeping fields of the frame are validated and discarded.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) response_flags: ResponseFlags,
    pub(crate) documents: Vec<Document>,
}

impl Reply {
    /// Parses the post-header portion of an OP_REPLY frame.
    pub(crate) fn read_from_slice(buf: &[u8], header: &Header) -> Result<Self> {
        let mut reader = buf;

        let response_flags = ResponseFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?);
        let _cursor_id = reader.read_i64::<LittleEndian>()?;
        let _starting_from = reader.read_i32::<LittleEndian>()?;
        let num_returned = reader.read_i32::<LittleEndian>()?;

        let documents_length = buf.len() - 20;
        let mut count_reader = CountReader::new(&mut reader);
        let mut documents = Vec::new();

        while documents_length > count_reader.bytes_read() {
            documents.push(Document::from_reader(&mut count_reader)?);
        }

        if documents_length != count_reader.bytes_read() {
            return Err(Error::protocol(format!(
                "the server indicated that the reply would be {} bytes long, but it instead was {}",
                header.length,
                Header::LENGTH + 20 + count_reader.bytes_read(),
            )));
        }

        if num_returned as usize != documents.len() {
            return Err(Error::protocol(format!(
                "the reply declared {} documents but carried {}",
                num_returned,
                documents.len(),
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            response_flags,
            documents,
        })
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY as defined in the spec.
    pub(crate) struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND   = 0b_0001;
        const QUERY_FAILURE      = 0b_0010;
        const SHARD_CONFIG_STALE = 0b_0100;
        const AWAIT_CAPABLE      = 0b_1000;
    }
}
