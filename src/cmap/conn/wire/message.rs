use std::io::Read;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util::CountReader,
};
use crate::{
    bson::RawDocumentBuf,
    bson_util,
    error::{Error, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    // OP_MSG payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
}

#[derive(Clone, Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Message {
    /// Parses the post-header portion of an OP_MSG frame.
    pub(crate) fn read_from_slice(buf: &[u8], header: &Header) -> Result<Self> {
        let mut reader = buf;
        let flags = MessageFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?);

        let mut sections_length = buf
            .len()
            .checked_sub(std::mem::size_of::<u32>())
            .ok_or_else(|| Error::protocol("OP_MSG frame too short to contain flag bits"))?;
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            sections_length = sections_length
                .checked_sub(std::mem::size_of::<u32>())
                .ok_or_else(|| Error::protocol("OP_MSG frame too short to contain a checksum"))?;
        }

        let mut document_payload = None;
        let mut document_sequences = Vec::new();

        let mut count_reader = CountReader::new(&mut reader);
        while count_reader.bytes_read() < sections_length {
            match MessageSection::read(&mut count_reader)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(Error::protocol(
                            "an OP_MSG frame must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(sequence) => document_sequences.push(sequence),
            }
        }

        if count_reader.bytes_read() != sections_length {
            return Err(Error::protocol(format!(
                "OP_MSG sections were declared to span {} bytes but spanned {}",
                sections_length,
                count_reader.bytes_read(),
            )));
        }

        let checksum = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            Some(reader.read_u32::<LittleEndian>()?)
        } else {
            None
        };

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| {
                Error::protocol("an OP_MSG frame must contain exactly one payload type 0 section")
            })?,
            document_sequences,
            checksum,
        })
    }

    /// Serializes the message and writes the bytes to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<()> {
        let sections = self.get_sections_bytes();

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self.checksum.map(|_| std::mem::size_of::<u32>()).unwrap_or(0);

        let header = Header {
            length: i32::try_from(total_length)
                .map_err(|_| Error::protocol("attempted to send an oversize OP_MSG frame"))?,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;

        if let Some(checksum) = self.checksum {
            writer.write_u32_le(checksum).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    fn get_sections_bytes(&self) -> Vec<u8> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let identifier_bytes = document_sequence.identifier.as_bytes();

            let documents_size: usize = document_sequence
                .documents
                .iter()
                .map(|document| document.as_bytes().len())
                .sum();

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = 4 + identifier_bytes.len() + 1 + documents_size;
            sections.extend((size as i32).to_le_bytes());

            sections.extend(identifier_bytes);
            sections.push(0);

            for document in &document_sequence.documents {
                sections.extend(document.as_bytes());
            }
        }

        sections
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8()?;

        if payload_type == 0 {
            let bytes = bson_util::read_document_bytes(reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)
                .map_err(|e| Error::protocol(format!("invalid document in OP_MSG frame: {}", e)))?;
            return Ok(MessageSection::Document(document));
        }

        let size = reader.read_i32::<LittleEndian>()?;
        let mut length_remaining = (size as usize)
            .checked_sub(std::mem::size_of::<i32>())
            .ok_or_else(|| Error::protocol("invalid OP_MSG document sequence length"))?;

        let identifier = bson_util::read_cstring(reader)?;
        length_remaining = length_remaining
            .checked_sub(identifier.len() + 1)
            .ok_or_else(|| Error::protocol("invalid OP_MSG document sequence length"))?;

        let mut documents = Vec::new();
        let mut count_reader = CountReader::new(reader);

        while length_remaining > count_reader.bytes_read() {
            let bytes = bson_util::read_document_bytes(&mut count_reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)
                .map_err(|e| Error::protocol(format!("invalid document in OP_MSG frame: {}", e)))?;
            documents.push(document);
        }

        if length_remaining != count_reader.bytes_read() {
            return Err(Error::protocol(format!(
                "an OP_MSG document sequence was declared to span {} bytes but spanned {}",
                length_remaining,
                count_reader.bytes_read(),
            )));
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
