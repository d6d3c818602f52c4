mod header;
mod message;
mod query;
mod reply;
mod util;

use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) use self::{
    header::{Header, OpCode},
    message::{DocumentSequence, Message, MessageFlags},
    query::{Query, QueryFlags},
    reply::{Reply, ResponseFlags},
};
use crate::{
    bson::Document,
    bson_util,
    error::{CommandError, Error, ErrorKind, Result},
};

/// The maximum frame size accepted before a handshake has told us otherwise.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// A frame received from the server: either a modern OP_MSG or a legacy OP_REPLY.
#[derive(Debug)]
pub(crate) enum ReplyFrame {
    Message(Message),
    Reply(Reply),
}

impl ReplyFrame {
    /// Reads a single frame, refusing frames longer than `max_message_size_bytes`.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: i32,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        if header.length > max_message_size_bytes {
            return Err(Error::protocol(format!(
                "frame length {} exceeds the maximum of {}",
                header.length, max_message_size_bytes
            )));
        }
        let body_length = match usize::try_from(header.length)
            .ok()
            .and_then(|len| len.checked_sub(Header::LENGTH))
        {
            Some(len) => len,
            None => {
                return Err(Error::protocol(format!(
                    "invalid frame length: {}",
                    header.length
                )))
            }
        };

        let mut buf = vec![0u8; body_length];
        reader.read_exact(&mut buf).await?;

        match header.op_code {
            OpCode::Message => Ok(ReplyFrame::Message(Message::read_from_slice(
                &buf, &header,
            )?)),
            OpCode::Reply => Ok(ReplyFrame::Reply(Reply::read_from_slice(&buf, &header)?)),
            OpCode::Query => Err(Error::protocol("the server sent an OP_QUERY frame")),
        }
    }

    /// The request id this frame answers.
    pub(crate) fn response_to(&self) -> i32 {
        match self {
            ReplyFrame::Message(message) => message.response_to,
            ReplyFrame::Reply(reply) => reply.response_to,
        }
    }

    /// Whether the server will follow this frame with another one for the same request.
    pub(crate) fn more_to_come(&self) -> bool {
        match self {
            ReplyFrame::Message(message) => message.flags.contains(MessageFlags::MORE_TO_COME),
            ReplyFrame::Reply(_) => false,
        }
    }

    /// Extracts the single command reply document carried by this frame. A reply whose body
    /// is not decodable BSON is a protocol failure, which poisons the connection.
    pub(crate) fn into_command_body(self) -> Result<Document> {
        match self {
            ReplyFrame::Message(message) => bson_util::raw_to_document(&message.document_payload)
                .map_err(|e| Error::protocol(format!("undecodable reply document: {}", e))),
            ReplyFrame::Reply(reply) => {
                let mut documents = reply.documents;
                let document = documents.drain(..).next();

                if reply.response_flags.contains(ResponseFlags::QUERY_FAILURE) {
                    let document = document.unwrap_or_default();
                    let code = document
                        .get("code")
                        .and_then(bson_util::get_int)
                        .and_then(|code| i32::try_from(code).ok())
                        .unwrap_or(-1);
                    let message = document
                        .get_str("$err")
                        .unwrap_or("the server reported a query failure")
                        .to_string();

                    return Err(ErrorKind::Command(CommandError {
                        code,
                        code_name: String::new(),
                        message,
                    })
                    .into());
                }

                if reply
                    .response_flags
                    .contains(ResponseFlags::CURSOR_NOT_FOUND)
                {
                    return Err(ErrorKind::Command(CommandError {
                        code: 43,
                        code_name: "CursorNotFound".to_string(),
                        message: "the requested cursor no longer exists on the server".to_string(),
                    })
                    .into());
                }

                document
                    .ok_or_else(|| Error::invalid_response("the reply contained no documents"))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{
        DocumentSequence,
        Message,
        MessageFlags,
        ReplyFrame,
        DEFAULT_MAX_MESSAGE_SIZE_BYTES,
    };
    use crate::{
        bson::doc,
        bson_util,
        error::ErrorKind,
    };

    #[tokio::test]
    async fn op_msg_round_trips_sections_and_flags() {
        let body = doc! { "insert": "coll", "$db": "test" };
        let batch = vec![doc! { "x": 1 }, doc! { "x": 2 }];

        let message = Message {
            request_id: 21,
            response_to: 0,
            flags: MessageFlags::EXHAUST_ALLOWED,
            document_payload: bson_util::to_raw_document_buf(&body).unwrap(),
            document_sequences: vec![DocumentSequence {
                identifier: "documents".to_string(),
                documents: batch
                    .iter()
                    .map(|d| bson_util::to_raw_document_buf(d).unwrap())
                    .collect(),
            }],
            checksum: None,
        };

        let (mut writer, mut reader) = tokio::io::duplex(1024 * 1024);
        message.write_to(&mut writer).await.unwrap();

        let frame = ReplyFrame::read_from(&mut reader, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();

        let parsed = match frame {
            ReplyFrame::Message(parsed) => parsed,
            other => panic!("expected OP_MSG, got {:?}", other),
        };

        assert_eq!(parsed.request_id, 21);
        assert!(parsed.flags.contains(MessageFlags::EXHAUST_ALLOWED));
        assert_eq!(
            bson_util::raw_to_document(&parsed.document_payload).unwrap(),
            body
        );
        assert_eq!(parsed.document_sequences.len(), 1);
        assert_eq!(parsed.document_sequences[0].identifier, "documents");
        let docs: Vec<_> = parsed.document_sequences[0]
            .documents
            .iter()
            .map(|d| bson_util::raw_to_document(d).unwrap())
            .collect();
        assert_eq!(docs, batch);
    }

    #[tokio::test]
    async fn oversize_frames_are_refused() {
        let message = Message {
            request_id: 1,
            response_to: 0,
            flags: MessageFlags::empty(),
            document_payload: bson_util::to_raw_document_buf(&doc! { "ping": 1 }).unwrap(),
            document_sequences: Vec::new(),
            checksum: None,
        };

        let (mut writer, mut reader) = tokio::io::duplex(1024 * 1024);
        message.write_to(&mut writer).await.unwrap();

        let err = ReplyFrame::read_from(&mut reader, 16).await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::Protocol { .. }));
    }
}
