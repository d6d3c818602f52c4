use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{
    bson::{Bson, Document, RawDocument, RawDocumentBuf},
    error::{Error, Result},
};

/// Encodes a `Document` into an owned raw document, ready for the wire.
pub(crate) fn to_raw_document_buf(document: &Document) -> Result<RawDocumentBuf> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    RawDocumentBuf::from_bytes(bytes)
        .map_err(|e| Error::internal(format!("serialized document was not valid BSON: {}", e)))
}

/// Decodes a raw document received from the wire into a `Document`.
pub(crate) fn raw_to_document(raw: &RawDocument) -> Result<Document> {
    Ok(bson::from_slice(raw.as_bytes())?)
}

/// Coerces numeric types into an `i64` if it can be done without losing any precision.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// The command name is always the first key of a command document.
pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Reads a single complete BSON document's raw bytes, length prefix included.
pub(crate) fn read_document_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let length = reader.read_i32::<LittleEndian>()?;
    if length < 5 {
        return Err(Error::protocol(format!(
            "invalid document length: {}",
            length
        )));
    }

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length.to_le_bytes());

    reader.take(length as u64 - 4).read_to_end(&mut bytes)?;
    if bytes.len() != length as usize {
        return Err(Error::protocol(
            "unexpected end of stream while reading a document",
        ));
    }

    Ok(bytes)
}

/// Reads a NUL-terminated UTF-8 string, consuming the terminator.
pub(crate) fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8];
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }

    String::from_utf8(bytes).map_err(|_| Error::protocol("cstring is not valid UTF-8"))
}

#[cfg(test)]
mod test {
    use super::get_int;
    use crate::bson::{oid::ObjectId, Bson};

    #[test]
    fn get_int_coerces_numeric_types() {
        assert_eq!(get_int(&Bson::Int32(1)), Some(1));
        assert_eq!(get_int(&Bson::Int64(1)), Some(1));
        assert_eq!(get_int(&Bson::Double(1.0)), Some(1));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".to_string())), None);
    }

    // The codec's ObjectId generator is process-wide: a 4-byte big-endian timestamp followed
    // by a per-process random and a wrapping 3-byte counter that increments once per id.
    #[test]
    fn object_id_counters_are_monotonic() {
        let ids: Vec<ObjectId> = (0..1_000).map(|_| ObjectId::new()).collect();

        for pair in ids.windows(2) {
            let (first, second) = (pair[0].bytes(), pair[1].bytes());

            let first_time = u32::from_be_bytes([first[0], first[1], first[2], first[3]]);
            let second_time = u32::from_be_bytes([second[0], second[1], second[2], second[3]]);
            assert!(second_time >= first_time);

            let first_counter =
                u32::from_be_bytes([0, first[9], first[10], first[11]]);
            let second_counter =
                u32::from_be_bytes([0, second[9], second[10], second[11]]);
            assert_eq!((second_counter + (1 << 24) - first_counter) % (1 << 24), 1);
        }
    }
}
