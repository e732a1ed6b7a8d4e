// JSON value codec shared by every collection; bytes are stored verbatim in BLOB columns.
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::error::{Error, ErrorKind};

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|err| {
        Error::new(ErrorKind::Codec)
            .with_message("encode value")
            .with_source(err)
    })
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|err| {
        Error::new(ErrorKind::Codec)
            .with_message("decode value")
            .with_source(err)
    })
}
