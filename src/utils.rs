use anyhow::{bail, Context, Result};
use prost::Message;

/// Encode the given u32 as an array of big-endian bytes.
pub fn encode_u32(val: u32) -> [u8; 4] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u32.
pub fn decode_u32(val: &[u8]) -> Result<u32> {
    match val {
        [b0, b1, b2, b3] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => bail!("invalid byte array given to decode as u32, invalid len {} needed 4", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding object from storage")
}
