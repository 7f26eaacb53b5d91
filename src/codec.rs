//! Bidirectional mapping between [`Message`] and the wire frame:
//! `[4-byte LE length N][1 tag byte][N-1 bytes JSON payload]`.

use {
  crate::{
    error::Error,
    wire::{
      Disconnect,
      ForwardJoin,
      Join,
      Message,
      Neighbor,
      NeighborReply,
      Shuffle,
      ShuffleReply,
    },
  },
  asynchronous_codec::{Decoder, Encoder},
  bytes::{Buf, BufMut, Bytes, BytesMut},
};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Stateless length-delimited JSON framer. One instance is reused across
/// the lifetime of a connection; `decode` is re-entrant and accumulates
/// partial frames in the caller-owned `BytesMut`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Codec {
  /// Encodes a single message to a standalone frame, length prefix
  /// included. Used for one-shot sends that don't go through a
  /// persistent [`Encoder`]-driven write loop (e.g. shuffle replies).
  pub fn encode_frame(&self, msg: &Message) -> Result<Bytes, Error> {
    let mut dst = BytesMut::new();
    let mut codec = *self;
    Encoder::encode(&mut codec, msg.clone(), &mut dst)?;
    Ok(dst.freeze())
  }
}

impl Encoder<Message> for Codec {
  type Error = Error;

  fn encode(
    &mut self,
    item: Message,
    dst: &mut BytesMut,
  ) -> Result<(), Self::Error> {
    let tag = item.tag();
    let payload = serde_json::to_vec(&item)
      .map_err(|e| Error::Decode(format!("encode {}: {e}", item.kind())))?;

    let frame_len = 1 + payload.len();
    dst.reserve(LENGTH_PREFIX_SIZE + frame_len);
    dst.put_u32_le(frame_len as u32);
    dst.put_u8(tag);
    dst.put_slice(&payload);
    Ok(())
  }
}

impl Decoder for Codec {
  type Item = Message;
  type Error = Error;

  fn decode(
    &mut self,
    src: &mut BytesMut,
  ) -> Result<Option<Self::Item>, Self::Error> {
    if src.len() < LENGTH_PREFIX_SIZE {
      return Ok(None);
    }

    let frame_len =
      u32::from_le_bytes(src[..LENGTH_PREFIX_SIZE].try_into().unwrap())
        as usize;

    if src.len() < LENGTH_PREFIX_SIZE + frame_len {
      src.reserve(LENGTH_PREFIX_SIZE + frame_len - src.len());
      return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    let mut frame = src.split_to(frame_len);

    if frame.is_empty() {
      return Err(Error::Decode("empty frame".into()));
    }
    let tag = frame.get_u8();
    decode_payload(tag, &frame).map(Some)
  }
}

fn decode_payload(tag: u8, payload: &[u8]) -> Result<Message, Error> {
  macro_rules! from_json {
    ($variant:ident, $ty:ty) => {
      serde_json::from_slice::<$ty>(payload)
        .map(Message::$variant)
        .map_err(|e| Error::Decode(format!("{}: {e}", stringify!($variant))))
    };
  }

  match tag {
    0 => from_json!(Join, Join),
    1 => from_json!(ForwardJoin, ForwardJoin),
    2 => from_json!(Disconnect, Disconnect),
    3 => from_json!(Neighbor, Neighbor),
    4 => from_json!(NeighborReply, NeighborReply),
    5 => from_json!(Shuffle, Shuffle),
    6 => from_json!(ShuffleReply, ShuffleReply),
    other => Err(Error::UnknownTag(other)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(msg: Message) {
    let codec = Codec;
    let mut buf = BytesMut::new();
    let mut enc = codec;
    Encoder::encode(&mut enc, msg.clone(), &mut buf).unwrap();

    let mut dec = codec;
    let decoded = Decoder::decode(&mut dec, &mut buf).unwrap().unwrap();
    assert_eq!(decoded, msg);
    assert!(buf.is_empty());
  }

  #[test]
  fn round_trips_every_variant() {
    roundtrip(Message::Join(Join {
      node_id: "a".into(),
      listen_address: "127.0.0.1:9001".into(),
    }));
    roundtrip(Message::ForwardJoin(ForwardJoin {
      node_id: "b".into(),
      listen_address: "127.0.0.1:9002".into(),
      ttl: 3,
    }));
    roundtrip(Message::Disconnect(Disconnect {
      node_id: "c".into(),
    }));
    roundtrip(Message::Neighbor(Neighbor {
      node_id: "d".into(),
      listen_address: "127.0.0.1:9003".into(),
      high_priority: true,
    }));
    roundtrip(Message::NeighborReply(NeighborReply {
      node_id: "e".into(),
      listen_address: "127.0.0.1:9004".into(),
      accepted: false,
    }));
    roundtrip(Message::Shuffle(Shuffle {
      node_id: "f".into(),
      listen_address: "127.0.0.1:9005".into(),
      nodes: vec![],
      ttl: 2,
    }));
    roundtrip(Message::ShuffleReply(ShuffleReply {
      received_nodes: vec![],
      nodes: vec![],
    }));
  }

  #[test]
  fn decode_waits_for_full_frame() {
    let mut codec = Codec;
    let msg = Message::Disconnect(Disconnect {
      node_id: "partial".into(),
    });
    let mut full = BytesMut::new();
    Encoder::encode(&mut codec, msg, &mut full).unwrap();

    let mut partial = BytesMut::from(&full[..full.len() - 1]);
    assert!(Decoder::decode(&mut codec, &mut partial).unwrap().is_none());
  }

  #[test]
  fn unknown_tag_is_a_decode_error() {
    let mut codec = Codec;
    let mut buf = BytesMut::new();
    buf.put_u32_le(2);
    buf.put_u8(255);
    buf.put_u8(0);
    let err = Decoder::decode(&mut codec, &mut buf).unwrap_err();
    assert!(matches!(err, Error::UnknownTag(255)));
  }
}
