//! # Dynamic Protobuf Codec
//!
//! Implements `tonic::codec::Codec` over `prost_reflect::DynamicMessage`, so `tonic` can carry
//! messages of any type described by the registry without generated Rust structs.
//!
//! The encoder writes the message as-is; the decoder reads bytes into a fresh message of the
//! type expected from the peer. The same codec serves both ends of a call: a client decodes
//! the method's output, a server decodes its input.
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

pub struct DynamicCodec {
    /// Schema for the messages read from the peer.
    incoming: MessageDescriptor,
    side: Side,
}

impl DynamicCodec {
    /// Codec for calling a backend: decodes responses of type `response`.
    pub fn new(response: MessageDescriptor) -> Self {
        Self {
            incoming: response,
            side: Side::Client,
        }
    }

    /// Codec for serving a method: decodes requests of type `request`.
    pub fn server(request: MessageDescriptor) -> Self {
        Self {
            incoming: request,
            side: Side::Server,
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;

    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder(self.side)
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.incoming.clone(), self.side)
    }
}

pub struct DynamicEncoder(Side);

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let what = match self.0 {
            Side::Client => "request",
            Side::Server => "response",
        };
        item.encode(dst)
            .map_err(|e| Status::internal(format!("Failed to encode {what}: {e}")))
    }
}

pub struct DynamicDecoder(MessageDescriptor, Side);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.0.clone(), src).map_err(|e| match self.1 {
            Side::Client => Status::internal(format!(
                "Backend response does not match '{}': {e}",
                self.0.full_name()
            )),
            Side::Server => Status::invalid_argument(format!(
                "Request does not match '{}': {e}",
                self.0.full_name()
            )),
        })?;

        Ok(Some(msg))
    }
}
