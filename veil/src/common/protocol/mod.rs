// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire codecs, destinations, and the dispatch seam between inbound and outbound sides

// Session stages:
//
// - ("Inbound" side)
// - accept a connection from a peer
// - decode (tag, destination) from its header; the tag resolves the identity
// - (Dispatcher)
// - produce a link toward the destination, for the pump to relay against
// - (Outbound side)
// - dial the destination and pump the link against it
//
// Authentication happens inside header decoding, before the destination is parsed

pub mod address;
pub mod freedom;
pub mod packet;
pub mod tagged;
mod traits;

pub use address::{Address, Destination, DestinationParseError, Network};
pub use traits::{
  BoxedAsyncRead, BoxedAsyncWrite, CodecError, DispatchError, Dispatcher, FramingError,
  InboundCodec, RequestHeader,
};
