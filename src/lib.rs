//! A protocol-description-driven packet decoding engine.
//!
//! A [`db::ProtocolDb`] describes a set of protocols as a graph of
//! elements (fields, containers, expressions, templates); [`dispatch`]
//! walks a packet's bytes against that graph, handing each protocol's
//! fields to [`decode`] and building a [`tree::DetailTree`] plus an
//! optional [`summary::SummaryRecord`] per packet. Runtime state that
//! outlives a single field (`$variables`, lookup tables) lives in
//! [`variables`] and [`lookup`].
//!
//! Building the protocol-description database from an on-disk format,
//! rendering the resulting tree/summary into final text, and packet
//! capture I/O are all out of scope: callers supply a [`db::ProtocolDb`]
//! and a [`packet::PacketContext`] and consume the [`dispatch::DecodeResult`]
//! themselves.

pub mod arena;
pub mod config;
pub mod cursor;
pub mod db;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod lookup;
pub mod packet;
pub mod plugins;
pub mod render;
pub mod summary;
pub mod template;
pub mod tree;
pub mod variables;

pub use config::DecoderConfig;
pub use db::ProtocolDb;
pub use dispatch::{decode_packet, DecodeResult};
pub use error::{DecodeError, Error, Status};
pub use lookup::LookupTableStore;
pub use packet::PacketContext;
pub use plugins::{DefaultNativeFunctions, NoExternalCalls};
pub use variables::VariableStore;
