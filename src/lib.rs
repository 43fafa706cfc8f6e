//! # Split-flow transport client
//!
//! Builds one logical duplex connection to a covert station out of two
//! ordinary-looking TLS sessions towards the same decoy host: a reader flow
//! for the download direction and a writer flow for the upload direction.
//! The station, watching passively, pairs them by their shared correlation id.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Application                        │
//! ├─────────────────────────────────────────────────────────┤
//! │  DualConn (reads → reader flow, writes → writer flow)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  DualDialer (yield / acquire handshake, close watcher)   │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Reader flow (GET-incompl) │  Writer flow (POST-incompl)│
//! ├────────────────────────────┴────────────────────────────┤
//! │  Station transport (tagging, station handshake, decoy)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Shared identity**: both flows carry the same correlation id and station key
//! 2. **Same decoy**: the writer is pinned to the decoy the reader used
//! 3. **Ordered hand-over**: the reader yields upload before the writer exists
//! 4. **Symmetric teardown**: either flow closing closes the other

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod assets;
pub mod crypto;
pub mod dual;
pub mod error;
pub mod flow;
pub mod latch;
pub mod session;

pub use assets::{AssetStore, Assets};
pub use dual::{DualConn, DualDialer};
pub use error::{Error, HandshakeStep, Result};
pub use flow::{
    CorrelationId, CustomDialer, DecoySpec, Flow, FlowFactory, FlowRole, RawFlow,
    SharedStream, StationTransport, StreamFlow, StreamFlowFactory, TagKind,
};
pub use latch::CloseLatch;
pub use session::{SessionCounter, SessionId};
