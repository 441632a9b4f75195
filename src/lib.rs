//! # Software Bus Network
//!
//! Links the local software bus of one flight processor to the buses of its
//! peers, so an application subscribing to a message id receives it no matter
//! which CPU published it.
//!
//! ## Features
//!
//! - **Peer protocol**: announce / heartbeat link supervision per peer
//! - **Subscription mirroring**: local subscriptions are forwarded to every
//!   connected peer, remote ones are installed on private peer pipes
//! - **Transports**: UDP/IPv4, serial, shared memory and SpaceWire behind one
//!   [`transport::Transport`] trait
//! - **Ground commands**: no-op, counter reset, peer list, peer status and
//!   peer reset, plus JSON housekeeping telemetry
//!
//! ## Quick Start
//!
//! ```rust
//! use sbn::{Engine, EngineConfig, LocalBus, TransportRegistry};
//!
//! let config = EngineConfig::default();
//! let mut engine = Engine::new(config, LocalBus::new(), TransportRegistry::new(), Vec::new()).unwrap();
//!
//! // One main-loop pass at t = 0 s.
//! engine.tick(0);
//! assert_eq!(engine.housekeeping().counters.cmd_count, 0);
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Main loop, peer state machine and subscription propagation
//! - [`wire`] - SBN frame header and subscription payload codec
//! - [`bus`] - Software bus trait and the in-process [`LocalBus`]
//! - [`transport`] - Link technologies
//! - [`peer_file`] - Peer file parser
//! - [`commands`] / [`telemetry`] - Ground interface

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::similar_names)]

pub mod bus;
pub mod commands;
pub mod config;
pub mod engine;
pub mod events;
pub mod msgids;
pub mod peer;
pub mod peer_file;
pub mod subscriptions;
pub mod telemetry;
pub mod transport;
pub mod wire;

// Re-export main public types for convenience
pub use bus::{BusMessage, LocalBus, SenderId, SoftwareBus};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use peer::{PeerState, PeerName};
pub use transport::{Transport, TransportRegistry};
pub use wire::{Frame, MsgType, Qos};
