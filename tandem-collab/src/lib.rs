//! # tandem-collab — multi-room relay for collaborative editing
//!
//! ```text
//! ┌──────────────┐      WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │     JSON frames     │ (relay)      │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Replica      │                     │ RoomRegistry │
//! │ (WOOT doc)   │                     │ name → Room  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                      ┌──────┴───────┐
//!                                      │ClientRegistry│
//!                                      │ (per room)   │
//!                                      └──────────────┘
//! ```
//!
//! The relay is content-agnostic: it assigns site identifiers, arranges
//! a one-shot snapshot for each newcomer, and fans operation frames out
//! to the other members of the sender's room. Convergence happens on the
//! clients, inside [`tandem_crdt::Replica`].
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`registry`] — per-room client monitor and broadcast primitives
//! - [`rooms`] — room creation and lookup
//! - [`server`] — connection handling and message routing
//! - [`client`] — sync client owning a document replica

pub mod client;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod server;

pub use client::{ClientConfig, ClientError, ClientEvent, CollabClient};
pub use protocol::{Message, MessageKind, ProtocolError};
pub use registry::{Client, ClientRegistry};
pub use rooms::{Room, RoomRegistry};
pub use server::{CollabServer, ServerConfig};
