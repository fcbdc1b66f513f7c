//! Offline-first document synchronization for a collaborative whiteboard.
//!
//! Every document operation writes the local SQLite store first. When the
//! remote store is reachable the write also goes to the server and the local
//! copy is marked synced; otherwise the mutation is queued and replayed once
//! connectivity returns. Conflicts resolve last-write-wins on `updated_at`.
//! While a document is open, record-level edits travel between sessions
//! through a best-effort realtime relay.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`access`] | Document access layer: routes each operation local or remote |
//! | [`store`] | Local document, asset and queue persistence |
//! | [`db`] | SQLite pool and migrations |
//! | [`sync`] | Pending-mutation queue and its drain |
//! | [`remote`] | Remote store contract and REST client |
//! | [`relay`] | Realtime operation relay and its transports |
//! | [`canvas`] | In-memory record set of the open document |
//! | [`autosave`] | Debounced save of the open canvas |
//! | [`assets`] | Asset reference resolution |
//! | [`session`] | Wires the pieces together for one user |
//! | [`state`] | Shared context handed to every component |
//! | [`connectivity`] | Online/offline and visibility signals |
//! | [`notice`] | User-facing notifications |
//! | [`debounce`] | Timing primitives |
//! | [`model`] | Documents, ids, patches, queued mutations |
//! | [`config`] | Environment configuration |
//! | [`error`] | Shared error classification |

pub mod access;
pub mod assets;
pub mod autosave;
pub mod canvas;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod debounce;
pub mod error;
pub mod model;
pub mod notice;
pub mod relay;
pub mod remote;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;

#[cfg(test)]
#[path = "fixtures_test.rs"]
pub(crate) mod fixtures;
