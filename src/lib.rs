//! Recetario — client core for a recipe-sharing app with realtime chat.
//!
//! ARCHITECTURE
//! ============
//! Every hard capability is delegated to a hosted backend: managed auth,
//! relational tables behind a PostgREST-style HTTP API, object storage for
//! recipe photos, and a server-push change feed. This crate is the client
//! orchestration layer on top of those contracts:
//!
//! - `backend` — trait seams for the external collaborators (`DataApi`,
//!   `EventFeed`, `ObjectStore`, `AuthApi`) plus the production REST and
//!   websocket clients and an in-memory fake for tests.
//! - `services` — the domain layer: chat message relay, typing-presence
//!   aggregation with timeout eviction, recipe CRUD, session glue.
//! - `event` — the insert-event type every feed consumer shares.
//! - `prefs` — local string flag store for session persistence.
//!
//! DESIGN
//! ======
//! Components never touch a shared global SDK handle. Each one is handed the
//! clients it needs at construction, so any of them runs against the
//! in-memory fake in isolation. Subscriptions are single-task consumers:
//! one spawned task per watched table multiplexes feed events and its own
//! timer, and owns all mutable state for that subscription.

pub mod backend;
pub mod event;
pub mod prefs;
pub mod services;
