//! # Session Layer
//!
//! One execution context per connection profile, owned by the
//! [`SessionManager`](manager::SessionManager).
//!
//! ```text
//!                 SessionCommand (try_send)           SessionEvent (ordered)
//! SessionManager ─────────────────────────► session task ─────────────────────► SessionManager
//!       │                                   (TransportWorker)                        │
//!       │                                                                            ├─► Store
//!       └─► AutomationEngine ◄── bound to the active session                         ├─► UiEvent broadcast
//!                                                                                    └─► unread counters
//! ```
//!
//! Commands never wait on a session, so a stalled connect on one profile
//! cannot block the foreground or any other profile.

pub mod error;
pub mod events;
pub mod manager;
pub mod session;
