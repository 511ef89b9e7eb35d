//! # Persistence Module
//!
//! Two stores back the assistant:
//!
//! - **SQLite database** (`database.rs` and the repositories) for connection
//!   profiles, saved commands, automation rules, subscriptions and message
//!   history. The foreground owns the only writing connection; history reads
//!   on background workers open a private read-only connection each.
//! - **Settings file** (`config_portal.rs`), a small TOML document with the
//!   scalar settings, shared through the [`ConfigPortal`](config_portal::ConfigPortal).
//!
//! Storage faults are reported as [`StoreError`](error::StoreError). Callers on
//! the message path log them and carry on; reads substitute an empty result.

pub mod commands;
pub mod config_portal;
pub mod database;
pub mod error;
pub mod messages;
pub mod profiles;
pub mod rules;
pub mod schema;
pub mod subscriptions;

use database::Database;

/// All repositories over one foreground database handle.
#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn messages(&self) -> messages::MessageRepo {
        messages::MessageRepo::new(self.db.clone())
    }

    pub fn profiles(&self) -> profiles::ProfileRepo {
        profiles::ProfileRepo::new(self.db.clone())
    }

    pub fn rules(&self) -> rules::RuleRepo {
        rules::RuleRepo::new(self.db.clone())
    }

    pub fn subscriptions(&self) -> subscriptions::SubscriptionRepo {
        subscriptions::SubscriptionRepo::new(self.db.clone())
    }

    pub fn commands(&self) -> commands::CommandRepo {
        commands::CommandRepo::new(self.db.clone())
    }
}
