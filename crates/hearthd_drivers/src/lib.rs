//! Script-backed device drivers and trigger dispatch for hearthd.
//!
//! Driver scripts are run by an embedded scripting engine, described here
//! only through the [`script::ScriptEngine`] trait. This crate turns those
//! scripts into persistent, introspectable device plugins ([`driver`]),
//! derives and enforces their configuration schemas ([`schema`]) and lets
//! scripts register callbacks on timers, broker messages and job
//! termination ([`dispatch`]).

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod schema;
pub mod script;
