//! Assignment resolution engine for the feedback portal, exposed by the
//! `feedbackd` sidecar. The library target exists so the engine can be
//! embedded and tested in-process.

pub mod cache;
pub mod db;
pub mod ident;
pub mod ipc;
pub mod resolve;
pub mod tasks;
