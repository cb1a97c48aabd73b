//! Core types shared by the Remora dispatcher, its transports and its tools.
//!
//! This crate holds plain data: identifiers, object introspection, values,
//! configuration and the shared error type. It contains no runtime logic.

pub mod config;
pub mod error;
pub mod event;
pub mod object;
