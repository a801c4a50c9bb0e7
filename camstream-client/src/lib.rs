//! # camstream-client: capture producer
//!
//! Opens a Video4Linux2 device (or the in-memory synthetic camera),
//! maps its buffers and streams every captured frame, unframed, to a
//! camstream collector over TCP.

pub mod config;
pub mod session;
