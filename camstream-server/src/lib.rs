//! # camstream-server: frame collector
//!
//! Accepts one producer at a time, stores its byte stream as
//! `<output_dir>/<descriptor>`, counts JPEG start markers and, when
//! enabled, hands the finished file to an external transcoder.

pub mod config;
pub mod service;
