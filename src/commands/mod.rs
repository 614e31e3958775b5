//! # Commands Module
//!
//! This module contains the command handlers for codedrop:
//!
//! ## `send`
//! Encrypts and uploads a file:
//! - Probes the listed servers and picks the fastest one with room
//! - Regular mode: mints a 6-digit code, derives the key from it, streams
//!   sealed 256 KiB chunks
//! - Secure mode: generates a 256-bit key the server never sees; the server
//!   mints the code
//!
//! ## `get`
//! Downloads and decrypts a file by code:
//! - Finds the server from the code's first digit
//! - Decrypts with the code-derived key, or prompts for the secure-mode key
//! - Verifies the plaintext SHA-256 before keeping the file
//!
//! ## `server`
//! Runs a relay server:
//! - Stores sealed blobs on disk under their codes
//! - Expires blobs after the retention window, rate-limits downloads
//! - Optionally serves a browser download page
//!
//! ## `bench`
//! Measures throughput to a server in both directions.

pub mod bench;
pub mod get;
pub mod send;
pub mod server;
