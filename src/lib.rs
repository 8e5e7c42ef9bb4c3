//! Chunked large-file uploads.
//!
//! The server side accepts a file as a sequence of small multipart chunks,
//! reassembles it once every ordinal has arrived and writes it to a storage
//! sink under a unique key. The client side slices files into chunks, splits
//! files above the object ceiling into independently stored parts, and can
//! push files straight to Google Drive with the resumable protocol.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
