//! Code extraction service.
//!
//! Accepts multi-page PDF documents, renders their pages, locates and decodes
//! machine-readable codes on them and reports per-page polygons, bounding
//! boxes and payloads. Page work runs on a pool whose size follows live CPU
//! and memory load.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
