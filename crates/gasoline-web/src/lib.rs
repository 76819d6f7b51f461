//! HTTP and stdio front ends of the gasoline bridge: the extension-facing
//! ingest routes, the correlator endpoints and the MCP tool surface.

pub mod api;
pub mod app;
pub mod config;
pub mod lifecycle;
pub mod mcp;
pub mod stdio;
pub mod util;
