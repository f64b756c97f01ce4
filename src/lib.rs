//! codetap - transparent observability wrapper for AI-assistant CLIs
//!
//! Spawns the underlying tool as a child process and passes its output
//! through byte-for-byte, while a parallel tap reassembles the structured
//! records it emits and fans them out to plugins and a SQLite store. The
//! [`direct`] module offers the same pipeline to in-process callers that
//! don't want a child process.
//!
//! # Architecture
//!
//! ```text
//! child stdout/stderr ──► StreamSplitter ──► parent stdout/stderr
//!                              │ (tap, drops on overflow)
//!                              ▼
//!                         FrameParser ──► EventBus ──► PluginHost
//!                                                          │
//!                                                          ▼
//!                                               BatchWriter ──► Store
//! ```

pub mod batch;
pub mod bus;
pub mod child;
pub mod cli;
pub mod config;
pub mod direct;
pub mod events;
pub mod frame;
pub mod logging;
pub mod orchestrator;
pub mod plugins;
pub mod pricing;
pub mod splitter;
pub mod store;
