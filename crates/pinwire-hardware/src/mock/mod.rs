//! In-memory GPIO backend.
//!
//! [`MockBackend`] hands out lines whose external levels and edges are driven
//! from a [`MockBackendHandle`], so pins and decoders can be tested without a
//! board.

pub mod line;

pub use line::{MockBackend, MockBackendHandle, MockEvent, MockLine};
