//! Reference handlers.
//!
//! These are small application services useful for trying the stream layer
//! out; real deployments supply their own [`Handler`](crate::Handler)s.

mod echo;

pub use echo::{LineEchoHandler, LINE_ECHO};
