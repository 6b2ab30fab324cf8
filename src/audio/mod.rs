//! Audio output
//!
//! The playback engine talks to a blocking [`AudioSink`]; the production
//! implementation is cpal-backed.

mod sink;

pub use sink::{AudioSink, CpalSink};
