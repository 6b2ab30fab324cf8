//! # ramcd
//!
//! Bit-perfect CD audio player for small single-board Linux hosts.
//!
//! **Purpose:** Deliver the PCM samples on an audio CD to the DAC with
//! byte-for-byte fidelity, with classic transport controls and two
//! acquisition strategies: whole-disc extraction into RAM with error
//! correction, or direct streaming through an external media engine.
//!
//! **Architecture:** A [`controller::Controller`] composes one
//! [`sequencer::TrackSequencer`] with exactly one
//! [`transport::AudioTransport`] (RAM or streaming) and dispatches
//! domain events over a listener bus. Preemptive threads with explicit
//! synchronisation; no global event loop.

pub mod audio;
pub mod config;
pub mod controller;
pub mod disc;
pub mod error;
pub mod events;
pub mod mcub;
pub mod sequencer;
pub mod source;
pub mod transport;

pub use controller::Controller;
pub use error::{Error, Result};
