//! Relay Client - Stream Controller
//!
//! Consumer side of the relay daemon. A view asks the [`StreamController`]
//! to generate a message and renders the [`StreamEvent`]s it gets back; after
//! a reload, [`StreamController::reconcile`] finds messages still generating
//! elsewhere and follows them through the resume endpoint instead of starting
//! a second generation.
//!
//! # Module Overview
//!
//! - [`controller`]: phases, badges and the generate/resume/cancel flows
//! - [`session`]: local session registry with age-based eviction
//! - [`transport`]: daemon calls (`reqwest` implementation and trait seam)

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod controller;
pub mod error;
pub mod session;
pub mod transport;

pub use controller::{
    ControllerSettings, StreamController, StreamEvent, StreamPhase, TerminalBadge,
};
pub use error::ClientError;
pub use session::{SessionRegistry, StreamSession};
pub use transport::{HttpTransport, StartRequest, StreamTransport, TextStream, Utf8Decoder};
