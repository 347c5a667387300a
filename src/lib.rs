//! Core library for the scope_daq acquisition session.
//!
//! The session sits between an operator surface and a microscope driver. It
//! keeps the desired instrument settings, reconciles them with what the
//! instrument last applied, and schedules captures for the live, scout,
//! survey and acquisition modes. The driver is reached only through the
//! [`hardware::Microscope`] trait; [`hardware::mock`] provides a simulated
//! one for tests and the headless binary.

pub mod autofocus;
pub mod config;
pub mod error;
pub mod hardware;
pub mod messages;
pub mod mode;
pub mod navigation;
pub mod observable;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod timers;
pub mod tracing_setup;

pub use error::{AppResult, DaqError};
pub use messages::{SessionHandle, SessionRequest};
pub use session::actor::spawn_session;
pub use session::Session;
