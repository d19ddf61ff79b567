//! # Traffic-Control Translation
//!
//! This crate turns declarative link-quality settings into the `tc` command
//! invocations that realise them on a virtual ethernet endpoint. It owns three
//! concerns:
//!
//! - the suffixed-number grammar shared by rates, sizes and durations
//!   ([`number::Number64`]),
//! - the constraint-group model attached to topology connections
//!   ([`constraint::LinkConstraints`]),
//! - the translation of a constraint group into an ordered qdisc chain
//!   ([`qdisc::qdisc_commands`]).
//!
//! ## Qdisc layout
//!
//! A constraint group maps onto at most two qdiscs on the node-side interface:
//!
//! ```text
//! tbf root (1:)            rate / burst / limit       [when rate is set]
//!   └── netem (2:)         delay / jitter / loss      [when any are set]
//! ```
//!
//! The token bucket sits at the root so that delay and loss act on traffic
//! that has already been shaped; with no rate limit the netem qdisc takes the
//! root position itself.

pub mod constraint;
pub mod number;
pub mod qdisc;

pub use constraint::{ConstraintError, LinkConstraints, RateLimit};
pub use number::{Number64, NumberError};
pub use qdisc::qdisc_commands;
