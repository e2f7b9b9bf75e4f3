//! Weighted, reaction-driven vote sessions.
//!
//! This crate holds the pure part of the voting engine:
//! - **Session** state machine (`VoteSession`): ballots, tally, thresholds
//!   and the `Open -> Closed` lifecycle
//! - **Rendering** (`RenderSpec`): what a tracking message should display
//! - **Effects** (`Effect`): what must happen when a session closes
//!
//! Persistence, concurrency and platform I/O live in `squid-server`.

pub mod effect;
pub mod ids;
pub mod render;
pub mod session;

pub use effect::*;
pub use ids::*;
pub use render::*;
pub use session::*;
