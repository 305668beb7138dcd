//! Session module for Scopekeeper
//!
//! Sessions are reference-counted units of server-side state shared by every
//! scope (request or fan-out item) that references them. The registry owns
//! them, the sweeper reclaims expired ones, and leases give scopes a
//! release-once handle on their reference.

pub mod fanout;
pub mod lease;
pub mod metrics;
pub mod order;
pub mod registry;
pub mod sweeper;
pub mod types;

pub use fanout::{FanoutReport, ItemOutcome, ItemResult};
pub use lease::ScopeLease;
pub use order::{Order, OrderItemRecord, OrderSnapshot};
pub use registry::{EndOutcome, SessionEndHook, SessionRegistry};
pub use sweeper::{ExpirationSweeper, SweepReport, SweeperHandle};
pub use types::{ConversationMessage, Session, SessionId, SessionIdentity, SessionSnapshot};
