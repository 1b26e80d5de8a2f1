//! # Code Duel
//!
//! A server pairing players for timed head-to-head coding duels.
//!
//! It provides:
//! - A FIFO matchmaking queue pairing players as they arrive
//! - Sessions holding exactly two players and a randomly drawn task
//! - Live relay of each player's code to their opponent
//! - Verification of submissions: the C source is embedded in a generated harness, compiled and
//!   run against the task's test vectors with hard time and memory budgets
//! - Confinement of untrusted code through Linux cgroups v2, `prlimit`, and network and mount
//!   namespaces
//!
//! The first submission verified correct wins. A player whose opponent disconnects wins by
//! walkover.
//!
//! # Documentation Overview
//!
//! - The core state machine and event routing live in [`lobby`]; sessions in [`session`].
//! - Inbound and outbound events are described in [`protocol`].
//! - Verification is handled by [`verifier`], tuned with [`constraints`] and
//!   [`Configuration`](crate::configuration::Configuration).
//! - [`server`] is the TCP transport. Other transports implement
//!   [`ClientChannel`](crate::channel::ClientChannel).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::{net::TcpListener, sync::Arc};
//!
//! use code_duel::prelude::*;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_run_timeout(std::time::Duration::from_secs(2))
//!         .build()?;
//!
//!     // Run even if cgroup v2, prlimit or unshare are not available
//!     let config = Configuration::new().with_allow_uncontained(true);
//!
//!     let workers = constraints.workers();
//!     let verifier = Verifier::new(&config, constraints)?;
//!     let lobby = Lobby::new(
//!         TaskCatalog::builtin()?,
//!         Arc::new(verifier),
//!         workers,
//!         StdRng::from_os_rng(),
//!     )?;
//!
//!     serve(TcpListener::bind(config.bind())?, lobby)
//! }
//! ```
//!
//! # Protocol
//!
//! Every frame is a JSON object on its own line, tagged by `type`:
//!  * Player -> Server : `join_queue`, `code_update`, `submit_solution`, `ping`
//!  * Server -> Player : `queue_joined`, `game_started`, `opponent_code_update`,
//!    `checking_solution`, `solution_incorrect`, `game_result`, `opponent_disconnected`,
//!    `error`, `pong`

mod cgroup_manager;
pub use anyhow;
pub mod channel;
pub mod configuration;
pub mod constraints;
pub mod error;
pub mod lobby;
pub mod logger;
pub mod matchmaking;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod task_catalog;
pub mod verifier;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use code_duel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{ClientChannel, MemoryChannel};
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::lobby::{Client, Lobby};
    pub use crate::logger::init_logger;
    pub use crate::protocol::{ClientEvent, ServerEvent};
    pub use crate::server::serve;
    pub use crate::task_catalog::TaskCatalog;
    pub use crate::verifier::{Judge, Verdict, Verifier};
}
