//! Anti-bot clearance token management
//!
//! One provider's HTTP path sits behind a browser challenge. An external
//! solver (FlareSolverr) passes the challenge and hands back a short-lived
//! `cf_clearance` cookie bound to the user agent that solved it. This crate
//! keeps one such token current for the whole process:
//!
//! 1. `Refresher::token()` returns the current token, refreshing first when
//!    it is missing, expired or was reported as rejected
//! 2. `Refresher::force_refresh()` is called by dispatch after upstream
//!    served a challenge page despite the token
//! 3. `spawn_refresh_task` keeps the token warm in the background, backing
//!    off while the solver is failing
//!
//! Concurrent callers never trigger more than one solve at a time.

pub mod error;
pub mod refresher;
pub mod solver;

pub use error::{Error, Result};
pub use refresher::{
    ClearanceState, ClearanceStatus, Lease, Refresher, RefresherConfig, next_delay, spawn_refresh_task,
};
pub use solver::{FlareSolverr, Solved, Solver};
