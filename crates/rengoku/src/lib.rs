//! # rengoku
//!
//! Keep-alive process supervisor.
//!
//! Each configured process is launched after an optional delay, polled at a
//! fixed interval and relaunched whenever it is found not running. Stale
//! instances of the same executable are cleaned up before the first launch.
//! All timer callbacks run on one background scheduler thread.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rengoku::{ProcessSpec, Scheduler, Supervisor};
//!
//! let scheduler = Scheduler::new().unwrap();
//! scheduler.start().unwrap();
//!
//! let sup = Supervisor::new(scheduler.clone());
//! let mut spec = ProcessSpec::new("worker", "/usr/local/bin/worker", "worker --serve");
//! spec.interval_secs = 2;
//! sup.start(&[spec]).unwrap();
//!
//! for status in sup.status(None) {
//!     println!("{} pid={} {:?}", status.name, status.pid, status.status);
//! }
//!
//! sup.stop();
//! scheduler.stop();
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod managed;
pub mod scheduler;
pub mod supervisor;
pub mod types;

pub use config::{Config, DaemonConfig};
pub use directory::ProcessDirectory;
pub use error::{Error, Result};
pub use managed::{ManagedProcess, Phase};
pub use scheduler::{Scheduler, TimerId};
pub use supervisor::Supervisor;
pub use types::*;
