//! DAQ Runtime - Process lifecycle for acquisition workers
//!
//! Each acquisition worker runs as an isolated task driven by the
//! [`ProcessManager`]: initialized once, ticked on a fixed cadence, restarted
//! or stopped on command, and watched for liveness so a supervisor can
//! respawn it within a [`RestartPolicy`].

mod process;
mod supervisor;

pub use process::*;
pub use supervisor::*;
