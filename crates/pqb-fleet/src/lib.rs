//! pqb-fleet: remote control of the benchmark fleet
//!
//! This crate owns everything between the campaign logic and the wire: the
//! Host Session (SSH transport with retry), the Traffic Shaper (kernel
//! queueing discipline over the session), readiness probes, the Process
//! Supervisor (remote service lifecycle), and the Fleet Controller
//! (parallel phase barriers across hosts).

pub mod controller;
pub mod probe;
pub mod retry;
pub mod shaper;
pub mod ssh;
pub mod supervisor;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::{
    ClientOutcome, FleetController, FleetHost, RoleAssignment, ServiceLaunch, TeardownReport,
};
pub use probe::ReadinessProbe;
pub use shaper::{ShapingState, TrafficShaper};
pub use supervisor::{ProcessState, ProcessSupervisor};
pub use transport::{ExecOutput, HostTransport, StreamEvent};
