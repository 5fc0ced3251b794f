mod monitor;
mod usage;
mod violation;

pub use monitor::{MonitorSessionStats, ResourceMonitor, ResourceStatistics};
pub use usage::{format_memory_size, parse_memory_size, parse_usage_line, ResourceUsage};
pub use violation::{classify, EnforcementAction, ResourceViolation, Severity, ViolationType};
