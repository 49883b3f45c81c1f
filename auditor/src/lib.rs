//! SSH credential auditing: discovery, brute force scheduling and reporting.

pub mod auditor;
pub mod brute;
pub mod config;
pub mod logcheck;
pub mod report;

pub use auditor::{AuditOptions, Auditor, DiscoverRequest, DiscoverSummary};
pub use brute::brute_force;
pub use logcheck::{FileLogSearcher, LogSearcher, LogcheckEntry};
