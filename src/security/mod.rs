//! Input validation, rate limiting, audit logging and secure execution.

pub mod audit;
pub mod executor;
pub mod rate_limit;
pub mod validator;

pub use audit::{
    AuditEntry, AuditEvent, AuditEventType, AuditFilter, AuditLogger, AuditStats, ClientInfo,
    Outcome, Severity, HIGH_RISK_THRESHOLD,
};
pub use executor::{
    CommandOutput, ExecutorStats, PreparedCommand, RequestContext, SecureCommandExecutor,
};
pub use rate_limit::RateLimiter;
pub use validator::{find_metacharacter, InputValidator, SHELL_METACHARACTERS};
