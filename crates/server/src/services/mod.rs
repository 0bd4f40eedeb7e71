//! Business logic services.
//!
//! # Services
//!
//! - `token_lifecycle` - Slack token refresh, legacy migration, sweeps and OAuth connect
//! - `scheduler` - Delivery of due scheduled messages
//! - `messaging` - User-facing scheduling, sending and Slack lookups
//! - `supervisor` - Background loop ownership and shutdown

pub mod messaging;
pub mod scheduler;
pub mod supervisor;
pub mod token_lifecycle;

pub use messaging::MessagingService;
pub use scheduler::{DeliveryReport, DeliveryScheduler};
pub use supervisor::BackgroundTasks;
pub use token_lifecycle::{
    ConnectedWorkspace, MigrationReport, SweepReport, TokenError, TokenHealth,
    TokenLifecycleManager, TokenStatus, TokenStatusReport, WorkspaceRef,
};
