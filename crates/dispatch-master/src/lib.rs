pub mod node_proxy;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod scheduler;

pub use node_proxy::{NodeProxy, NodeState};
pub use persistence::{JournalEvent, Persistence, SchedulerSnapshot};
pub use protocol::MasterHandler;
pub use registry::{NodeContext, NodeRegistry, NodeStatus};
pub use scheduler::{spawn as spawn_scheduler, SchedulerCommand, SchedulerConfig};
