// Routing
//
// Where admitted requests go: backend selection (balancer), the hold queue
// used while the proxy is in maintenance (buffer), and the maintenance
// window schedule itself (maintenance).

pub mod balancer;
pub mod buffer;
pub mod maintenance;

pub use balancer::{Backend, BackendPick, BalanceStrategy, BalancerConfig, LoadBalancer};
pub use buffer::{BufferConfig, BufferState, BufferedRequest, RequestBufferQueue};
pub use maintenance::{
    MaintenanceStatus, MaintenanceWindow, MaintenanceWindowManager, WindowStatus,
};
