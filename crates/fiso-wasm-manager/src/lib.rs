mod manager;
mod port_pool;

pub use manager::{AppInstanceInfo, AppManager, Health};
pub use port_pool::PortPool;
