use std::collections::HashSet;
use std::net::TcpListener;

use fiso_core::{FisoError, FisoResult};
use tokio::sync::Mutex;

/// A `[min, max]` range of ports the app manager hands out to apps that
/// don't pin a specific port (§4.8). The availability probe (binding a
/// throwaway listener) runs under the same lock as the used-set mutation so
/// two concurrent `allocate` calls never observe the same port as free.
pub struct PortPool {
    min: u16,
    max: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Scans `[min, max]` for the first port that's both unmarked and
    /// actually bindable right now, marks it used, and returns it.
    pub async fn allocate(&self) -> FisoResult<u16> {
        let mut used = self.used.lock().await;
        for port in self.min..=self.max {
            if used.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                used.insert(port);
                return Ok(port);
            }
        }
        Err(FisoError::Internal(format!(
            "no free port in range {}..={}",
            self.min, self.max
        )))
    }

    pub async fn release(&self, port: u16) {
        self.used.lock().await.remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn concurrent_allocate_never_double_allocates() {
        let pool = Arc::new(PortPool::new(20000, 20050));
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move { pool.allocate().await.unwrap() }));
        }
        let mut ports = Vec::new();
        for task in tasks {
            ports.push(task.await.unwrap());
        }
        let unique: HashSet<_> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[tokio::test]
    async fn release_makes_a_port_reallocatable() {
        let pool = PortPool::new(20100, 20100);
        let port = pool.allocate().await.expect("first allocate");
        assert!(pool.allocate().await.is_err());
        pool.release(port).await;
        assert_eq!(pool.allocate().await.expect("reallocate"), port);
    }
}
