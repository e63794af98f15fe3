//! The fixed set of server instances making up one fleet.

use crate::instance::{InstanceError, InstanceReport, InstanceState, ServerInstance};
use crate::topology::{ServerTopology, TopologyError};
use log::{info, warn};
use shared::Transport;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub bind_host: IpAddr,
    pub starting_port: u16,
    pub instance_count: usize,
    pub tick_duration: Duration,
}

/// Read-only view of a running instance
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub index: usize,
    pub addr: SocketAddr,
    pub state: watch::Receiver<InstanceState>,
}

struct Worker {
    handle: InstanceHandle,
    join: JoinHandle<Result<InstanceReport, InstanceError>>,
}

/// Owns one worker task per instance.
///
/// Launch is fire-and-forget: `start` returns as soon as every worker is
/// spawned. Bind failures surface later through `wait_for_failure`.
pub struct ServerPool {
    topology: Arc<ServerTopology>,
    workers: Vec<Worker>,
    failures: mpsc::UnboundedReceiver<usize>,
}

impl ServerPool {
    /// Computes the topology and spawns an instance for each address.
    ///
    /// `make_transport` is called once per instance, in index order.
    pub fn start<T, F>(
        config: &PoolConfig,
        stop: CancellationToken,
        mut make_transport: F,
    ) -> Result<Self, TopologyError>
    where
        T: Transport,
        F: FnMut(SocketAddr) -> T,
    {
        let topology = Arc::new(ServerTopology::contiguous(
            config.bind_host,
            config.starting_port,
            config.instance_count,
        )?);

        let (failure_tx, failures) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(topology.len());

        for (index, &addr) in topology.addrs().iter().enumerate() {
            let instance =
                ServerInstance::new(index, addr, make_transport(addr), config.tick_duration);
            let handle = InstanceHandle {
                index,
                addr,
                state: instance.subscribe(),
            };

            let stop = stop.clone();
            let failure_tx = failure_tx.clone();
            let join = tokio::spawn(async move {
                let result = instance.run(stop).await;
                if result.is_err() {
                    let _ = failure_tx.send(index);
                }
                result
            });

            workers.push(Worker { handle, join });
        }

        info!("Launched {} server instances on {}", topology.len(), topology);

        Ok(Self {
            topology,
            workers,
            failures,
        })
    }

    pub fn topology(&self) -> Arc<ServerTopology> {
        Arc::clone(&self.topology)
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceHandle> {
        self.workers.iter().map(|worker| &worker.handle)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Resolves with the index of the first instance that failed to start.
    /// Never resolves if every instance comes up.
    pub async fn wait_for_failure(&mut self) -> usize {
        match self.failures.recv().await {
            Some(index) => index,
            None => std::future::pending().await,
        }
    }

    /// Waits for every worker to finish, giving up on stragglers once
    /// `limit` has elapsed. Results are in instance order.
    pub async fn join_all(self, limit: Duration) -> Vec<Result<InstanceReport, InstanceError>> {
        let deadline = Instant::now() + limit;
        let mut results = Vec::with_capacity(self.workers.len());

        for Worker { handle, mut join } in self.workers {
            let result = match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!("Instance {} worker ended abnormally: {}", handle.index, e);
                    Err(InstanceError::Panicked {
                        index: handle.index,
                        addr: handle.addr,
                    })
                }
                Err(_) => {
                    warn!("Instance {} did not stop within {:?}", handle.index, limit);
                    join.abort();
                    Err(InstanceError::StopTimeout {
                        index: handle.index,
                        addr: handle.addr,
                    })
                }
            };
            results.push(result);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{MockLog, MockTransport};
    use crate::shutdown::{ShutdownCoordinator, ShutdownSource};
    use std::net::Ipv6Addr;
    use std::sync::Mutex;

    fn config(count: usize, tick_duration: Duration) -> PoolConfig {
        PoolConfig {
            bind_host: IpAddr::V6(Ipv6Addr::LOCALHOST),
            starting_port: 40000,
            instance_count: count,
            tick_duration,
        }
    }

    fn start_mock_pool(
        count: usize,
        tick_duration: Duration,
        stop: CancellationToken,
    ) -> (ServerPool, Vec<Arc<Mutex<MockLog>>>, Vec<SocketAddr>) {
        let mut logs = Vec::new();
        let mut seen = Vec::new();
        let pool = ServerPool::start(&config(count, tick_duration), stop, |addr| {
            let (transport, log) = MockTransport::new(2);
            logs.push(log);
            seen.push(addr);
            transport
        })
        .unwrap();
        (pool, logs, seen)
    }

    async fn wait_until_running(pool: &ServerPool) {
        for handle in pool.instances() {
            let mut state = handle.state.clone();
            state
                .wait_for(|s| *s >= InstanceState::Running)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_topology_matches_spawned_instances() {
        let stop = CancellationToken::new();
        let (pool, _, seen) = start_mock_pool(3, Duration::from_millis(5), stop.clone());

        let expected: Vec<SocketAddr> = vec![
            "[::1]:40000".parse().unwrap(),
            "[::1]:40001".parse().unwrap(),
            "[::1]:40002".parse().unwrap(),
        ];
        assert_eq!(pool.topology().addrs(), expected.as_slice());
        assert_eq!(seen, expected);
        assert_eq!(pool.len(), 3);

        let addrs: Vec<SocketAddr> = pool.instances().map(|handle| handle.addr).collect();
        assert_eq!(addrs, expected);

        stop.cancel();
        pool.join_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_empty_pool_is_rejected() {
        let result = ServerPool::start(
            &config(0, Duration::from_millis(5)),
            CancellationToken::new(),
            |_| MockTransport::new(1).0,
        );

        assert!(matches!(result, Err(TopologyError::Empty)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_tick_independently() {
        let stop = CancellationToken::new();
        let (pool, logs, _) = start_mock_pool(4, Duration::from_millis(5), stop.clone());

        wait_until_running(&pool).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();

        let results = pool.join_all(Duration::from_secs(1)).await;
        for (index, result) in results.into_iter().enumerate() {
            let report = result.unwrap();
            assert_eq!(report.index, index);
            assert!(report.ticks > 0);
        }
        for log in logs {
            assert!(!log.lock().unwrap().updates.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_double_shutdown_tears_down_each_instance_once() {
        let coordinator = ShutdownCoordinator::new();
        let (pool, logs, _) = start_mock_pool(3, Duration::from_millis(5), coordinator.token());
        wait_until_running(&pool).await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.trigger(ShutdownSource::Http) })
        };
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.trigger(ShutdownSource::Interrupt) })
        };
        let wins = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(wins.iter().filter(|won| **won).count(), 1);

        let results = pool.join_all(Duration::from_secs(1)).await;
        assert!(results.iter().all(|result| result.is_ok()));
        for log in logs {
            assert_eq!(log.lock().unwrap().stops, 1);
        }
    }

    #[tokio::test]
    async fn test_ticks_cease_within_one_interval() {
        let tick = Duration::from_millis(40);
        let stop = CancellationToken::new();
        let (pool, logs, _) = start_mock_pool(3, tick, stop.clone());
        wait_until_running(&pool).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let cancelled_at = Instant::now();
        stop.cancel();
        let results = pool.join_all(tick).await;

        assert!(cancelled_at.elapsed() <= tick);
        assert!(results.iter().all(|result| result.is_ok()));

        let counts: Vec<usize> = logs
            .iter()
            .map(|log| log.lock().unwrap().updates.len())
            .collect();
        tokio::time::sleep(tick * 2).await;
        let later: Vec<usize> = logs
            .iter()
            .map(|log| log.lock().unwrap().updates.len())
            .collect();
        assert_eq!(counts, later);
    }

    #[tokio::test]
    async fn test_failed_instance_is_reported() {
        let stop = CancellationToken::new();
        let mut index = 0;
        let mut pool = ServerPool::start(&config(3, Duration::from_millis(5)), stop.clone(), |_| {
            let (mut transport, _) = MockTransport::new(1);
            transport.fail_listen = index == 1;
            index += 1;
            transport
        })
        .unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(1), pool.wait_for_failure())
            .await
            .expect("failure should be reported");
        assert_eq!(failed, 1);

        stop.cancel();
        let results = pool.join_all(Duration::from_secs(1)).await;
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(InstanceError::Listen { index: 1, .. })
        ));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_healthy_pool_reports_no_failure() {
        let stop = CancellationToken::new();
        let (mut pool, _, _) = start_mock_pool(2, Duration::from_millis(5), stop.clone());

        let waited =
            tokio::time::timeout(Duration::from_millis(50), pool.wait_for_failure()).await;
        assert!(waited.is_err());

        stop.cancel();
        pool.join_all(Duration::from_secs(1)).await;
    }
}
