//! Partitioned work queues feeding the worker pools
//!
//! Jobs are routed by key, so every job for one endpoint lands on the same
//! partition and is handled by the same worker in arrival order. Producers
//! never block; workers wait on their partition until a job arrives or the
//! server stops.

use log::{debug, error};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::utils::partition_for;

/// Sending side of a partitioned queue
pub struct WorkQueue<T> {
    partitions: Vec<mpsc::UnboundedSender<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            partitions: self.partitions.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Creates `workers` partitions and returns the queue plus one receiver
    /// per partition
    pub fn new(workers: usize) -> (Self, Vec<mpsc::UnboundedReceiver<T>>) {
        let (partitions, receivers) = (0..workers.max(1))
            .map(|_| mpsc::unbounded_channel())
            .unzip();
        (Self { partitions }, receivers)
    }

    /// Enqueues `job` on the partition owned by `key`
    ///
    /// Returns false once the workers have shut down.
    pub fn push(&self, key: SocketAddr, job: T) -> bool {
        let partition = partition_for(key, self.partitions.len());
        self.partitions[partition].send(job).is_ok()
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Spawns one worker per receiver. Each worker runs `handler` for every
    /// job until the queue closes or `stop` turns true.
    pub fn spawn_workers<F, Fut>(
        name: &'static str,
        receivers: Vec<mpsc::UnboundedReceiver<T>>,
        stop: watch::Receiver<bool>,
        handler: F,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        receivers
            .into_iter()
            .enumerate()
            .map(|(index, mut receiver)| {
                let handler = Arc::clone(&handler);
                let mut stop = stop.clone();
                tokio::spawn(async move {
                    debug!("{} worker {} started", name, index);
                    loop {
                        tokio::select! {
                            _ = stopped(&mut stop) => break,
                            job = receiver.recv() => match job {
                                Some(job) => handler(job).await,
                                None => {
                                    error!("{} worker {} lost its queue", name, index);
                                    break;
                                }
                            },
                        }
                    }
                    debug!("{} worker {} stopped", name, index);
                })
            })
            .collect()
    }
}

/// Resolves once the stop flag is set or its sender is gone
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_jobs_for_one_key_stay_in_order() {
        let (queue, receivers) = WorkQueue::new(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let handles = {
            let seen = Arc::clone(&seen);
            WorkQueue::spawn_workers("test", receivers, stop_rx, move |job: (u16, u32)| {
                let seen = Arc::clone(&seen);
                let done_tx = done_tx.clone();
                async move {
                    seen.lock().unwrap().push(job);
                    let _ = done_tx.send(());
                }
            })
        };

        for n in 0..50u32 {
            assert!(queue.push(addr(1), (1, n)));
            assert!(queue.push(addr(2), (2, n)));
        }
        for _ in 0..100 {
            done_rx.recv().await.unwrap();
        }

        let seen = seen.lock().unwrap().clone();
        for key in [1u16, 2] {
            let order: Vec<u32> = seen.iter().filter(|(k, _)| *k == key).map(|(_, n)| *n).collect();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }

        stop_tx.send_replace(true);
        for handle in handles {
            assert_ok!(handle.await);
        }
    }

    #[tokio::test]
    async fn test_workers_exit_on_stop() {
        let (queue, receivers) = WorkQueue::<u8>::new(2);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = WorkQueue::spawn_workers("idle", receivers, stop_rx, |_| async {});

        stop_tx.send_replace(true);
        for handle in handles {
            assert_ok!(handle.await);
        }
        assert!(!queue.push(addr(1), 1));
    }

    #[test]
    fn test_at_least_one_partition() {
        let (queue, receivers) = WorkQueue::<u8>::new(0);
        assert_eq!(queue.partitions(), 1);
        assert_eq!(receivers.len(), 1);
    }
}
