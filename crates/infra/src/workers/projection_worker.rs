use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use shopfloor_core::TenantId;
use shopfloor_events::{EventBus, Subscription, TenantScoped};

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = self.name, "projection worker panicked");
            }
        }
    }
}

/// Subscribes to a bus and feeds every message to an idempotent handler.
///
/// Handler errors are logged and the loop keeps going; the read model can be
/// rebuilt from the store if it falls behind.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn the worker thread.
    ///
    /// With `tenant_id` set, messages for other tenants are skipped.
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: &B,
        tenant_id: Option<TenantId>,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        M: TenantScoped + Send + 'static,
        B: EventBus<M> + ?Sized,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, tenant_id, &mut handler))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    tenant_id: Option<TenantId>,
    handler: &mut H,
) where
    M: TenantScoped,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if tenant_id.is_some_and(|t| msg.tenant_id() != t) {
                    continue;
                }

                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "projection worker handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = name, "projection worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shopfloor_events::InMemoryEventBus;

    #[derive(Debug, Clone)]
    struct Msg(TenantId);

    impl TenantScoped for Msg {
        fn tenant_id(&self) -> TenantId {
            self.0
        }
    }

    #[test]
    fn filters_by_tenant_and_stops_on_shutdown() {
        let bus: InMemoryEventBus<Msg> = InMemoryEventBus::new();
        let tenant_id = TenantId::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let handle = ProjectionWorker::spawn("test-worker", &bus, Some(tenant_id), move |_msg: Msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ()>(())
        })
        .unwrap();

        bus.publish(Msg(tenant_id)).unwrap();
        bus.publish(Msg(TenantId::new())).unwrap();
        bus.publish(Msg(tenant_id)).unwrap();

        for _ in 0..40 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }
        handle.shutdown();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
