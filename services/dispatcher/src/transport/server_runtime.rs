use std::{
    sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel},
    thread,
};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::config::resolve_http_queue_capacity;

use super::*;

/// Accepted connections waiting for a worker. Offers never block the
/// accept loop; a full queue is answered with 503 on the spot.
pub(super) struct ConnectionQueue {
    pub(super) sender: SyncSender<TcpStream>,
    pub(super) metrics: Arc<TransportBackpressureMetrics>,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Offer {
    Queued,
    Rejected,
    Closed,
}

impl ConnectionQueue {
    pub(super) fn offer(&self, stream: TcpStream) -> Offer {
        self.metrics.observe_enqueued();
        match self.sender.try_send(stream) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(stream)) => {
                self.metrics.observe_dequeued();
                self.metrics.observe_rejected();
                if let Err(err) = write_backpressure_response(stream, SOCKET_TIMEOUT_SECS) {
                    warn!("dispatch transport could not answer a queue-full rejection: {err}");
                }
                Offer::Rejected
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.observe_dequeued();
                Offer::Closed
            }
        }
    }
}

fn run_worker(
    runtime: &SharedRuntime,
    connections: &Mutex<Receiver<TcpStream>>,
    metrics: &TransportBackpressureMetrics,
) {
    loop {
        // Released before the connection is handled.
        let next = connections.lock().recv();
        let Ok(stream) = next else {
            break;
        };
        metrics.observe_dequeued();
        if let Err(err) = handle_connection(runtime, stream) {
            warn!("dispatch transport error: {err}");
        }
    }
}

/// Serves until the listener fails, then shuts every application down.
pub fn serve_http_with_workers(
    runtime: DispatchRuntime,
    bind_addr: &str,
    worker_count: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    let worker_count = worker_count.max(1);
    let queue_capacity = if runtime.queue_capacity == 0 {
        resolve_http_queue_capacity(worker_count)
    } else {
        runtime.queue_capacity
    };
    let runtime: SharedRuntime = Arc::new(runtime);
    let metrics = Arc::new(TransportBackpressureMetrics::new(queue_capacity));
    runtime.set_transport_backpressure_metrics(Arc::clone(&metrics));

    let (sender, receiver) = sync_channel::<TcpStream>(queue_capacity);
    let connections = Mutex::new(receiver);

    let served = thread::scope(|scope| -> std::io::Result<()> {
        // Dropped when this closure returns, which lets the workers exit.
        let queue = ConnectionQueue {
            sender,
            metrics: Arc::clone(&metrics),
        };
        for worker in 0..worker_count {
            let (runtime, connections, metrics) = (&runtime, &connections, &*metrics);
            thread::Builder::new()
                .name(format!("dispatch-http-{worker}"))
                .spawn_scoped(scope, move || run_worker(runtime, connections, metrics))?;
        }
        debug!("dispatch transport accepting on {bind_addr} with {worker_count} workers");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("dispatch transport accept error: {err}");
                    continue;
                }
            };
            if let Offer::Closed = queue.offer(stream) {
                error!("dispatch transport worker queue closed");
                break;
            }
        }
        Ok(())
    });

    runtime.registry.shutdown_all();
    served
}
