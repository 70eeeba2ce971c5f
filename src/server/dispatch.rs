//! Hands admission slots to waiting connections.

use log::debug;
use tokio::{select, sync::oneshot};
use tokio_util::sync::CancellationToken;

use crate::admission::{Acquire, AdmissionQueue, Lease};

/// Queue payload: where to deliver the lease once the entry is dequeued.
pub(crate) struct StartSignal(pub(crate) oneshot::Sender<Lease<StartSignal>>);

impl StartSignal {
    /// Create a signal and the receiver its connection waits on.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Lease<StartSignal>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }
}

/// Grant processing slots in priority order until `shutdown` fires.
///
/// The lease travels to the connection and holds the slot for as long as the
/// stream runs. A connection that went away drops the returned lease, which
/// frees the slot and wakes this loop again.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(super) async fn dispatch(queue: AdmissionQueue<StartSignal>, shutdown: CancellationToken) {
    loop {
        match queue.acquire() {
            Acquire::Leased(mut lease) => {
                let Some(StartSignal(tx)) = lease.take_payload() else {
                    continue;
                };
                let (id, waited) = (lease.id(), lease.waited());
                match tx.send(lease) {
                    Ok(()) => debug!("slot granted: entry={id}, waited={waited:?}"),
                    Err(_) => debug!("admitted connection went away: entry={id}"),
                }
            }
            Acquire::AtCapacity | Acquire::Empty => select! {
                biased;

                () = shutdown.cancelled() => return,
                () = queue.wait_for_work() => {}
            },
        }
    }
}
