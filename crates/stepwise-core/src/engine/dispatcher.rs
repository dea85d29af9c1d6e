//! Hand-off of newly scheduled machine tasks to the execution facility.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A machine task waiting for its handler to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineJob {
    pub task_id: Uuid,
    pub process_id: Uuid,
    pub node_name: String,
    /// Handler descriptor registered in the `HandlerRegistry`.
    pub callable: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch channel closed")]
    Closed,
}

/// Receives machine tasks as soon as the scheduler creates them.
///
/// Dispatch is fire-and-forget: the task row is already committed, so a
/// dispatcher only needs to make the job visible to a worker.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, job: MachineJob) -> Result<(), DispatchError>;
}

impl<T: TaskDispatcher + ?Sized> TaskDispatcher for Arc<T> {
    fn dispatch(&self, job: MachineJob) -> Result<(), DispatchError> {
        (**self).dispatch(job)
    }
}

/// Dispatcher backed by an unbounded tokio channel; the receiver feeds `Worker::run`.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<MachineJob>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MachineJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskDispatcher for ChannelDispatcher {
    fn dispatch(&self, job: MachineJob) -> Result<(), DispatchError> {
        tracing::debug!(task_id = %job.task_id, callable = %job.callable, "dispatching machine task");
        self.tx.send(job).map_err(|_| DispatchError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> MachineJob {
        MachineJob {
            task_id: Uuid::now_v7(),
            process_id: Uuid::now_v7(),
            node_name: "save_the_princess".to_string(),
            callable: "save_the_princess".to_string(),
        }
    }

    #[test]
    fn test_channel_dispatch() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let sent = job();
        dispatcher.dispatch(sent.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), sent);
    }

    #[test]
    fn test_dispatch_after_receiver_dropped() {
        let (dispatcher, rx) = ChannelDispatcher::new();
        drop(rx);
        assert!(matches!(dispatcher.dispatch(job()), Err(DispatchError::Closed)));
    }

    #[test]
    fn test_arc_dispatcher() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let shared: Arc<dyn TaskDispatcher> = Arc::new(dispatcher);
        shared.dispatch(job()).unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
