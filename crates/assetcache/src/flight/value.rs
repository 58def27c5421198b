use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::utils::futures::CancelOnDrop;

/// A type-erased error that can be handed out to any number of waiters.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// An error returned when waiting for a [`SingleFlightValue`].
#[derive(Debug, Clone, Error)]
pub enum FlightError {
    /// The computation failed.
    ///
    /// Every waiter of the same computation receives the very same error instance.
    #[error("computation failed: {0}")]
    Computation(#[source] SharedError),
    /// The wait of this particular caller was cancelled.
    ///
    /// The computation itself, and other waiters of it, are not affected.
    #[error("wait was cancelled")]
    Cancelled,
}

/// The computation panicked.
#[derive(Debug, Error)]
#[error("computation panicked: {0}")]
pub struct Panicked(String);

impl Panicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self(message)
    }
}

/// The computation was torn down before it could produce an outcome.
#[derive(Debug, Error)]
#[error("computation was aborted")]
pub struct Aborted;

/// The phase a [`SingleFlightValue`] is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightState {
    /// Nobody asked for the value yet.
    Unstarted,
    /// The computation is running.
    Running,
    /// The computation finished successfully.
    Resolved,
    /// The computation failed, panicked, or was aborted.
    Failed,
}

type Outcome<T> = Result<T, FlightError>;
type Producer<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, SharedError>> + Send>;

enum Phase<T> {
    Unstarted {
        producer: Producer<T>,
        sender: watch::Sender<Option<Outcome<T>>>,
    },
    /// The spawned computation, which is aborted once the last handle to the value goes away.
    Running {
        // Only held for its drop.
        _task: Option<CancelOnDrop<()>>,
    },
}

struct Inner<T> {
    phase: Mutex<Phase<T>>,
    receiver: watch::Receiver<Option<Outcome<T>>>,
}

/// A value that is computed at most once, and shared with everyone who asks for it.
///
/// The computation is started lazily by the first call to [`get`](Self::get), and runs on its
/// own spawned task. Every caller, including ones that arrive long after the computation
/// finished, receives a clone of the very same outcome. A failed computation is never retried;
/// create a new value to try again.
///
/// Cloning a `SingleFlightValue` is cheap and yields a handle to the same computation. Once the
/// last handle is dropped, a still-running computation is aborted.
pub struct SingleFlightValue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SingleFlightValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SingleFlightValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightValue")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> SingleFlightValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new value that will be computed by `producer`.
    ///
    /// The producer is not invoked until the value is first requested.
    pub fn new<F, Fut, E>(producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let producer: Producer<T> = Box::new(move || {
            producer()
                .map(|result| result.map_err(|e| Arc::new(e) as SharedError))
                .boxed()
        });
        let (sender, receiver) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                phase: Mutex::new(Phase::Unstarted { producer, sender }),
                receiver,
            }),
        }
    }

    /// Waits for the outcome of the computation, starting it if needed.
    ///
    /// Dropping the returned future only stops waiting, the computation continues for the
    /// benefit of other waiters.
    pub async fn get(&self) -> Result<T, FlightError> {
        let mut receiver = self.start();
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());

        outcome.unwrap_or_else(|| Err(FlightError::Computation(Arc::new(Aborted))))
    }

    /// Like [`get`](Self::get), but gives up with [`FlightError::Cancelled`] once `token` is
    /// cancelled.
    ///
    /// A token that is already cancelled does not start the computation.
    pub async fn get_or_cancel(&self, token: &CancellationToken) -> Result<T, FlightError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FlightError::Cancelled),
            outcome = self.get() => outcome,
        }
    }

    /// Returns the outcome if the computation has already finished.
    pub fn outcome(&self) -> Option<Result<T, FlightError>> {
        self.inner.receiver.borrow().clone()
    }

    /// Returns the phase the computation is currently in.
    pub fn state(&self) -> FlightState {
        if let Phase::Unstarted { .. } = *self.inner.phase.lock().unwrap() {
            return FlightState::Unstarted;
        }

        let finished = match &*self.inner.receiver.borrow() {
            Some(Ok(_)) => return FlightState::Resolved,
            Some(Err(_)) => return FlightState::Failed,
            None => false,
        };
        // The sender is gone without having published anything.
        if !finished && self.inner.receiver.has_changed().is_err() {
            return FlightState::Failed;
        }
        FlightState::Running
    }

    /// Whether both handles refer to the same computation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spawns the computation if this is the first request, and returns a receiver for its
    /// outcome.
    fn start(&self) -> watch::Receiver<Option<Outcome<T>>> {
        let mut phase = self.inner.phase.lock().unwrap();
        if let Phase::Unstarted { .. } = *phase {
            if let Phase::Unstarted { producer, sender } =
                std::mem::replace(&mut *phase, Phase::Running { _task: None })
            {
                metric!(counter("flight.computation") += 1);
                let task = tokio::spawn(compute(producer, sender));
                *phase = Phase::Running {
                    _task: Some(CancelOnDrop::new(task)),
                };
            }
        }
        drop(phase);

        self.inner.receiver.clone()
    }
}

async fn compute<T>(producer: Producer<T>, sender: watch::Sender<Option<Outcome<T>>>) {
    let computation = async move { producer().await };
    let outcome = match AssertUnwindSafe(computation).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(FlightError::Computation(err)),
        Err(payload) => {
            let panicked = Panicked::from_payload(payload);
            tracing::error!(error = &panicked as &dyn std::error::Error);
            Err(FlightError::Computation(Arc::new(panicked)))
        }
    };
    sender.send_replace(Some(outcome));
}
