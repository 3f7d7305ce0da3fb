//! The processor pipeline.
//!
//! An insertion-ordered set of consumers that see every notification. Both
//! application listeners and the engine's own reply waits live here.

use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{trace, warn};

use crate::notification::{Handling, Notification};

/// Error a processor may return.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A consumer of notifications.
pub trait Processor: Send + Sync {
    /// Inspect a notification.
    ///
    /// An `Err` or a panic is reported and does not affect other processors.
    fn process(&self, notification: &Notification) -> Result<Handling, BoxError>;
}

impl<F> Processor for F
where
    F: Fn(&Notification) -> Result<Handling, BoxError> + Send + Sync,
{
    fn process(&self, notification: &Notification) -> Result<Handling, BoxError> {
        self(notification)
    }
}

/// Wrap a closure as a shareable processor.
pub fn processor<F>(f: F) -> Arc<dyn Processor>
where
    F: Fn(&Notification) -> Result<Handling, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same(a: &Arc<dyn Processor>, b: &Arc<dyn Processor>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// Ordered processor set.
#[derive(Default)]
pub struct Pipeline {
    processors: RwLock<Vec<Arc<dyn Processor>>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Processor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a processor.
    ///
    /// Returns `false` if it was already registered.
    pub fn add(&self, processor: Arc<dyn Processor>) -> bool {
        let mut processors = self.processors.write().unwrap_or_else(PoisonError::into_inner);
        if processors.iter().any(|p| same(p, &processor)) {
            return false;
        }
        processors.push(processor);
        true
    }

    /// Remove a processor.
    ///
    /// Returns `false` if it was not registered.
    pub fn remove(&self, processor: &Arc<dyn Processor>) -> bool {
        let mut processors = self.processors.write().unwrap_or_else(PoisonError::into_inner);
        let before = processors.len();
        processors.retain(|p| !same(p, processor));
        processors.len() != before
    }

    /// Check if a processor is registered.
    #[must_use]
    pub fn contains(&self, processor: &Arc<dyn Processor>) -> bool {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| same(p, processor))
    }

    /// Number of registered processors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if no processor is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every processor.
    pub fn clear(&self) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Push a notification to every processor in insertion order.
    ///
    /// Works on a snapshot: processors added or removed meanwhile only see
    /// the change on the next dispatch.
    pub fn dispatch(&self, notification: &Notification) -> Handling {
        let processors = self.snapshot();
        trace!(processors = processors.len(), "Dispatching notification");

        processors
            .iter()
            .enumerate()
            .fold(Handling::Unhandled, |handled, (position, processor)| {
                match catch_unwind(AssertUnwindSafe(|| processor.process(notification))) {
                    Ok(Ok(result)) => handled.merge(result),
                    Ok(Err(err)) => {
                        warn!(position, error = %err, "Processor failed");
                        handled
                    }
                    Err(_) => {
                        warn!(position, "Processor panicked");
                        handled
                    }
                }
            })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("processors", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn Processor> {
        let log = Arc::clone(log);
        processor(move |_| {
            log.lock().unwrap().push(name);
            Ok(Handling::Unhandled)
        })
    }

    #[test]
    fn test_add_remove_idempotent() {
        let pipeline = Pipeline::new();
        let p = processor(|_| Ok(Handling::Unhandled));

        assert!(pipeline.add(Arc::clone(&p)));
        assert!(!pipeline.add(Arc::clone(&p)));
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.contains(&p));

        assert!(pipeline.remove(&p));
        assert!(!pipeline.remove(&p));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_dispatch_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(recorder(&log, "first"));
        pipeline.add(recorder(&log, "second"));
        pipeline.add(recorder(&log, "third"));

        pipeline.dispatch(&Notification::unexpected_receiver("c"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_faulting_processor_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.add(processor(|_| Err("broken".into())));
        pipeline.add(processor(|_| panic!("processor bug")));
        pipeline.add(recorder(&log, "survivor"));

        let handled = pipeline.dispatch(&Notification::unexpected_receiver("c"));
        assert_eq!(handled, Handling::Unhandled);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_mutation_during_dispatch_applies_next_time() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Arc::new(Pipeline::new());
        let late = recorder(&log, "late");

        let adder = {
            let pipeline = Arc::downgrade(&pipeline);
            let late = Arc::clone(&late);
            processor(move |_| {
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.add(Arc::clone(&late));
                }
                Ok(Handling::Unhandled)
            })
        };
        pipeline.add(adder);

        pipeline.dispatch(&Notification::unexpected_receiver("c"));
        assert!(log.lock().unwrap().is_empty());

        pipeline.dispatch(&Notification::unexpected_receiver("c"));
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn test_dispatch_merges_handling() {
        let pipeline = Pipeline::new();
        pipeline.add(processor(|_| Ok(Handling::Handled)));
        pipeline.add(processor(|_| {
            Ok(Handling::HandledWithContent(serde_json::json!({ "title": "hi" })))
        }));

        assert_eq!(
            pipeline.dispatch(&Notification::unexpected_receiver("c")),
            Handling::HandledWithContent(serde_json::json!({ "title": "hi" }))
        );
    }
}
