use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::logging::Logger;

pub type HookResult = Result<(), String>;

type Hook = Box<dyn Fn(&str) -> HookResult>;

const LOG_CONTEXT: &str = "broker::hooks";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connection,
    Disconnection,
}

impl LifecycleEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "on_connection",
            Self::Disconnection => "on_disconnection",
        }
    }
}

/// Optional observers for workers joining and leaving a service.
///
/// Callbacks receive the service name. A failing or panicking callback is
/// logged and otherwise ignored; routing never depends on hook outcomes.
#[derive(Default)]
pub struct LifecycleHooks {
    on_connection: Option<Hook>,
    on_disconnection: Option<Hook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> HookResult + 'static,
    {
        self.on_connection = Some(Box::new(hook));
        self
    }

    pub fn on_disconnection<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> HookResult + 'static,
    {
        self.on_disconnection = Some(Box::new(hook));
        self
    }

    pub fn notify(&self, event: LifecycleEvent, service: &str, logger: &Logger) {
        let hook = match event {
            LifecycleEvent::Connection => self.on_connection.as_ref(),
            LifecycleEvent::Disconnection => self.on_disconnection.as_ref(),
        };
        let Some(hook) = hook else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| hook(service))) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => logger.warn(
                Some(LOG_CONTEXT),
                &format!("{} hook failed for service '{service}': {message}", event.as_str()),
            ),
            Err(_) => logger.warn(
                Some(LOG_CONTEXT),
                &format!("{} hook panicked for service '{service}'", event.as_str()),
            ),
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_connection", &self.on_connection.is_some())
            .field("on_disconnection", &self.on_disconnection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;

    use super::{LifecycleEvent, LifecycleHooks};

    #[test]
    fn routes_events_to_matching_callback() {
        let (logger, _sink) = memory_logger(LogLevel::Info);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let on_join = Rc::clone(&seen);
        let on_leave = Rc::clone(&seen);

        let hooks = LifecycleHooks::new()
            .on_connection(move |service| {
                on_join.borrow_mut().push(format!("+{service}"));
                Ok(())
            })
            .on_disconnection(move |service| {
                on_leave.borrow_mut().push(format!("-{service}"));
                Ok(())
            });

        hooks.notify(LifecycleEvent::Connection, "svc-a", &logger);
        hooks.notify(LifecycleEvent::Disconnection, "svc-a", &logger);

        assert_eq!(*seen.borrow(), vec!["+svc-a".to_owned(), "-svc-a".to_owned()]);
    }

    #[test]
    fn missing_callbacks_are_noops() {
        let (logger, sink) = memory_logger(LogLevel::Verbose);
        LifecycleHooks::new().notify(LifecycleEvent::Disconnection, "svc-a", &logger);
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn callback_errors_are_logged_not_propagated() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        let hooks = LifecycleHooks::new().on_connection(|_| Err("observer offline".to_owned()));

        hooks.notify(LifecycleEvent::Connection, "svc-a", &logger);

        assert!(sink.contains("on_connection hook failed for service 'svc-a': observer offline"));
    }

    #[test]
    fn callback_panics_are_contained() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        let hooks = LifecycleHooks::new().on_disconnection(|_| panic!("boom"));

        hooks.notify(LifecycleEvent::Disconnection, "svc-b", &logger);

        assert!(sink.contains("on_disconnection hook panicked for service 'svc-b'"));
    }
}
