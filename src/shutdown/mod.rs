use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Cooperative stop request shared between the signal handlers and the broker loop.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    triggered: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// SIGINT/SIGTERM registration; handlers are removed again on drop.
pub struct ShutdownHooks {
    token: StopToken,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let token = StopToken::new();

        #[cfg(unix)]
        {
            let mut sig_ids = Vec::with_capacity(2);
            for signal in [SIGINT, SIGTERM] {
                sig_ids.push(flag::register(signal, Arc::clone(&token.triggered))?);
            }
            return Ok(Self { token, sig_ids });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { token })
        }
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StopToken;

    #[test]
    fn clones_observe_trigger() {
        let token = StopToken::new();
        let observer = token.clone();
        assert!(!observer.is_triggered());

        token.trigger();
        assert!(observer.is_triggered());
    }
}
