//! Process-wide defaults.
//!
//! A default interface and resolver are created lazily on first use and
//! torn down explicitly via [`exit`]. After teardown a sentinel refuses
//! further registrations, so late users fail loudly instead of resurrecting
//! state during process shutdown.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::{
    error::{Error, ErrorKind, Result},
    interface::{Interface, InterfaceConfig},
    metrics::MonitorableRegistry,
    resolve::Resolve,
};

#[derive(Default)]
struct Globals {
    interface: Option<Arc<Interface>>,
    resolver: Option<Arc<dyn Resolve>>,
    exited: bool,
}

static GLOBALS: Lazy<Mutex<Globals>> = Lazy::new(|| Mutex::new(Globals::default()));

fn lock() -> std::sync::MutexGuard<'static, Globals> {
    GLOBALS.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The process default interface, created on first use.
pub fn default_interface() -> Result<Arc<Interface>> {
    let mut globals = lock();
    if globals.exited {
        return Err(Error::new(ErrorKind::Cancelled));
    }
    if let Some(interface) = &globals.interface {
        return Ok(Arc::clone(interface));
    }
    let interface = Interface::create(InterfaceConfig::default())?;
    globals.interface = Some(Arc::clone(&interface));
    Ok(interface)
}

/// Replaces the process default interface.
pub fn set_default_interface(interface: Arc<Interface>) -> Result<()> {
    let mut globals = lock();
    if globals.exited {
        return Err(Error::new(ErrorKind::Cancelled));
    }
    globals.interface = Some(interface);
    Ok(())
}

/// The process default resolver, if one was installed.
pub fn default_resolver() -> Option<Arc<dyn Resolve>> {
    let globals = lock();
    globals.resolver.clone()
}

/// Installs the process default resolver.
pub fn set_default_resolver(resolver: Arc<dyn Resolve>) -> Result<()> {
    let mut globals = lock();
    if globals.exited {
        return Err(Error::new(ErrorKind::Cancelled));
    }
    globals.resolver = Some(resolver);
    Ok(())
}

/// Tears down the process defaults and flips the sentinel. Meant for
/// orderly process shutdown; later calls into this module fail with
/// `Cancelled`.
pub fn exit() {
    let (interface, _resolver) = {
        let mut globals = lock();
        if globals.exited {
            warn!("global teardown requested twice");
        }
        globals.exited = true;
        (globals.interface.take(), globals.resolver.take())
    };
    if let Some(interface) = interface {
        interface.shutdown();
        interface.linger();
    }
    MonitorableRegistry::global().tear_down();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Serialized into one test: the globals are process-wide and the exit
    // sentinel is one-way.
    #[test]
    fn defaults_then_exit_then_refusal() {
        let first = default_interface().unwrap();
        let second = default_interface().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        exit();

        assert_eq!(default_interface().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(set_default_interface(first).unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(default_resolver().is_none());
    }
}
