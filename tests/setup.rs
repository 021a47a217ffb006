use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use syshook::{Arch, Errno, Error, HandlerRegistry, State, Syshook};

#[macro_use]
mod support;
use support::*;

#[test]
fn test_duplicate_registration_is_rejected() -> Result<()> {
    let mut registry = HandlerRegistry::new();
    registry
        .register(0, |_| Ok(1))?
        .register(1, |_| Ok(2))?;

    let err = registry.register(0, |_| Ok(3)).unwrap_err();
    assert!(matches!(err, Error::DuplicateHandler { nr: 0 }));

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.syscalls().collect::<Vec<_>>(), vec![0, 1]);

    // The first binding is the one that gets installed.
    let supervisor = FakeSupervisor::new();
    let hook = Syshook::new(Arch::X86_64, supervisor.clone());
    hook.setup(registry)?;

    assert_eq!(supervisor.trap(pid!(1), 0, [0; 6]), Outcome::Returned(1));

    Ok(())
}

#[test]
fn test_setup_lifecycle() -> Result<()> {
    init_tracing();

    let supervisor = FakeSupervisor::new();
    let hook = Syshook::new(Arch::X86_64, supervisor.clone());
    assert_eq!(hook.state(), State::Uninitialized);
    assert!(hook.installed().is_empty());

    let mut registry = HandlerRegistry::new();
    registry
        .register(2, |_| Ok(Errno::EPERM))?
        .register(257, |_| Ok(Errno::EPERM))?;

    // Nothing is intercepted before setup.
    assert_eq!(supervisor.trap(pid!(1), 2, [0; 6]), Outcome::NotIntercepted);

    hook.setup(registry)?;

    assert_eq!(hook.state(), State::Supervising);
    assert_eq!(hook.installed(), vec![2, 257]);
    assert_eq!(supervisor.callbacks(), vec![2, 257]);
    assert!(supervisor.started());

    assert_eq!(supervisor.trap(pid!(1), 257, [0; 6]), Outcome::Returned(-1));
    assert!(supervisor.violations().is_empty());

    Ok(())
}

#[test]
fn test_second_setup_fails() -> Result<()> {
    init_tracing();

    let supervisor = FakeSupervisor::new();
    let hook = Syshook::new(Arch::X86_64, supervisor.clone());

    let mut first = HandlerRegistry::new();
    first.register(0, |_| Ok(Errno::EACCES))?;
    hook.setup(first)?;

    let mut second = HandlerRegistry::new();
    second.register(0, |_| Ok(0))?.register(1, |_| Ok(0))?;

    let err = hook.setup(second).unwrap_err();
    assert!(matches!(err, Error::Protocol { state: State::Supervising, .. }));
    assert!(!err.recoverable());

    assert_eq!(hook.state(), State::Supervising);
    assert_eq!(hook.installed(), vec![0]);
    assert_eq!(supervisor.callbacks(), vec![0]);
    assert_eq!(supervisor.trap(pid!(1), 0, [0; 6]), Outcome::Returned(-13));
    assert_eq!(supervisor.trap(pid!(1), 1, [0; 6]), Outcome::NotIntercepted);
    assert!(supervisor.violations().is_empty());

    Ok(())
}

#[test]
fn test_failed_start_cannot_be_retried() -> Result<()> {
    init_tracing();

    let supervisor = FakeSupervisor::new();
    supervisor.fail_start();

    let hook = Syshook::new(Arch::Aarch64, supervisor.clone());

    let mut registry = HandlerRegistry::new();
    registry.register(63, |_| Ok(0))?;

    assert!(matches!(hook.setup(registry), Err(Error::Internal(..))));
    assert_eq!(hook.state(), State::Failed);
    assert!(!supervisor.started());

    let err = hook.setup(HandlerRegistry::new()).unwrap_err();
    assert!(matches!(err, Error::Protocol { state: State::Failed, .. }));

    Ok(())
}

#[test]
fn test_empty_registry() -> Result<()> {
    let supervisor = FakeSupervisor::new();
    let hook = Syshook::new(Arch::X86_64, supervisor.clone());

    hook.setup(HandlerRegistry::new())?;

    assert_eq!(hook.state(), State::Supervising);
    assert!(supervisor.callbacks().is_empty());
    assert_eq!(supervisor.trap(pid!(1), 0, [0; 6]), Outcome::NotIntercepted);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_concurrent_dispatch() -> Result<()> {
    const THREADS: usize = 8;
    const EVENTS: usize = 200;

    init_tracing();

    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    registry.register(39, move |syscall| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(syscall.pid.as_raw())
    })?;

    let supervisor = FakeSupervisor::new();
    let hook = Syshook::new(Arch::X86_64, supervisor.clone());
    hook.setup(registry)?;

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let supervisor = supervisor.clone();

            thread::spawn(move || {
                let pid = 1000 + t as i32;

                (0..EVENTS)
                    .map(|_| supervisor.trap(pid!(pid), 39, [0; 6]))
                    .all(|outcome| outcome == Outcome::Returned(pid as i64))
            })
        })
        .collect();

    for worker in workers {
        assert!(worker.join().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), THREADS * EVENTS);
    assert_eq!(supervisor.resolutions().len(), THREADS * EVENTS);
    assert_eq!(supervisor.pending(), 0);
    assert!(supervisor.violations().is_empty());

    Ok(())
}
