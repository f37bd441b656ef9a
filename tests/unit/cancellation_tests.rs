/*!
 * Tests for the cancellation registry
 */

use std::sync::Arc;

use yastq::scheduler::CancellationRegistry;

/// Test that cancelling an unknown id is a harmless no-op
#[test]
fn test_cancel_withUnknownId_shouldReturnFalse() {
    let registry = CancellationRegistry::new();

    assert!(!registry.cancel(404));
    registry.unregister(404);
    assert!(registry.is_empty());
}

/// Test that a re-registration replaces the token without cancelling the old one
#[test]
fn test_register_twice_shouldReplaceToken() {
    let registry = CancellationRegistry::new();
    let first = registry.register(1);
    let second = registry.register(1);

    assert!(registry.cancel(1));
    assert!(second.is_cancelled());
    assert!(!first.is_cancelled());
    assert_eq!(registry.len(), 1);
}

/// Test that a stale guard does not remove a newer registration
#[test]
fn test_registerGuarded_staleGuardDropped_shouldKeepNewerRegistration() {
    let registry = Arc::new(CancellationRegistry::new());
    let stale = registry.register_guarded(5);
    let current = registry.register_guarded(5);

    drop(stale);
    assert!(registry.is_registered(5));
    assert!(registry.cancel(5));
    assert!(current.token().is_cancelled());

    drop(current);
    assert!(!registry.is_registered(5));
}

/// Test cancellation racing the owning task finishing
#[tokio::test]
async fn test_cancel_racingUnregister_shouldNeverPanic() {
    let registry = Arc::new(CancellationRegistry::new());

    let mut handles = Vec::new();
    for id in 0..50 {
        let registration = registry.register_guarded(id);
        let canceller = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            canceller.cancel(id);
        }));
        handles.push(tokio::spawn(async move {
            drop(registration);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(registry.is_empty());
}
