//! Cancellation shared by a run and its probes.
//!
//! The coordinator owns one token per run; each dispatched session gets a
//! `child_token()`, so cancelling the run reaches every probe while a probe
//! tripping its own token leaves its siblings alone.

pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn child_sees_parent_cancel_but_not_vice_versa() {
        let run = CancellationToken::new();
        let a = run.child_token();
        let b = run.child_token();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!run.is_cancelled());
        run.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn grandchild_sees_root_cancel() {
        let root = CancellationToken::new();
        let session = root.child_token();
        let login = session.child_token();
        root.cancel();
        assert!(login.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_wake_on_cancel() {
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trip.cancel();
        });
        let woke = tokio::time::timeout(Duration::from_secs(60), token.cancelled()).await;
        assert!(woke.is_ok());
    }
}
