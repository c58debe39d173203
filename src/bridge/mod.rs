//! Raw byte bridging between a terminated user TLS connection and a shard
//! tunnel.
//!
//! A symmetric pair of `io::copy` calls is not enough here: when one side
//! fails, the opposite direction would block in its read indefinitely. Each
//! direction therefore actively unblocks its partner on termination. User
//! EOF half-closes the tunnel send side and lets the shard drain; a user
//! read error or tunnel write error force-closes the tunnel outright.

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::tunnel::TunnelConn;

/// Terminal classification of one bridged connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Both directions ended cleanly.
    Ok,
    /// Only the user → shard direction errored.
    ErrUser,
    /// Only the shard → user direction errored.
    ErrShard,
    /// Both directions errored.
    Err,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Ok => "OK",
            BridgeStatus::ErrUser => "ErrUser",
            BridgeStatus::ErrShard => "ErrShard",
            BridgeStatus::Err => "Err",
        }
    }

    fn classify(forward: &std::io::Result<u64>, backward: &std::io::Result<u64>) -> Self {
        match (forward, backward) {
            (Ok(_), Ok(_)) => BridgeStatus::Ok,
            (Err(_), Ok(_)) => BridgeStatus::ErrUser,
            (Ok(_), Err(_)) => BridgeStatus::ErrShard,
            (Err(_), Err(_)) => BridgeStatus::Err,
        }
    }
}

/// TCP keep-alive on the raw user socket, to detect silently broken user
/// transports during long-lived proxied sessions.
pub fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(60));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Pump bytes both ways between `user` and `shard` until both directions
/// have ended, then classify the outcome.
pub async fn run<U>(user: U, shard: TunnelConn) -> BridgeStatus
where
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let abort = shard.abort_handle();
    let (user_r, user_w) = tokio::io::split(user);
    let (shard_r, shard_w) = tokio::io::split(shard);
    run_split(user_r, user_w, shard_r, shard_w, move || abort.abort()).await
}

async fn run_split<UR, UW, SR, SW, A>(
    mut user_r: UR,
    mut user_w: UW,
    mut shard_r: SR,
    mut shard_w: SW,
    abort_shard: A,
) -> BridgeStatus
where
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send + 'static,
    A: FnOnce() + Send,
{
    // Backward: shard → user. On termination, half-close the user's write
    // side so an HTTP-style user observes a clean end of response.
    let backward = tokio::spawn(async move {
        let result = tokio::io::copy(&mut shard_r, &mut user_w).await;
        let _ = user_w.shutdown().await;
        result
    });

    // Forward: user → shard, in the current task.
    let forward = match tokio::io::copy(&mut user_r, &mut shard_w).await {
        Ok(n) => {
            // Clean user EOF: half-close the tunnel send side and let the
            // shard's remaining responses drain through `backward`.
            let _ = shard_w.shutdown().await;
            Ok(n)
        }
        Err(err) => {
            // User read or shard write failure: force-close the tunnel so
            // the backward pump cannot stay blocked in its read.
            abort_shard();
            Err(err)
        }
    };

    let backward = match backward.await {
        Ok(result) => result,
        Err(join_err) => Err(std::io::Error::other(join_err)),
    };

    let status = BridgeStatus::classify(&forward, &backward);
    debug!(
        status = status.as_str(),
        user_to_shard = forward.as_ref().ok(),
        shard_to_user = backward.as_ref().ok(),
        "bridge finished"
    );
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn clean_half_close_in_both_directions() {
        let (user_ours, mut user_theirs) = tokio::io::duplex(1024);
        let (shard_ours, mut shard_theirs) = tokio::io::duplex(1024);

        let (user_r, user_w) = tokio::io::split(user_ours);
        let (shard_r, shard_w) = tokio::io::split(shard_ours);
        let bridge = tokio::spawn(run_split(user_r, user_w, shard_r, shard_w, || ()));

        // User sends a request and half-closes.
        user_theirs.write_all(b"request").await.unwrap();
        user_theirs.shutdown().await.unwrap();

        // The shard sees the request, then EOF, and answers before closing.
        let mut buf = vec![0u8; 7];
        shard_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");
        assert_eq!(shard_theirs.read(&mut [0u8; 1]).await.unwrap(), 0);

        shard_theirs.write_all(b"response").await.unwrap();
        shard_theirs.shutdown().await.unwrap();

        // The user reads the full response through to EOF.
        let mut response = Vec::new();
        user_theirs.read_to_end(&mut response).await.unwrap();
        assert_eq!(&response, b"response");

        assert_eq!(bridge.await.unwrap(), BridgeStatus::Ok);
    }

    #[tokio::test]
    async fn shard_eof_half_closes_user_while_user_keeps_sending() {
        let (user_ours, mut user_theirs) = tokio::io::duplex(1024);
        let (shard_ours, mut shard_theirs) = tokio::io::duplex(1024);

        let (user_r, user_w) = tokio::io::split(user_ours);
        let (shard_r, shard_w) = tokio::io::split(shard_ours);
        let bridge = tokio::spawn(run_split(user_r, user_w, shard_r, shard_w, || ()));

        // Shard closes its sending direction immediately.
        shard_theirs.write_all(b"bye").await.unwrap();
        shard_theirs.shutdown().await.unwrap();

        // The user observes the data and then EOF on its read side...
        let mut buf = vec![0u8; 3];
        user_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(user_theirs.read(&mut [0u8; 1]).await.unwrap(), 0);

        // ...while its writes still flow to the shard.
        user_theirs.write_all(b"late data").await.unwrap();
        let mut late = vec![0u8; 9];
        shard_theirs.read_exact(&mut late).await.unwrap();
        assert_eq!(&late, b"late data");

        user_theirs.shutdown().await.unwrap();
        assert_eq!(bridge.await.unwrap(), BridgeStatus::Ok);
    }

    #[tokio::test]
    async fn shard_write_failure_aborts_and_classifies() {
        let (user_ours, mut user_theirs) = tokio::io::duplex(1024);
        let (shard_ours, shard_theirs) = tokio::io::duplex(16);

        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);

        let (user_r, user_w) = tokio::io::split(user_ours);
        let (shard_r, shard_w) = tokio::io::split(shard_ours);
        let bridge = tokio::spawn(run_split(user_r, user_w, shard_r, shard_w, move || {
            flag.store(true, Ordering::SeqCst);
        }));

        // Killing the shard side makes the forward copy's write fail.
        drop(shard_theirs);
        user_theirs.write_all(&vec![0u8; 256]).await.ok();
        drop(user_theirs);

        let status = bridge.await.unwrap();
        assert_eq!(status, BridgeStatus::ErrUser);
        assert!(aborted.load(Ordering::SeqCst));
    }
}
