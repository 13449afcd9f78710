//! Host liveness monitor.
//!
//! Pings the host on a fresh connection every interval. A Pong resets the
//! consecutive-failure count; anything else (wrong tag, timeout, connection
//! error) increments it. Once the count reaches the tolerance the host is
//! presumed gone and the process exits immediately, without answering
//! in-flight requests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Message, MessageType, read_tag, write_message};
use crate::bridge::transport::HostEndpoint;
use crate::config::BridgeConfig;

/// Result of a single ping.
#[derive(Debug)]
pub enum HeartbeatOutcome {
    Pong,
    UnexpectedResponse(i32),
    TimedOut,
    Connection(io::Error),
}

impl HeartbeatOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Pong)
    }

    /// Exit status used if this outcome ends the process: a host that went
    /// away is a normal exit, a host that answered nonsense is not.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnexpectedResponse(_) => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Display for HeartbeatOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pong => write!(f, "pong"),
            Self::UnexpectedResponse(tag) => write!(f, "unexpected response {tag}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Connection(e) => write!(f, "connection error: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    Degraded { failures: u32 },
    Dead { failures: u32 },
}

/// Consecutive-failure counter.
#[derive(Debug)]
pub struct FailureTracker {
    tolerance: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(tolerance: u32) -> Self {
        Self {
            tolerance: tolerance.max(1),
            consecutive: 0,
        }
    }

    pub fn record(&mut self, alive: bool) -> Verdict {
        if alive {
            self.consecutive = 0;
            return Verdict::Alive;
        }
        self.consecutive += 1;
        if self.consecutive >= self.tolerance {
            Verdict::Dead {
                failures: self.consecutive,
            }
        } else {
            Verdict::Degraded {
                failures: self.consecutive,
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

/// What to do once the host is declared dead.
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Exit the process on the spot.
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

pub struct HeartbeatMonitor {
    endpoint: HostEndpoint,
    timeout: Duration,
    interval: Duration,
    tolerance: u32,
    terminator: Arc<dyn Terminator>,
}

impl HeartbeatMonitor {
    pub fn new(endpoint: HostEndpoint, config: &BridgeConfig) -> Self {
        Self {
            endpoint,
            timeout: config.heartbeat_timeout,
            interval: config.heartbeat_interval,
            tolerance: config.heartbeat_tolerance,
            terminator: Arc::new(ProcessExit),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// One ping on a fresh connection.
    pub async fn ping_once(&self) -> HeartbeatOutcome {
        let exchange = async {
            let mut stream = self.endpoint.connect().await?;
            write_message(&mut stream, &Message::Ping).await?;
            read_tag(&mut stream).await
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => HeartbeatOutcome::TimedOut,
            Ok(Err(e)) => HeartbeatOutcome::Connection(e),
            Ok(Ok(tag)) if tag == MessageType::Pong.tag() => HeartbeatOutcome::Pong,
            Ok(Ok(tag)) => HeartbeatOutcome::UnexpectedResponse(tag),
        }
    }

    /// Ping until cancelled or until the host is declared dead.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tracker = FailureTracker::new(self.tolerance);
        tracing::debug!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            tolerance = self.tolerance,
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Heartbeat stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let outcome = self.ping_once().await;
            match tracker.record(outcome.is_alive()) {
                Verdict::Alive => tracing::trace!("Heartbeat ok"),
                Verdict::Degraded { failures } => {
                    tracing::warn!(failures, tolerance = self.tolerance, outcome = %outcome, "Heartbeat missed");
                }
                Verdict::Dead { failures } => {
                    tracing::error!(failures, outcome = %outcome, "Host unresponsive, terminating");
                    self.terminator.terminate(outcome.exit_code());
                    return;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingTerminator {
        codes: Mutex<Vec<i32>>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, code: i32) {
            self.codes.lock().unwrap().push(code);
        }
    }

    fn config(tolerance: u32) -> BridgeConfig {
        BridgeConfig {
            heartbeat_timeout: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(10),
            heartbeat_tolerance: tolerance,
            ..BridgeConfig::default()
        }
    }

    /// Fake host answering each ping with the next tag in `script`
    /// (`None` = accept and stay silent), then Pong forever.
    async fn scripted_host(script: Vec<Option<i32>>) -> HostEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = HostEndpoint::new(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut script = script.into_iter();
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let step = script.next().unwrap_or(Some(MessageType::Pong.tag()));
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let _ = read_tag(&mut stream).await;
                    match step {
                        Some(tag) => {
                            let _ = stream.write_all(&tag.to_le_bytes()).await;
                        }
                        None => tokio::time::sleep(Duration::from_secs(5)).await,
                    }
                });
            }
        });
        endpoint
    }

    #[test]
    fn tracker_reaches_dead_at_tolerance() {
        let mut tracker = FailureTracker::new(2);
        assert_eq!(tracker.record(false), Verdict::Degraded { failures: 1 });
        assert_eq!(tracker.record(false), Verdict::Dead { failures: 2 });
    }

    #[test]
    fn pong_resets_the_count() {
        let mut tracker = FailureTracker::new(3);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.record(true), Verdict::Alive);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.record(false), Verdict::Degraded { failures: 1 });
    }

    #[test]
    fn zero_tolerance_is_treated_as_one() {
        let mut tracker = FailureTracker::new(0);
        assert_eq!(tracker.record(false), Verdict::Dead { failures: 1 });
    }

    #[tokio::test]
    async fn ping_classifies_responses() {
        let host = scripted_host(vec![Some(6), Some(42), None]).await;
        let monitor = HeartbeatMonitor::new(host, &config(2));

        assert!(matches!(monitor.ping_once().await, HeartbeatOutcome::Pong));
        assert!(matches!(
            monitor.ping_once().await,
            HeartbeatOutcome::UnexpectedResponse(42)
        ));
        assert!(matches!(monitor.ping_once().await, HeartbeatOutcome::TimedOut));
    }

    #[tokio::test]
    async fn ping_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = HostEndpoint::new(listener.local_addr().unwrap());
        drop(listener);

        let monitor = HeartbeatMonitor::new(endpoint, &config(2));
        assert!(matches!(
            monitor.ping_once().await,
            HeartbeatOutcome::Connection(_)
        ));
    }

    #[tokio::test]
    async fn silent_host_terminates_after_tolerance() {
        let host = scripted_host(vec![None; 10]).await;
        let terminator = Arc::new(RecordingTerminator::default());
        let monitor = HeartbeatMonitor::new(host, &config(2))
            .with_terminator(Arc::clone(&terminator) as Arc<dyn Terminator>);

        tokio::time::timeout(Duration::from_secs(5), monitor.run(CancellationToken::new()))
            .await
            .expect("monitor should give up on a silent host");

        assert_eq!(*terminator.codes.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn wrong_answer_terminates_with_failure_code() {
        let host = scripted_host(vec![Some(99); 10]).await;
        let terminator = Arc::new(RecordingTerminator::default());
        let monitor = HeartbeatMonitor::new(host, &config(1))
            .with_terminator(Arc::clone(&terminator) as Arc<dyn Terminator>);

        tokio::time::timeout(Duration::from_secs(5), monitor.run(CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(*terminator.codes.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn one_pong_between_failures_keeps_process_alive() {
        // tolerance - 1 failures, a pong, repeat: never dead.
        let script = vec![None, Some(6), None, Some(6), None, Some(6)];
        let host = scripted_host(script).await;
        let terminator = Arc::new(RecordingTerminator::default());
        let shutdown = CancellationToken::new();
        let task = HeartbeatMonitor::new(host, &config(2))
            .with_terminator(Arc::clone(&terminator) as Arc<dyn Terminator>)
            .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        task.await.unwrap();

        assert!(terminator.codes.lock().unwrap().is_empty());
    }
}
