//! Periodic progress logging for a running pipeline.

use super::tracker::RunTracker;
use crate::abort::AbortSignal;
use crate::resources::ResourceMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Logs a one-line status on every tick until told to stop.
pub struct ProgressReporter {
    tracker: Arc<RunTracker>,
    monitor: Arc<ResourceMonitor>,
    abort: Arc<AbortSignal>,
    interval_secs: u64,
}

impl ProgressReporter {
    /// Create a new progress reporter.
    pub fn new(
        tracker: Arc<RunTracker>,
        monitor: Arc<ResourceMonitor>,
        abort: Arc<AbortSignal>,
        interval_secs: u64,
    ) -> Self {
        Self {
            tracker,
            monitor,
            abort,
            interval_secs: interval_secs.max(1),
        }
    }

    fn line(&self) -> String {
        self.tracker
            .snapshot(self.monitor.latest(), self.abort.state())
            .to_string()
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.line());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.line());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::resources::StaticProbe;

    fn reporter(interval_secs: u64) -> ProgressReporter {
        let monitor = ResourceMonitor::with_probe(
            &ResourceConfig::default(),
            StaticProbe::new(10.0, 10.0, 10.0),
        );
        ProgressReporter::new(
            Arc::new(RunTracker::new()),
            Arc::new(monitor),
            Arc::new(AbortSignal::new()),
            interval_secs,
        )
    }

    #[test]
    fn test_reporter_creation() {
        assert_eq!(reporter(10).interval_secs, 10);
        assert_eq!(reporter(0).interval_secs, 1);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let (tx, rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(reporter(1).run(rx));
        tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reporter_stops_when_sender_dropped() {
        let (tx, rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(reporter(1).run(rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
