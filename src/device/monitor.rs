use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration, MissedTickBehavior};

use super::DeviceManager;
use crate::serial::StatusReport;

/// Shortest refresh period; `tokio::time::interval` rejects zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic status refresh for front-ends
pub struct StatusMonitor {
    /// Task handle for the refresh loop
    task_handle: tokio::task::JoinHandle<()>,
    /// Channel to signal stop
    stop_tx: mpsc::Sender<()>,
    reports: watch::Receiver<Option<StatusReport>>,
}

impl StatusMonitor {
    /// Refresh every `interval` until [`stop`](Self::stop) is called.
    /// Intervals below 1 ms are raised to 1 ms.
    pub fn start(device_manager: Arc<DeviceManager>, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (report_tx, reports) = watch::channel(None);

        let task_handle = tokio::spawn(Self::refresh_loop(
            device_manager,
            interval,
            report_tx,
            stop_rx,
        ));

        Self {
            task_handle,
            stop_tx,
            reports,
        }
    }

    /// Receiver that wakes on every new report
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusReport>> {
        self.reports.clone()
    }

    pub fn latest(&self) -> Option<StatusReport> {
        self.reports.borrow().clone()
    }

    /// Stop refreshing, waiting up to 2 s for an in-flight refresh
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if timeout(Duration::from_secs(2), self.task_handle).await.is_err() {
            log::warn!("Status monitor did not stop within 2 s");
        }
    }

    async fn refresh_loop(
        device_manager: Arc<DeviceManager>,
        interval: Duration,
        report_tx: watch::Sender<Option<StatusReport>>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        log::info!("Starting status monitor every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    log::info!("Received stop signal for status monitor");
                    break;
                }
                _ = ticker.tick() => {
                    match device_manager.status_report().await {
                        Ok(report) => {
                            if report.temperature_c.is_none() {
                                log::debug!("Temperature not supported on {}", report.port_name);
                            }
                            if report_tx.send(Some(report)).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Status refresh failed: {}", e),
                    }
                }
            }
        }
    }
}
