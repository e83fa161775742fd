use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelClient, ChannelError};
use crate::types::{ClientFrame, GeoPoint};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> Result<GeoPoint, PositionError>;
}

#[async_trait]
pub trait LocationSink: Send + Sync {
    async fn send_location(&self, order_id: &str, location: GeoPoint) -> Result<(), ChannelError>;
}

#[async_trait]
impl LocationSink for ChannelClient {
    async fn send_location(&self, order_id: &str, location: GeoPoint) -> Result<(), ChannelError> {
        self.send(ClientFrame::DriverLocation {
            order_id: order_id.to_string(),
            location,
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReporterStatus {
    Idle,
    Active { order_id: String },
    Halted { order_id: String, error: String },
}

struct Sampling {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LocationReporter {
    source: Arc<dyn PositionSource>,
    sink: Arc<dyn LocationSink>,
    period: Duration,
    status: watch::Sender<ReporterStatus>,
    sampling: Mutex<Option<Sampling>>,
}

impl LocationReporter {
    pub fn new(source: Arc<dyn PositionSource>, sink: Arc<dyn LocationSink>, period: Duration) -> Self {
        let (status, _) = watch::channel(ReporterStatus::Idle);
        Self {
            source,
            sink,
            period,
            status,
            sampling: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ReporterStatus {
        self.status.borrow().clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<ReporterStatus> {
        self.status.subscribe()
    }

    pub async fn start(&self, order_id: impl Into<String>) {
        let order_id = order_id.into();
        let mut sampling = self.sampling.lock().await;
        if let Some(previous) = sampling.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        self.status.send_replace(ReporterStatus::Active {
            order_id: order_id.clone(),
        });
        info!(%order_id, period_ms = self.period.as_millis() as u64, "location reporting started");

        let task = tokio::spawn(sample_loop(
            self.source.clone(),
            self.sink.clone(),
            self.status.clone(),
            order_id,
            self.period,
            cancel.clone(),
        ));
        *sampling = Some(Sampling { cancel, task });
    }

    /// Stops sampling. A send already in flight completes; no further sends happen.
    pub async fn stop(&self) {
        let Some(sampling) = self.sampling.lock().await.take() else {
            return;
        };
        sampling.cancel.cancel();
        if sampling.task.is_finished() {
            return;
        }

        self.status.send_if_modified(|status| {
            if matches!(status, ReporterStatus::Active { .. }) {
                *status = ReporterStatus::Idle;
                true
            } else {
                false
            }
        });
        info!("location reporting stopped");
    }
}

async fn sample_loop(
    source: Arc<dyn PositionSource>,
    sink: Arc<dyn LocationSink>,
    status: watch::Sender<ReporterStatus>,
    order_id: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks =
        Box::pin(IntervalStream::new(interval).take_until(cancel.clone().cancelled_owned()));

    while ticks.next().await.is_some() {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = source.current_position() => read,
        };
        let location = match read {
            Ok(location) => location,
            Err(e) => {
                error!(%order_id, error = %e, "position source failed, halting location reporting");
                if !cancel.is_cancelled() {
                    status.send_replace(ReporterStatus::Halted {
                        order_id: order_id.clone(),
                        error: e.to_string(),
                    });
                }
                return;
            }
        };

        match sink.send_location(&order_id, location).await {
            Ok(()) => debug!(%order_id, lat = location.lat, lng = location.lng, "location sent"),
            Err(e) => warn!(%order_id, error = %e, "location send failed, retrying next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::test_support::ScriptedPositions;

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(String, Instant)>>,
        fail_first: StdMutex<usize>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(String, Instant)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocationSink for RecordingSink {
        async fn send_location(&self, order_id: &str, _location: GeoPoint) -> Result<(), ChannelError> {
            let mut failures = self.fail_first.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChannelError::NotConnected);
            }
            drop(failures);
            self.sent
                .lock()
                .unwrap()
                .push((order_id.to_string(), Instant::now()));
            Ok(())
        }
    }

    fn point() -> GeoPoint {
        GeoPoint {
            lat: 40.7,
            lng: -74.0,
            accuracy_m: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_25s_yields_two_sends() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = LocationReporter::new(
            ScriptedPositions::fixed(point()),
            sink.clone(),
            Duration::from_secs(10),
        );

        let started = Instant::now();
        reporter.start("order-2").await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        reporter.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(order, _)| order == "order-2"));
        assert_eq!(sent[0].1 - started, Duration::from_secs(10));
        assert_eq!(sent[1].1 - started, Duration::from_secs(20));
        assert_eq!(reporter.status(), ReporterStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_does_not_stop_sampling() {
        let sink = Arc::new(RecordingSink {
            fail_first: StdMutex::new(1),
            ..RecordingSink::default()
        });
        let positions = ScriptedPositions::fixed(point());
        let reporter = LocationReporter::new(positions.clone(), sink.clone(), Duration::from_secs(10));

        reporter.start("order-2").await;
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(positions.reads(), 3);
        assert_eq!(sink.sent().len(), 2);
        assert!(matches!(reporter.status(), ReporterStatus::Active { .. }));
        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denial_halts_and_surfaces() {
        let sink = Arc::new(RecordingSink::default());
        let positions = ScriptedPositions::new(vec![
            Ok(point()),
            Err(PositionError::PermissionDenied),
            Ok(point()),
        ]);
        let reporter = LocationReporter::new(positions.clone(), sink.clone(), Duration::from_secs(10));
        let mut status = reporter.status_changes();

        reporter.start("order-5").await;
        let halted = status
            .wait_for(|s| matches!(s, ReporterStatus::Halted { .. }))
            .await
            .unwrap()
            .clone();
        assert_eq!(
            halted,
            ReporterStatus::Halted {
                order_id: "order-5".into(),
                error: "location permission denied".into(),
            }
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(positions.reads(), 2);
        assert_eq!(sink.sent().len(), 1);

        reporter.stop().await;
        assert!(matches!(reporter.status(), ReporterStatus::Halted { .. }));
    }

    struct SlowPositions(Duration);

    #[async_trait]
    impl PositionSource for SlowPositions {
        async fn current_position(&self) -> Result<GeoPoint, PositionError> {
            tokio::time::sleep(self.0).await;
            Ok(point())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_position_read_sends_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = LocationReporter::new(
            Arc::new(SlowPositions(Duration::from_secs(5))),
            sink.clone(),
            Duration::from_secs(10),
        );

        reporter.start("order-2").await;
        tokio::time::sleep(Duration::from_secs(12)).await;
        reporter.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(sink.sent().is_empty());
        assert_eq!(reporter.status(), ReporterStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_switches_order() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = LocationReporter::new(
            ScriptedPositions::fixed(point()),
            sink.clone(),
            Duration::from_secs(10),
        );

        reporter.start("order-1").await;
        tokio::time::sleep(Duration::from_secs(15)).await;
        reporter.start("order-2").await;
        tokio::time::sleep(Duration::from_secs(15)).await;
        reporter.stop().await;

        let orders: Vec<String> = sink.sent().into_iter().map(|(o, _)| o).collect();
        assert_eq!(orders, vec!["order-1", "order-2"]);
    }
}
