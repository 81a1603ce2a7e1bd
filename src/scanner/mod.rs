//! Core functionality for actual probing behaviour.
mod results;
pub use results::{ResultAggregator, ResultFilter, ResultSet, TargetResult};

use crate::address::AddressKey;
use crate::input::ScanConfig;
use crate::probe::Probe;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error};
use std::{
    num::{NonZeroU8, NonZeroUsize},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc::UnboundedSender, Semaphore};

/// Emitted once per finished target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Targets finished so far, including dropped ones.
    pub completed: usize,
    /// Targets that answered at least once so far.
    pub reachable: usize,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    reachable: AtomicUsize,
}

/// Runs the per-target measurement loop for every target, never more than
/// `concurrency` targets at a time.
///
/// A target takes a slot before its first attempt and gives it back as soon
/// as its last attempt finishes. Targets are admitted in list order.
pub struct Prober {
    probe: Arc<dyn Probe>,
    concurrency: NonZeroUsize,
    tries: NonZeroU8,
    progress: Option<UnboundedSender<Progress>>,
}

impl Prober {
    pub fn new(probe: Arc<dyn Probe>, config: &ScanConfig) -> Self {
        Self {
            probe,
            concurrency: config.concurrency,
            tries: config.tries,
            progress: None,
        }
    }

    /// Sends a [`Progress`] event after every finished target.
    #[must_use]
    pub fn with_progress(mut self, progress: UnboundedSender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Probes every target and returns once all of them are accounted for.
    /// Targets that never answered are left out of the result.
    pub async fn run(&self, targets: &[AddressKey]) -> ResultSet {
        if targets.is_empty() {
            return ResultSet::default();
        }

        let attempts = self.probe.attempts(self.tries);
        let gate = Arc::new(Semaphore::new(self.concurrency.get()));
        let aggregator = Arc::new(ResultAggregator::new());
        let counters = Arc::new(Counters::default());

        debug!(
            "Start probing targets. \nConcurrency {}\nAttempts per target {}\nTargets {}",
            self.concurrency,
            attempts,
            targets.len()
        );

        let mut workers = FuturesUnordered::new();
        for &target in targets {
            let Ok(permit) = Arc::clone(&gate).acquire_owned().await else {
                error!("Admission gate closed, {target} was not probed");
                break;
            };

            let probe = Arc::clone(&self.probe);
            let aggregator = Arc::clone(&aggregator);
            let counters = Arc::clone(&counters);
            let progress = self.progress.clone();

            workers.push(tokio::spawn(async move {
                let measured = measure(probe.as_ref(), target, attempts).await;
                drop(permit);

                let reachable = match measured {
                    Some(result) => {
                        aggregator.append(result);
                        counters.reachable.fetch_add(1, Ordering::SeqCst) + 1
                    }
                    None => counters.reachable.load(Ordering::SeqCst),
                };
                let completed = counters.completed.fetch_add(1, Ordering::SeqCst) + 1;

                if let Some(progress) = progress {
                    if progress.send(Progress { completed, reachable }).is_err() {
                        debug!("Progress receiver dropped");
                    }
                }
            }));
        }

        while let Some(joined) = workers.next().await {
            if let Err(e) = joined {
                error!("Probe task failed: {e}");
            }
        }

        debug!(
            "Reachable targets: {} of {}",
            counters.reachable.load(Ordering::SeqCst),
            targets.len()
        );

        match Arc::try_unwrap(aggregator) {
            Ok(aggregator) => aggregator.finalize(),
            Err(shared) => shared.snapshot(),
        }
    }
}

/// Runs `probe` against `target` `attempts` times in sequence. The average only
/// covers successful attempts; `None` means no attempt succeeded.
async fn measure(
    probe: &dyn Probe,
    target: AddressKey,
    attempts: NonZeroU8,
) -> Option<TargetResult> {
    let mut successes = 0u32;
    let mut total = Duration::ZERO;
    let mut location = None;

    for _ in 0..attempts.get() {
        let outcome = probe.probe(&target).await;
        if !outcome.success {
            continue;
        }
        successes += 1;
        total += outcome.elapsed;
        if outcome.location.is_some() {
            location = outcome.location;
        }
    }

    if successes == 0 {
        debug!("{target} did not answer any of {attempts} attempts");
        return None;
    }

    Some(TargetResult {
        target,
        attempts: u32::from(attempts.get()),
        successes,
        average_delay: total / successes,
        location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutcome;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn key(last: u8, port: u16) -> AddressKey {
        AddressKey::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, last)), port)
    }

    fn config(concurrency: usize, tries: u8) -> ScanConfig {
        ScanConfig {
            concurrency: NonZeroUsize::new(concurrency).unwrap(),
            tries: NonZeroU8::new(tries).unwrap(),
            ..ScanConfig::default()
        }
    }

    /// Answers every target with a fixed delay per address.
    struct ScriptedProbe {
        delays: HashMap<AddressKey, Duration>,
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, target: &AddressKey) -> ProbeOutcome {
            self.delays
                .get(target)
                .copied()
                .map_or_else(ProbeOutcome::failed, ProbeOutcome::reached)
        }
    }

    /// Succeeds on every other call, alternating 10ms and 30ms answers.
    struct FlakyProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for FlakyProbe {
        async fn probe(&self, _target: &AddressKey) -> ProbeOutcome {
            match self.calls.fetch_add(1, Ordering::SeqCst) % 4 {
                0 => ProbeOutcome::reached(Duration::from_millis(10)),
                2 => ProbeOutcome::reached(Duration::from_millis(30))
                    .with_location(Some("LAX".to_owned())),
                _ => ProbeOutcome::failed(),
            }
        }
    }

    /// Records how many measurement loops run at once.
    #[derive(Default)]
    struct GaugeProbe {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Probe for GaugeProbe {
        async fn probe(&self, _target: &AddressKey) -> ProbeOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::reached(Duration::from_millis(1))
        }
    }

    /// Panics for one address, answers the others.
    struct PanickingProbe {
        poison: AddressKey,
    }

    #[async_trait]
    impl Probe for PanickingProbe {
        async fn probe(&self, target: &AddressKey) -> ProbeOutcome {
            assert_ne!(*target, self.poison, "probe blew up");
            ProbeOutcome::reached(Duration::from_millis(2))
        }
    }

    struct SingleShotProbe;

    #[async_trait]
    impl Probe for SingleShotProbe {
        async fn probe(&self, _target: &AddressKey) -> ProbeOutcome {
            ProbeOutcome::reached(Duration::from_millis(4))
        }

        fn attempts(&self, _configured: NonZeroU8) -> NonZeroU8 {
            NonZeroU8::MIN
        }
    }

    #[tokio::test]
    async fn single_target_single_attempt() {
        let target = key(4, 443);
        let probe = ScriptedProbe {
            delays: HashMap::from([(target, Duration::from_millis(10))]),
        };

        let results = Prober::new(Arc::new(probe), &config(10, 1))
            .run(&[target])
            .await;

        assert_eq!(
            results.into_vec(),
            [TargetResult {
                target,
                attempts: 1,
                successes: 1,
                average_delay: Duration::from_millis(10),
                location: None,
            }]
        );
    }

    #[tokio::test]
    async fn unreachable_targets_are_dropped_and_rest_sorted() {
        let targets = [key(0, 80), key(1, 80), key(2, 80), key(3, 80)];
        let probe = ScriptedProbe {
            delays: HashMap::from([
                (targets[1], Duration::from_millis(40)),
                (targets[3], Duration::from_millis(15)),
            ]),
        };

        let results = Prober::new(Arc::new(probe), &config(2, 1))
            .run(&targets)
            .await;

        let order: Vec<_> = results.iter().map(|r| r.target).collect();
        assert_eq!(order, [targets[3], targets[1]]);
    }

    #[tokio::test]
    async fn average_covers_successful_attempts_only() {
        let probe = FlakyProbe {
            calls: AtomicUsize::new(0),
        };

        let results = Prober::new(Arc::new(probe), &config(1, 4))
            .run(&[key(9, 443)])
            .await;

        let result = &results.as_slice()[0];
        assert_eq!(result.attempts, 4);
        assert_eq!(result.successes, 2);
        assert_eq!(result.average_delay, Duration::from_millis(20));
        assert_eq!(result.location.as_deref(), Some("LAX"));
    }

    #[tokio::test]
    async fn probe_may_override_attempts() {
        let results = Prober::new(Arc::new(SingleShotProbe), &config(4, 4))
            .run(&[key(1, 443), key(2, 443)])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.attempts == 1 && r.successes == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_ceiling_is_respected() {
        let probe = Arc::new(GaugeProbe::default());
        let targets: Vec<_> = (0..40).map(|last| key(last, 443)).collect();

        let results = Prober::new(Arc::clone(&probe) as Arc<dyn Probe>, &config(3, 2))
            .run(&targets)
            .await;

        assert_eq!(results.len(), 40);
        let peak = probe.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn panicking_probe_does_not_lose_slots() {
        let targets: Vec<_> = (0..5).map(|last| key(last, 443)).collect();
        let probe = PanickingProbe { poison: targets[0] };

        let results = Prober::new(Arc::new(probe), &config(1, 1))
            .run(&targets)
            .await;

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.target != targets[0]));
    }

    #[tokio::test]
    async fn progress_is_reported_per_target() {
        let targets = [key(0, 80), key(1, 80), key(2, 80)];
        let probe = ScriptedProbe {
            delays: HashMap::from([(targets[2], Duration::from_millis(3))]),
        };
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let prober = Prober::new(Arc::new(probe), &config(2, 1)).with_progress(sender);
        let results = prober.run(&targets).await;
        drop(prober);

        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }

        assert_eq!(results.len(), 1);
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().map(|e| e.completed).max(), Some(3));
        assert!(events.iter().all(|e| e.reachable <= 1));
    }

    #[tokio::test]
    async fn empty_target_list() {
        let probe = Arc::new(SingleShotProbe);
        let results = Prober::new(probe, &config(1, 1)).run(&[]).await;
        assert!(results.is_empty());
    }
}
