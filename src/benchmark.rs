use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};

use crate::metrics::Metrics;
use crate::outcome::{GroupStatus, RequestOutcome, ResultGroup};
use crate::request::RequestDriver;
use crate::templates::{ContextCatalog, ContextTemplate};

/// What to run: context sizes in order, and how hard to push each one.
#[derive(Debug, Clone)]
pub struct BenchmarkPlan {
    pub templates: Vec<ContextTemplate>,
    pub requests_per_size: usize,
    pub concurrency: usize,
    /// Pause between attempts in sequential mode
    pub inter_request_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// A request failed while running this context size
    AbortedAt(String),
}

#[derive(Debug, Clone)]
pub struct BenchmarkRun {
    pub groups: Vec<ResultGroup>,
    pub status: RunStatus,
}

/// Observer for a running benchmark. Only `group_finished` is required.
pub trait Progress {
    fn group_started(&mut self, _template: &ContextTemplate, _plan: &BenchmarkPlan) {}

    /// Sequential mode calls this as each request ends; concurrent mode
    /// calls it for every outcome once the batch is done.
    fn request_finished(&mut self, _outcome: &RequestOutcome, _index: usize, _total: usize) {}

    fn group_finished(&mut self, group: &ResultGroup, elapsed: Duration);
}

/// Runs every context size of a plan against one endpoint.
///
/// Sizes run strictly in order. With a concurrency of 1 requests go one at a
/// time and the first failure stops everything. Above that, each size is sent
/// as one batch bounded by a semaphore; the whole batch is awaited and any
/// failure in it stops the run after that size.
pub struct BenchmarkRunner {
    driver: Arc<RequestDriver>,
    catalog: Arc<ContextCatalog>,
    rng: StdRng,
}

impl BenchmarkRunner {
    pub fn new(driver: Arc<RequestDriver>, catalog: Arc<ContextCatalog>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            driver,
            catalog,
            rng,
        }
    }

    pub async fn run(&mut self, plan: &BenchmarkPlan, progress: &mut impl Progress) -> BenchmarkRun {
        let mut groups = Vec::with_capacity(plan.templates.len());

        for template in &plan.templates {
            info!(
                "Testing context size {} ({} chars), concurrency {}",
                template.label,
                template.char_count(),
                plan.concurrency
            );
            progress.group_started(template, plan);

            let started = Instant::now();
            let group = if plan.concurrency <= 1 {
                self.run_sequential(template, plan, progress).await
            } else {
                self.run_concurrent(template, plan, progress).await
            };
            let elapsed = started.elapsed();

            Metrics::record_group(group.status);
            progress.group_finished(&group, elapsed);

            let aborted = group.is_aborted();
            groups.push(group);

            if aborted {
                warn!(
                    "Context size {} had failures, skipping remaining sizes",
                    template.label
                );
                return BenchmarkRun {
                    groups,
                    status: RunStatus::AbortedAt(template.label.clone()),
                };
            }
        }

        BenchmarkRun {
            groups,
            status: RunStatus::Completed,
        }
    }

    async fn run_sequential(
        &mut self,
        template: &ContextTemplate,
        plan: &BenchmarkPlan,
        progress: &mut impl Progress,
    ) -> ResultGroup {
        let total = plan.requests_per_size;
        let mut results = Vec::with_capacity(total);
        let mut status = GroupStatus::Completed;

        for i in 0..total {
            if i > 0 && !plan.inter_request_delay.is_zero() {
                sleep(plan.inter_request_delay).await;
            }

            let prompt = self.catalog.compose(template, &mut self.rng);
            let outcome = self
                .driver
                .request(prompt, request_id(&template.label, i))
                .await;
            progress.request_finished(&outcome, i, total);

            let failed = !outcome.success;
            results.push(outcome);

            if failed {
                warn!(
                    "Request {}/{} for context size {} failed, stopping",
                    i + 1,
                    total,
                    template.label
                );
                status = GroupStatus::Aborted;
                break;
            }
        }

        ResultGroup {
            context_size: template.label.clone(),
            concurrency: plan.concurrency,
            status,
            results,
        }
    }

    async fn run_concurrent(
        &mut self,
        template: &ContextTemplate,
        plan: &BenchmarkPlan,
        progress: &mut impl Progress,
    ) -> ResultGroup {
        let total = plan.requests_per_size;
        let semaphore = Arc::new(Semaphore::new(plan.concurrency));
        let mut handles = Vec::with_capacity(total);

        debug!(
            "Launching {} requests for {} behind {} permits",
            total, template.label, plan.concurrency
        );

        // Prompts are composed here, in launch order, so a seeded rng gives
        // the same question sequence every run.
        for i in 0..total {
            let prompt = self.catalog.compose(template, &mut self.rng);
            let driver = Arc::clone(&self.driver);
            let semaphore = Arc::clone(&semaphore);
            let id = request_id(&template.label, i);

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                driver.request(prompt, id).await
            });
            handles.push(handle);
        }

        let mut results = Vec::with_capacity(total);
        for (i, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Request task for {} did not finish: {}", template.label, e);
                    RequestOutcome::aborted(
                        request_id(&template.label, i),
                        &template.label,
                        template.char_count(),
                        e.to_string(),
                    )
                }
            };
            results.push(outcome);
        }

        for (i, outcome) in results.iter().enumerate() {
            progress.request_finished(outcome, i, total);
        }

        let failures = results.iter().filter(|r| !r.success).count();
        let status = if failures > 0 {
            warn!(
                "{}/{} requests for context size {} failed",
                failures, total, template.label
            );
            GroupStatus::Aborted
        } else {
            GroupStatus::Completed
        };

        ResultGroup {
            context_size: template.label.clone(),
            concurrency: plan.concurrency,
            status,
            results,
        }
    }
}

fn request_id(label: &str, index: usize) -> String {
    format!("{}-{}", label, index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::consumer::StreamConsumer;
    use crate::testing::{MockEndpoint, Script};
    use crate::tokenizer::TokenEstimator;

    #[derive(Default)]
    struct Recorder {
        started: Vec<String>,
        requests: Vec<String>,
        finished: Vec<(String, GroupStatus)>,
    }

    impl Progress for Recorder {
        fn group_started(&mut self, template: &ContextTemplate, _plan: &BenchmarkPlan) {
            self.started.push(template.label.clone());
        }

        fn request_finished(&mut self, outcome: &RequestOutcome, _index: usize, _total: usize) {
            self.requests.push(outcome.request_id.clone());
        }

        fn group_finished(&mut self, group: &ResultGroup, _elapsed: Duration) {
            self.finished.push((group.context_size.clone(), group.status));
        }
    }

    fn runner(endpoint: Arc<MockEndpoint>, seed: u64) -> BenchmarkRunner {
        let driver = RequestDriver::new(
            endpoint,
            StreamConsumer::new(TokenEstimator::heuristic()),
            16,
            Duration::from_secs(30),
        );
        BenchmarkRunner::new(
            Arc::new(driver),
            Arc::new(ContextCatalog::builtin()),
            Some(seed),
        )
    }

    fn plan(labels: &[&str], requests: usize, concurrency: usize) -> BenchmarkPlan {
        let catalog = ContextCatalog::builtin();
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        BenchmarkPlan {
            templates: catalog.resolve(&labels).unwrap(),
            requests_per_size: requests,
            concurrency,
            inter_request_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_sequential_failure_halts_run() {
        let endpoint = Arc::new(MockEndpoint::with_scripts(
            Script::reply("ok"),
            vec![
                Script::reply("ok"),
                Script::fail(ClientError::Connection("refused".into())),
            ],
        ));
        let mut recorder = Recorder::default();

        let run = runner(endpoint.clone(), 1)
            .run(&plan(&["13t", "1k", "2k"], 2, 1), &mut recorder)
            .await;

        assert_eq!(run.status, RunStatus::AbortedAt("13t".to_string()));
        assert_eq!(run.groups.len(), 1);
        let group = &run.groups[0];
        assert_eq!(group.status, GroupStatus::Aborted);
        assert_eq!(group.results.len(), 2);
        assert!(group.results[0].success);
        assert!(!group.results[1].success);
        assert_eq!(endpoint.calls(), 2);
        assert_eq!(recorder.finished, vec![("13t".to_string(), GroupStatus::Aborted)]);
    }

    #[tokio::test]
    async fn test_sequential_failure_on_first_request() {
        let endpoint = Arc::new(MockEndpoint::new(Script::fail(ClientError::Http4xx {
            status: 400,
            message: "context too long".into(),
        })));

        let run = runner(endpoint.clone(), 1)
            .run(&plan(&["1k", "2k"], 3, 1), &mut Recorder::default())
            .await;

        assert_eq!(run.status, RunStatus::AbortedAt("1k".to_string()));
        assert_eq!(run.groups[0].results.len(), 1);
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_completed_run_keeps_order() {
        let endpoint = Arc::new(MockEndpoint::new(Script::reply("fine")));
        let mut recorder = Recorder::default();

        let run = runner(endpoint.clone(), 1)
            .run(&plan(&["2k", "13t", "1k"], 2, 1), &mut recorder)
            .await;

        assert_eq!(run.status, RunStatus::Completed);
        let labels: Vec<&str> = run.groups.iter().map(|g| g.context_size.as_str()).collect();
        assert_eq!(labels, ["2k", "13t", "1k"]);
        assert_eq!(recorder.started, ["2k", "13t", "1k"]);
        assert_eq!(
            recorder.requests,
            ["2k-1", "2k-2", "13t-1", "13t-2", "1k-1", "1k-2"]
        );
        assert!(run.groups.iter().all(|g| g.status == GroupStatus::Completed));
        assert_eq!(endpoint.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_delay_between_attempts() {
        let endpoint = Arc::new(MockEndpoint::new(Script::reply("ok")));
        let mut plan = plan(&["1k"], 3, 1);
        plan.inter_request_delay = Duration::from_secs(1);

        let started = Instant::now();
        runner(endpoint, 1).run(&plan, &mut Recorder::default()).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let endpoint = Arc::new(MockEndpoint::new(
            Script::reply("ok").with_open_delay(Duration::from_secs(1)),
        ));

        let run = runner(endpoint.clone(), 1)
            .run(&plan(&["1k"], 10, 3), &mut Recorder::default())
            .await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.groups[0].results.len(), 10);
        assert_eq!(run.groups[0].concurrency, 3);
        assert_eq!(endpoint.calls(), 10);
        assert_eq!(endpoint.peak_inflight(), 3);
        assert_eq!(endpoint.inflight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_batch_runs_to_completion_before_abort() {
        let endpoint = Arc::new(MockEndpoint::with_scripts(
            Script::reply("ok"),
            vec![Script::fail(ClientError::Http5xx {
                status: 502,
                message: "bad gateway".into(),
            })],
        ));

        let run = runner(endpoint.clone(), 1)
            .run(&plan(&["1k", "2k"], 4, 2), &mut Recorder::default())
            .await;

        assert_eq!(run.status, RunStatus::AbortedAt("1k".to_string()));
        assert_eq!(run.groups.len(), 1);
        let group = &run.groups[0];
        assert_eq!(group.results.len(), 4);
        assert_eq!(group.failure_count(), 1);
        let ids: Vec<&str> = group.results.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, ["1k-1", "1k-2", "1k-3", "1k-4"]);
        assert_eq!(endpoint.calls(), 4);
    }

    #[tokio::test]
    async fn test_seeded_runs_send_same_prompts() {
        let prompts = |seed| async move {
            let endpoint = Arc::new(MockEndpoint::new(Script::reply("ok")));
            runner(endpoint.clone(), seed)
                .run(&plan(&["1k", "4k"], 5, 1), &mut Recorder::default())
                .await;
            endpoint.prompts()
        };

        let first = prompts(9).await;
        let second = prompts(9).await;
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);
    }

    #[test]
    fn test_request_ids_are_one_based() {
        assert_eq!(request_id("32k", 0), "32k-1");
        assert_eq!(request_id("13t", 2), "13t-3");
    }
}
