//! Conformance run orchestration
//!
//! Stages run in a fixed order against one target and the first failure
//! stops the run: every stage depends on the state the previous one left
//! behind on the device.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tracing::{error, info};

use crate::actions::ActionDriver;
use crate::client::ThingClient;
use crate::config::TargetConfig;
use crate::description::validate_description;
use crate::error::{ConformanceError, ConformanceResult};
use crate::events::EventLog;
use crate::profile::DeviceProfile;
use crate::properties::PropertyChecker;
use crate::websocket::run_session;

/// Stage names, in execution order
pub const STAGES: [&str; 5] = [
    "thing description",
    "properties",
    "actions",
    "events",
    "websocket",
];

/// How a stage ended
#[derive(Debug)]
pub enum StageOutcome {
    Passed,
    Failed(ConformanceError),
    Skipped,
}

/// Result of one stage
#[derive(Debug)]
pub struct StageReport {
    pub name: &'static str,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

impl StageReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Passed)
    }

    /// Print a single summary line
    pub fn print_summary(&self) {
        match &self.outcome {
            StageOutcome::Passed => println!("✅ {} - PASS ({:?})", self.name, self.elapsed),
            StageOutcome::Failed(e) => {
                println!("❌ {} - FAIL ({:?})", self.name, self.elapsed);
                println!("   [{:>9}] {}", e.category(), e);
            }
            StageOutcome::Skipped => println!("⏭  {} - SKIPPED", self.name),
        }
    }
}

/// One conformance run against one target
pub struct ConformanceRun {
    pub config: TargetConfig,
    pub profile: DeviceProfile,
    pub reports: Vec<StageReport>,
}

impl ConformanceRun {
    /// Create a run checking the lamp profile
    pub fn new(config: TargetConfig) -> Self {
        Self::with_profile(config, DeviceProfile::lamp())
    }

    pub fn with_profile(config: TargetConfig, profile: DeviceProfile) -> Self {
        Self {
            config,
            profile,
            reports: Vec::new(),
        }
    }

    /// Execute every stage, stopping at the first failure
    ///
    /// Returns whether all stages passed.
    pub async fn run(&mut self) -> bool {
        let config = self.config.clone();
        let profile = self.profile.clone();
        info!(target_url = %config.url("/"), schema = ?config.schema, "starting conformance run");

        let client = match ThingClient::new(&config) {
            Ok(client) => client,
            Err(e) => {
                self.record(STAGES[0], Instant::now(), Err::<(), _>(e));
                return self.skip_from(1);
            }
        };
        let properties = PropertyChecker::new(&client);
        let mut actions = ActionDriver::new(&client);
        let mut events = EventLog::new(&client, &profile);

        let start = Instant::now();
        let result = fetch_and_validate(&client, &profile).await;
        let Some(ws_href) = self.record(STAGES[0], start, result) else {
            return self.skip_from(1);
        };

        let start = Instant::now();
        let result = properties.run(&profile).await;
        if self.record(STAGES[1], start, result).is_none() {
            return self.skip_from(2);
        }

        // The event log must be empty before the first fade.
        let start = Instant::now();
        let result = async {
            events.verify().await?;
            actions.run().await
        }
        .await;
        if self.record(STAGES[2], start, result).is_none() {
            return self.skip_from(3);
        }

        let start = Instant::now();
        events.record_trigger();
        let result = events.verify().await.map(|_| ());
        if self.record(STAGES[3], start, result).is_none() {
            return self.skip_from(4);
        }

        let start = Instant::now();
        let result = run_session(
            &ws_href,
            &profile,
            &properties,
            &mut actions,
            &mut events,
            &config,
        )
        .await;
        self.record(STAGES[4], start, result).is_some()
    }

    fn record<T>(
        &mut self,
        name: &'static str,
        start: Instant,
        result: ConformanceResult<T>,
    ) -> Option<T> {
        let elapsed = start.elapsed();
        let (outcome, value) = match result {
            Ok(value) => {
                info!(stage = name, ?elapsed, "stage passed");
                (StageOutcome::Passed, Some(value))
            }
            Err(e) => {
                error!(stage = name, category = e.category(), error = %e, "stage failed");
                (StageOutcome::Failed(e), None)
            }
        };
        self.reports.push(StageReport {
            name,
            outcome,
            elapsed,
        });
        value
    }

    fn skip_from(&mut self, index: usize) -> bool {
        for &name in &STAGES[index..] {
            self.reports.push(StageReport {
                name,
                outcome: StageOutcome::Skipped,
                elapsed: Duration::ZERO,
            });
        }
        false
    }

    /// Check if every stage passed
    pub fn all_passed(&self) -> bool {
        !self.reports.is_empty() && self.reports.iter().all(StageReport::passed)
    }

    /// The error that stopped the run, if any
    pub fn failure(&self) -> Option<&ConformanceError> {
        self.reports.iter().find_map(|report| match &report.outcome {
            StageOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    /// Print summary of all stages
    pub fn print_summary(&self) {
        println!("\n=== Web Thing Conformance Summary ===");
        println!("Target: {}", self.config.url("/"));
        println!("Schema: {:?}", self.config.schema);
        println!();

        for report in &self.reports {
            report.print_summary();
        }

        let passed = self.reports.iter().filter(|r| r.passed()).count();
        println!();
        println!("Results: {}/{} stages passed", passed, STAGES.len());
        if self.all_passed() {
            println!("✅ Target conforms");
        } else {
            println!("❌ Target does not conform");
        }
    }
}

async fn fetch_and_validate(
    client: &ThingClient,
    profile: &DeviceProfile,
) -> ConformanceResult<String> {
    let doc = client
        .get("/")
        .await?
        .expect_status(StatusCode::OK)?
        .into_json()?;
    validate_description(&doc, profile, client.config())
}
