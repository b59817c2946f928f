use anyhow::Context;
use chrono::{DateTime, Local, Timelike};
use cron::Schedule;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::analyzer::{Analyzer, RunPlan};
use crate::config::Config;

type PlanFn = fn(&Config) -> RunPlan;

/// The clock job fires at the top of every UTC minute; configured schedules
/// are matched against the local wall-clock minute it lands on.
const CLOCK: &str = "0 * * * * *";

/// A configured cron expression paired with the run it triggers.
pub struct ScheduledPlan {
    pub name: &'static str,
    pub schedule: Schedule,
    plan: PlanFn,
}

impl ScheduledPlan {
    fn parse(name: &'static str, expression: &str, plan: PlanFn) -> anyhow::Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("invalid {} schedule '{}'", name, expression))?;
        Ok(Self { name, schedule, plan })
    }

    /// True when the schedule fires within the local minute containing `now`.
    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        match now.with_second(0).and_then(|t| t.with_nanosecond(0)) {
            Some(minute) => self.schedule.includes(minute),
            None => false,
        }
    }
}

/// Parses the daily, weekly and monthly expressions from the config.
pub fn scheduled_plans(config: &Config) -> anyhow::Result<Vec<ScheduledPlan>> {
    Ok(vec![
        ScheduledPlan::parse("daily", &config.schedule_daily, RunPlan::daily)?,
        ScheduledPlan::parse("weekly", &config.schedule_weekly, RunPlan::weekly)?,
        ScheduledPlan::parse("monthly", &config.schedule_monthly, RunPlan::monthly)?,
    ])
}

/// Runs one scheduled cycle. Errors are logged; the scheduler keeps going.
/// A cycle that fires while another is still running is skipped.
async fn run_cycle(config: Arc<Config>, pool: PgPool, plan: RunPlan, lock: Arc<Mutex<()>>) {
    let Ok(_guard) = lock.try_lock() else {
        warn!(plan = plan.name, "previous analysis still running, skipping this cycle");
        return;
    };

    info!(plan = plan.name, "scheduled analysis starting");
    let analyzer = Analyzer::new(config, pool, plan.use_browser);
    match analyzer.run(&plan).await {
        Ok(summary) => info!(
            plan = plan.name,
            results = summary.results_saved,
            "scheduled analysis finished"
        ),
        Err(e) => error!(plan = plan.name, "scheduled analysis failed: {:#}", e),
    }
    analyzer.close().await;
}

fn clock_job(
    config: Arc<Config>,
    pool: PgPool,
    plans: Arc<Vec<ScheduledPlan>>,
    lock: Arc<Mutex<()>>,
) -> anyhow::Result<Job> {
    let job = Job::new_async(CLOCK, move |_uuid, _l| {
        let config = config.clone();
        let pool = pool.clone();
        let plans = plans.clone();
        let lock = lock.clone();
        Box::pin(async move {
            let now = Local::now();
            for scheduled in plans.iter().filter(|p| p.is_due(now)) {
                debug!(job = scheduled.name, "schedule due");
                let plan = (scheduled.plan)(&config);
                run_cycle(config.clone(), pool.clone(), plan, lock.clone()).await;
            }
        })
    })?;
    Ok(job)
}

/// Registers the daily, weekly and monthly runs and starts the scheduler.
/// Times are local wall-clock.
pub async fn start_scheduler(config: Arc<Config>, pool: PgPool) -> anyhow::Result<JobScheduler> {
    let plans = scheduled_plans(&config)?;
    for scheduled in &plans {
        let next = scheduled.schedule.upcoming(Local).next();
        info!(job = scheduled.name, next = ?next, "scheduled");
    }

    let sched = JobScheduler::new().await?;
    let lock = Arc::new(Mutex::new(()));
    sched
        .add(clock_job(config, pool, Arc::new(plans), lock)?)
        .await?;

    sched.start().await?;
    info!("scheduler started");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::postgres::PgPoolOptions;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, s).single().unwrap()
    }

    fn plan<'a>(plans: &'a [ScheduledPlan], name: &str) -> &'a ScheduledPlan {
        plans.iter().find(|p| p.name == name).unwrap()
    }

    #[test]
    fn default_schedules_fire_on_local_wall_clock() {
        let plans = scheduled_plans(&Config::default()).unwrap();
        assert_eq!(plans.len(), 3);

        // 2024-09-01 is a Sunday and the first of the month.
        let daily = plan(&plans, "daily");
        assert!(daily.is_due(local(2024, 9, 3, 9, 0, 0)));
        assert!(daily.is_due(local(2024, 9, 3, 9, 0, 42)));
        assert!(!daily.is_due(local(2024, 9, 3, 9, 1, 0)));
        assert!(!daily.is_due(local(2024, 9, 3, 10, 0, 0)));

        let weekly = plan(&plans, "weekly");
        assert!(weekly.is_due(local(2024, 9, 1, 10, 0, 5)));
        assert!(!weekly.is_due(local(2024, 9, 2, 10, 0, 0)));

        let monthly = plan(&plans, "monthly");
        assert!(monthly.is_due(local(2024, 9, 1, 11, 0, 0)));
        assert!(!monthly.is_due(local(2024, 9, 2, 11, 0, 0)));
    }

    #[test]
    fn due_plans_build_their_run() {
        let config = Config::default();
        let plans = scheduled_plans(&config).unwrap();
        let run = (plan(&plans, "monthly").plan)(&config);
        assert_eq!(run.name, RunPlan::monthly(&config).name);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let config = Config {
            schedule_weekly: "every sunday".to_string(),
            ..Config::default()
        };
        let err = scheduled_plans(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("weekly"));
    }

    #[tokio::test]
    async fn clock_job_builds_from_default_config() {
        let config = Arc::new(Config::default());
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let plans = Arc::new(scheduled_plans(&config).unwrap());
        let job = clock_job(config, pool, plans, Arc::new(Mutex::new(())));
        assert!(job.is_ok());
    }
}
