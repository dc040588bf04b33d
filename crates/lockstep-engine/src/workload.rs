//! Seeded cafe workload for exercising the runtime end to end.
//!
//! Customers arrive at random times, wait for the cafe to open, then wait
//! for their drink to brew. Every customer is shadowed by a watchdog that
//! cancels the order once the customer's patience runs out. All randomness
//! is drawn up front from one seeded generator, so the seed fully determines
//! the run.
//!
//! All times in the `workload` section are relative to the loop's start.

use std::rc::Rc;

use lockstep_core::{
    Activity, All, Any, Condition, Fault, Flag, Handle, LoopConfig, RunSummary, SharedCondition,
    simulate,
};
use lockstep_types::{ActivityState, Time};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;

// -----------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------

/// Configuration for the cafe workload, loaded from the `workload` section
/// of `lockstep-config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkloadConfig {
    /// Seed for the random generator.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of customers.
    #[serde(default = "default_customers")]
    pub customers: u32,

    /// Customers arrive at whole times in `[0, arrival_window]`.
    #[serde(default = "default_arrival_window")]
    pub arrival_window: u32,

    /// When the cafe opens. Customers arriving earlier queue outside.
    #[serde(default = "default_opens_at")]
    pub opens_at: Time,

    /// Shortest brew time.
    #[serde(default = "default_brew_min")]
    pub brew_min: Time,

    /// Longest brew time.
    #[serde(default = "default_brew_max")]
    pub brew_max: Time,

    /// How long a customer waits after arriving before walking out.
    #[serde(default = "default_patience")]
    pub patience: Time,

    /// Run the workload twice and fail if the reports differ.
    #[serde(default = "default_verify_determinism")]
    pub verify_determinism: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            customers: default_customers(),
            arrival_window: default_arrival_window(),
            opens_at: default_opens_at(),
            brew_min: default_brew_min(),
            brew_max: default_brew_max(),
            patience: default_patience(),
            verify_determinism: default_verify_determinism(),
        }
    }
}

const fn default_seed() -> u64 {
    7
}

const fn default_customers() -> u32 {
    12
}

const fn default_arrival_window() -> u32 {
    30
}

fn default_opens_at() -> Time {
    Time::new(Decimal::new(5, 0))
}

fn default_brew_min() -> Time {
    Time::new(Decimal::new(15, 1))
}

fn default_brew_max() -> Time {
    Time::new(Decimal::new(6, 0))
}

fn default_patience() -> Time {
    Time::new(Decimal::new(8, 0))
}

const fn default_verify_determinism() -> bool {
    true
}

/// Drinks on the menu. Each customer orders one at random.
const MENU: &[&str] = &[
    "espresso",
    "latte",
    "cortado",
    "flat white",
    "mocha",
    "americano",
    "macchiato",
    "chai",
];

// -----------------------------------------------------------------------
// Planning
// -----------------------------------------------------------------------

/// One customer's order, fixed before the simulation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Customer name.
    pub name: String,
    /// What the customer ordered.
    pub drink: String,
    /// Arrival, relative to the loop's start.
    pub arrival: Time,
    /// How long the drink takes to brew.
    pub brew: Time,
}

impl WorkloadConfig {
    /// Check that the configured ranges make sense.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (field, value) in [
            ("opens_at", self.opens_at),
            ("brew_min", self.brew_min),
            ("patience", self.patience),
        ] {
            if value.is_negative() {
                return Err(EngineError::Workload {
                    message: format!("{field} must not be negative, got {value}"),
                });
            }
        }
        if self.brew_max < self.brew_min {
            return Err(EngineError::Workload {
                message: format!(
                    "brew_max {} is below brew_min {}",
                    self.brew_max, self.brew_min
                ),
            });
        }
        Ok(())
    }

    /// Draw every customer's order from the seeded generator.
    pub fn plan(&self) -> Result<Vec<Order>, EngineError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let span = self
            .brew_max
            .value()
            .checked_sub(self.brew_min.value())
            .ok_or_else(|| overflow("brew range"))?;

        (0..self.customers)
            .map(|n| {
                let arrival = Time::from(rng.random_range(0..=self.arrival_window));
                let drink = MENU
                    .get(rng.random_range(0..MENU.len()))
                    .copied()
                    .unwrap_or("drip");
                let fraction = Decimal::new(i64::from(rng.random_range(0_u32..=100)), 2);
                let extra = span
                    .checked_mul(fraction)
                    .ok_or_else(|| overflow("brew time"))?
                    .round_dp(2);
                let brew = self
                    .brew_min
                    .checked_add(Time::new(extra))
                    .ok_or_else(|| overflow("brew time"))?;
                Ok(Order {
                    name: format!("customer-{n:02}"),
                    drink: drink.to_owned(),
                    arrival,
                    brew,
                })
            })
            .collect()
    }
}

fn overflow(what: &str) -> EngineError {
    EngineError::Workload {
        message: format!("{what} overflows"),
    }
}

// -----------------------------------------------------------------------
// Report
// -----------------------------------------------------------------------

/// What happened to one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerReport {
    /// Customer name.
    pub name: String,
    /// What the customer ordered.
    pub drink: String,
    /// Absolute arrival time.
    pub arrived: Time,
    /// Brew time of the order.
    pub brew: Time,
    /// Final status of the customer's activity.
    pub status: ActivityState,
    /// When the drink was handed over, if it was.
    pub served_at: Option<Time>,
}

/// Result of one workload run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadReport {
    /// The seed the orders were drawn from.
    pub seed: u64,
    /// Customers who got their drink.
    pub served: usize,
    /// Customers whose watchdog cancelled the order.
    pub walked_out: usize,
    /// Per-customer details, in order of arrival planning.
    pub customers: Vec<CustomerReport>,
    /// What the loop did.
    pub summary: RunSummary,
}

// -----------------------------------------------------------------------
// Running
// -----------------------------------------------------------------------

/// Run the workload once on a fresh loop.
pub fn run(
    loop_config: &LoopConfig,
    workload: &WorkloadConfig,
) -> Result<WorkloadReport, EngineError> {
    let orders = workload.plan()?;
    let opens_at = workload.opens_at;
    let patience = workload.patience;
    info!(
        seed = workload.seed,
        customers = orders.len(),
        opens_at = %opens_at,
        patience = %patience,
        "Cafe workload planned"
    );

    let result = simulate(loop_config.clone(), move |handle| {
        open_cafe(handle, orders, opens_at, patience)
    })?;

    let customers = result.value;
    let served = customers
        .iter()
        .filter(|c| c.status == ActivityState::Success)
        .count();
    let walked_out = customers
        .iter()
        .filter(|c| c.status == ActivityState::Cancelled)
        .count();
    info!(
        served,
        walked_out,
        turnstamp = %result.summary.final_turnstamp,
        "Cafe workload finished"
    );

    Ok(WorkloadReport {
        seed: workload.seed,
        served,
        walked_out,
        customers,
        summary: result.summary,
    })
}

/// Run the workload, and again to confirm the replay matches when
/// `verify_determinism` is set.
pub fn run_verified(
    loop_config: &LoopConfig,
    workload: &WorkloadConfig,
) -> Result<WorkloadReport, EngineError> {
    let report = run(loop_config, workload)?;
    if !workload.verify_determinism {
        return Ok(report);
    }
    let replay = run(loop_config, workload)?;
    if replay != report {
        return Err(EngineError::Nondeterministic {
            seed: workload.seed,
        });
    }
    debug!(seed = workload.seed, "Replay matched");
    Ok(report)
}

/// The main activity: open the doors, admit every customer with a watchdog,
/// and wait until every customer is done one way or the other.
async fn open_cafe(
    handle: Handle,
    orders: Vec<Order>,
    opens_at: Time,
    patience: Time,
) -> Result<Vec<CustomerReport>, Fault> {
    let open = Flag::new(&handle);
    let doors = open.clone();
    let opening = handle.deadline_after(opens_at)?;
    handle.spawn_at(
        async move {
            doors.raise();
            debug!("Cafe opened");
            Ok(())
        },
        opening,
    )?;

    let mut admitted = Vec::with_capacity(orders.len());
    for order in &orders {
        let arrival = handle.deadline_after(order.arrival)?;
        let customer = handle.spawn_at(serve(handle.clone(), open.clone(), order.brew), arrival)?;
        handle.spawn_at(watch(handle.clone(), customer.clone(), patience), arrival)?;
        admitted.push((order, arrival, customer));
    }

    let everyone = All::new(
        admitted
            .iter()
            .map(|(_, _, customer)| Rc::new(customer.done()) as SharedCondition),
    );
    everyone.wait().await?;

    Ok(admitted
        .into_iter()
        .map(|(order, arrived, customer)| CustomerReport {
            name: order.name.clone(),
            drink: order.drink.clone(),
            arrived,
            brew: order.brew,
            status: customer.status(),
            served_at: customer.outcome().and_then(Result::ok),
        })
        .collect())
}

/// One customer: wait for the doors, then for the drink.
async fn serve(handle: Handle, open: Flag, brew: Time) -> Result<Time, Fault> {
    open.wait().await?;
    handle.sleep(brew).await?;
    Ok(handle.now())
}

/// Cancel `customer` unless it is served within `patience`.
///
/// Returns whether the customer was sent away.
async fn watch(handle: Handle, customer: Activity<Time>, patience: Time) -> Result<bool, Fault> {
    let deadline = handle.deadline_after(patience)?;
    let served_or_late = Any::new([
        Rc::new(customer.done()) as SharedCondition,
        Rc::new(handle.after(deadline)) as SharedCondition,
    ]);
    served_or_late.wait().await?;
    if customer.is_finished() {
        return Ok(false);
    }
    debug!(activity = %customer.id(), time = %handle.now(), "Customer ran out of patience");
    customer.cancel_with("ran out of patience");
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn same_seed_draws_same_orders() {
        let config = WorkloadConfig::default();
        assert_eq!(config.plan().unwrap(), config.plan().unwrap());
        assert_eq!(config.plan().unwrap().len(), 12);
    }

    #[test]
    fn brew_times_stay_in_range() {
        let config = WorkloadConfig {
            customers: 50,
            ..WorkloadConfig::default()
        };
        for order in config.plan().unwrap() {
            assert!(order.brew >= config.brew_min, "{order:?}");
            assert!(order.brew <= config.brew_max, "{order:?}");
            assert!(order.arrival <= Time::from(config.arrival_window));
        }
    }

    #[test]
    fn inverted_brew_range_is_rejected() {
        let config = WorkloadConfig {
            brew_min: Time::new(dec!(4)),
            brew_max: Time::new(dec!(2)),
            ..WorkloadConfig::default()
        };
        assert!(matches!(config.plan(), Err(EngineError::Workload { .. })));
    }

    #[test]
    fn negative_patience_is_rejected() {
        let config = WorkloadConfig {
            patience: Time::new(dec!(-1)),
            ..WorkloadConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Workload { .. })));
    }

    #[test]
    fn partial_section_uses_defaults() {
        let config: WorkloadConfig = serde_yml::from_str("customers: 3\npatience: 2.5\n").unwrap();
        assert_eq!(config.customers, 3);
        assert_eq!(config.patience, Time::new(dec!(2.5)));
        assert_eq!(config.seed, 7);
        assert!(config.verify_determinism);
    }

    #[test]
    fn patient_customers_are_all_served() {
        let workload = WorkloadConfig {
            patience: Time::from(1_000_u32),
            ..WorkloadConfig::default()
        };
        let report = run(&LoopConfig::default(), &workload).unwrap();
        assert_eq!(report.served, 12);
        assert_eq!(report.walked_out, 0);
        for customer in &report.customers {
            let start = customer.arrived.max(workload.opens_at);
            assert_eq!(customer.served_at, start.checked_add(customer.brew));
        }
    }

    #[test]
    fn impatient_customers_walk_out() {
        let workload = WorkloadConfig {
            patience: Time::ZERO,
            ..WorkloadConfig::default()
        };
        let report = run(&LoopConfig::default(), &workload).unwrap();
        assert_eq!(report.served, 0);
        assert_eq!(report.walked_out, 12);
        assert!(report.customers.iter().all(|c| c.served_at.is_none()));
    }

    #[test]
    fn default_workload_replays_identically() {
        let workload = WorkloadConfig::default();
        let report = run_verified(&LoopConfig::default(), &workload).unwrap();
        assert_eq!(report.served.saturating_add(report.walked_out), 12);
        assert_eq!(report.summary.end_reason, lockstep_types::EndReason::Idle);
    }

    #[test]
    fn start_offset_shifts_arrivals() {
        let workload = WorkloadConfig {
            customers: 4,
            ..WorkloadConfig::default()
        };
        let shifted = run(&LoopConfig::starting_at(Time::from(100_u32)), &workload).unwrap();
        let plain = run(&LoopConfig::default(), &workload).unwrap();
        for (a, b) in shifted.customers.iter().zip(&plain.customers) {
            assert_eq!(a.arrived, b.arrived.checked_add(Time::from(100_u32)).unwrap());
            assert_eq!(a.status, b.status);
        }
    }
}
