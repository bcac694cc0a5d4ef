//! Simulation driver.
//!
//! Items describe their own simulator: `<function>:<interval ms>:<params...>`.
//!
//! | Function      | Params                   |
//! |---------------|--------------------------|
//! | `increment`   | `init:delta`             |
//! | `randomInt`   | `init:min:max`           |
//! | `randomDelta` | `init:min:max:delta`     |
//!
//! Tokens after the function params are ignored except that they make the
//! item name distinct, so `randomInt:1000:0:0:9:a` and `randomInt:1000:0:0:9:b`
//! are two independent series.

use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagbus_core::coerce::parse_numeric;
use tagbus_core::{panic_message, values_equal, Driver, ItemSink};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimFunction {
    Increment { delta: i64 },
    RandomInt { min: i64, max: i64 },
    RandomDelta { min: i64, max: i64, delta: i64 },
}

#[derive(Debug, Clone)]
struct Simulator {
    function: SimFunction,
    interval: Duration,
    value: Value,
}

/// Integer token with a fallback for missing or unparsable input.
fn int_param(params: &[&str], index: usize, fallback: i64) -> i64 {
    params
        .get(index)
        .and_then(|t| t.trim().parse::<i64>().ok())
        .unwrap_or(fallback)
}

/// Range params shared by the random functions. `max` is forced above `min`.
fn range_params(params: &[&str]) -> Result<(i64, i64), String> {
    let min = int_param(params, 1, 0);
    let above = min
        .checked_add(1)
        .ok_or_else(|| format!("min [{min}] leaves no room for max"))?;
    let max = int_param(params, 2, above);
    Ok((min, if max <= min { above } else { max }))
}

/// Numeric view of a simulator value, accepting numeric strings.
fn numeric(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        _ => parse_numeric(value),
    }
}

impl Simulator {
    fn parse(item: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = item.split(':').collect();
        let name = tokens[0];

        let interval = tokens
            .get(1)
            .and_then(|t| t.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                format!(
                    "interval [{}] must be a positive non-zero integer: {}",
                    tokens.get(1).copied().unwrap_or_default(),
                    item
                )
            })?;

        let params = &tokens[2..];
        let required = match name {
            "increment" => 2,
            "randomInt" => 3,
            "randomDelta" => 4,
            _ => return Err(format!("invalid function name: {name}")),
        };
        if params.len() < required {
            return Err(format!("{name} needs {required} params: {item}"));
        }

        let init = int_param(params, 0, 0);
        let function = match name {
            "increment" => SimFunction::Increment {
                delta: int_param(params, 1, 1),
            },
            "randomInt" => {
                let (min, max) = range_params(params).map_err(|e| format!("{e}: {item}"))?;
                SimFunction::RandomInt { min, max }
            }
            _ => {
                let (min, max) = range_params(params).map_err(|e| format!("{e}: {item}"))?;
                SimFunction::RandomDelta {
                    min,
                    max,
                    delta: int_param(params, 3, 1).saturating_abs(),
                }
            }
        };

        Ok(Self {
            function,
            interval: Duration::from_millis(interval),
            value: Value::from(init),
        })
    }

    /// Next value of the series.
    ///
    /// Continues from the current value, which may have been written as a
    /// float or a numeric string. Anything else restarts the series from 0.
    fn step(&self) -> Value {
        let current = numeric(&self.value).unwrap_or_else(|| Value::from(0));
        let mut rng = rand::thread_rng();
        match current.as_i64() {
            Some(current) => Value::from(match self.function {
                SimFunction::Increment { delta } => current.saturating_add(delta),
                SimFunction::RandomInt { min, max } => rng.gen_range(min..=max),
                SimFunction::RandomDelta { min, max, delta } => current
                    .saturating_add(rng.gen_range(-delta..=delta))
                    .clamp(min, max),
            }),
            None => {
                let current = current.as_f64().unwrap_or(0.0);
                match self.function {
                    SimFunction::Increment { delta } => Value::from(current + delta as f64),
                    SimFunction::RandomInt { min, max } => Value::from(rng.gen_range(min..=max)),
                    SimFunction::RandomDelta { min, max, delta } => Value::from(
                        (current + rng.gen_range(-delta..=delta) as f64)
                            .clamp(min as f64, max as f64),
                    ),
                }
            }
        }
    }
}

type Simulators = Arc<Mutex<HashMap<String, Simulator>>>;

/// Apply a value to a simulator. Returns it when it changed.
fn apply(simulators: &Simulators, item: &str, value: Value) -> Option<Value> {
    let mut sims = lock(simulators);
    let sim = sims.get_mut(item)?;
    if values_equal(&sim.value, &value) {
        return None;
    }
    sim.value = value.clone();
    Some(value)
}

fn advance(simulators: &Simulators, item: &str) -> Option<Value> {
    let next = lock(simulators).get(item)?.step();
    apply(simulators, item, next)
}

#[derive(Debug)]
pub struct SimDriver {
    simulators: Simulators,
    sink: ItemSink,
    tasks: HashMap<String, JoinHandle<()>>,
    running: bool,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            simulators: Arc::new(Mutex::new(HashMap::new())),
            sink: ItemSink::discard(crate::SIM_DRIVER_ID),
            tasks: HashMap::new(),
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn spawn_item(&mut self, item: &str, interval: Duration) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("sim item {} cannot start without a runtime: {}", item, e);
                return;
            }
        };
        let simulators = self.simulators.clone();
        let sink = self.sink.clone();
        let name = item.to_string();

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match catch_unwind(AssertUnwindSafe(|| advance(&simulators, &name))) {
                    Ok(Some(value)) => sink.emit(&name, value),
                    Ok(None) => {}
                    Err(panic) => {
                        error!(
                            "sim function panicked for item {}: {}",
                            name,
                            panic_message(panic.as_ref())
                        );
                        std::process::exit(1);
                    }
                }
            }
        });
        self.tasks.insert(item.to_string(), task);
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimDriver {
    fn attach(&mut self, sink: ItemSink) {
        self.sink = sink;
    }

    fn register(&mut self, item: &str) {
        if lock(&self.simulators).contains_key(item) {
            return;
        }
        let sim = match Simulator::parse(item) {
            Ok(sim) => sim,
            Err(e) => {
                error!("sim register failed: {}", e);
                return;
            }
        };
        let interval = sim.interval;
        lock(&self.simulators).insert(item.to_string(), sim);
        debug!("sim item registered: {}", item);

        if self.running {
            self.spawn_item(item, interval);
        }
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        let schedule: Vec<(String, Duration)> = lock(&self.simulators)
            .iter()
            .map(|(item, sim)| (item.clone(), sim.interval))
            .collect();
        for (item, interval) in schedule {
            self.spawn_item(&item, interval);
        }
        debug!("sim driver started with {} items", self.tasks.len());
    }

    fn stop(&mut self) {
        self.running = false;
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        debug!("sim driver stopped");
    }

    fn read_item(&self, item: &str) -> Option<Value> {
        lock(&self.simulators).get(item).map(|sim| sim.value.clone())
    }

    fn write_item(&mut self, item: &str, value: Value) -> bool {
        if !lock(&self.simulators).contains_key(item) {
            warn!("sim write to unknown item {}", item);
            return false;
        }
        if let Some(value) = apply(&self.simulators, item, value) {
            self.sink.emit(item, value);
        }
        true
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tagbus_core::ItemEvent;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn attached() -> (SimDriver, mpsc::UnboundedReceiver<ItemEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut driver = SimDriver::new();
        driver.attach(ItemSink::new("sim", move |e| {
            let _ = tx.send(e);
        }));
        (driver, rx)
    }

    #[test]
    fn test_parse_items() {
        let sim = Simulator::parse("increment:250:10:5").unwrap();
        assert_eq!(sim.interval, Duration::from_millis(250));
        assert_eq!(sim.value, json!(10));
        assert_eq!(sim.function, SimFunction::Increment { delta: 5 });

        let sim = Simulator::parse("randomInt:1000:0:7:3:series-a").unwrap();
        assert_eq!(sim.function, SimFunction::RandomInt { min: 7, max: 8 });

        let sim = Simulator::parse("randomDelta:1000:50:0:100:-3").unwrap();
        assert_eq!(
            sim.function,
            SimFunction::RandomDelta {
                min: 0,
                max: 100,
                delta: 3
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_items() {
        assert!(Simulator::parse("increment:0:1:1").is_err());
        assert!(Simulator::parse("increment:abc:1:1").is_err());
        assert!(Simulator::parse("sine:1000:1:1").is_err());
        assert!(Simulator::parse("randomInt:1000:0").is_err());
    }

    #[test]
    fn test_parse_extreme_params() {
        assert!(Simulator::parse("randomInt:1000:0:9223372036854775807:x").is_err());
        assert!(Simulator::parse("randomDelta:1000:0:9223372036854775807:0:1").is_err());

        let sim = Simulator::parse("randomInt:1000:0:9223372036854775806:5").unwrap();
        assert_eq!(
            sim.function,
            SimFunction::RandomInt {
                min: i64::MAX - 1,
                max: i64::MAX
            }
        );

        let sim = Simulator::parse("randomDelta:1000:0:0:10:-9223372036854775808").unwrap();
        assert_eq!(
            sim.function,
            SimFunction::RandomDelta {
                min: 0,
                max: 10,
                delta: i64::MAX
            }
        );
        let v = sim.step().as_i64().unwrap();
        assert!((0..=10).contains(&v));
    }

    #[test]
    fn test_step_continues_from_written_value() {
        let mut sim = Simulator::parse("increment:1000:0:2").unwrap();

        sim.value = json!(2.5);
        assert_eq!(sim.step(), json!(4.5));

        sim.value = json!("7");
        assert_eq!(sim.step(), json!(9));

        sim.value = json!("on");
        assert_eq!(sim.step(), json!(2));

        let mut sim = Simulator::parse("randomDelta:1000:0:0:10:1").unwrap();
        sim.value = json!(5.5);
        let v = sim.step().as_f64().unwrap();
        assert!((4.5..=6.5).contains(&v));
    }

    #[test]
    fn test_random_delta_stays_in_range() {
        let mut sim = Simulator::parse("randomDelta:1000:5:0:10:20").unwrap();
        for _ in 0..200 {
            sim.value = sim.step();
            let v = sim.value.as_i64().unwrap();
            assert!((0..=10).contains(&v));
        }
    }

    #[test]
    fn test_invalid_item_stays_unknown() {
        let (mut driver, _rx) = attached();
        driver.register("sine:1000:1");
        assert_eq!(driver.read_item("sine:1000:1"), None);
        assert!(!driver.write_item("sine:1000:1", json!(1)));
    }

    #[tokio::test]
    async fn test_increment_emits_on_each_tick() {
        let (mut driver, mut rx) = attached();
        driver.register("increment:10:0:1");
        assert_eq!(driver.read_item("increment:10:0:1"), Some(json!(0)));
        driver.start();

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.item, "increment:10:0:1");
        assert_eq!(first.value, json!(1));

        let second = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.value, json!(2));
        driver.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_polling() {
        let (mut driver, mut rx) = attached();
        driver.register("increment:10:0:1");
        driver.start();
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        driver.stop();
        assert!(!driver.is_running());

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_overrides_value() {
        let (mut driver, mut rx) = attached();
        driver.register("increment:60000:0:1");

        assert!(driver.write_item("increment:60000:0:1", json!(100)));
        assert!(driver.write_item("increment:60000:0:1", json!(100)));

        assert_eq!(driver.read_item("increment:60000:0:1"), Some(json!(100)));
        assert_eq!(rx.try_recv().unwrap().value, json!(100));
        assert!(rx.try_recv().is_err());
    }
}
