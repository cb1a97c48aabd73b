//! The two sample objects served by `remora host`.
//!
//! `TestSample1` is a grab bag of methods that print and count calls.
//! `TestSample2` runs its own timer and pushes every trigger to controllers as
//! a `timerTriggerNo` attribute update.

use async_trait::async_trait;
use remora_types::object::{AttributeDesc, MethodDesc, ObjectDescriptor, Value, ValueType};
use remora_wire::{HostNotifier, ObjectHost};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const SAMPLE1: &str = "TestSample1";
pub const SAMPLE2: &str = "TestSample2";

/// Shortest period `enableTimer` accepts.
const MIN_PERIOD_MS: i64 = 100;

struct Sample1 {
    method_calls: i64,
    my_string: String,
}

struct Sample2 {
    timeout: i64,
    timer_trigger_no: i64,
    timer: Option<JoinHandle<()>>,
}

impl Sample1 {
    fn descriptor(&self) -> ObjectDescriptor {
        ObjectDescriptor::new(SAMPLE1, "A simple test object with a handful of methods.")
            .with_attribute(
                AttributeDesc::new("methodCalls", Value::Int(self.method_calls))
                    .read_only()
                    .describe("number of method calls so far"),
            )
            .with_attribute(
                AttributeDesc::new("myString", Value::from(self.my_string.as_str()))
                    .read_only()
                    .describe("saved concatenated string"),
            )
            .with_method(MethodDesc::new("helloWorld", ValueType::Void).describe("hello world method"))
            .with_method(
                MethodDesc::new("testBoolean", ValueType::Void)
                    .arg("good", ValueType::Bool)
                    .describe("test boolean"),
            )
            .with_method(
                MethodDesc::new("printThisText", ValueType::Void)
                    .arg("text", ValueType::String)
                    .describe("prints an input text"),
            )
            .with_method(
                MethodDesc::new("doAddition", ValueType::Int)
                    .arg("a", ValueType::Int)
                    .arg("b", ValueType::Int)
                    .describe("add two integers"),
            )
            .with_method(
                MethodDesc::new("doMultiply", ValueType::Double)
                    .arg("a", ValueType::Float)
                    .arg("b", ValueType::Float)
                    .describe("multiply two floats"),
            )
            .with_method(
                MethodDesc::new("doDivision", ValueType::Float)
                    .arg("a", ValueType::Float)
                    .arg("b", ValueType::Float)
                    .describe("divide two floats"),
            )
            .with_method(
                MethodDesc::new("concateString", ValueType::String)
                    .arg("a", ValueType::String)
                    .arg("b", ValueType::String)
                    .describe("concatenate two strings"),
            )
    }
}

impl Sample2 {
    fn descriptor(&self) -> ObjectDescriptor {
        ObjectDescriptor::new(SAMPLE2, "A simple timer object.")
            .with_attribute(
                AttributeDesc::new("timeout", Value::Int(self.timeout))
                    .read_only()
                    .describe("timeout period for the timer"),
            )
            .with_attribute(
                AttributeDesc::new("timerTriggerNo", Value::Int(self.timer_trigger_no))
                    .read_only()
                    .describe("timer trigger"),
            )
            .with_method(
                MethodDesc::new("enableTimer", ValueType::Bool)
                    .optional_arg("period", ValueType::Int)
                    .describe("enables the timer with a timeout period in milliseconds"),
            )
            .with_method(MethodDesc::new("disableTimer", ValueType::Void).describe("disable the timer"))
            .with_method(MethodDesc::new("quit", ValueType::Void).describe("stop the object"))
    }
}

/// Hosts `TestSample1` and `TestSample2` until both have quit.
pub struct SampleHost {
    notifier: HostNotifier,
    sample1: Mutex<Option<Sample1>>,
    /// Shared with the timer task.
    sample2: Arc<Mutex<Option<Sample2>>>,
    all_gone: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SampleHost {
    pub fn new(notifier: HostNotifier) -> Self {
        Self {
            notifier,
            sample1: Mutex::new(Some(Sample1 {
                method_calls: 0,
                my_string: "my test".to_string(),
            })),
            sample2: Arc::new(Mutex::new(Some(Sample2 {
                timeout: 500,
                timer_trigger_no: 0,
                timer: None,
            }))),
            all_gone: Notify::new(),
        }
    }

    /// Resolves once every sample object has quit.
    pub async fn all_quit(&self) {
        self.all_gone.notified().await;
    }

    fn invoke_sample1(&self, operation: &str, args: &[Value]) -> Result<Value, String> {
        let mut guard = lock(&self.sample1);
        let state = guard.as_mut().ok_or_else(|| gone(SAMPLE1))?;
        check_signature(&state.descriptor(), operation, args)?;

        let outcome = match operation {
            "helloWorld" => {
                println!("Hello World ;)");
                Ok(Value::Void)
            }
            "testBoolean" => {
                let good = bool_arg(args, 0)?;
                println!("received boolean is {good}");
                Ok(Value::Void)
            }
            "printThisText" => {
                println!("Incoming test message {}", str_arg(args, 0)?);
                Ok(Value::Void)
            }
            "doAddition" => {
                let (a, b) = (int_arg(args, 0)?, int_arg(args, 1)?);
                match a.checked_add(b) {
                    Some(c) => {
                        println!("{a} + {b} = {c}");
                        Ok(Value::Int(c))
                    }
                    None => Err(format!("{a} + {b} overflows")),
                }
            }
            "doMultiply" => {
                let (a, b) = (float_arg(args, 0)?, float_arg(args, 1)?);
                let c = a * b;
                println!("{a} * {b} = {c}");
                Ok(Value::Float(c))
            }
            "doDivision" => {
                let (a, b) = (float_arg(args, 0)?, float_arg(args, 1)?);
                if b == 0.0 {
                    println!("failed division. divide by zero");
                    Err("division by zero".to_string())
                } else {
                    let c = a / b;
                    println!("{a} / {b} = {c}");
                    Ok(Value::Float(c))
                }
            }
            "concateString" => {
                let joined = format!("{}{}", str_arg(args, 0)?, str_arg(args, 1)?);
                println!("{} + {} = {joined}", str_arg(args, 0)?, str_arg(args, 1)?);
                state.my_string = joined.clone();
                self.notifier
                    .publish_attribute(SAMPLE1, "myString", Value::from(joined.as_str()));
                Ok(Value::String(joined))
            }
            other => return Err(format!("{SAMPLE1} has no operation {other}")),
        };

        state.method_calls += 1;
        self.notifier
            .publish_attribute(SAMPLE1, "methodCalls", Value::Int(state.method_calls));
        outcome
    }

    fn invoke_sample2(&self, operation: &str, args: &[Value]) -> Result<Value, String> {
        let mut guard = lock(&self.sample2);
        let state = guard.as_mut().ok_or_else(|| gone(SAMPLE2))?;
        check_signature(&state.descriptor(), operation, args)?;

        match operation {
            "enableTimer" => {
                let period = match args.first() {
                    Some(_) => int_arg(args, 0)?,
                    None => state.timeout,
                };
                if period < MIN_PERIOD_MS {
                    error!(period, "{SAMPLE2}: only timer periods of at least {MIN_PERIOD_MS} ms are supported");
                    return Ok(Value::Bool(false));
                }
                if state.timer.is_some() {
                    warn!("{SAMPLE2}: timer already enabled");
                    return Ok(Value::Bool(true));
                }
                state.timer = Some(spawn_trigger_loop(
                    Arc::clone(&self.sample2),
                    self.notifier.clone(),
                    period as u64,
                ));
                state.timeout = period;
                println!("{SAMPLE2} timer enabled.");
                self.notifier
                    .publish_attribute(SAMPLE2, "timeout", Value::Int(period));
                Ok(Value::Bool(true))
            }
            "disableTimer" => {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                    state.timer_trigger_no = 0;
                    println!("{SAMPLE2} timer disabled.");
                }
                Ok(Value::Void)
            }
            "quit" => {
                drop(guard);
                self.retire(SAMPLE2)?;
                self.notifier.withdraw(SAMPLE2);
                Ok(Value::Void)
            }
            other => Err(format!("{SAMPLE2} has no operation {other}")),
        }
    }

    /// Stop exposing an object.
    fn retire(&self, object: &str) -> Result<(), String> {
        let retired = match object {
            SAMPLE1 => lock(&self.sample1).take().is_some(),
            SAMPLE2 => match lock(&self.sample2).take() {
                Some(state) => {
                    if let Some(timer) = state.timer {
                        timer.abort();
                    }
                    true
                }
                None => false,
            },
            _ => false,
        };
        if !retired {
            return Err(gone(object));
        }

        info!(object, "Sample object quitting");
        if lock(&self.sample1).is_none() && lock(&self.sample2).is_none() {
            self.all_gone.notify_one();
        }
        Ok(())
    }

    fn descriptor(&self, object: &str) -> Result<ObjectDescriptor, String> {
        let descriptor = match object {
            SAMPLE1 => lock(&self.sample1).as_ref().map(Sample1::descriptor),
            SAMPLE2 => lock(&self.sample2).as_ref().map(Sample2::descriptor),
            _ => None,
        };
        descriptor.ok_or_else(|| gone(object))
    }
}

#[async_trait]
impl ObjectHost for SampleHost {
    fn objects(&self) -> Vec<ObjectDescriptor> {
        [SAMPLE1, SAMPLE2]
            .into_iter()
            .filter_map(|name| self.descriptor(name).ok())
            .collect()
    }

    async fn invoke(
        &self,
        object: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, String> {
        match object {
            SAMPLE1 => self.invoke_sample1(operation, &args),
            SAMPLE2 => self.invoke_sample2(operation, &args),
            _ => Err(gone(object)),
        }
    }

    async fn get_attribute(&self, object: &str, name: &str) -> Result<Value, String> {
        self.descriptor(object)?
            .attribute(name)
            .map(|attr| attr.value.clone())
            .ok_or_else(|| format!("{object} has no attribute {name}"))
    }

    async fn set_attribute(&self, object: &str, name: &str, _value: Value) -> Result<Value, String> {
        let descriptor = self.descriptor(object)?;
        match descriptor.attribute(name) {
            Some(_) => Err(format!("attribute {name} of {object} is read-only")),
            None => Err(format!("{object} has no attribute {name}")),
        }
    }

    async fn quit(&self, object: &str) -> Result<(), String> {
        self.retire(object)
    }
}

/// Count timer triggers on `TestSample2` and push each one to controllers.
fn spawn_trigger_loop(
    sample2: Arc<Mutex<Option<Sample2>>>,
    notifier: HostNotifier,
    period_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(period_ms);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let count = match lock(&sample2).as_mut() {
                Some(state) => {
                    state.timer_trigger_no += 1;
                    state.timer_trigger_no
                }
                None => break,
            };
            notifier.publish_attribute(SAMPLE2, "timerTriggerNo", Value::Int(count));
        }
    })
}

fn gone(object: &str) -> String {
    format!("object {object} is not available")
}

fn check_signature(descriptor: &ObjectDescriptor, operation: &str, args: &[Value]) -> Result<(), String> {
    match descriptor.method(operation) {
        Some(method) => method.check_args(args),
        None => Err(format!("{} has no operation {operation}", descriptor.name)),
    }
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, String> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| format!("argument {} must be an integer", index + 1))
}

fn float_arg(args: &[Value], index: usize) -> Result<f64, String> {
    match args.get(index) {
        Some(Value::Float(f)) => Ok(*f),
        Some(Value::Int(n)) => Ok(*n as f64),
        _ => Err(format!("argument {} must be a number", index + 1)),
    }
}

fn str_arg(args: &[Value], index: usize) -> Result<&str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("argument {} must be a string", index + 1))
}

fn bool_arg(args: &[Value], index: usize) -> Result<bool, String> {
    match args.get(index) {
        Some(Value::Bool(b)) => Ok(*b),
        _ => Err(format!("argument {} must be a boolean", index + 1)),
    }
}
