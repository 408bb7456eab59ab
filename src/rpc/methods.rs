//! RPC method handlers.
//!
//! The set of callable methods is closed: each one is a variant of
//! [`Operation`], decoded from the method name and the structural shape of
//! the params, then run by a plain function.

use serde_json::{Map, Number, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::codec;
use super::protocol::{CallRequest, CallResponse, Params, UNKNOWN_REQUEST_ID, now_timestamp};

/// Names of all registered methods, in registration order.
pub const METHOD_NAMES: [&str; 6] = [
    "add",
    "multiply",
    "get_time",
    "reverse_string",
    "simulate_delay",
    "echo",
];

/// Request-level problem detected before a handler runs.
#[derive(Debug, Error, PartialEq)]
pub enum MethodError {
    #[error("method \"{0}\" not found. Available: [{list}]", list = METHOD_NAMES.join(", "))]
    NotFound(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// A fault raised by a handler while running.
#[derive(Debug, Error, PartialEq)]
#[error("{0}")]
pub struct HandlerFault(pub String);

/// One decoded call, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add { a: Number, b: Number },
    Multiply { a: Number, b: Number },
    GetTime,
    ReverseString { s: String },
    SimulateDelay { delay_seconds: Number },
    Echo { message: Value },
}

impl Operation {
    /// Resolve `method` and bind `params` against its declared signature.
    pub fn decode(method: &str, params: Params) -> Result<Self, MethodError> {
        match method {
            "add" => {
                let [a, b] = bind(method, ["a", "b"], params)?;
                Ok(Operation::Add {
                    a: number("a", a)?,
                    b: number("b", b)?,
                })
            }
            "multiply" => {
                let [a, b] = bind(method, ["a", "b"], params)?;
                Ok(Operation::Multiply {
                    a: number("a", a)?,
                    b: number("b", b)?,
                })
            }
            "get_time" => {
                let [] = bind(method, [], params)?;
                Ok(Operation::GetTime)
            }
            "reverse_string" => {
                let [s] = bind(method, ["s"], params)?;
                match s {
                    Value::String(s) => Ok(Operation::ReverseString { s }),
                    other => Err(type_mismatch("s", "a string", &other)),
                }
            }
            "simulate_delay" => {
                let [delay] = bind(method, ["delay_seconds"], params)?;
                Ok(Operation::SimulateDelay {
                    delay_seconds: number("delay_seconds", delay)?,
                })
            }
            "echo" => {
                let [message] = bind(method, ["message"], params)?;
                Ok(Operation::Echo { message })
            }
            _ => Err(MethodError::NotFound(method.to_string())),
        }
    }

    /// Run the operation.
    pub async fn invoke(self) -> Result<Value, HandlerFault> {
        match self {
            Operation::Add { a, b } => {
                let result = arithmetic(&a, &b, i64::checked_add, |x, y| x + y)?;
                info!(%a, %b, %result, "add");
                Ok(Value::Number(result))
            }
            Operation::Multiply { a, b } => {
                let result = arithmetic(&a, &b, i64::checked_mul, |x, y| x * y)?;
                info!(%a, %b, %result, "multiply");
                Ok(Value::Number(result))
            }
            Operation::GetTime => {
                let now = now_timestamp();
                info!(time = %now, "get_time");
                Ok(Value::String(now))
            }
            Operation::ReverseString { s } => Ok(Value::String(reverse_string(&s))),
            Operation::SimulateDelay { delay_seconds } => {
                let delay = delay_duration(&delay_seconds)?;
                warn!(delay_seconds = %delay_seconds, "Simulating delay");
                tokio::time::sleep(delay).await;
                info!(delay_seconds = %delay_seconds, "Delay completed");
                Ok(Value::String(format!("Slept for {} seconds", delay_seconds)))
            }
            Operation::Echo { message } => {
                let text = match message {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Value::String(format!("Echo: {}", text)))
            }
        }
    }
}

/// Reverse a string by Unicode scalar value.
pub fn reverse_string(s: &str) -> String {
    s.chars().rev().collect()
}

/// Bind params to the declared parameter names, in declared order.
fn bind<const N: usize>(
    method: &str,
    names: [&'static str; N],
    params: Params,
) -> Result<[Value; N], MethodError> {
    let values = match params {
        Params::Named(map) => bind_named(method, &names, map)?,
        Params::Positional(values) => values,
        Params::Scalar(value) => vec![value],
    };

    let given = values.len();
    values.try_into().map_err(|_| {
        MethodError::InvalidParams(format!(
            "{}() takes {} positional argument(s) but {} were given",
            method, N, given
        ))
    })
}

fn bind_named(
    method: &str,
    names: &[&'static str],
    mut map: Map<String, Value>,
) -> Result<Vec<Value>, MethodError> {
    if let Some(unexpected) = map.keys().find(|k| !names.contains(&k.as_str())) {
        return Err(MethodError::InvalidParams(format!(
            "{}() got an unexpected keyword argument '{}'",
            method, unexpected
        )));
    }

    names
        .iter()
        .map(|name| {
            map.remove(*name).ok_or_else(|| {
                MethodError::InvalidParams(format!(
                    "{}() missing required argument '{}'",
                    method, name
                ))
            })
        })
        .collect()
}

fn number(name: &str, value: Value) -> Result<Number, MethodError> {
    match value {
        Value::Number(n) => Ok(n),
        other => Err(type_mismatch(name, "a number", &other)),
    }
}

fn type_mismatch(name: &str, expected: &str, got: &Value) -> MethodError {
    let kind = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    MethodError::InvalidParams(format!("argument '{}' must be {}, got {}", name, expected, kind))
}

/// Integer arithmetic when both operands are integers and the result fits,
/// floating point otherwise.
fn arithmetic(
    a: &Number,
    b: &Number,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Number, HandlerFault> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(result) = int_op(x, y) {
            return Ok(Number::from(result));
        }
    }

    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(HandlerFault(format!("cannot combine {} and {}", a, b))),
    };

    Number::from_f64(float_op(x, y))
        .ok_or_else(|| HandlerFault("result is not a finite number".to_string()))
}

fn delay_duration(seconds: &Number) -> Result<Duration, HandlerFault> {
    let secs = seconds
        .as_f64()
        .ok_or_else(|| HandlerFault(format!("invalid delay: {}", seconds)))?;
    if secs < 0.0 {
        return Err(HandlerFault("sleep length must be non-negative".to_string()));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| HandlerFault(format!("invalid delay: {}", e)))
}

/// Handles RPC method dispatch and execution.
///
/// Shared by every connection; the request counter is the only mutable
/// state and is diagnostic only.
#[derive(Default)]
pub struct MethodHandler {
    request_count: AtomicU64,
}

impl MethodHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far, including malformed ones.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Handle one raw message and produce exactly one response.
    pub async fn handle_message(&self, payload: &[u8]) -> CallResponse {
        let seq = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(seq, bytes = payload.len(), "Received message");

        match codec::decode::<CallRequest>(payload) {
            Ok(request) => self.handle(seq, request).await,
            Err(e) => {
                warn!(seq, error = %e, "Failed to decode message");
                CallResponse::invalid_message(e)
            }
        }
    }

    /// Validate a decoded request, then run it.
    pub async fn handle(&self, seq: u64, request: CallRequest) -> CallResponse {
        let Some(request_id) = request.request_id() else {
            return CallResponse::error(UNKNOWN_REQUEST_ID, "request_id is required");
        };
        let request_id = request_id.to_string();
        let Some(method) = request.method() else {
            return CallResponse::error(request_id, "method is required");
        };
        let method = method.to_string();

        info!(seq, request_id = %request_id, method = %method, "Handling request");

        let operation = match Operation::decode(&method, request.params) {
            Ok(op) => op,
            Err(e) => {
                warn!(seq, request_id = %request_id, error = %e, "Rejected request");
                return CallResponse::error(request_id, e.to_string());
            }
        };

        match operation.invoke().await {
            Ok(result) => {
                info!(seq, request_id = %request_id, method = %method, "Success");
                CallResponse::success(request_id, result, request.timestamp)
            }
            Err(fault) => {
                warn!(seq, request_id = %request_id, error = %fault, "Handler failed");
                CallResponse::error(request_id, format!("server error: {}", fault))
            }
        }
    }
}
