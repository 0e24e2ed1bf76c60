// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric expressions
//!
//! Expressions are written in the [`evalexpr`] language and evaluated once per
//! observation. The environment exposes:
//!
//! | Name | Kind | Meaning |
//! |------|------|---------|
//! | `value` | float | Coerced input value |
//! | `last_value` | float | Input of the previous evaluation |
//! | `last_result` | float | Result of the previous evaluation |
//! | `elapsed` | float | Seconds since the previous evaluation (0 on first call) |
//! | `now()` | function | Evaluation time in unix seconds |
//! | `int`, `float`, `round`, `ceil`, `floor`, `abs` | function | One numeric argument |
//! | `min`, `max` | function | One or more numeric arguments |
//!
//! The library built-ins (`if(cond, a, b)`, `math::*`, ...) remain available.
//! Integrating power (W) into energy (Wh):
//!
//! ```text
//! if(value > 0, last_result + value * elapsed / 3600, last_result)
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, ContextWithMutableVariables,
    EvalexprError, EvalexprResult, Function, HashMapContext, Node, Value,
};

use crate::error::{BridgeError, Result};

/// Values bound before each evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bindings {
    pub value: f64,
    pub last_value: f64,
    pub last_result: f64,
    pub elapsed: Duration,
    pub now: DateTime<Utc>,
}

impl Bindings {
    fn zero(now: DateTime<Utc>) -> Self {
        Self {
            value: 0.0,
            last_value: 0.0,
            last_result: 0.0,
            elapsed: Duration::ZERO,
            now,
        }
    }
}

/// A compiled expression with its evaluation environment
pub struct Expression {
    source: String,
    program: Node,
    context: HashMapContext,
}

impl Expression {
    /// Parse `source` and check that it evaluates to a number
    ///
    /// The check is a dry run with every variable bound to zero, so unknown
    /// identifiers and non-numeric results are rejected here rather than on
    /// the first message. Arithmetic failures depend on the input and are
    /// left to evaluation.
    pub fn compile(source: &str) -> Result<Self> {
        let compile_error = |reason: String| BridgeError::ExpressionCompile {
            expression: source.to_string(),
            reason,
        };

        let program = build_operator_tree(source).map_err(|e| compile_error(e.to_string()))?;
        let context = environment().map_err(|e| compile_error(e.to_string()))?;

        let mut expression = Self {
            source: source.to_string(),
            program,
            context,
        };
        match expression.eval(&Bindings::zero(Utc::now())) {
            Ok(value) => {
                number(value).map_err(compile_error)?;
            }
            Err(e) if is_arithmetic(&e) => {}
            Err(e) => return Err(compile_error(e.to_string())),
        }
        Ok(expression)
    }

    /// Evaluate with the given bindings
    pub fn evaluate(&mut self, bindings: &Bindings) -> Result<f64> {
        self.run(bindings)
            .map_err(|reason| BridgeError::ExpressionRuntime {
                expression: self.source.clone(),
                reason,
            })
    }

    /// Source text
    pub fn source(&self) -> &str {
        &self.source
    }

    fn run(&mut self, bindings: &Bindings) -> std::result::Result<f64, String> {
        let value = self.eval(bindings).map_err(|e| e.to_string())?;
        number(value)
    }

    fn eval(&mut self, bindings: &Bindings) -> EvalexprResult<Value> {
        bind(&mut self.context, bindings)?;
        self.program.eval_with_context(&self.context)
    }
}

fn number(value: Value) -> std::result::Result<f64, String> {
    match value {
        Value::Float(f) => Ok(f),
        Value::Int(i) => Ok(i as f64),
        other => Err(format!("expected a numeric result, got '{}'", other)),
    }
}

fn is_arithmetic(error: &EvalexprError) -> bool {
    matches!(
        error,
        EvalexprError::AdditionError { .. }
            | EvalexprError::SubtractionError { .. }
            | EvalexprError::NegationError { .. }
            | EvalexprError::MultiplicationError { .. }
            | EvalexprError::DivisionError { .. }
            | EvalexprError::ModulationError { .. }
    )
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .finish()
    }
}

fn environment() -> EvalexprResult<HashMapContext> {
    let mut context = HashMapContext::new();
    context.set_function("int".to_string(), truncate())?;
    context.set_function("float".to_string(), unary(|x| x))?;
    context.set_function("round".to_string(), unary(f64::round))?;
    context.set_function("ceil".to_string(), unary(f64::ceil))?;
    context.set_function("floor".to_string(), unary(f64::floor))?;
    context.set_function("abs".to_string(), unary(f64::abs))?;
    context.set_function("min".to_string(), fold(f64::min))?;
    context.set_function("max".to_string(), fold(f64::max))?;
    Ok(context)
}

fn bind(context: &mut HashMapContext, bindings: &Bindings) -> EvalexprResult<()> {
    context.set_value("value".to_string(), Value::Float(bindings.value))?;
    context.set_value("last_value".to_string(), Value::Float(bindings.last_value))?;
    context.set_value("last_result".to_string(), Value::Float(bindings.last_result))?;
    context.set_value(
        "elapsed".to_string(),
        Value::Float(bindings.elapsed.as_secs_f64()),
    )?;

    let now = bindings.now.timestamp_millis() as f64 / 1000.0;
    context.set_function(
        "now".to_string(),
        Function::new(move |_argument: &Value| Ok(Value::Float(now))),
    )
}

fn unary(f: fn(f64) -> f64) -> Function {
    Function::new(move |argument: &Value| Ok(Value::Float(f(argument.as_number()?))))
}

fn truncate() -> Function {
    Function::new(|argument: &Value| Ok(Value::Int(argument.as_number()?.trunc() as i64)))
}

fn fold(f: fn(f64, f64) -> f64) -> Function {
    Function::new(move |argument: &Value| match argument {
        Value::Tuple(values) => {
            let mut iter = values.iter();
            let first = iter
                .next()
                .ok_or_else(|| EvalexprError::CustomMessage("expected an argument".to_string()))?
                .as_number()?;
            let folded = iter.try_fold(first, |acc, v| v.as_number().map(|x| f(acc, x)))?;
            Ok(Value::Float(folded))
        }
        single => Ok(Value::Float(single.as_number()?)),
    })
}
