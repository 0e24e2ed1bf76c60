// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Stateful value transformation
//!
//! Applied to every coerced value, in order: expression, monotonicity
//! repair, scaling, timestamp.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::MetricConfig;
use crate::error::Result;
use crate::expression::{Bindings, Expression};
use crate::state::{MetricInstanceState, StateStore};

/// Owns the live instance states and their backing store
#[derive(Debug)]
pub struct TransformEngine {
    store: StateStore,
    states: HashMap<String, MetricInstanceState>,
}

impl TransformEngine {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            states: HashMap::new(),
        }
    }

    /// Transform `value` for the instance `instance_id`
    ///
    /// Returns the final value and the timestamp to expose, if any.
    pub fn transform(
        &mut self,
        instance_id: &str,
        config: &MetricConfig,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(f64, Option<DateTime<Utc>>)> {
        let mut value = value;

        if config.is_stateful() {
            let state = match self.states.entry(instance_id.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let state = match self.store.load(instance_id)? {
                        Some(record) => MetricInstanceState::restored(record, now),
                        None => {
                            let mut state = MetricInstanceState::new();
                            state.force_flush();
                            state
                        }
                    };
                    entry.insert(state)
                }
            };

            if let Some(source) = config.expression() {
                value = evaluate(state, source, value, now)?;
            }
            if config.force_monotonicy {
                value = repair_monotonicity(state, value);
            }

            if state.needs_flush(now) {
                self.store.save(instance_id, &state.record)?;
                state.mark_written(now);
            }
        }

        if config.mqtt_value_scale != 0.0 {
            value *= config.mqtt_value_scale;
        }

        let timestamp = if config.omit_timestamp { None } else { Some(now) };
        Ok((value, timestamp))
    }

    /// Write every state changed since its last write
    ///
    /// Keeps going after a failure and returns the first error.
    pub fn flush_all(&mut self) -> Result<()> {
        let now = Utc::now();
        let mut first_error = None;
        for (instance_id, state) in self.states.iter_mut().filter(|(_, s)| s.is_dirty()) {
            match self.store.save(instance_id, &state.record) {
                Ok(()) => state.mark_written(now),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Live state of an instance, if it has been touched
    pub fn state(&self, instance_id: &str) -> Option<&MetricInstanceState> {
        self.states.get(instance_id)
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn evaluate(
    state: &mut MetricInstanceState,
    source: &str,
    value: f64,
    now: DateTime<Utc>,
) -> Result<f64> {
    if state.program.is_none() {
        state.force_flush();
    }
    let expression = match state.program.get_or_insert_with(|| Expression::compile(source)) {
        Ok(expression) => expression,
        Err(e) => return Err(e.clone()),
    };

    let record = &mut state.record;
    let elapsed = record
        .last_expr_timestamp
        .and_then(|last| (now - last).to_std().ok())
        .unwrap_or(Duration::ZERO);

    let result = expression.evaluate(&Bindings {
        value,
        last_value: record.last_expr_value,
        last_result: record.last_expr_result,
        elapsed,
        now,
    })?;

    record.last_expr_value = value;
    record.last_expr_result = result;
    record.last_expr_timestamp = Some(now);
    state.touch();
    Ok(result)
}

fn repair_monotonicity(state: &mut MetricInstanceState, value: f64) -> f64 {
    if value < state.record.last_raw_value {
        state.record.offset += state.record.last_raw_value;
        state.force_flush();
    }
    state.record.last_raw_value = value;
    state.touch();
    value + state.record.offset
}
