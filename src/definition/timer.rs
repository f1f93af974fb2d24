use super::{DefinitionState, EventDefinition};
use crate::{
    activity::Activity,
    api::{ACTIVITY_TIMER, API_EXCHANGE, ApiType, EVENT_EXCHANGE},
    broker::ConsumeOptions,
    error::{Error, Result},
    message::{Message, Properties},
    timers::{MAX_DELAY, RegisteredTimers, Timer},
};
use serde_json::{Value, json};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

struct Inner {
    state: DefinitionState,
    time_duration: String,
    timers: RegisteredTimers,
    timer: RefCell<Option<Timer>>,
    output: RefCell<Value>,
    this: Weak<Inner>,
}

/// Completes when its duration has elapsed.
pub struct TimerEventDefinition {
    inner: Rc<Inner>,
}

impl TimerEventDefinition {
    /// `time_duration` is an ISO 8601 duration or milliseconds, expressions allowed.
    pub fn new(activity: &Activity, time_duration: impl Into<String>) -> Self {
        let timers = activity.environment().get_timers().register(activity.id());
        Self {
            inner: Rc::new_cyclic(|this| Inner {
                state: DefinitionState::new(activity, "bpmn:TimerEventDefinition", "timer"),
                time_duration: time_duration.into(),
                timers,
                timer: RefCell::new(None),
                output: RefCell::new(Value::Null),
                this: this.clone(),
            }),
        }
    }

    /// Pending timer of the current execution.
    pub fn timer(&self) -> Option<Timer> {
        self.inner.timer.borrow().clone()
    }
}

impl EventDefinition for TimerEventDefinition {
    fn state(&self) -> &DefinitionState {
        &self.inner.state
    }

    fn execute(&self, message: &Message) -> Result<()> {
        self.inner.execute(message)
    }

    fn stop(&self) {
        self.inner.stop();
    }
}

impl Inner {
    fn execute(&self, message: &Message) -> Result<()> {
        let duration = self.resolve_duration(message)?;
        self.stop();
        let Some(execution_id) = self.state.begin(message)? else {
            return Ok(());
        };

        let now = SystemTime::now();
        let persisted = message
            .fields
            .redelivered
            .then(|| message.content.get("expireAt").and_then(Value::as_u64))
            .flatten()
            .and_then(|expire_at| UNIX_EPOCH.checked_add(Duration::from_millis(expire_at)));
        let (timeout, expire_at) = match persisted {
            Some(expire_at) => (expire_at.duration_since(now).unwrap_or_default(), expire_at),
            None => (duration, now.checked_add(duration).unwrap_or(now)),
        };

        let broker = self.state.activity().broker();
        let weak = self.this.clone();
        broker.subscribe_tmp(
            API_EXCHANGE,
            &format!("activity.#.{execution_id}"),
            move |routing_key, message| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_api(routing_key, message);
                }
            },
            ConsumeOptions::tag(format!("_api-{execution_id}")),
        );

        self.output.replace(json!({
            "timeout": millis(timeout),
            "expireAt": epoch_millis(expire_at),
        }));

        let weak = self.this.clone();
        let timer = self.timers.set_timeout(
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timeout();
                }
            },
            timeout,
        );
        self.state
            .debug(&execution_id, format!("set timer {timer}"));
        self.timer.replace(Some(timer));

        broker.publish(
            EVENT_EXCHANGE,
            ACTIVITY_TIMER,
            message
                .content
                .clone()
                .with("timeout", millis(timeout))
                .with("expireAt", epoch_millis(expire_at)),
            Properties::default(),
        );
        Ok(())
    }

    fn resolve_duration(&self, message: &Message) -> Result<Duration> {
        let value = self
            .state
            .activity()
            .environment()
            .resolve_expression(&self.time_duration, message.to_scope()?)?;
        match &value {
            Value::Number(number) => number
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| from_seconds(ms / 1000.0))
                .ok_or_else(|| Error::InvalidDuration(value.to_string())),
            Value::String(text) => parse_duration(text),
            _ => Err(Error::InvalidDuration(value.to_string())),
        }
    }

    fn on_timeout(&self) {
        self.timer.take();
        if !self.state.complete() {
            return;
        }
        self.stop();
        let output = self.output.take();
        self.state.publish_completed(Some(output), "timeout");
    }

    fn on_api(&self, _: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Discard => self.discard(),
            ApiType::Stop => self.stop(),
            _ => {}
        }
    }

    fn discard(&self) {
        if !self.state.complete() {
            return;
        }
        self.stop();
        self.state.publish_discard();
    }

    fn stop(&self) {
        if let Some(timer) = self.timer.take() {
            self.timers.clear_timeout(&timer);
        }
        if let Some(execution_id) = self.state.execution_id() {
            self.state.cancel_all(&[format!("_api-{execution_id}")]);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(millis).unwrap_or_default()
}

/// Parse an ISO 8601 duration, `P[nW][nD][T[nH][nM][nS]]`, or a number of milliseconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDuration(value.to_string());
    let text = value.trim();

    if let Ok(ms) = text.parse::<f64>() {
        if !ms.is_finite() || ms < 0.0 {
            return Err(invalid());
        }
        return Ok(from_seconds(ms / 1000.0));
    }

    let rest = text
        .strip_prefix(['P', 'p'])
        .ok_or_else(invalid)?;
    let (date, time) = match rest.split_once(['T', 't']) {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut seconds = 0.0;
    let mut components = 0;
    for (number, designator) in designated(date).ok_or_else(invalid)? {
        seconds += number
            * match designator {
                'W' => 604_800.0,
                'D' => 86_400.0,
                _ => return Err(invalid()),
            };
        components += 1;
    }

    if let Some(time) = time {
        let parts = designated(time).ok_or_else(invalid)?;
        if parts.is_empty() {
            return Err(invalid());
        }
        for (number, designator) in parts {
            seconds += number
                * match designator {
                    'H' => 3_600.0,
                    'M' => 60.0,
                    'S' => 1.0,
                    _ => return Err(invalid()),
                };
            components += 1;
        }
    }

    if components == 0 {
        return Err(invalid());
    }
    Ok(from_seconds(seconds))
}

/// Durations beyond the max timer delay are clamped to it.
fn from_seconds(seconds: f64) -> Duration {
    let max = Duration::from_millis(MAX_DELAY);
    Duration::try_from_secs_f64(seconds).map_or(max, |duration| duration.min(max))
}

// "1H30M" => [(1.0, 'H'), (30.0, 'M')]
fn designated(text: &str) -> Option<Vec<(f64, char)>> {
    let mut parts = Vec::new();
    let mut number = String::new();
    for ch in text.chars() {
        match ch {
            '0'..='9' | '.' => number.push(ch),
            ',' => number.push('.'),
            _ => {
                let value = number.parse::<f64>().ok()?;
                number.clear();
                parts.push((value, ch.to_ascii_uppercase()));
            }
        }
    }
    number.is_empty().then_some(parts)
}
