//! Fiber configuration and per-call observe options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::subscription::Urgency;

/// Rate-limiting strategy for host-side effects.
///
/// Stored and merged but not interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Debounce,
    Throttle,
}

/// Maps a value to a deadline, in milliseconds.
pub type Deadline<T> = Arc<dyn Fn(&T) -> u32 + Send + Sync>;

/// Configuration held by a fiber.
///
/// Every field is optional. A config passed for a key that already has a
/// fiber is merged into it, later fields overriding earlier ones.
/// `initial_value` and `enable_cache` are interpreted by the engine; the
/// timing fields are stored for the host.
pub struct FiberConfig<T> {
    /// Human-readable name used in diagnostics.
    pub name: Option<String>,
    /// Seeds `current` when the fiber is created.
    pub initial_value: Option<Arc<T>>,
    /// Keep fulfilled results per argument and serve repeated runs from them.
    pub enable_cache: Option<bool>,
    pub deadline: Option<Deadline<T>>,
    pub skip_pending_under: Option<Duration>,
    pub keep_pending_at_least: Option<Duration>,
    pub effect_duration: Option<Duration>,
    pub effect: Option<Effect>,
}

impl<T> Default for FiberConfig<T> {
    fn default() -> Self {
        Self {
            name: None,
            initial_value: None,
            enable_cache: None,
            deadline: None,
            skip_pending_under: None,
            keep_pending_at_least: None,
            effect_duration: None,
            effect: None,
        }
    }
}

impl<T> Clone for FiberConfig<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            initial_value: self.initial_value.clone(),
            enable_cache: self.enable_cache,
            deadline: self.deadline.clone(),
            skip_pending_under: self.skip_pending_under,
            keep_pending_at_least: self.keep_pending_at_least,
            effect_duration: self.effect_duration,
            effect: self.effect,
        }
    }
}

impl<T> FiberConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay the fields set in `other`.
    pub fn merge(&mut self, other: &FiberConfig<T>) {
        if other.name.is_some() {
            self.name = other.name.clone();
        }
        if other.initial_value.is_some() {
            self.initial_value = other.initial_value.clone();
        }
        if other.enable_cache.is_some() {
            self.enable_cache = other.enable_cache;
        }
        if other.deadline.is_some() {
            self.deadline = other.deadline.clone();
        }
        if other.skip_pending_under.is_some() {
            self.skip_pending_under = other.skip_pending_under;
        }
        if other.keep_pending_at_least.is_some() {
            self.keep_pending_at_least = other.keep_pending_at_least;
        }
        if other.effect_duration.is_some() {
            self.effect_duration = other.effect_duration;
        }
        if other.effect.is_some() {
            self.effect = other.effect;
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.enable_cache.unwrap_or(false)
    }

    /// Evaluate the configured deadline for `value`.
    pub fn deadline_for(&self, value: &T) -> Option<u32> {
        self.deadline.as_ref().map(|deadline| deadline(value))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn initial_value(mut self, value: T) -> Self {
        self.initial_value = Some(Arc::new(value));
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = Some(enabled);
        self
    }

    pub fn deadline(mut self, deadline: impl Fn(&T) -> u32 + Send + Sync + 'static) -> Self {
        self.deadline = Some(Arc::new(deadline));
        self
    }

    pub fn skip_pending_under(mut self, duration: Duration) -> Self {
        self.skip_pending_under = Some(duration);
        self
    }

    pub fn keep_pending_at_least(mut self, duration: Duration) -> Self {
        self.keep_pending_at_least = Some(duration);
        self
    }

    pub fn effect(mut self, effect: Effect, duration: Duration) -> Self {
        self.effect = Some(effect);
        self.effect_duration = Some(duration);
        self
    }
}

impl<T> fmt::Debug for FiberConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberConfig")
            .field("name", &self.name)
            .field("initial_value", &self.initial_value.is_some())
            .field("enable_cache", &self.enable_cache)
            .field("deadline", &self.deadline.is_some())
            .field("skip_pending_under", &self.skip_pending_under)
            .field("keep_pending_at_least", &self.keep_pending_at_least)
            .field("effect_duration", &self.effect_duration)
            .field("effect", &self.effect)
            .finish()
    }
}

/// Options for one [`Pass::observe`](crate::Pass::observe) call.
///
/// `args` re-runs the producer whenever they differ from the fiber's last
/// arguments. `initial_args` are used only to mount the fiber, and `args` win
/// when both are given. Passing both to a mounted fiber logs a warning once.
pub struct ObserveOptions<T, A> {
    pub config: FiberConfig<T>,
    pub args: Option<A>,
    pub initial_args: Option<A>,
    /// Notification class of the subscription. Defaults to
    /// [`Urgency::Urgent`].
    pub urgency: Option<Urgency>,
}

impl<T, A> Default for ObserveOptions<T, A> {
    fn default() -> Self {
        Self {
            config: FiberConfig::default(),
            args: None,
            initial_args: None,
            urgency: None,
        }
    }
}

impl<T, A> ObserveOptions<T, A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying only `args`.
    pub fn with_args(args: A) -> Self {
        Self::new().args(args)
    }

    pub fn args(mut self, args: A) -> Self {
        self.args = Some(args);
        self
    }

    pub fn initial_args(mut self, args: A) -> Self {
        self.initial_args = Some(args);
        self
    }

    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    pub fn config(mut self, config: FiberConfig<T>) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config = self.config.name(name);
        self
    }

    pub fn initial_value(mut self, value: T) -> Self {
        self.config = self.config.initial_value(value);
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.config = self.config.enable_cache(enabled);
        self
    }

    pub fn deadline(mut self, deadline: impl Fn(&T) -> u32 + Send + Sync + 'static) -> Self {
        self.config = self.config.deadline(deadline);
        self
    }

    pub fn skip_pending_under(mut self, duration: Duration) -> Self {
        self.config = self.config.skip_pending_under(duration);
        self
    }

    pub fn keep_pending_at_least(mut self, duration: Duration) -> Self {
        self.config = self.config.keep_pending_at_least(duration);
        self
    }

    pub fn effect(mut self, effect: Effect, duration: Duration) -> Self {
        self.config = self.config.effect(effect, duration);
        self
    }
}
