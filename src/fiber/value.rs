// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::erased::Erased;

/// The result carrier threaded through a fiber's continuations.
///
/// A `FiberValue` is in exactly one of three mutually exclusive states at any
/// time:
///
/// - *value*: not an error, not canceled, and the payload holds a value
/// - *error*: the error flag is set and the payload carries the error
/// - *canceled*: the canceled flag is set and the payload is empty
///
/// A default-constructed carrier is in none of these states (empty payload,
/// no flags); the setters enforce the mutual exclusion from then on.
#[derive(Clone, Debug, Default)]
pub struct FiberValue {
    value: Erased,
    error: bool,
    canceled: bool,
}

impl FiberValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(value: Erased, error: bool, canceled: bool) -> Self {
        Self {
            value,
            error,
            canceled,
        }
    }

    pub fn is_value(&self) -> bool {
        !self.error && !self.canceled && self.value.has_value()
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn set_value(&mut self, value: Erased) {
        self.value = value;
        self.error = false;
        self.canceled = false;
    }

    pub fn set_error(&mut self, error: Erased) {
        self.value = error;
        self.error = true;
        self.canceled = false;
    }

    pub fn set_canceled(&mut self) {
        self.value.reset();
        self.error = false;
        self.canceled = true;
    }

    /// The payload, but only in the value state.
    pub fn get_value(&self) -> Option<Erased> {
        if self.is_value() {
            Some(self.value.clone())
        } else {
            None
        }
    }

    /// The payload, but only in the error state.
    pub fn get_error(&self) -> Option<Erased> {
        if self.is_error() {
            Some(self.value.clone())
        } else {
            None
        }
    }

    /// The payload regardless of state.
    pub fn underlying(&self) -> &Erased {
        &self.value
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn default_is_no_state() {
        let value = FiberValue::new();
        assert!(!value.is_value());
        assert!(!value.is_error());
        assert!(!value.is_canceled());
    }

    #[test]
    fn set_value() {
        let mut value = FiberValue::new();
        value.set_value(Erased::new(42_i32));

        assert!(value.is_value());
        assert!(!value.is_error());
        assert!(!value.is_canceled());

        let payload = value.get_value().expect("value state");
        // Safety: the payload was constructed from an `i32`.
        assert_eq!(*unsafe { payload.get::<i32>() }, 42);
        assert!(value.get_error().is_none());
    }

    #[test]
    fn set_error() {
        let mut value = FiberValue::new();
        value.set_error(Erased::new("boom"));

        assert!(!value.is_value());
        assert!(value.is_error());
        assert!(!value.is_canceled());

        let payload = value.get_error().expect("error state");
        // Safety: the payload was constructed from a `&str`.
        assert_eq!(*unsafe { payload.get::<&str>() }, "boom");
        assert!(value.get_value().is_none());
    }

    #[test]
    fn set_canceled() {
        let mut value = FiberValue::new();
        value.set_value(Erased::new(42_i32));
        value.set_canceled();

        assert!(!value.is_value());
        assert!(!value.is_error());
        assert!(value.is_canceled());
        assert!(!value.underlying().has_value());
    }

    #[test]
    fn states_overwrite_each_other() {
        let mut value = FiberValue::new();

        value.set_error(Erased::new("boom"));
        value.set_value(Erased::new(1_i32));
        assert!(value.is_value() && !value.is_error());

        value.set_canceled();
        value.set_error(Erased::new("boom again"));
        assert!(value.is_error() && !value.is_canceled());
    }
}
