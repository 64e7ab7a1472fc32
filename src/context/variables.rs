//! Declared Variables
//!
//! Steps exchange data only through variables declared here (or declared by
//! the step itself). A [`Variable`] names a context slot and fixes the type
//! stored in it.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;

/// A named, typed slot in the execution context.
pub struct Variable<T> {
    name: Cow<'static, str>,
    default: Option<fn() -> T>,
    _type: PhantomData<fn() -> T>,
}

impl<T> Variable<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            default: None,
            _type: PhantomData,
        }
    }

    /// Declares a variable that reads as `default()` while unset.
    pub const fn with_default(name: &'static str, default: fn() -> T) -> Self {
        Self {
            name: Cow::Borrowed(name),
            default: Some(default),
            _type: PhantomData,
        }
    }

    /// Working variable private to one step, named `<step>.<suffix>`.
    pub fn scoped(step: &str, suffix: &str) -> Self {
        Self {
            name: Cow::Owned(format!("{}.{}", step, suffix)),
            default: None,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> Option<T> {
        self.default.map(|default| default())
    }
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            default: self.default,
            _type: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

fn one() -> u32 {
    1
}

fn enabled() -> bool {
    true
}

/// Space the operation deploys into.
pub const SPACE_ID: Variable<String> = Variable::new("space-id");

/// Deployment target, usually the MTA id.
pub const TARGET_ID: Variable<String> = Variable::new("target-id");

pub const USER: Variable<String> = Variable::new("user");

pub const APP_NAME: Variable<String> = Variable::new("app-name");

pub const APP_ARCHIVE_ID: Variable<String> = Variable::new("app-archive-id");

/// Archive size in bytes, used to size the upload timeout.
pub const APP_ARCHIVE_SIZE: Variable<u64> = Variable::new("app-archive-size");

/// Explicit upload timeout in seconds.
pub const UPLOAD_TIMEOUT: Variable<u64> = Variable::new("upload-timeout");

/// Handle of the upload started on the platform.
pub const UPLOAD_TOKEN: Variable<String> = Variable::new("upload-token");

/// Explicit start timeout in seconds.
pub const START_TIMEOUT: Variable<u64> = Variable::new("start-timeout");

pub const EXPECTED_INSTANCES: Variable<u32> = Variable::with_default("expected-instances", one);

/// Whether crashed instances fail the start step.
pub const FAIL_ON_CRASHED: Variable<bool> = Variable::with_default("fail-on-crashed", enabled);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_name() {
        let var: Variable<u32> = Variable::scoped("upload-app", "attempts");
        assert_eq!(var.name(), "upload-app.attempts");
        assert!(var.default_value().is_none());
    }

    #[test]
    fn test_default_value() {
        assert_eq!(EXPECTED_INSTANCES.default_value(), Some(1));
        assert_eq!(FAIL_ON_CRASHED.default_value(), Some(true));
        assert_eq!(APP_NAME.default_value(), None);
    }

    #[test]
    fn test_clone_keeps_name() {
        let var = SPACE_ID.clone();
        assert_eq!(var.name(), "space-id");
        assert!(format!("{:?}", var).contains("space-id"));
    }
}
