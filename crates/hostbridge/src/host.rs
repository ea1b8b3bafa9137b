//! Host-environment boundary.
//!
//! A host binding hands the engine arbitrary objects through [`HostObject`].
//! The engine never looks inside them beyond property access and invocation;
//! identity is the `Arc` allocation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::HandlerError;
use crate::value::{Map, UNDEFINED, Value};

pub trait HostObject: Send + Sync + fmt::Debug {
    /// Property lookup. `None` means the property does not exist.
    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set(&self, name: &str, _value: Value) -> Result<(), HandlerError> {
        Err(HandlerError::type_error(format!(
            "cannot set property '{}' on {:?}",
            name, self
        )))
    }

    fn is_invocable(&self) -> bool {
        false
    }

    /// Call the object with `receiver` as `this`.
    fn invoke(&self, _receiver: Option<&HostRef>, _args: Vec<Value>) -> Result<Value, HandlerError> {
        Err(HandlerError::type_error(format!("{:?} is not a function", self)))
    }
}

pub type HostRef = Arc<dyn HostObject>;

/// Identity comparison; two equal-looking objects are still different referents.
pub fn same_object(a: &HostRef, b: &HostRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn lock_props<'a>(label: &str, props: &'a Mutex<Map>) -> MutexGuard<'a, Map> {
    match props.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(object = label, "Property mutex poisoned - continuing");
            poisoned.into_inner()
        }
    }
}

/// Plain object with a mutable property bag.
pub struct PropertyObject {
    label: String,
    props: Mutex<Map>,
}

impl PropertyObject {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            props: Mutex::new(Map::new()),
        }
    }

    pub fn with_property(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        lock_props(&self.label, &self.props).insert(name.into(), value.into());
        self
    }

    pub fn into_ref(self) -> HostRef {
        Arc::new(self)
    }
}

impl fmt::Debug for PropertyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.label)
    }
}

impl HostObject for PropertyObject {
    fn get(&self, name: &str) -> Option<Value> {
        lock_props(&self.label, &self.props).get(name).cloned()
    }

    fn set(&self, name: &str, value: Value) -> Result<(), HandlerError> {
        lock_props(&self.label, &self.props).insert(name.to_string(), value);
        Ok(())
    }
}

type HostFn = dyn Fn(Option<&HostRef>, Vec<Value>) -> Result<Value, HandlerError> + Send + Sync;

/// Invocable host object backed by a closure.
pub struct FnObject {
    name: String,
    func: Box<HostFn>,
}

impl FnObject {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Option<&HostRef>, Vec<Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn into_ref(self) -> HostRef {
        Arc::new(self)
    }
}

impl fmt::Debug for FnObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {}()", self.name)
    }
}

impl HostObject for FnObject {
    fn get(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::from(self.name.as_str())),
            _ => None,
        }
    }

    fn is_invocable(&self) -> bool {
        true
    }

    fn invoke(&self, receiver: Option<&HostRef>, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self.func)(receiver, args)
    }
}

/// Read a property, mapping a missing one to `undefined`.
pub fn get_or_undefined(obj: &HostRef, name: &str) -> Value {
    obj.get(name).unwrap_or(UNDEFINED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_object_get_and_set() {
        let obj = PropertyObject::new("div")
            .with_property("id", "main")
            .into_ref();
        assert_eq!(obj.get("id"), Some(Value::from("main")));
        assert_eq!(obj.get("missing"), None);

        obj.set("id", Value::from("other")).unwrap();
        assert_eq!(obj.get("id"), Some(Value::from("other")));
        assert!(!obj.is_invocable());
    }

    #[test]
    fn fn_object_sees_receiver() {
        let target = PropertyObject::new("span").with_property("text", "hi").into_ref();
        let func = FnObject::new("getText", |this, _args| {
            let this = this.ok_or_else(|| HandlerError::type_error("no receiver"))?;
            Ok(get_or_undefined(this, "text"))
        })
        .into_ref();

        assert!(func.is_invocable());
        assert_eq!(func.invoke(Some(&target), vec![]).unwrap(), Value::from("hi"));
        assert_eq!(
            func.invoke(None, vec![]).unwrap_err().name,
            "TypeError"
        );
    }

    #[test]
    fn plain_object_is_not_invocable() {
        let obj = PropertyObject::new("div").into_ref();
        let err = obj.invoke(None, vec![]).unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "[object div] is not a function");
    }

    #[test]
    fn identity_not_equality() {
        let a = PropertyObject::new("div").into_ref();
        let b = PropertyObject::new("div").into_ref();
        assert!(same_object(&a, &a.clone()));
        assert!(!same_object(&a, &b));
    }
}
