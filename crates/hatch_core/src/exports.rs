use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Namespace object holding a module's exports.
///
/// Cloning shares the namespace; every `require` of a module hands out the
/// same object, so exports added later (circular imports) are visible to all.
#[derive(Clone, Default)]
pub struct Exports(Rc<RefCell<HashMap<String, Rc<dyn Any>>>>);

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any>(&self, name: impl Into<String>, value: T) {
        self.set_shared(name, Rc::new(value));
    }

    pub fn set_shared(&self, name: impl Into<String>, value: Rc<dyn Any>) {
        self.0.borrow_mut().insert(name.into(), value);
    }

    /// Typed lookup; `None` when missing or stored under another type.
    pub fn get<T: Any>(&self, name: &str) -> Option<Rc<T>> {
        let value = self.0.borrow().get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.borrow().contains_key(name)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.0.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Whether both handles point at the same namespace object.
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports").field("keys", &self.keys()).finish()
    }
}
