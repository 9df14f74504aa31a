mod common;

use common::{bare_loader, load_error};
use hatch_core::{LoadError, ModuleId};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn test_factory_runs_once() {
    let loader = bare_loader();
    let runs = Rc::new(Cell::new(0));

    let counter = runs.clone();
    loader.register_module("config", move |module, _| {
        counter.set(counter.get() + 1);
        module.exports().set("speed", 3i32);
        Ok(())
    });

    let first = loader.require("config").unwrap();
    let second = loader.require("config").unwrap();

    assert_eq!(runs.get(), 1);
    assert!(first.ptr_eq(&second));
    assert_eq!(*second.get::<i32>("speed").unwrap(), 3);
    assert!(loader.is_loaded("config"));
}

#[test]
fn test_missing_module() {
    let loader = bare_loader();
    let err = loader.require("nowhere").unwrap_err();
    assert_eq!(load_error(&err), &LoadError::MissingModule(ModuleId::from("nowhere")));
    assert_eq!(err.to_string(), "cannot find module 'nowhere'");
}

#[test]
fn test_circular_require_sees_partial_exports() {
    let loader = bare_loader();
    let seen = Rc::new(RefCell::new(None));

    // a exports "early", requires b, then exports "late".
    loader.register_module("a", |module, loader| {
        module.exports().set("early", 1i32);
        loader.require("b")?;
        module.exports().set("late", 2i32);
        Ok(())
    });

    let observed = seen.clone();
    loader.register_module("b", move |_, loader| {
        let a = loader.require("a")?;
        *observed.borrow_mut() = Some((a.keys(), loader.is_loaded("a")));
        Ok(())
    });

    let a = loader.require("a").unwrap();

    // b ran while a was half done.
    assert_eq!(*seen.borrow(), Some((vec!["early".to_string()], false)));
    assert_eq!(a.keys(), vec!["early".to_string(), "late".to_string()]);
    assert!(loader.is_loaded("a"));
    assert!(loader.is_loaded("b"));
}

#[derive(Debug, thiserror::Error)]
#[error("bad level data")]
struct LevelError;

#[test]
fn test_factory_error_propagates_unmodified() {
    let loader = bare_loader();
    let runs = Rc::new(Cell::new(0));

    let counter = runs.clone();
    loader.register_module("level", move |_, _| {
        counter.set(counter.get() + 1);
        Err(LevelError.into())
    });

    let err = loader.require("level").unwrap_err();
    assert!(err.downcast_ref::<LevelError>().is_some());
    assert_eq!(err.to_string(), "bad level data");

    // Never re-executed.
    let err = loader.require("level").unwrap_err();
    assert_eq!(load_error(&err), &LoadError::ModuleFailed(ModuleId::from("level")));
    assert_eq!(runs.get(), 1);
    assert!(!loader.is_loaded("level"));
    assert!(loader.cached_exports("level").is_none());
}

#[test]
fn test_merge_replaces_factories() {
    let loader = bare_loader();
    loader.register_module("theme", |module, _| {
        module.exports().set("color", "red".to_string());
        Ok(())
    });
    loader.register_module("theme", |module, _| {
        module.exports().set("color", "blue".to_string());
        Ok(())
    });

    assert_eq!(loader.registry().module_count(), 1);
    let theme = loader.require("theme").unwrap();
    assert_eq!(theme.get::<String>("color").unwrap().as_str(), "blue");
}
