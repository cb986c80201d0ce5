#![forbid(unsafe_code)]

//! E2E tests for the full write → batch → flush → deliver cycle.
//!
//! Validates that:
//! 1. A component hierarchy with inherited observers batches writes per turn.
//! 2. Custom detectors, callback chains and update hooks compose along the
//!    lineage.
//! 3. Render pipelines coexist with per-property callbacks on one property.
//! 4. Re-entrant writes from callbacks land in the next cycle.
//! 5. Callback failures surface from the drain without wedging the instance.
//! 6. Custom once-per-hierarchy installers run once per lineage.

use std::cell::RefCell;
use std::rc::Rc;

use proptrack::prelude::*;
use proptrack::{OncePerHierarchy, change_detector, register_change_callback};

// ============================================================================
// Helpers
// ============================================================================

/// Property value used by the simulated component tree.
#[derive(Debug, Clone, PartialEq, Default)]
enum Prop {
    #[default]
    Unset,
    Text(String),
    Number(i64),
}

fn text(value: &str) -> Prop {
    Prop::Text(value.to_string())
}

type Log = Rc<RefCell<Vec<String>>>;

fn logger(
    log: &Log,
    tag: &'static str,
) -> impl Fn(&Instance<Prop>, &ChangeRecord<Prop>) -> Result<()> + 'static {
    let log = Rc::clone(log);
    move |_, record| {
        log.borrow_mut()
            .push(format!("{tag}: {:?} -> {:?}", record.old_value, record.new_value));
        Ok(())
    }
}

struct Components {
    runtime: Runtime<Prop>,
    element: TypeKey,
    button: TypeKey,
    log: Log,
}

/// `Element` observes `label`; `Button` derives from it, adds a `width`
/// observer with a coarse detector, and its own update hook.
fn components() -> Components {
    let runtime = Runtime::new();
    let element = runtime.define_type("Element", None).unwrap();
    let button = runtime.define_type("Button", Some(element)).unwrap();
    let log: Log = Rc::default();

    runtime.declare_field(element, "label", text("untitled")).unwrap();
    on_property_change(&runtime, element, "label", logger(&log, "element.label")).unwrap();

    register_change_detector(&runtime, button, "width", |old: &Prop, new: &Prop| {
        match (old, new) {
            (Prop::Number(a), Prop::Number(b)) => (a - b).abs() >= 4,
            _ => old != new,
        }
    })
    .unwrap();
    on_property_change(&runtime, button, "width", logger(&log, "button.width")).unwrap();

    let hook_log = Rc::clone(&log);
    on_update(&runtime, button, move |instance| {
        hook_log
            .borrow_mut()
            .push(format!("button.update {}", instance.id()));
        Ok(())
    })
    .unwrap();

    Components {
        runtime,
        element,
        button,
        log,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn component_tree_batches_per_turn() {
    let c = components();
    let button = c.runtime.instantiate(c.button).unwrap();

    assert_eq!(button.get("label"), text("untitled"));
    button.set("label", text("Save"));
    button.set("label", text("Save all"));
    button.set("width", Prop::Number(10));
    assert!(c.log.borrow().is_empty());
    assert!(button.update_requested());

    assert_eq!(c.runtime.run_microtasks().unwrap(), 1);
    assert_eq!(
        *c.log.borrow(),
        vec![
            r#"element.label: Text("untitled") -> Text("Save all")"#.to_string(),
            "button.width: Unset -> Number(10)".to_string(),
            format!("button.update {}", button.id()),
        ]
    );
}

#[test]
fn custom_detector_filters_small_changes() {
    let c = components();
    let button = c.runtime.instantiate(c.button).unwrap();
    button.set("width", Prop::Number(10));
    c.runtime.run_microtasks().unwrap();
    c.log.borrow_mut().clear();

    button.set("width", Prop::Number(12));
    c.runtime.run_microtasks().unwrap();
    assert_eq!(
        *c.log.borrow(),
        vec![format!("button.update {}", button.id())]
    );

    assert!(!change_detector(&c.runtime, c.button, "width")(
        &Prop::Number(12),
        &Prop::Number(14)
    ));
    assert!(change_detector(&c.runtime, c.element, "width")(
        &Prop::Number(12),
        &Prop::Number(14)
    ));
}

#[test]
fn base_instances_ignore_derived_registrations() {
    let c = components();
    let element = c.runtime.instantiate(c.element).unwrap();

    element.set("label", text("Heading"));
    element.set("width", Prop::Number(100));
    c.runtime.run_microtasks().unwrap();

    assert_eq!(
        *c.log.borrow(),
        vec![r#"element.label: Text("untitled") -> Text("Heading")"#.to_string()]
    );
    assert_eq!(element.get("width"), Prop::Number(100));
}

#[test]
fn render_pipeline_coexists_with_callbacks() {
    let c = components();
    let frames: Rc<RefCell<Vec<Vec<PropertyKey>>>> = Rc::default();
    let sink = Rc::clone(&frames);
    let render = c.runtime.create_pipeline(move |_, changes| {
        sink.borrow_mut().push(changes.properties().collect());
        Ok(())
    });
    render.register_property(c.element, "label").unwrap();
    render.register_property(c.button, "width").unwrap();

    let button = c.runtime.instantiate(c.button).unwrap();
    button.set("width", Prop::Number(1));
    button.set("label", text("Go"));
    c.runtime.run_microtasks().unwrap();

    assert_eq!(*frames.borrow(), vec![vec!["width", "label"]]);
    assert_eq!(
        *c.log.borrow(),
        vec![
            "button.width: Unset -> Number(1)".to_string(),
            r#"element.label: Text("untitled") -> Text("Go")"#.to_string(),
            format!("button.update {}", button.id()),
        ]
    );

    // Width 1 -> 2 is below the detector threshold: the callback chain
    // stays quiet, the raw pipeline still sees the write.
    c.log.borrow_mut().clear();
    button.set("width", Prop::Number(2));
    c.runtime.run_microtasks().unwrap();
    assert_eq!(frames.borrow().len(), 2);
    assert_eq!(
        *c.log.borrow(),
        vec![format!("button.update {}", button.id())]
    );

    render.request_update(&button).unwrap();
    c.runtime.run_microtasks().unwrap();
    assert_eq!(frames.borrow().last(), Some(&Vec::new()));
}

#[test]
fn reentrant_writes_flush_next_cycle() {
    let runtime: Runtime<Prop> = Runtime::new();
    let ty = runtime.define_type("Counter", None).unwrap();
    let seen: Log = Rc::default();

    let sink = Rc::clone(&seen);
    on_property_change(&runtime, ty, "count", move |instance, record| {
        sink.borrow_mut().push(format!("{:?}", record.new_value));
        if let Prop::Number(n) = record.new_value
            && n < 3
        {
            instance.set("count", Prop::Number(n + 1));
        }
        Ok(())
    })
    .unwrap();

    let counter = runtime.instantiate(ty).unwrap();
    counter.set("count", Prop::Number(1));
    assert_eq!(runtime.run_microtasks().unwrap(), 3);
    assert_eq!(*seen.borrow(), vec!["Number(1)", "Number(2)", "Number(3)"]);
    assert_eq!(counter.get("count"), Prop::Number(3));
}

#[test]
fn failing_callback_surfaces_and_instance_recovers() {
    let runtime: Runtime<Prop> = Runtime::new();
    let ty = runtime.define_type("Form", None).unwrap();
    let accepted: Log = Rc::default();

    let sink = Rc::clone(&accepted);
    on_property_change(&runtime, ty, "email", move |_, record| match &record.new_value {
        Prop::Text(value) if value.contains('@') => {
            sink.borrow_mut().push(value.clone());
            Ok(())
        }
        other => Err(ReactiveError::callback(format!("invalid email: {other:?}"))),
    })
    .unwrap();

    let form = runtime.instantiate(ty).unwrap();
    form.set("email", text("nobody"));
    let err = runtime.run_microtasks().unwrap_err();
    assert_eq!(err.to_string(), r#"callback failed: invalid email: Text("nobody")"#);
    assert!(!form.update_requested());

    form.set("email", text("a@b.c"));
    runtime.run_microtasks().unwrap();
    assert_eq!(*accepted.borrow(), vec!["a@b.c"]);
}

#[test]
fn shared_callback_runs_once_per_registration() {
    let c = components();
    register_change_callback(&c.runtime, c.button, "label", logger(&c.log, "button.label"))
        .unwrap();

    let button = c.runtime.instantiate(c.button).unwrap();
    button.set("label", text("Ok"));
    c.runtime.run_microtasks().unwrap();

    let log = c.log.borrow();
    assert!(log[0].starts_with("element.label"));
    assert!(log[1].starts_with("button.label"));
}

#[test]
fn custom_installer_runs_once_per_lineage() {
    let c = components();
    let widget = c.runtime.define_type("Widget", None).unwrap();
    let installs: Rc<RefCell<Vec<TypeKey>>> = Rc::default();

    let sink = Rc::clone(&installs);
    let install_theme = OncePerHierarchy::new(c.runtime.operations(), move |ty, _: ()| {
        sink.borrow_mut().push(ty);
    });

    let hierarchy = c.runtime.hierarchy();
    install_theme.call(hierarchy, c.element, ());
    install_theme.call(hierarchy, c.button, ());
    install_theme.call(hierarchy, widget, ());
    install_theme.call(hierarchy, c.element, ());

    assert_eq!(*installs.borrow(), vec![c.element, widget]);
    assert!(hierarchy.has_applied(c.button, install_theme.id()));
}

#[test]
fn lenient_runtime_skips_orphan_records() {
    let runtime: Runtime<Prop> =
        Runtime::with_config(RuntimeConfig::default().with_strict_callback_chains(false));
    let ty = runtime.define_type("Loose", None).unwrap();
    let seen: Log = Rc::default();
    on_property_change(&runtime, ty, "known", logger(&seen, "known")).unwrap();

    let item = runtime.instantiate(ty).unwrap();
    proptrack::record_pending_change(&item, "orphan", Prop::Unset, Prop::Number(1));
    item.set("known", Prop::Number(2));
    runtime.run_microtasks().unwrap();

    assert_eq!(*seen.borrow(), vec!["known: Unset -> Number(2)"]);
}
