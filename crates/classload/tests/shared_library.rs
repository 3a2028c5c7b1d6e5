//! Two loaders sharing one library: the library stays resident until the
//! last owner departs, and factories stay reachable through the remaining
//! owner.

use classload::{register_builtin_library, register_plugin, FactoryRegistration, Loader};

trait Sensor: Send + Sync {
    fn reading(&self) -> i32;
}

#[derive(Default)]
struct SharedSensor;

impl Sensor for SharedSensor {
    fn reading(&self) -> i32 {
        42
    }
}

#[derive(Default)]
struct LateSensor;

impl Sensor for LateSensor {
    fn reading(&self) -> i32 {
        7
    }
}

fn register_shared() -> FactoryRegistration {
    register_plugin::<dyn Sensor>("SharedSensor", "Sensor", || {
        Box::new(Box::new(SharedSensor) as Box<dyn Sensor>)
    })
}

fn register_late() -> FactoryRegistration {
    register_plugin::<dyn Sensor>("LateSensor", "Sensor", || {
        Box::new(Box::new(LateSensor) as Box<dyn Sensor>)
    })
}

#[test]
fn test_second_loader_shares_resident_library() {
    let path = "builtin://shared/two-loaders";
    register_builtin_library(path, || vec![register_shared()]);

    let first = Loader::new(path, false).unwrap();
    let second = Loader::new(path, false).unwrap();

    assert!(first.is_class_available::<dyn Sensor>("SharedSensor"));
    assert!(second.is_class_available::<dyn Sensor>("SharedSensor"));

    // Destroying the first loader leaves the class reachable through the
    // second, and the library resident.
    drop(first);
    assert!(classload::is_library_loaded_by_anybody(path));
    assert!(second.is_class_available::<dyn Sensor>("SharedSensor"));

    let instance = second.create_shared::<dyn Sensor>("SharedSensor").unwrap();
    assert_eq!(instance.reading(), 42);
    drop(instance);

    // Destroying the last owner closes the library and retires the class.
    drop(second);
    assert!(!classload::is_library_loaded_by_anybody(path));
}

#[test]
fn test_on_demand_loader_binds_to_library_opened_by_another() {
    let path = "builtin://shared/late-binding";
    register_builtin_library(path, || vec![register_late()]);

    let opener = Loader::new(path, false).unwrap();

    // The second loader never calls load() explicitly; creation binds it as
    // an additional owner of the already-resident library.
    let late = Loader::new(path, true).unwrap();
    assert!(!late.is_library_loaded());

    let instance = late.create_shared::<dyn Sensor>("LateSensor").unwrap();
    assert_eq!(instance.reading(), 7);
    assert!(late.is_library_loaded());

    drop(instance);
    // The opener still holds the library: the on-demand close released only
    // this loader's claim.
    assert!(classload::is_library_loaded_by_anybody(path));
    assert!(opener.is_class_available::<dyn Sensor>("LateSensor"));
}
