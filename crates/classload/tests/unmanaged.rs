//! Unmanaged instances, isolated in their own test binary because the flag
//! they set is sticky for the whole process.

use classload::{register_builtin_library, register_plugin, FactoryRegistration, Loader};

trait Engine: Send + Sync {
    fn cylinders(&self) -> u8;
}

#[derive(Default)]
struct V8Engine;

impl Engine for V8Engine {
    fn cylinders(&self) -> u8 {
        8
    }
}

fn register_v8() -> FactoryRegistration {
    register_plugin::<dyn Engine>("V8Engine", "Engine", || {
        Box::new(Box::new(V8Engine) as Box<dyn Engine>)
    })
}

#[test]
fn test_unmanaged_instance_disables_on_demand_unload() {
    let path = "builtin://unmanaged/engines";
    register_builtin_library(path, || vec![register_v8()]);

    assert!(!classload::unmanaged_instance_created());

    let loader = Loader::new(path, true).unwrap();
    let raw: Box<dyn Engine> = loader.create_unmanaged::<dyn Engine>("V8Engine").unwrap();
    assert_eq!(raw.cylinders(), 8);
    assert!(classload::unmanaged_instance_created());
    assert!(loader.is_library_loaded());

    // Unmanaged instances are not tracked: the loader believes no instances
    // are live, yet the on-demand close after a managed instance drops is
    // refused (with a warning) because the unmanaged one might still be.
    let managed = loader.create_shared::<dyn Engine>("V8Engine").unwrap();
    drop(managed);
    assert!(classload::is_library_loaded_by_anybody(path));

    drop(raw);
    // The sticky flag outlives the instance; automatic closing stays off.
    let managed = loader.create_shared::<dyn Engine>("V8Engine").unwrap();
    drop(managed);
    assert!(classload::is_library_loaded_by_anybody(path));

    // Explicit unloading still works: the unmanaged instance never entered
    // the instance count.
    assert_eq!(loader.unload().unwrap(), 0);
    assert!(!classload::is_library_loaded_by_anybody(path));
}
