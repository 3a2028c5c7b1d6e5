//! Instance reference counting: live instances pin the library, shared
//! clones count once, and unique handles behave like their shared peers.

use classload::{register_builtin_library, register_plugin, FactoryRegistration, Loader};

trait Counter: Send + Sync {
    fn bump(&self) -> u32;
}

#[derive(Default)]
struct PinCounter;

impl Counter for PinCounter {
    fn bump(&self) -> u32 {
        1
    }
}

#[derive(Default)]
struct CloneCounter;

impl Counter for CloneCounter {
    fn bump(&self) -> u32 {
        2
    }
}

#[derive(Default)]
struct UniqueCounter {
    state: u32,
}

impl Counter for UniqueCounter {
    fn bump(&self) -> u32 {
        self.state + 3
    }
}

fn register_pin() -> FactoryRegistration {
    register_plugin::<dyn Counter>("PinCounter", "Counter", || {
        Box::new(Box::new(PinCounter) as Box<dyn Counter>)
    })
}

fn register_clone() -> FactoryRegistration {
    register_plugin::<dyn Counter>("CloneCounter", "Counter", || {
        Box::new(Box::new(CloneCounter) as Box<dyn Counter>)
    })
}

fn register_unique() -> FactoryRegistration {
    register_plugin::<dyn Counter>("UniqueCounter", "Counter", || {
        Box::new(Box::new(UniqueCounter::default()) as Box<dyn Counter>)
    })
}

#[test]
fn test_live_instance_blocks_unload() {
    let path = "builtin://instances/pin";
    register_builtin_library(path, || vec![register_pin()]);

    let loader = Loader::new(path, true).unwrap();
    let instance = loader.create_shared::<dyn Counter>("PinCounter").unwrap();
    assert_eq!(instance.bump(), 1);

    // Unload is refused (with a warning) while the instance lives; the
    // returned count is unchanged.
    assert_eq!(loader.unload().unwrap(), 1);
    assert!(loader.is_library_loaded());
    assert_eq!(loader.unload().unwrap(), 1);
    assert!(classload::is_library_loaded_by_anybody(path));

    // Dropping the instance releases the pin and, on demand, closes the
    // library.
    drop(instance);
    assert!(!classload::is_library_loaded_by_anybody(path));
}

#[test]
fn test_shared_clones_count_as_one_instance() {
    let path = "builtin://instances/clones";
    register_builtin_library(path, || vec![register_clone()]);

    let loader = Loader::new(path, true).unwrap();
    let original = loader.create_shared::<dyn Counter>("CloneCounter").unwrap();
    let duplicate = original.clone();

    drop(original);
    // A clone still lives; the library stays open.
    assert!(loader.is_library_loaded());
    assert_eq!(duplicate.bump(), 2);

    drop(duplicate);
    assert!(!classload::is_library_loaded_by_anybody(path));
}

#[test]
fn test_two_instances_close_only_after_both_drop() {
    let path = "builtin://instances/pair";
    register_builtin_library(path, || {
        vec![register_plugin::<dyn Counter>("PairCounter", "Counter", || {
            Box::new(Box::new(PinCounter) as Box<dyn Counter>)
        })]
    });

    let loader = Loader::new(path, true).unwrap();
    let first = loader.create_shared::<dyn Counter>("PairCounter").unwrap();
    let second = loader.create_shared::<dyn Counter>("PairCounter").unwrap();

    drop(first);
    assert!(loader.is_library_loaded());

    drop(second);
    assert!(!classload::is_library_loaded_by_anybody(path));
}

#[test]
fn test_unique_instance_lifecycle() {
    let path = "builtin://instances/unique";
    register_builtin_library(path, || vec![register_unique()]);

    let loader = Loader::new(path, true).unwrap();
    let instance = loader.create_unique::<dyn Counter>("UniqueCounter").unwrap();
    assert_eq!(instance.bump(), 3);
    assert!(loader.is_library_loaded());

    drop(instance);
    assert!(!classload::is_library_loaded_by_anybody(path));
}
