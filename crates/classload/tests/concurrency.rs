//! Parallel use of the registry: many threads creating through one loader,
//! and many loaders cycling their own libraries through the shared catalog.

use std::sync::Arc;
use std::thread;

use classload::{register_builtin_library, register_plugin, FactoryRegistration, Loader};

trait Job: Send + Sync {
    fn run(&self) -> u32;
}

#[derive(Default)]
struct BusyJob;

impl Job for BusyJob {
    fn run(&self) -> u32 {
        11
    }
}

fn register_busy() -> FactoryRegistration {
    register_plugin::<dyn Job>("BusyJob", "Job", || {
        Box::new(Box::new(BusyJob) as Box<dyn Job>)
    })
}

#[test]
fn test_parallel_creation_through_one_loader() {
    let path = "builtin://concurrency/busy";
    register_builtin_library(path, || vec![register_busy()]);

    let loader = Arc::new(Loader::new(path, false).unwrap());

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let loader = Arc::clone(&loader);
            thread::spawn(move || {
                for _ in 0..50 {
                    let job = loader.create_shared::<dyn Job>("BusyJob").unwrap();
                    assert_eq!(job.run(), 11);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    // Every instance dropped; the eager load reference is still held.
    assert!(loader.is_library_loaded());
    assert_eq!(loader.unload().unwrap(), 0);
    assert!(!loader.is_library_loaded_by_any());
}

#[test]
fn test_parallel_loaders_cycle_their_own_libraries() {
    struct WorkerJob(u32);

    impl Job for WorkerJob {
        fn run(&self) -> u32 {
            self.0
        }
    }

    let threads: Vec<_> = (0..6)
        .map(|worker: u32| {
            thread::spawn(move || {
                let path = format!("builtin://concurrency/worker-{worker}");
                let class = format!("WorkerJob{worker}");
                {
                    let class = class.clone();
                    // Each worker library exports its own class name.
                    register_builtin_library(&path, move || {
                        vec![register_plugin::<dyn Job>(&class, "Job", || {
                            Box::new(Box::new(WorkerJob(0)) as Box<dyn Job>)
                        })]
                    });
                }

                for _ in 0..20 {
                    let loader = Loader::new(path.as_str(), true).unwrap();
                    let job = loader.create_shared::<dyn Job>(&class).unwrap();
                    assert_eq!(job.run(), 0);
                    drop(job);
                    assert!(!loader.is_library_loaded());
                }
                path
            })
        })
        .collect();

    for thread in threads {
        let path = thread.join().unwrap();
        assert!(!classload::is_library_loaded_by_anybody(&path));
    }
}
