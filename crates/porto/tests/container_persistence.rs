//! Persistence across supervisor restarts, exercised at the engine
//! level: records written by one engine must restore into an identical
//! container map in the next.

use porto::container::ContainerState;
use porto::events::Event;
use porto::{Config, Engine};
use porto_common::{ContainerName, Cred, PortoPaths};

fn fresh_engine(dir: &std::path::Path) -> Engine {
    let paths = PortoPaths::with_roots(dir.join("run"), dir.join("place"));
    Engine::new(Config::default(), paths).unwrap()
}

#[test]
fn hierarchy_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fresh_engine(dir.path());

    for name in ["a", "a/b", "a/b/c", "d"] {
        engine
            .create_container(&ContainerName::new(name).unwrap(), Cred::new(1000, 1000), None)
            .unwrap();
    }
    engine
        .set_property("a/b/c", "command", "sleep 1000")
        .unwrap();
    engine.set_property("a/b/c", "memory_limit", "128M").unwrap();

    let engine2 = fresh_engine(dir.path());
    engine2.restore().unwrap();

    for name in ["a", "a/b", "a/b/c", "d"] {
        let ct = engine2.tree.find(name).unwrap();
        assert_eq!(ct.state(), ContainerState::Stopped);
        // Tree consistency: the parent resolves and lists the child.
        if let Some(parent_id) = ct.parent_id() {
            let parent = engine2.tree.find_by_id(parent_id).unwrap();
            assert!(parent.read().children.contains(&ct.id()));
        }
    }
    assert_eq!(
        engine2.get_property("a/b/c", "command").unwrap(),
        "sleep 1000"
    );
    assert_eq!(
        engine2.get_property("a/b/c", "memory_limit").unwrap(),
        "128M"
    );
}

#[test]
fn ids_are_stable_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fresh_engine(dir.path());

    let a = engine
        .create_container(&ContainerName::new("a").unwrap(), Cred::root(), None)
        .unwrap();
    let b = engine
        .create_container(&ContainerName::new("b").unwrap(), Cred::root(), None)
        .unwrap();
    let (a_id, b_id) = (a.id(), b.id());

    let engine2 = fresh_engine(dir.path());
    engine2.restore().unwrap();
    assert_eq!(engine2.tree.find("a").unwrap().id(), a_id);
    assert_eq!(engine2.tree.find("b").unwrap().id(), b_id);

    // A new container cannot collide with a restored id.
    let c = engine2
        .create_container(&ContainerName::new("c").unwrap(), Cred::root(), None)
        .unwrap();
    assert_ne!(c.id(), a_id);
    assert_ne!(c.id(), b_id);
}

#[test]
fn dead_containers_keep_their_status() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fresh_engine(dir.path());

    let ct = engine
        .create_container(&ContainerName::new("job").unwrap(), Cred::root(), None)
        .unwrap();
    {
        let mut rt = ct.write();
        rt.props.set("command", "false").unwrap();
        rt.state = ContainerState::Running;
        rt.task = Some(porto::exec::TaskHandle {
            host_pid: 31337,
            parent_pid: 31337,
            container_pid: 1,
        });
    }
    engine.handle_event(Event::Exit {
        pid: 31337,
        status: 256,
    });
    assert_eq!(ct.state(), ContainerState::Dead);

    let engine2 = fresh_engine(dir.path());
    engine2.restore().unwrap();
    let restored = engine2.tree.find("job").unwrap();
    assert_eq!(restored.state(), ContainerState::Dead);
}

#[test]
fn destroyed_containers_stay_destroyed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fresh_engine(dir.path());

    engine
        .create_container(&ContainerName::new("gone").unwrap(), Cred::root(), None)
        .unwrap();
    engine
        .create_container(&ContainerName::new("kept").unwrap(), Cred::root(), None)
        .unwrap();
    engine.destroy_container("gone", None).unwrap();

    let engine2 = fresh_engine(dir.path());
    engine2.restore().unwrap();
    assert!(!engine2.tree.contains("gone"));
    assert!(engine2.tree.contains("kept"));
}

#[test]
fn waiters_complete_once_per_death() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fresh_engine(dir.path());

    let ct = engine
        .create_container(&ContainerName::new("w").unwrap(), Cred::root(), None)
        .unwrap();
    {
        let mut rt = ct.write();
        rt.state = ContainerState::Running;
        rt.task = Some(porto::exec::TaskHandle {
            host_pid: 4000,
            parent_pid: 4000,
            container_pid: 1,
        });
    }

    // Three waiters: two exact, one wildcard.
    engine.wait_containers(1, &["w".to_string()], None).unwrap();
    engine.wait_containers(2, &["w".to_string()], None).unwrap();
    engine.wait_containers(3, &["*".to_string()], None).unwrap();

    engine.handle_event(Event::Exit { pid: 4000, status: 0 });

    let reports = engine.take_reports();
    assert_eq!(reports.len(), 3);
    let mut clients: Vec<u64> = reports.iter().map(|r| r.client).collect();
    clients.sort_unstable();
    assert_eq!(clients, vec![1, 2, 3]);

    // A second death event is a no-op, no duplicate notifications.
    engine.handle_event(Event::Exit { pid: 4000, status: 0 });
    assert!(engine.take_reports().is_empty());
}
