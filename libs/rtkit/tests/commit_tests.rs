//! Commit engine behavior: planning, ordering, two-pass isolation, and
//! execution against a scripted bus.

use std::path::PathBuf;
use std::sync::Arc;

use rtkit::Error;
use rtkit::commit::{CommitEngine, order_modules};
use rtkit::config::{ConfigOperator, ConfigTree};
use rtkit::supervisor::{ModuleStatus, ProcessSupervisor};
use rtkit::task::TaskManager;
use rtkit::template::TemplateTree;
use rtkit_bus::testing::ScriptedBus;
use rtkit_bus::{CallBus, SignatureDb};
use tokio_util::sync::CancellationToken;

fn sample_template() -> Arc<TemplateTree> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/templates");
    Arc::new(TemplateTree::load(&dir, &SignatureDb::permissive()).expect("templates load"))
}

fn committed_base(template: &Arc<TemplateTree>) -> ConfigTree {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.boot");
    let text = std::fs::read_to_string(path).expect("boot config readable");
    let mut tree = ConfigTree::new(Arc::clone(template));
    tree.parse(&text, "config.boot", 0).expect("boot config parses");
    tree.add_default_children();
    tree.finalize_commit();
    tree
}

fn engine_with(
    bus: &Arc<ScriptedBus>,
    execute: bool,
) -> (CommitEngine, Arc<ProcessSupervisor>) {
    let supervisor = ProcessSupervisor::new(false, CancellationToken::new());
    let manager = TaskManager::new(
        Arc::clone(bus) as Arc<dyn CallBus>,
        Arc::clone(&supervisor),
        execute,
    );
    (CommitEngine::new(manager), supervisor)
}

/// Marks a module as already up without spawning anything.
fn pretend_running(supervisor: &ProcessSupervisor, module: &str, executable: &str) {
    supervisor.declare(module, executable).unwrap();
    supervisor.start(module, false, false).unwrap();
    supervisor.mark_running(module);
}

#[tokio::test(start_paused = true)]
async fn first_commit_plans_one_task_with_the_interface_steps() {
    let template = sample_template();
    let mut tree = ConfigTree::new(Arc::clone(&template));
    tree.set(
        "interfaces.interface.eth0.enabled",
        Some("true"),
        ConfigOperator::Assign,
        0,
    )
    .unwrap();

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, _supervisor) = engine_with(&bus, false);

    engine.prepare(&tree, false).unwrap();
    assert_eq!(engine.task_manager().planned_order(), vec!["interfaces"]);
    let task = engine.task_manager().task("interfaces").expect("task");
    assert!(task.will_start_module());
    // Creating eth0 queues its %create, setting enabled queues its %set.
    assert_eq!(task.step_count(), 2);

    // A verification-only commit succeeds without touching the bus.
    engine.commit(&mut tree).await.expect("no-exec commit");
    assert_eq!(bus.call_count(), 0);
    assert_eq!(tree.get("interfaces.interface.eth0.enabled"), Some("true"));
    assert!(!tree.has_provisional_changes());
}

#[tokio::test(start_paused = true)]
async fn boot_configuration_verifies_end_to_end() {
    let template = sample_template();
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.boot");
    let text = std::fs::read_to_string(path).unwrap();

    let mut tree = ConfigTree::new(Arc::clone(&template));
    tree.parse(&text, "config.boot", 0).unwrap();
    tree.add_default_children();

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, _supervisor) = engine_with(&bus, false);
    engine.commit(&mut tree).await.expect("verification commit");
    assert_eq!(bus.call_count(), 0);
    assert!(!tree.has_provisional_changes());
}

#[tokio::test(start_paused = true)]
async fn committing_an_unchanged_tree_invokes_nothing() {
    let template = sample_template();
    let mut tree = committed_base(&template);

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, _supervisor) = engine_with(&bus, true);

    engine.prepare(&tree, true).unwrap();
    assert!(engine.task_manager().planned_order().is_empty());

    engine.commit(&mut tree).await.expect("empty commit");
    assert_eq!(bus.call_count(), 0);
}

const CHAIN: &str = r#"
a { %modinfo { provides: a; depends: b; path: "sbin/rk-a"; }; x: u32; }
b { %modinfo { provides: b; depends: c; path: "sbin/rk-b"; }; x: u32; }
c { %modinfo { provides: c; path: "sbin/rk-c"; }; x: u32; }
"#;

fn chain_template() -> Arc<TemplateTree> {
    Arc::new(TemplateTree::from_str(CHAIN, "chain.tp", &SignatureDb::permissive()).unwrap())
}

#[test]
fn dependencies_order_before_dependents() {
    let template = chain_template();
    let all = ["a", "b", "c"].map(str::to_owned).into_iter().collect();
    assert_eq!(order_modules(&template, &all).unwrap(), vec!["c", "b", "a"]);

    // Requesting only the dependent pulls the chain in transitively.
    let just_a = std::iter::once("a".to_owned()).collect();
    assert_eq!(order_modules(&template, &just_a).unwrap(), vec!["c", "b", "a"]);
}

#[test]
fn dependency_cycles_are_fatal() {
    let text = r#"
p { %modinfo { provides: p; depends: q; path: "sbin/rk-p"; }; x: u32; }
q { %modinfo { provides: q; depends: p; path: "sbin/rk-q"; }; x: u32; }
"#;
    let template =
        Arc::new(TemplateTree::from_str(text, "cycle.tp", &SignatureDb::permissive()).unwrap());
    let both = ["p", "q"].map(str::to_owned).into_iter().collect();
    let err = order_modules(&template, &both).unwrap_err();
    assert!(matches!(err, Error::DependencyCycle { ref modules } if modules.len() == 2));
}

#[tokio::test(start_paused = true)]
async fn startup_order_forward_shutdown_order_reverse() {
    let template = chain_template();
    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, supervisor) = engine_with(&bus, true);
    for (module, exec) in [("a", "sbin/rk-a"), ("b", "sbin/rk-b"), ("c", "sbin/rk-c")] {
        pretend_running(&supervisor, module, exec);
    }

    // Configure all three.
    let mut tree = ConfigTree::new(Arc::clone(&template));
    for path in ["a.x", "b.x", "c.x"] {
        tree.set(path, Some("1"), ConfigOperator::Assign, 0).unwrap();
    }
    engine.prepare(&tree, false).unwrap();
    assert_eq!(engine.task_manager().planned_order(), vec!["c", "b", "a"]);
    engine.commit(&mut tree).await.expect("chain commit");

    // Delete all three: shutdown runs dependents first.
    for path in ["a", "b", "c"] {
        tree.delete(path, 0).unwrap();
    }
    engine.prepare(&tree, true).unwrap();
    assert_eq!(engine.task_manager().planned_order(), vec!["a", "b", "c"]);
}

const OPTIONAL_PEER: &str = r#"
m {
    %modinfo { provides: m; path: "sbin/rk-m"; };
    peer: ipv4;
    target: u32 {
        %set: xrl "m/m/set?v:u32=$(@)&peer:ipv4=$(peer)";
    }
}
"#;

#[tokio::test(start_paused = true)]
async fn pass_one_failure_touches_no_external_system() {
    let template = Arc::new(
        TemplateTree::from_str(OPTIONAL_PEER, "m.tp", &SignatureDb::permissive()).unwrap(),
    );
    let mut tree = ConfigTree::new(Arc::clone(&template));
    // peer is left unset, so expanding the %set action must fail.
    tree.set("m.target", Some("1"), ConfigOperator::Assign, 0).unwrap();

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, supervisor) = engine_with(&bus, true);

    let err = engine.commit(&mut tree).await.unwrap_err();
    assert!(matches!(err, Error::Commit { ref module, .. } if module == "m"), "{err}");

    // Pass 1 failed: no remote call was made, no process was started.
    assert_eq!(bus.call_count(), 0);
    assert_eq!(supervisor.status("m"), ModuleStatus::NotStarted);
    // The provisional edit was discarded.
    assert_eq!(tree.get("m.target"), None);
}

#[tokio::test(start_paused = true)]
async fn executed_commit_calls_the_bus_and_writes_results_back() {
    let template = sample_template();
    let mut tree = committed_base(&template);

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, supervisor) = engine_with(&bus, true);
    pretend_running(&supervisor, "interfaces", "sbin/routekit-ifmgr");

    tree.set(
        "interfaces.interface.eth1.enabled",
        Some("true"),
        ConfigOperator::Assign,
        0,
    )
    .unwrap();

    // Pass 2: create_interface, set_enabled (with writeback), ready probe.
    bus.push_reply(rtkit_bus::CallReply::empty());
    bus.push_reply(
        rtkit_bus::CallReply::empty().with("ok", rtkit_bus::AtomValue::Bool(true)),
    );
    bus.push_status(3, "");

    engine.commit(&mut tree).await.expect("commit");

    let calls = bus.recorded_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].method, "create_interface");
    assert_eq!(calls[0].to_string(), "ifmgr/ifmgr/create_interface?ifname:txt=eth1");
    assert_eq!(calls[1].method, "set_enabled");
    assert_eq!(calls[2].method, "get_status");

    // The declared writeback variable landed on the originating node.
    let enabled = tree.find("interfaces.interface.eth1.enabled").unwrap();
    assert_eq!(tree.expand_variable(enabled, "last_ok"), Some("true".to_owned()));
    assert!(!tree.has_provisional_changes());
}

#[tokio::test(start_paused = true)]
async fn removing_a_module_schedules_its_shutdown() {
    let template = sample_template();
    let mut tree = committed_base(&template);

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, supervisor) = engine_with(&bus, true);
    pretend_running(&supervisor, "interfaces", "sbin/routekit-ifmgr");
    pretend_running(&supervisor, "static_routes", "sbin/routekit-static");

    tree.delete("interfaces", 0).unwrap();

    // Pass 2: the shutdown method, then the shutdown probe reporting DONE.
    bus.push_reply(rtkit_bus::CallReply::empty());
    bus.push_status(6, "");

    engine.commit(&mut tree).await.expect("shutdown commit");

    let calls = bus.recorded_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].method, "shutdown");
    assert_eq!(calls[1].method, "get_status");
    assert_eq!(supervisor.status("interfaces"), ModuleStatus::Stopped);
    assert_eq!(supervisor.status("static_routes"), ModuleStatus::Running);
    assert!(tree.find("interfaces").is_none());
}

#[tokio::test(start_paused = true)]
async fn pass_two_failure_names_the_module_and_discards_edits() {
    let template = sample_template();
    let mut tree = committed_base(&template);

    let bus = Arc::new(ScriptedBus::new());
    let (mut engine, supervisor) = engine_with(&bus, true);
    pretend_running(&supervisor, "interfaces", "sbin/routekit-ifmgr");

    tree.set(
        "interfaces.interface.eth0.mtu",
        Some("1500"),
        ConfigOperator::Assign,
        0,
    )
    .unwrap();

    // The set_mtu call fails permanently; non-fatal for the target but
    // fatal for the commit.
    bus.push_error(rtkit_bus::BusError::CommandFailed {
        reason: "mtu not supported".to_owned(),
    });

    let err = engine.commit(&mut tree).await.unwrap_err();
    match err {
        Error::Commit { module, message } => {
            assert_eq!(module, "interfaces");
            assert!(message.contains("mtu not supported"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Permanent command errors do not wound the target.
    assert_eq!(supervisor.status("interfaces"), ModuleStatus::Running);
    // The provisional edit was discarded.
    assert_eq!(tree.get("interfaces.interface.eth0.mtu"), Some("9000"));
}
