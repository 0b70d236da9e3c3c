//! Configuration tree behavior against the sample schema.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rtkit::Error;
use rtkit::config::{ConfigOperator, ConfigTree};
use rtkit::template::TemplateTree;
use rtkit_bus::SignatureDb;

fn template() -> Arc<TemplateTree> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/templates");
    Arc::new(TemplateTree::load(&dir, &SignatureDb::permissive()).expect("templates load"))
}

fn boot_text() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.boot");
    std::fs::read_to_string(path).expect("boot config readable")
}

fn parsed_tree() -> ConfigTree {
    let mut tree = ConfigTree::new(template());
    tree.parse(&boot_text(), "config.boot", 0).expect("boot config parses");
    tree
}

fn committed_tree() -> ConfigTree {
    let mut tree = parsed_tree();
    tree.add_default_children();
    tree.finalize_commit();
    tree
}

#[test]
fn sample_config_parses_with_values_and_keys() {
    let tree = parsed_tree();
    assert_eq!(tree.get("interfaces.interface.eth0.mtu"), Some("9000"));
    assert_eq!(tree.get("interfaces.interface.eth0.enabled"), Some("true"));
    assert_eq!(
        tree.get("interfaces.interface.eth0.address.192.0.2.1.prefix-length"),
        None,
        "dotted lookup cannot cross a dotted key"
    );
    let eth0 = tree.find("interfaces.interface.eth0").expect("eth0");
    let address_tag = tree
        .children(eth0)
        .iter()
        .copied()
        .find(|&c| tree.node(c).segment == "address")
        .expect("address tag");
    let instance = tree.children(address_tag)[0];
    assert_eq!(tree.node(instance).segment, "192.0.2.1");
}

#[test]
fn defaults_are_synthesized_under_existing_containers() {
    let mut tree = parsed_tree();
    tree.add_default_children();
    // metric was not configured; its schema default appears committed.
    let route = tree.find("protocols.static.route").expect("route tag");
    let instance = tree.children(route)[0];
    let metric = tree
        .children(instance)
        .iter()
        .copied()
        .find(|&c| tree.node(c).segment == "metric")
        .expect("metric default");
    assert_eq!(tree.node(metric).value.as_deref(), Some("1"));
    assert!(tree.node(metric).committed);
    // finder was never configured; no default subtree appears for it.
    assert!(tree.find("finder").is_none());
}

#[test]
fn rejected_set_leaves_the_tree_untouched() {
    let mut tree = committed_tree();
    let before = tree.serialize();

    // Out of every declared range.
    let err = tree
        .set(
            "interfaces.interface.eth0.mtu",
            Some("42"),
            ConfigOperator::Assign,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }));

    // Malformed for the type.
    let err = tree
        .set(
            "interfaces.interface.eth0.enabled",
            Some("maybe"),
            ConfigOperator::Assign,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }));

    // Operator not admitted.
    let err = tree
        .set(
            "interfaces.interface.eth0.mtu",
            Some("9000"),
            ConfigOperator::Add,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }));

    // Unknown child.
    let err = tree
        .set(
            "interfaces.interface.eth0.speed",
            Some("1000"),
            ConfigOperator::Assign,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }));

    // Outside the %allow set.
    let err = tree
        .set(
            "interfaces.interface.eth0.media",
            Some("token-ring"),
            ConfigOperator::Assign,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }));

    assert_eq!(tree.serialize(), before);
    assert!(!tree.has_provisional_changes());
}

#[test]
fn allowed_set_membership_is_accepted() {
    let mut tree = committed_tree();
    tree.set(
        "interfaces.interface.eth0.media",
        Some("ethernet"),
        ConfigOperator::Assign,
        1,
    )
    .unwrap();
    assert_eq!(tree.get("interfaces.interface.eth0.media"), Some("ethernet"));
}

#[test]
fn set_within_constraints_is_provisional_until_finalized() {
    let mut tree = committed_tree();
    tree.set(
        "interfaces.interface.eth0.mtu",
        Some("1500"),
        ConfigOperator::AssignDefault,
        1,
    )
    .unwrap();
    assert!(tree.has_provisional_changes());
    assert_eq!(tree.get("interfaces.interface.eth0.mtu"), Some("1500"));
    assert_eq!(
        tree.find_changed_modules().into_iter().collect::<Vec<_>>(),
        vec!["interfaces".to_owned()]
    );

    tree.finalize_commit();
    assert!(!tree.has_provisional_changes());
    assert_eq!(tree.get("interfaces.interface.eth0.mtu"), Some("1500"));
}

#[test]
fn discard_restores_the_committed_state() {
    let mut tree = committed_tree();
    tree.set(
        "interfaces.interface.eth0.mtu",
        Some("1500"),
        ConfigOperator::Assign,
        1,
    )
    .unwrap();
    tree.set(
        "interfaces.interface.eth1.enabled",
        Some("true"),
        ConfigOperator::Assign,
        1,
    )
    .unwrap();
    tree.delete("protocols.static", 1).unwrap();

    tree.discard_provisional();
    assert_eq!(tree.get("interfaces.interface.eth0.mtu"), Some("9000"));
    assert!(tree.find("interfaces.interface.eth1").is_none());
    assert!(tree.find("protocols.static.route").is_some());
    assert!(!tree.has_provisional_changes());
}

#[test]
fn delete_marks_but_keeps_nodes_until_finalize() {
    let mut tree = committed_tree();
    tree.delete("interfaces.interface.eth0", 1).unwrap();
    let eth0 = tree.find("interfaces.interface.eth0").expect("still present");
    assert!(tree.node(eth0).deleted);
    assert!(tree.find_changed_modules().contains("interfaces"));

    tree.finalize_commit();
    assert!(tree.find("interfaces.interface.eth0").is_none());
}

#[test]
fn deleting_everything_empties_active_modules() {
    let mut tree = committed_tree();
    assert_eq!(tree.find_active_modules().len(), 2);
    tree.delete_entire_config(1);
    assert!(tree.find_active_modules().is_empty());
    assert_eq!(tree.find_previously_active_modules().len(), 2);
}

#[test]
fn serialize_then_reparse_is_semantically_equal() {
    let tree = committed_tree();
    let text = tree.serialize();
    assert!(text.starts_with("/* Router configuration, RouteKit v1 */"));

    let mut reparsed = ConfigTree::new(template());
    reparsed.parse(&text, "reparsed", 0).expect("round-trip parses");
    reparsed.add_default_children();
    assert!(tree.semantic_eq(&reparsed), "round-trip changed the tree:\n{text}");
}

#[test]
fn save_and_load_round_trip_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.boot");

    let tree = committed_tree();
    tree.save(&path).expect("save");

    let mut fresh = committed_tree();
    fresh
        .set(
            "interfaces.interface.eth0.mtu",
            Some("1500"),
            ConfigOperator::Assign,
            0,
        )
        .unwrap();
    fresh.finalize_commit();

    // Loading the saved file brings the tree back to the saved state.
    let (deltas, deletions) = fresh.load(&path, 0).expect("load");
    assert!(deltas.find("interfaces").is_some());
    assert!(deletions.walk_preorder().len() <= 1, "nothing was deleted");
    fresh.finalize_commit();
    assert!(tree.semantic_eq(&fresh));
}

#[test]
fn save_refuses_to_overwrite_a_foreign_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "precious data\n").unwrap();

    let tree = committed_tree();
    let err = tree.save(&path).unwrap_err();
    assert!(err.to_string().contains("refusing to overwrite"), "{err}");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "precious data\n");
}

#[test]
fn diff_and_replay_reconstruct_the_candidate() {
    let baseline = committed_tree();

    let mut candidate = committed_tree();
    candidate
        .set(
            "interfaces.interface.eth1.enabled",
            Some("true"),
            ConfigOperator::Assign,
            0,
        )
        .unwrap();
    candidate
        .set(
            "interfaces.interface.eth0.mtu",
            Some("1500"),
            ConfigOperator::Assign,
            0,
        )
        .unwrap();
    candidate.delete("protocols.static", 0).unwrap();
    candidate.finalize_commit();

    let (deltas, deletions) = candidate.diff(&baseline);
    assert!(deltas.find("interfaces.interface.eth1.enabled").is_some());
    assert!(deletions.find("protocols.static").is_some());
    // Unchanged leaves stay out of the delta.
    assert!(deltas.find("interfaces.interface.eth0.enabled").is_none());

    let mut replayed = committed_tree();
    replayed.apply_deltas(&deltas, 0).expect("deltas apply");
    replayed.apply_deletions(&deletions, 0).expect("deletions apply");
    replayed.finalize_commit();
    assert!(candidate.semantic_eq(&replayed));
}

#[test]
fn node_locks_block_other_users() {
    let mut tree = committed_tree();
    tree.lock_node(
        "interfaces.interface.eth0.mtu",
        1,
        Duration::from_secs(60),
    )
    .unwrap();

    let err = tree
        .set(
            "interfaces.interface.eth0.mtu",
            Some("1500"),
            ConfigOperator::Assign,
            2,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NodeLocked { holder: 1, .. }));
    let err = tree.unlock_node("interfaces.interface.eth0.mtu", 2).unwrap_err();
    assert!(matches!(err, Error::NodeLocked { .. }));

    // The holder can still edit, and can release the lock.
    tree.set(
        "interfaces.interface.eth0.mtu",
        Some("1500"),
        ConfigOperator::Assign,
        1,
    )
    .unwrap();
    tree.unlock_node("interfaces.interface.eth0.mtu", 1).unwrap();
    tree.set(
        "interfaces.interface.eth0.mtu",
        Some("9000"),
        ConfigOperator::Assign,
        2,
    )
    .unwrap();
}

#[test]
fn variable_expansion_resolves_keys_values_and_declared_names() {
    let tree = committed_tree();
    let eth0 = tree.find("interfaces.interface.eth0").unwrap();
    let mtu = tree.find("interfaces.interface.eth0.mtu").unwrap();

    // `@` is the node's own text: key for instances, value for leaves.
    assert_eq!(tree.expand_variable(eth0, "@"), Some("eth0".to_owned()));
    assert_eq!(tree.expand_variable(mtu, "@"), Some("9000".to_owned()));
    // Children and siblings by name.
    assert_eq!(tree.expand_variable(eth0, "mtu"), Some("9000".to_owned()));
    assert_eq!(tree.expand_variable(mtu, "enabled"), Some("true".to_owned()));
    // Declared variables resolve within the nearest enclosing instance.
    assert_eq!(tree.expand_variable(mtu, "ifname"), Some("eth0".to_owned()));
    // Absolute dotted paths.
    assert_eq!(
        tree.expand_variable(mtu, "interfaces.interface.eth0.mtu"),
        Some("9000".to_owned())
    );
    assert_eq!(tree.expand_variable(mtu, "nosuch"), None);
}

#[test]
fn expression_evaluation_is_delegated_to_the_host() {
    let mut tree = committed_tree();
    let mtu = tree.find("interfaces.interface.eth0.mtu").unwrap();
    assert_eq!(tree.expand_expression(mtu, "uptime"), None);

    tree.set_expr_evaluator(Arc::new(|expr: &str| {
        (expr == "uptime").then(|| "42".to_owned())
    }));
    assert_eq!(tree.expand_expression(mtu, "uptime"), Some("42".to_owned()));
}

#[test]
fn parse_error_pinpoints_line_and_preserves_tree() {
    let mut tree = committed_tree();
    let before = tree.serialize();
    let err = tree
        .parse(
            "interfaces {\n    interface \"eth9\" {\n        mtu = banana;\n    }\n}\n",
            "edit",
            0,
        )
        .unwrap_err();
    assert!(err.to_string().starts_with("edit:3"), "{err}");
    assert_eq!(tree.serialize(), before);
}
