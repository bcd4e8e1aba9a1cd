use dataiku_iac_core::{
    ConfigError, GraphError, ResourceAddress, load_project_from_root_with_environment,
};
use std::fs;
use std::path::Path;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[test]
fn test_full_project_layout() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();

    write(
        root,
        "dataiku.kdl",
        r#"
        workspace "analytics"

        project "DEMO" {
            name "Demo project"
            owner "{{ owner }}"
        }

        environment "prod" {
            variables { connection "s3_prod" }
        }
        "#,
    );
    write(
        root,
        "variables/common.kdl",
        r#"
        variables {
            owner "data-team"
            connection "filesystem_managed"
        }
        "#,
    );
    write(
        root,
        "resources/pipeline.kdl",
        r#"
        dataset "RAW" project="DEMO" {
            connection "{{ connection }}"
        }
        dataset "PREPARED" project="DEMO" {
            connection "{{ connection }}"
        }
        recipe "compute_PREPARED" project="DEMO" {
            type "python"
            input "RAW"
            output "PREPARED"
        }
        scenario "daily" project="DEMO" {
            depends-on "recipe:compute_PREPARED"
        }
        "#,
    );

    let loaded = load_project_from_root_with_environment(root, Some("prod")).unwrap();
    assert_eq!(loaded.config.name, "analytics");

    let graph = loaded.build_graph().unwrap();
    assert_eq!(graph.len(), 5);

    let raw = graph.node(&ResourceAddress::dataset("DEMO", "RAW")).unwrap();
    assert_eq!(raw.attributes["connection"], serde_json::json!("s3_prod"));

    let recipe = graph
        .index_of(&ResourceAddress::recipe("DEMO", "compute_PREPARED"))
        .unwrap();
    let recipe_deps: Vec<_> = graph
        .dependencies(recipe)
        .iter()
        .map(|&i| graph.node_at(i).unwrap().address.clone())
        .collect();
    assert!(recipe_deps.contains(&ResourceAddress::project("DEMO")));
    assert!(recipe_deps.contains(&ResourceAddress::dataset("DEMO", "RAW")));
    assert!(recipe_deps.contains(&ResourceAddress::dataset("DEMO", "PREPARED")));

    let demo = graph.node(&ResourceAddress::project("DEMO")).unwrap();
    assert_eq!(demo.attributes["owner"], serde_json::json!("data-team"));
}

#[test]
fn test_duplicate_across_files() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    write(root, "dataiku.kdl", r#"project "DEMO" {}"#);
    write(root, "resources/a.kdl", r#"dataset "RAW" project="DEMO" {}"#);
    write(root, "resources/b.kdl", r#"dataset "RAW" project="DEMO" {}"#);

    let loaded = load_project_from_root_with_environment(root, None).unwrap();
    assert!(matches!(
        loaded.build_graph(),
        Err(GraphError::DuplicateResource(_))
    ));
}

#[test]
fn test_local_override_wins() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    write(root, "dataiku.kdl", r#"project "DEMO" { owner "alice" }"#);
    write(root, "dataiku.local.kdl", r#"project "DEMO" { owner "me" }"#);

    let loaded = load_project_from_root_with_environment(root, None).unwrap();
    let graph = loaded.build_graph().unwrap();
    assert_eq!(
        graph.node(&ResourceAddress::project("DEMO")).unwrap().attributes["owner"],
        serde_json::json!("me")
    );
}

#[test]
fn test_schema_error_reports_before_graph() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    write(root, "dataiku.kdl", r#"project "lowercase" {}"#);

    let result = load_project_from_root_with_environment(root, None);
    assert!(matches!(result, Err(ConfigError::Schema(_))));
}
