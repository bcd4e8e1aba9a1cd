//! リソースグラフ
//!
//! パース済み設定から、変数展開済みの不変な依存グラフを構築します。
//! ノードはアドレス順に並び、依存関係は整数インデックスの隣接リストで保持します。

use crate::error::GraphError;
use crate::model::{Attributes, ParsedConfig, ResourceAddress, Variables};
use crate::template::Substitute;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};

/// 変数展開済みのリソース
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub address: ResourceAddress,
    pub attributes: Attributes,
    /// 依存先（アドレス順）
    pub depends_on: Vec<ResourceAddress>,
}

/// 不変のリソース依存グラフ
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    /// deps[i] = ノード i が依存するノードのインデックス
    deps: Vec<Vec<usize>>,
    index: HashMap<ResourceAddress, usize>,
}

impl ResourceGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// アドレス順の全ノード
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, address: &ResourceAddress) -> Option<&ResourceNode> {
        self.index_of(address).map(|i| &self.nodes[i])
    }

    pub fn node_at(&self, index: usize) -> Option<&ResourceNode> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, address: &ResourceAddress) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// ノード i の依存先インデックス
    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.deps.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }
}

/// リソースグラフのビルダー
pub struct GraphBuilder<'a> {
    substitute: &'a dyn Substitute,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(substitute: &'a dyn Substitute) -> Self {
        Self { substitute }
    }

    /// パース済み設定からグラフを構築
    ///
    /// - 同じアドレスの宣言が複数あれば DuplicateResource
    /// - 依存先（所属プロジェクトを含む）が宣言されていなければ UnresolvedReference
    /// - 文字列属性は設定の変数で展開される
    #[instrument(skip(self, config), fields(config = %config.name))]
    pub fn build(&self, config: &ParsedConfig) -> Result<ResourceGraph, GraphError> {
        let mut seen = HashSet::with_capacity(config.resources.len());
        for decl in &config.resources {
            if !seen.insert(&decl.address) {
                return Err(GraphError::DuplicateResource(decl.address.clone()));
            }
        }

        let mut nodes = Vec::with_capacity(config.resources.len());
        for decl in &config.resources {
            let attributes = self
                .substitute_attributes(&decl.attributes, &config.variables)
                .map_err(|source| GraphError::Substitution {
                    address: decl.address.clone(),
                    source,
                })?;

            let mut depends_on = decl.depends_on.clone();
            if let Some(parent) = decl.address.parent()
                && !depends_on.contains(&parent)
            {
                depends_on.push(parent);
            }
            depends_on.sort();

            nodes.push(ResourceNode {
                address: decl.address.clone(),
                attributes,
                depends_on,
            });
        }
        nodes.sort_by(|a, b| a.address.cmp(&b.address));

        let index: HashMap<ResourceAddress, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.address.clone(), i))
            .collect();

        let mut deps = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut edges = Vec::with_capacity(node.depends_on.len());
            for dep in &node.depends_on {
                let target =
                    index
                        .get(dep)
                        .copied()
                        .ok_or_else(|| GraphError::UnresolvedReference {
                            from: node.address.clone(),
                            to: dep.clone(),
                        })?;
                edges.push(target);
            }
            edges.sort_unstable();
            deps.push(edges);
        }

        let edge_count: usize = deps.iter().map(Vec::len).sum();
        info!(
            resources = nodes.len(),
            edges = edge_count,
            "Resource graph built"
        );

        Ok(ResourceGraph { nodes, deps, index })
    }

    fn substitute_attributes(
        &self,
        attributes: &Attributes,
        variables: &Variables,
    ) -> crate::error::Result<Attributes> {
        attributes
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.substitute_value(value, variables)?)))
            .collect()
    }

    fn substitute_value(
        &self,
        value: &serde_json::Value,
        variables: &Variables,
    ) -> crate::error::Result<serde_json::Value> {
        use serde_json::Value;

        Ok(match value {
            Value::String(raw) => {
                let rendered = self.substitute.substitute(raw, variables)?;
                if &rendered != raw {
                    debug!(raw = %raw, rendered = %rendered, "Substituted attribute");
                }
                Value::String(rendered)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.substitute_value(item, variables))
                    .collect::<crate::error::Result<_>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.substitute_value(v, variables)?)))
                    .collect::<crate::error::Result<_>>()?,
            ),
            other => other.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceDecl;
    use crate::parser::parse_kdl_string;
    use crate::template::TemplateProcessor;

    fn build(kdl: &str) -> Result<ResourceGraph, GraphError> {
        let config = parse_kdl_string(kdl, "test".to_string()).unwrap();
        let processor = TemplateProcessor::new();
        GraphBuilder::new(&processor).build(&config)
    }

    #[test]
    fn test_build_demo_graph() {
        let graph = build(
            r#"
            project "DEMO" {
                dataset "TEST_DATA" { type "Filesystem" }
            }
            "#,
        )
        .unwrap();

        assert_eq!(graph.len(), 2);
        let project = graph.index_of(&ResourceAddress::project("DEMO")).unwrap();
        let dataset = graph
            .index_of(&ResourceAddress::dataset("DEMO", "TEST_DATA"))
            .unwrap();
        assert_eq!(graph.dependencies(dataset), &[project]);
        assert!(graph.dependencies(project).is_empty());
    }

    #[test]
    fn test_nodes_sorted_by_address() {
        let graph = build(
            r#"
            project "ZOO" {}
            project "ALPHA" {}
            "#,
        )
        .unwrap();
        let names: Vec<_> = graph.nodes().iter().map(|n| n.address.name.as_str()).collect();
        assert_eq!(names, vec!["ALPHA", "ZOO"]);
    }

    #[test]
    fn test_duplicate_resource() {
        let result = build(
            r#"
            project "DEMO" {
                dataset "RAW" {}
                dataset "RAW" {}
            }
            "#,
        );
        match result {
            Err(GraphError::DuplicateResource(addr)) => {
                assert_eq!(addr, ResourceAddress::dataset("DEMO", "RAW"));
            }
            other => panic!("Expected DuplicateResource, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_reference() {
        let result = build(
            r#"
            project "DEMO" {
                scenario "daily" { depends-on "recipe:missing" }
            }
            "#,
        );
        match result {
            Err(GraphError::UnresolvedReference { from, to }) => {
                assert_eq!(from, ResourceAddress::scenario("DEMO", "daily"));
                assert_eq!(to, ResourceAddress::recipe("DEMO", "missing"));
            }
            other => panic!("Expected UnresolvedReference, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_parent_project_is_unresolved() {
        let mut config = ParsedConfig::new("test");
        config
            .resources
            .push(ResourceDecl::new(ResourceAddress::dataset("GHOST", "RAW")));
        let processor = TemplateProcessor::new();
        let result = GraphBuilder::new(&processor).build(&config);
        assert!(matches!(
            result,
            Err(GraphError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_substitution_is_recursive() {
        let graph = build(
            r#"
            variables {
                root "/data"
                owner "team"
            }
            project "DEMO" {
                owner "{{ owner }}"
                dataset "RAW" {
                    params { path "{{ root }}/raw" }
                    tags "{{ owner }}" "static"
                }
            }
            "#,
        )
        .unwrap();

        let raw = graph.node(&ResourceAddress::dataset("DEMO", "RAW")).unwrap();
        assert_eq!(
            raw.attributes["params"],
            serde_json::json!({ "path": "/data/raw" })
        );
        assert_eq!(raw.attributes["tags"], serde_json::json!(["team", "static"]));
    }

    #[test]
    fn test_substitution_error_names_resource() {
        let result = build(r#"project "DEMO" { owner "{{ nobody }}" }"#);
        match result {
            Err(GraphError::Substitution { address, .. }) => {
                assert_eq!(address, ResourceAddress::project("DEMO"));
            }
            other => panic!("Expected Substitution, got {:?}", other),
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let kdl = r#"
            project "DEMO" {
                dataset "B" {}
                dataset "A" {}
                recipe "r" {
                    input "A"
                    output "B"
                }
            }
        "#;
        let first = build(kdl).unwrap();
        let second = build(kdl).unwrap();
        assert_eq!(first.nodes(), second.nodes());
        for i in 0..first.len() {
            assert_eq!(first.dependencies(i), second.dependencies(i));
        }
    }
}
