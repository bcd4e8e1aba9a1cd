//! 環境・変数ノードのパース

use super::resource::{parse_project, parse_scoped_resource};
use super::value::{first_string, node_to_json};
use crate::error::{ConfigError, Result};
use crate::model::{EnvironmentDecl, ResourceKind, Variables};
use kdl::KdlNode;

/// variables ノードをパース
pub fn parse_variables(node: &KdlNode) -> Variables {
    let mut variables = Variables::new();
    if let Some(vars) = node.children() {
        for var in vars.nodes() {
            variables.insert(var.name().value().to_string(), node_to_json(var));
        }
    }
    variables
}

/// environment ノードをパース
pub fn parse_environment(node: &KdlNode) -> Result<(String, EnvironmentDecl)> {
    let name = first_string(node)
        .ok_or_else(|| ConfigError::schema("environment requires a name"))?
        .to_string();

    let mut env = EnvironmentDecl::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "variables" => {
                    env.variables.extend(parse_variables(child));
                }
                "project" => {
                    env.resources.extend(parse_project(child)?);
                }
                other => match ResourceKind::parse(other) {
                    Some(kind) => {
                        env.resources.push(parse_scoped_resource(child, kind, None)?);
                    }
                    None => {
                        return Err(ConfigError::schema(format!(
                            "environment {name} に不明なノードがあります: {other}"
                        )));
                    }
                },
            }
        }
    }

    Ok((name, env))
}
