//! リソースノードのパース

use super::value::{first_string, node_to_json, property, string_args};
use crate::error::{ConfigError, Result};
use crate::model::{ResourceAddress, ResourceDecl, ResourceKind};
use kdl::KdlNode;
use regex::Regex;

/// DSSのプロジェクトキーの形式
const PROJECT_KEY_PATTERN: &str = r"^[A-Z][A-Z0-9_]*$";

/// project ノードをパース
///
/// プロジェクト自身と、ブロック内で宣言された dataset / recipe / scenario を
/// 宣言順に返す。
pub fn parse_project(node: &KdlNode) -> Result<Vec<ResourceDecl>> {
    let key = first_string(node)
        .ok_or_else(|| ConfigError::schema("project requires a key"))?
        .to_string();
    validate_project_key(&key)?;

    let mut project = ResourceDecl::new(ResourceAddress::project(key.clone()));
    let mut nested = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "depends_on" | "depends-on" => {
                    for reference in string_args(child) {
                        project.add_dependency(parse_reference(&reference, None)?);
                    }
                }
                "project" => {
                    return Err(ConfigError::schema(format!(
                        "project {key} の中に project は宣言できません"
                    )));
                }
                other => match ResourceKind::parse(other) {
                    Some(kind) => {
                        nested.push(parse_scoped_resource(child, kind, Some(&key))?);
                    }
                    None => {
                        project
                            .attributes
                            .insert(other.to_string(), node_to_json(child));
                    }
                },
            }
        }
    }

    let mut decls = Vec::with_capacity(nested.len() + 1);
    decls.push(project);
    decls.extend(nested);
    Ok(decls)
}

/// dataset / recipe / scenario ノードをパース
///
/// `project` が None の場合（トップレベル宣言）は `project="KEY"` プロパティが必須。
/// 所属プロジェクトへの依存は暗黙的に追加される。
pub fn parse_scoped_resource(
    node: &KdlNode,
    kind: ResourceKind,
    project: Option<&str>,
) -> Result<ResourceDecl> {
    let name = first_string(node)
        .ok_or_else(|| ConfigError::schema(format!("{kind} requires a name")))?
        .to_string();

    let project_key = match project {
        Some(p) => p.to_string(),
        None => property(node, "project")
            .and_then(|v| v.as_string())
            .ok_or_else(|| {
                ConfigError::schema(format!(
                    "{kind} {name} はプロジェクト外で宣言されています（project=\"KEY\" を指定してください）"
                ))
            })?
            .to_string(),
    };
    validate_project_key(&project_key)?;

    let address = ResourceAddress::scoped(kind, project_key.clone(), name);
    let mut decl = ResourceDecl::new(address);
    decl.add_dependency(ResourceAddress::project(project_key.clone()));

    let mut inputs: Vec<String> = Vec::new();
    let mut outputs: Vec<String> = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "depends_on" | "depends-on" => {
                    for reference in string_args(child) {
                        decl.add_dependency(parse_reference(&reference, Some(&project_key))?);
                    }
                }
                "input" | "inputs" if kind == ResourceKind::Recipe => {
                    inputs.extend(string_args(child));
                }
                "output" | "outputs" if kind == ResourceKind::Recipe => {
                    outputs.extend(string_args(child));
                }
                other if ResourceKind::parse(other).is_some() => {
                    return Err(ConfigError::schema(format!(
                        "{} の中に {other} は宣言できません",
                        decl.address
                    )));
                }
                other => {
                    decl.attributes
                        .insert(other.to_string(), node_to_json(child));
                }
            }
        }
    }

    // レシピの入出力データセットは依存関係になる
    for dataset in inputs.iter().chain(outputs.iter()) {
        decl.add_dependency(dataset_reference(dataset, &project_key)?);
    }
    if !inputs.is_empty() {
        decl.attributes
            .insert("inputs".to_string(), serde_json::json!(inputs));
    }
    if !outputs.is_empty() {
        decl.attributes
            .insert("outputs".to_string(), serde_json::json!(outputs));
    }

    Ok(decl)
}

fn parse_reference(reference: &str, project: Option<&str>) -> Result<ResourceAddress> {
    ResourceAddress::parse_ref(reference, project).ok_or_else(|| {
        ConfigError::schema(format!(
            "不正な参照: {reference}（kind:NAME または kind:PROJECT.NAME の形式で指定してください）"
        ))
    })
}

/// レシピ入出力のデータセット名（`NAME` または `PROJECT.NAME`）を解決
fn dataset_reference(name: &str, project: &str) -> Result<ResourceAddress> {
    match name.split_once('.') {
        Some((p, n)) if !p.is_empty() && !n.is_empty() => Ok(ResourceAddress::dataset(p, n)),
        Some(_) => Err(ConfigError::schema(format!("不正なデータセット名: {name}"))),
        None => Ok(ResourceAddress::dataset(project, name)),
    }
}

fn validate_project_key(key: &str) -> Result<()> {
    let re = Regex::new(PROJECT_KEY_PATTERN)
        .map_err(|e| ConfigError::schema(format!("正規表現のコンパイルエラー: {}", e)))?;
    if re.is_match(key) {
        Ok(())
    } else {
        Err(ConfigError::schema(format!(
            "不正なプロジェクトキー: {key}（英大文字・数字・アンダースコアのみ使用できます）"
        )))
    }
}
