//! KDLパーサー
//!
//! dataiku-iac のKDL設定ファイルをパースします。
//! 各ノードタイプのパース処理はモジュールに分離されています。
//!
//! ```kdl
//! variables {
//!     owner "data-team"
//! }
//!
//! project "DEMO" {
//!     name "Demo project"
//!     owner "{{ owner }}"
//!
//!     dataset "TEST_DATA" {
//!         type "Filesystem"
//!         connection "filesystem_managed"
//!     }
//! }
//! ```

mod environment;
mod resource;
mod value;

use environment::{parse_environment, parse_variables};
use resource::{parse_project, parse_scoped_resource};

pub use value::kdl_value_to_json;

use crate::error::{ConfigError, Result};
use crate::model::{ParsedConfig, ResourceKind};
use kdl::KdlDocument;
use std::fs;
use std::path::Path;

/// KDLファイルをパースして ParsedConfig を生成
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<ParsedConfig> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::IoError {
        path: path.as_ref().to_path_buf(),
        message: e.to_string(),
    })?;
    let name = path
        .as_ref()
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    parse_kdl_string(&content, name)
}

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str, default_name: String) -> Result<ParsedConfig> {
    let doc: KdlDocument = content.parse()?;
    let mut config = ParsedConfig::new(default_name);

    for node in doc.nodes() {
        match node.name().value() {
            "workspace" => {
                if let Some(name) = node.entries().first().and_then(|e| e.value().as_string()) {
                    config.name = name.to_string();
                }
            }
            "variables" => {
                config.variables.extend(parse_variables(node));
            }
            "environment" => {
                let (env_name, env) = parse_environment(node)?;
                // 同名の environment ブロックは結合
                let target = config.environments.entry(env_name).or_default();
                target.variables.extend(env.variables);
                target.resources.extend(env.resources);
            }
            "project" => {
                config.resources.extend(parse_project(node)?);
            }
            other => match ResourceKind::parse(other) {
                Some(kind) => {
                    config.resources.push(parse_scoped_resource(node, kind, None)?);
                }
                None => {
                    return Err(ConfigError::schema(format!(
                        "不明なトップレベルノード: {other}"
                    )));
                }
            },
        }
    }

    tracing::debug!(
        resources = config.resources.len(),
        environments = config.environments.len(),
        "Parsed configuration"
    );

    Ok(config)
}
