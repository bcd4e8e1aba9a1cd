//! 統合ローダー
//!
//! ファイル発見、パース、オーバーライド適用、変数収集を統合

use crate::discovery::{DiscoveredFiles, discover_files_with_environment, find_project_root};
use crate::error::{ConfigError, GraphError, Result};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::model::ParsedConfig;
use crate::parser::parse_kdl_string;
use crate::template::TemplateProcessor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// ロード済みプロジェクト
///
/// 変数展開はグラフ構築時に行うため、パース済み設定と
/// ベース変数を保持したテンプレートプロセッサを組で返す。
#[derive(Debug, Clone)]
pub struct LoadedProject {
    pub root: PathBuf,
    pub environment: Option<String>,
    pub config: ParsedConfig,
    pub processor: TemplateProcessor,
}

impl LoadedProject {
    /// 変数展開を行ってリソースグラフを構築
    pub fn build_graph(&self) -> std::result::Result<ResourceGraph, GraphError> {
        GraphBuilder::new(&self.processor).build(&self.config)
    }
}

/// カレントディレクトリからプロジェクトを探してロード
#[instrument]
pub fn load_project(environment: Option<&str>) -> Result<LoadedProject> {
    info!("Starting project load");
    let project_root = find_project_root()?;
    load_project_from_root_with_environment(&project_root, environment)
}

/// 指定されたルートディレクトリからプロジェクトをロード
#[instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn load_project_from_root(project_root: &Path) -> Result<LoadedProject> {
    load_project_from_root_with_environment(project_root, None)
}

/// 環境指定でプロジェクトをロード
///
/// 読み込み順序: dataiku.kdl → variables/ → resources/ → dataiku.{env}.kdl → dataiku.local.kdl
/// その後 environment ブロックのオーバーレイを適用する。
#[instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn load_project_from_root_with_environment(
    project_root: &Path,
    environment: Option<&str>,
) -> Result<LoadedProject> {
    // 1. ファイル発見
    debug!("Step 1: Discovering files");
    let discovered = discover_files_with_environment(project_root, environment)?;
    if discovered.root.is_none() {
        return Err(ConfigError::ProjectRootNotFound(project_root.to_path_buf()));
    }

    // 2. KDLパース
    debug!("Step 2: Parsing KDL files");
    let name = project_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let mut config = ParsedConfig::new(name.clone());
    for file in discovered.base_files() {
        let parsed = parse_file(file, &name)?;
        if parsed.name != name {
            config.name = parsed.name.clone();
        }
        config.append(parsed);
    }

    // 3. オーバーライドファイル
    debug!("Step 3: Applying override files");
    for file in discovered
        .environment_override
        .iter()
        .chain(discovered.local_override.iter())
    {
        debug!(file = %file.display(), "Merging override file");
        config.merge_override(parse_file(file, &name)?);
    }

    // 4. 環境オーバーレイ
    if let Some(env) = environment {
        debug!(environment = %env, "Step 4: Applying environment overlay");
        let applied = config.apply_environment(env);
        // 環境を宣言している設定で、未知の環境が指定された場合はエラー
        if !applied && !config.environments.is_empty() && discovered.environment_override.is_none()
        {
            return Err(ConfigError::EnvironmentNotFound(env.to_string()));
        }
    }

    // 5. 変数収集
    debug!("Step 5: Preparing template processor");
    let processor = prepare_template_processor(&discovered, project_root, environment)?;

    info!(
        resources = config.resources.len(),
        environments = config.environments.len(),
        "Project loaded successfully"
    );

    Ok(LoadedProject {
        root: project_root.to_path_buf(),
        environment: environment.map(str::to_string),
        config,
        processor,
    })
}

fn parse_file(path: &Path, default_name: &str) -> Result<ParsedConfig> {
    debug!(file = %path.display(), "Parsing file");
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_kdl_string(&content, default_name.to_string())
}

/// テンプレートプロセッサを準備
///
/// 優先順位（後が強い）: ビルトイン → .env → .env.{env} → 環境変数。
/// KDL の variables はグラフ構築時に渡され、これらすべてを上書きする。
fn prepare_template_processor(
    discovered: &DiscoveredFiles,
    project_root: &Path,
    environment: Option<&str>,
) -> Result<TemplateProcessor> {
    let mut processor = TemplateProcessor::new();

    // ビルトイン変数
    processor.add_variable(
        "PROJECT_ROOT",
        serde_json::Value::String(project_root.to_string_lossy().to_string()),
    );
    if let Some(env) = environment {
        processor.add_variable("ENVIRONMENT", serde_json::Value::String(env.to_string()));
    }

    if let Some(env_file) = &discovered.env_file {
        processor.add_env_file_variables(env_file)?;
    }
    if let Some(env_file) = &discovered.environment_env_file {
        processor.add_env_file_variables(env_file)?;
    }

    // DATAIKU_*, CI_*, APP_* プレフィックスのみ
    processor.add_env_variables();

    Ok(processor)
}
